#![allow(clippy::uninlined_format_args)]
use approx::assert_relative_eq;
use qspace_core::{Histogram3D, ProjectionBinner, QEventBatch, Vec3};

/// Deterministic pseudo-random points spread over `[-2, 2)^3`.
fn scattered_batch(n: usize) -> QEventBatch {
    let mut batch = QEventBatch::with_capacity(n);
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        #[allow(clippy::cast_precision_loss)]
        let unit = (state % 1_000_000) as f64 / 1_000_000.0;
        unit * 4.4 - 2.2
    };
    for i in 0..n {
        #[allow(clippy::cast_precision_loss)]
        let weight = 1.0 + (i % 3) as f64 * 0.5;
        batch.push_weighted(Vec3::new(next(), next(), next()), weight);
    }
    batch
}

fn skewed_histogram() -> Histogram3D {
    Histogram3D::new(
        ProjectionBinner::along(Vec3::X, -2.0, 2.0, 16).unwrap(),
        ProjectionBinner::along(Vec3::new(0.3, 1.0, 0.0), -2.0, 2.0, 16).unwrap(),
        ProjectionBinner::along(Vec3::new(0.0, 0.2, 1.0), -2.0, 2.0, 16).unwrap(),
    )
    .unwrap()
}

fn assert_same_cells(a: &Histogram3D, b: &Histogram3D) {
    let [nx, ny, nz] = a.num_bins();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                assert_relative_eq!(a.cell(x, y, z), b.cell(x, y, z), epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_accumulation_is_commutative() {
    let batch = scattered_batch(3000);

    let mut whole = skewed_histogram();
    whole.add_events(&batch, true);

    let parts = [batch.slice(0..700), batch.slice(700..1900), batch.slice(1900..3000)];
    for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let mut split = skewed_histogram();
        for &i in &order {
            split.add_events(&parts[i], true);
        }
        assert_same_cells(&whole, &split);
        assert_relative_eq!(whole.total(), split.total(), epsilon = 1e-9);
    }
}

#[test]
fn test_page_parallel_matches_small_batches() {
    // large enough to take the page-parallel path in one call
    let batch = scattered_batch(60_000);

    let mut parallel = skewed_histogram();
    let added = parallel.add_events(&batch, true);

    let mut serial = skewed_histogram();
    let mut serial_added = 0;
    for start in (0..batch.len()).step_by(1000) {
        serial_added += serial.add_events(&batch.slice(start..start + 1000), true);
    }
    assert_eq!(added, serial_added);
    assert_same_cells(&parallel, &serial);
    assert_relative_eq!(parallel.total(), serial.total(), epsilon = 1e-6);
}

#[test]
fn test_total_matches_in_range_events() {
    let batch = scattered_batch(2000);
    let mut hist = Histogram3D::cube(2.0, 8).unwrap();
    let added = hist.add_events(&batch, false);

    let in_range = batch
        .iter()
        .filter(|(q, _)| {
            [q.x, q.y, q.z]
                .iter()
                .all(|&c| (-2.0..2.0).contains(&c))
        })
        .count();
    assert_eq!(added, in_range);
    #[allow(clippy::cast_precision_loss)]
    let expected = in_range as f64;
    assert_relative_eq!(hist.total(), expected);
}

#[test]
fn test_clear_is_idempotent() {
    let batch = scattered_batch(500);
    let mut hist = skewed_histogram();
    hist.add_events(&batch, true);
    assert!(hist.total() > 0.0);

    hist.clear();
    let once = hist.clone();
    hist.clear();
    assert_same_cells(&once, &hist);

    for (q, _) in batch.iter() {
        assert_relative_eq!(hist.value_at(q), 0.0);
    }
    assert_eq!(hist.num_bins(), [16, 16, 16]);
    assert_eq!(hist.num_added(), 0);
}

#[test]
fn test_sphere_integrals_monotone_and_shell_exact() {
    let batch = scattered_batch(5000);
    let mut hist = skewed_histogram();
    hist.add_events(&batch, true);

    let center = Vec3::new(0.1, -0.2, 0.3);
    let radii = [0.3, 0.6, 0.75, 0.75, 1.2];
    let result = hist.sphere_integrals(center, &radii).unwrap();

    for window in result.counts.windows(2) {
        assert!(window[1] >= window[0], "counts not monotone: {:?}", result.counts);
    }
    for window in result.n_bins.windows(2) {
        assert!(window[1] >= window[0]);
    }

    let (r2, r3) = (radii[1], radii[4]);
    let [nx, ny, nz] = hist.num_bins();
    let mut shell = 0.0;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let d = hist.bin_center(x, y, z).distance_squared(center);
                if d > r2 * r2 && d <= r3 * r3 {
                    shell += hist.cell(x, y, z);
                }
            }
        }
    }
    assert_relative_eq!(result.counts[4] - result.counts[1], shell, epsilon = 1e-9);
    assert_relative_eq!(result.volumes[4], result.n_bins[4] as f64 * hist.cell_volume());
}

#[test]
fn test_single_all_inclusive_bin() {
    let mut hist = Histogram3D::cube(100.0, 1).unwrap();
    let batch = scattered_batch(10);
    hist.add_events(&batch, false);
    assert_relative_eq!(hist.cell(0, 0, 0), 10.0);
    let (min, max) = hist.min_max();
    assert_relative_eq!(min, 10.0);
    assert_relative_eq!(max, 10.0);
}
