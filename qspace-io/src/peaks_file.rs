//! ISAW-style peaks files.
//!
//! Lengths are written in centimetres; the in-memory calibration uses
//! metres. Each line starts with a tag:
//!
//! | tag | content |
//! |-----|---------|
//! | `6` / `7` | L1 and T0 shift |
//! | `4` / `5` | one line per detector grid |
//! | `0` / `1` | run number, detector, goniometer angles and monitor count |
//! | `2` / `3` | one line per peak |
//!
//! Even tags are column titles and are skipped on reading.

use crate::{Error, Result};
use qspace_core::{IntensityEstimate, MillerIndex, Peak, RunInfo, Vec3};
use qspace_instrument::{DetectorGrid, Instrument, InstrumentCalibration, ANGST_PER_US_PER_M};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const CM_PER_M: f64 = 100.0;

const L1_TITLE: &str = "6         L1    T0_SHIFT";
const GRID_TITLE: &str = "4 DETNUM  NROWS  NCOLS   WIDTH   HEIGHT   DEPTH   DETD   CenterX   CenterY   CenterZ    BaseX    BaseY    BaseZ      UpX      UpY      UpZ";
const RUN_TITLE: &str = "0 NRUN DETNUM    CHI    PHI  OMEGA MONCNT";
const PEAK_TITLE: &str = "2   SEQN    H    K    L     COL     ROW    CHAN       L2  2_THETA       AZ        WL        D   IPK      INTI   SIGI RFLG";

/// Contents of a peaks file.
#[derive(Debug, Clone, PartialEq)]
pub struct PeaksFile {
    pub instrument: String,
    /// Source to sample distance in metres.
    pub l1: f64,
    /// Time-of-flight offset in microseconds.
    pub t0_shift: f64,
    pub grids: Vec<DetectorGrid>,
    pub peaks: Vec<Peak>,
}

/// Scattering geometry of a peak as written on a `3` line.
struct PeakGeometry {
    l2: f64,
    two_theta: f64,
    azimuth: f64,
}

impl PeakGeometry {
    fn of(grid: Option<&DetectorGrid>, peak: &Peak) -> Self {
        let Some(grid) = grid else {
            return Self {
                l2: 0.0,
                two_theta: 0.0,
                azimuth: 0.0,
            };
        };
        let position = grid.position(peak.row, peak.col);
        let l2 = position.length();
        let two_theta = if l2 > 0.0 {
            (position.x / l2).clamp(-1.0, 1.0).acos()
        } else {
            0.0
        };
        Self {
            l2,
            two_theta,
            azimuth: position.y.atan2(position.x),
        }
    }
}

impl PeaksFile {
    /// Pairs a peak list with the geometry it was measured on.
    #[must_use]
    pub fn from_calibration(calibration: &InstrumentCalibration, peaks: Vec<Peak>) -> Self {
        Self {
            instrument: calibration.instrument().name().to_string(),
            l1: calibration.l1(),
            t0_shift: calibration.t0_shift(),
            grids: calibration.grids().to_vec(),
            peaks,
        }
    }

    fn grid(&self, detector_id: u32) -> Option<&DetectorGrid> {
        self.grids.iter().find(|g| g.id == detector_id)
    }

    /// Rebuilds the calibration stored in the file.
    ///
    /// # Errors
    /// Returns an error for an unknown instrument name or invalid geometry.
    pub fn calibration(&self) -> Result<InstrumentCalibration> {
        let instrument: Instrument = self.instrument.parse()?;
        Ok(InstrumentCalibration::new(
            instrument,
            self.l1,
            self.t0_shift,
            self.grids.clone(),
        )?)
    }

    /// Reads a peaks file from disk.
    ///
    /// # Errors
    /// Returns an I/O error or [`Error::PeakFile`] for a malformed line.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parses peaks file text.
    ///
    /// Valid-looking peaks whose hkl is `0,0,0` are read as unindexed;
    /// zero intensity and sigma read as not integrated. Q is recomputed
    /// from the detector geometry and wavelength when both are known.
    ///
    /// # Errors
    /// Returns an I/O error or [`Error::PeakFile`] for a malformed line.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut file = Self {
            instrument: String::new(),
            l1: 0.0,
            t0_shift: 0.0,
            grids: Vec::new(),
            peaks: Vec::new(),
        };
        let mut run: Option<(u32, RunInfo)> = None;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let number = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("Version:") {
                file.instrument = header_field(rest, "Instrument:").unwrap_or_default();
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let tag = fields.next().unwrap_or_default();
            let values: Vec<&str> = fields.collect();
            match tag {
                "0" | "2" | "4" | "6" => {}
                "7" => {
                    let v = numbers(&values, 2, number)?;
                    file.l1 = v[0] / CM_PER_M;
                    file.t0_shift = v[1];
                }
                "5" => file.grids.push(parse_grid(&values, number)?),
                "1" => {
                    let v = numbers(&values, 6, number)?;
                    let info = RunInfo {
                        run: to_u32(v[0], number)?,
                        chi: v[2],
                        phi: v[3],
                        omega: v[4],
                        monitor_count: v[5],
                    };
                    run = Some((to_u32(v[1], number)?, info));
                }
                "3" => {
                    let Some((detector_id, info)) = run else {
                        return Err(Error::PeakFile {
                            line: number,
                            reason: "peak line before any run line".to_string(),
                        });
                    };
                    let peak = file.parse_peak(&values, detector_id, info, number)?;
                    file.peaks.push(peak);
                }
                other => log::debug!("peaks file line {number}: skipping tag {other}"),
            }
        }
        log::debug!(
            "read {} peaks on {} detectors",
            file.peaks.len(),
            file.grids.len()
        );
        Ok(file)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn parse_peak(&self, values: &[&str], detector_id: u32, run_info: RunInfo, line: usize) -> Result<Peak> {
        let v = numbers(values, 16, line)?;
        let mut peak = Peak::on_detector(detector_id, v[5], v[4], v[6] - 1.0);
        peak.seqn = to_u32(v[0], line)?;
        peak.run_info = run_info;
        let hkl = MillerIndex::new(v[1].round() as i32, v[2].round() as i32, v[3].round() as i32);
        peak.hkl = (!hkl.is_origin()).then_some(hkl);
        peak.wavelength = v[10];
        peak.ipk = v[12];
        if v[13] != 0.0 || v[14] != 0.0 {
            peak.intensity = Some(IntensityEstimate {
                intensity: v[13],
                sigma: v[14],
            });
        }
        peak.reflag = v[15].round() as i32;

        if let Some(grid) = self.grid(detector_id) {
            let position = grid.position(peak.row, peak.col);
            let l2 = position.length();
            if l2 > 0.0 && peak.wavelength > 0.0 {
                peak.q = (position * (1.0 / l2) - Vec3::X) * (1.0 / peak.wavelength);
                peak.tof = peak.wavelength * (self.l1 + l2) / ANGST_PER_US_PER_M;
            }
        }
        Ok(peak)
    }

    /// Writes the file to disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = PeaksFileWriter::create(path)?;
        writer.write_peaks_file(self)
    }
}

/// Writer for peaks files.
pub struct PeaksFileWriter {
    writer: BufWriter<File>,
}

impl PeaksFileWriter {
    /// Creates a new peaks file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        Ok(Self { writer })
    }

    /// Writes the header, the detector table and every valid peak grouped
    /// by run and detector.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_peaks_file(&mut self, file: &PeaksFile) -> Result<()> {
        write_peaks(&mut self.writer, file)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn write_peaks<W: Write>(out: &mut W, file: &PeaksFile) -> Result<()> {
    writeln!(
        out,
        "Version: 2.0  Facility: SNS  Instrument: {}",
        file.instrument
    )?;
    writeln!(out, "{L1_TITLE}")?;
    writeln!(out, "7 {:10.4} {:11.3}", file.l1 * CM_PER_M, file.t0_shift)?;
    writeln!(out, "{GRID_TITLE}")?;
    for grid in &file.grids {
        writeln!(
            out,
            "5 {:6} {:6} {:6} {:8.4} {:8.4} {:8.4} {:8.3} {:9.4} {:9.4} {:9.4} {:8.5} {:8.5} {:8.5} {:8.5} {:8.5} {:8.5}",
            grid.id,
            grid.num_rows,
            grid.num_cols,
            grid.width * CM_PER_M,
            grid.height * CM_PER_M,
            grid.depth * CM_PER_M,
            grid.center.length() * CM_PER_M,
            grid.center.x * CM_PER_M,
            grid.center.y * CM_PER_M,
            grid.center.z * CM_PER_M,
            grid.base.x,
            grid.base.y,
            grid.base.z,
            grid.up.x,
            grid.up.y,
            grid.up.z,
        )?;
    }

    let mut peaks: Vec<&Peak> = file.peaks.iter().filter(|p| p.is_valid()).collect();
    peaks.sort_by_key(|p| (p.run_info.run, p.detector_id));
    let mut group = None;
    for peak in peaks {
        let key = (peak.run_info.run, peak.detector_id);
        if group != Some(key) {
            group = Some(key);
            let info = &peak.run_info;
            writeln!(out, "{RUN_TITLE}")?;
            writeln!(
                out,
                "1 {:4} {:6} {:6.2} {:6.2} {:6.2} {:6.0}",
                info.run, peak.detector_id, info.chi, info.phi, info.omega, info.monitor_count
            )?;
            writeln!(out, "{PEAK_TITLE}")?;
        }
        let geometry = PeakGeometry::of(file.grid(peak.detector_id), peak);
        let hkl = peak.hkl.unwrap_or_default();
        let intensity = peak.intensity.unwrap_or_default();
        writeln!(
            out,
            "3 {:6} {:4.0} {:4.0} {:4.0} {:7.2} {:7.2} {:7.2} {:8.3} {:8.5} {:8.5} {:9.6} {:8.4} {:5.0} {:9.2} {:6.2} {:4}",
            peak.seqn,
            f64::from(hkl.h),
            f64::from(hkl.k),
            f64::from(hkl.l),
            peak.col,
            peak.row,
            peak.channel + 1.0,
            geometry.l2 * CM_PER_M,
            geometry.two_theta,
            geometry.azimuth,
            peak.wavelength,
            peak.d_spacing(),
            peak.ipk,
            intensity.intensity,
            intensity.sigma,
            peak.reflag,
        )?;
    }
    Ok(())
}

fn header_field(header: &str, key: &str) -> Option<String> {
    let (_, rest) = header.split_once(key)?;
    rest.split_whitespace().next().map(str::to_string)
}

fn numbers(values: &[&str], expected: usize, line: usize) -> Result<Vec<f64>> {
    if values.len() < expected {
        return Err(Error::PeakFile {
            line,
            reason: format!("expected {expected} values, found {}", values.len()),
        });
    }
    values[..expected]
        .iter()
        .map(|v| {
            v.parse::<f64>().map_err(|_| Error::PeakFile {
                line,
                reason: format!("not a number: {v}"),
            })
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u32(value: f64, line: usize) -> Result<u32> {
    if value < 0.0 || value > f64::from(u32::MAX) || value.fract() != 0.0 {
        return Err(Error::PeakFile {
            line,
            reason: format!("not a non-negative integer: {value}"),
        });
    }
    Ok(value as u32)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_grid(values: &[&str], line: usize) -> Result<DetectorGrid> {
    let v = numbers(values, 16, line)?;
    let rows = to_u32(v[1], line)? as usize;
    let cols = to_u32(v[2], line)? as usize;
    let mut grid = DetectorGrid::new(
        to_u32(v[0], line)?,
        rows,
        cols,
        v[3] / CM_PER_M,
        v[4] / CM_PER_M,
        Vec3::new(v[7], v[8], v[9]) * (1.0 / CM_PER_M),
        Vec3::new(v[10], v[11], v[12]),
        Vec3::new(v[13], v[14], v[15]),
    )?;
    grid.depth = v[5] / CM_PER_M;
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn calibration() -> InstrumentCalibration {
        let grid = DetectorGrid::new(
            17,
            256,
            256,
            0.158,
            0.158,
            Vec3::new(0.0, 0.4, 0.0),
            Vec3::X,
            Vec3::Z,
        )
        .unwrap();
        InstrumentCalibration::new(Instrument::Topaz, 18.0, 0.5, vec![grid]).unwrap()
    }

    fn sample_peaks() -> Vec<Peak> {
        let mut first = Peak::on_detector(17, 120.25, 100.5, 41.75);
        first.seqn = 1;
        first.hkl = Some(MillerIndex::new(2, -1, 3));
        first.wavelength = 1.5;
        first.ipk = 45.0;
        first.set_intensity(321.5, 18.25);
        first.reflag = 310;
        first.run_info = RunInfo {
            run: 3132,
            chi: 135.0,
            phi: 12.5,
            omega: 60.0,
            monitor_count: 12345.0,
        };
        let mut second = Peak::on_detector(17, 30.0, 40.0, 10.0);
        second.seqn = 2;
        second.run_info.run = 3131;
        let mut rejected = second.clone();
        rejected.seqn = 3;
        rejected.invalidate();
        vec![first, second, rejected]
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.peaks");
        let file = PeaksFile::from_calibration(&calibration(), sample_peaks());
        file.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Version: 2.0  Facility: SNS  Instrument: TOPAZ"));
        assert_eq!(text.lines().filter(|l| l.starts_with("1 ")).count(), 2);

        let back = PeaksFile::read(&path).unwrap();
        assert_eq!(back.instrument, "TOPAZ");
        assert_relative_eq!(back.l1, 18.0, epsilon = 1e-9);
        assert_relative_eq!(back.t0_shift, 0.5, epsilon = 1e-9);
        assert_eq!(back.grids.len(), 1);
        assert_eq!(back.grids[0].num_rows, 256);
        assert_relative_eq!(back.grids[0].center.y, 0.4, epsilon = 1e-6);
        assert_eq!(back.peaks.len(), 2);

        // run 3131 sorts first
        assert_eq!(back.peaks[0].seqn, 2);
        assert!(!back.peaks[0].is_indexed());
        assert!(!back.peaks[0].is_integrated());

        let peak = &back.peaks[1];
        assert_eq!(peak.detector_id, 17);
        assert_eq!(peak.run_info.run, 3132);
        assert_relative_eq!(peak.run_info.phi, 12.5);
        assert_relative_eq!(peak.run_info.monitor_count, 12345.0);
        assert_relative_eq!(peak.row, 120.25);
        assert_relative_eq!(peak.col, 100.5);
        assert_relative_eq!(peak.channel, 41.75);
        assert_eq!(peak.hkl, Some(MillerIndex::new(2, -1, 3)));
        assert_relative_eq!(peak.wavelength, 1.5);
        assert_relative_eq!(peak.ipk, 45.0);
        let est = peak.intensity.unwrap();
        assert_relative_eq!(est.intensity, 321.5);
        assert_relative_eq!(est.sigma, 18.25);
        assert_eq!(peak.reflag, 310);
        assert!(peak.q.length() > 0.0);

        assert!(back.calibration().is_ok());
    }

    #[test]
    fn test_malformed_lines() {
        let text = "3      1    1    0    0   10.00   10.00   10.00\n";
        assert!(matches!(
            PeaksFile::from_reader(text.as_bytes()),
            Err(Error::PeakFile { line: 1, .. })
        ));
        let text = "7 abc 0.0\n";
        assert!(matches!(
            PeaksFile::from_reader(text.as_bytes()),
            Err(Error::PeakFile { line: 1, .. })
        ));
    }
}
