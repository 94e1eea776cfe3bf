//! qspace command-line interface.
//!
//! Runs the event pipeline on event files or a live UDP feed.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use qspace_algorithms::{PeakFinderConfig, SphereConfig};
use qspace_core::Mat3;
use qspace_instrument::InstrumentCalibration;
use qspace_io::{EventFileReader, ListenerConfig, LoadRequest, SocketEventListener};
use qspace_pipeline::{CalibrationSource, Message, MessageKind, Pipeline, PipelineConfig};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    QspaceIo(#[from] qspace_io::Error),

    #[error("Instrument error: {0}")]
    Instrument(#[from] qspace_instrument::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] qspace_pipeline::Error),

    #[error("{0}")]
    Rejected(String),

    #[error("UB matrix needs 9 values, got {0}")]
    BadMatrix(usize),
}

/// Event-to-Q reduction for TOF single-crystal diffraction.
#[derive(Parser)]
#[command(name = "qspace")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about an event file
    Info {
        /// Input event file
        input: PathBuf,
    },

    /// Load an event file, find peaks and integrate them
    Process {
        /// Input event file
        input: PathBuf,

        /// Instrument calibration (JSON)
        #[arg(short, long)]
        calibration: PathBuf,

        /// First event to load
        #[arg(long, default_value = "0")]
        first: usize,

        /// Number of events to load (default: all)
        #[arg(long)]
        count: Option<usize>,

        /// Loader worker threads
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Histogram bins per axis
        #[arg(long, default_value = "256")]
        bins: usize,

        /// Minimum histogram value for a peak
        #[arg(long)]
        threshold: Option<f64>,

        /// Maximum number of peaks
        #[arg(long, default_value = "50")]
        max_peaks: usize,

        /// Sphere radius in Q/2π for integration
        #[arg(long, default_value = "0.15")]
        radius: f64,

        /// UB matrix, row-major
        #[arg(long, num_args = 9, allow_hyphen_values = true)]
        ub: Option<Vec<f64>>,

        /// Peak file to write
        #[arg(short, long)]
        peaks: Option<PathBuf>,
    },

    /// Accumulate a live UDP event feed
    Listen {
        /// Instrument calibration (JSON)
        #[arg(short, long)]
        calibration: PathBuf,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// UDP port
        #[arg(short, long, default_value = "8002")]
        port: u16,

        /// How long to listen
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        /// Histogram bins per axis
        #[arg(long, default_value = "256")]
        bins: usize,
    },

    /// Lattice-aligned integration of every hkl
    Integrate {
        /// Input event file
        input: PathBuf,

        /// Instrument calibration (JSON)
        #[arg(short, long)]
        calibration: PathBuf,

        /// UB matrix, row-major
        #[arg(long, num_args = 9, allow_hyphen_values = true, required = true)]
        ub: Vec<f64>,

        /// Loader worker threads
        #[arg(short, long, default_value = "4")]
        workers: usize,
    },
}

fn parse_ub(values: &[f64]) -> Result<Mat3> {
    let [a, b, c, d, e, f, g, h, i] = values else {
        return Err(CliError::BadMatrix(values.len()));
    };
    Ok(Mat3::new([[*a, *b, *c], [*d, *e, *f], [*g, *h, *i]]))
}

/// Builds a pipeline with the instrument from `calibration` installed.
fn pipeline_for(calibration: &Path, config: PipelineConfig) -> Result<Pipeline> {
    let calibration = InstrumentCalibration::from_file(calibration)?;
    let mut pipeline = Pipeline::new(config)?;
    let replies = pipeline.tap(&[MessageKind::LoadFailed, MessageKind::InstrumentReady]);
    pipeline.post(Message::SetNewInstrument {
        name: calibration.instrument().name().to_string(),
        calibration: CalibrationSource::Loaded(Box::new(calibration)),
    });
    pipeline.process_pending();
    drain(&replies)?;
    Ok(pipeline)
}

/// Collects tapped messages; a `LoadFailed` aborts the command.
fn drain(replies: &Receiver<Message>) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for message in replies.try_iter() {
        match message {
            Message::LoadFailed(reason) => return Err(CliError::Rejected(reason)),
            Message::Error(text) => eprintln!("warning: {}", text),
            other => messages.push(other),
        }
    }
    Ok(messages)
}

fn load_request(input: &Path, first: usize, count: Option<usize>, workers: usize) -> Result<LoadRequest> {
    let total = EventFileReader::open(input)?.num_events();
    let count = count.unwrap_or(total);
    Ok(LoadRequest::new(first, count, count).with_worker_count(workers))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { input } => {
            let reader = EventFileReader::open(&input)?;
            let num_events = reader.num_events();
            println!("File: {}", input.display());
            println!("Events: {}", num_events);

            let batch = reader.read_range(0..num_events)?;
            if let (Some(min_tof), Some(max_tof)) =
                (batch.tof.iter().min(), batch.tof.iter().max())
            {
                println!("TOF range: {} - {}", min_tof, max_tof);
            }
            if let (Some(min_id), Some(max_id)) =
                (batch.pixel_id.iter().min(), batch.pixel_id.iter().max())
            {
                println!("Pixel id range: {} - {}", min_id, max_id);
            }
        }

        Commands::Process {
            input,
            calibration,
            first,
            count,
            workers,
            bins,
            threshold,
            max_peaks,
            radius,
            ub,
            peaks,
        } => {
            let start = Instant::now();
            let mut pipeline =
                pipeline_for(&calibration, PipelineConfig::default().with_num_bins(bins))?;
            let replies = pipeline.tap(&[
                MessageKind::LoadFailed,
                MessageKind::Error,
                MessageKind::LoadDone,
                MessageKind::Status,
            ]);

            if let Some(ub) = ub {
                pipeline.post(Message::SetOrientationMatrix(parse_ub(&ub)?));
            }
            pipeline.post(Message::LoadFileData {
                path: input.clone(),
                request: load_request(&input, first, count, workers)?,
            });
            let mut finder = PeakFinderConfig::default().with_max_peaks(max_peaks);
            if let Some(threshold) = threshold {
                finder = finder.with_threshold(threshold);
            }
            pipeline.post(Message::FindPeaks(finder));
            pipeline.post(Message::IntegratePeaks(
                SphereConfig::default()
                    .with_peak_radius(radius)
                    .with_detector_window(None),
            ));
            if let Some(path) = peaks {
                pipeline.post(Message::WritePeakFile(path));
            }
            pipeline.process_pending();

            for message in drain(&replies)? {
                match message {
                    Message::LoadDone(summary) => {
                        println!(
                            "Loaded {} events in {} segments",
                            summary.loaded, summary.segments
                        );
                    }
                    Message::Status(text) => println!("{}", text),
                    _ => {}
                }
            }

            let found = pipeline.state().peaks();
            println!("{:>4} {:>9} {:>9} {:>9} {:>12} {:>10}", "#", "qx", "qy", "qz", "I", "sigI");
            for (i, peak) in found.iter().enumerate() {
                let (intensity, sigma) = peak
                    .intensity
                    .map_or((0.0, 0.0), |est| (est.intensity, est.sigma));
                println!(
                    "{:>4} {:>9.4} {:>9.4} {:>9.4} {:>12.2} {:>10.2}",
                    i + 1,
                    peak.q.x,
                    peak.q.y,
                    peak.q.z,
                    intensity,
                    sigma
                );
            }
            println!(
                "Found {} peaks in {:.2}s",
                found.len(),
                start.elapsed().as_secs_f64()
            );
        }

        Commands::Listen {
            calibration,
            bind,
            port,
            seconds,
            bins,
        } => {
            let mut pipeline =
                pipeline_for(&calibration, PipelineConfig::default().with_num_bins(bins))?;
            let (tx, rx) = mpsc::channel();
            let listener = SocketEventListener::bind(
                &ListenerConfig::default()
                    .with_bind_address(bind)
                    .with_port(port),
                tx,
            )?;
            println!("Listening on {} for {}s", listener.local_addr(), seconds);

            let sender = pipeline.sender();
            let forwarder = thread::spawn(move || {
                for event in rx {
                    if sender.send(Message::from(event)).is_err() {
                        break;
                    }
                }
            });

            let stop = Arc::new(AtomicBool::new(false));
            let timer = {
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    thread::sleep(Duration::from_secs(seconds));
                    stop.store(true, Ordering::SeqCst);
                })
            };
            pipeline.run(&stop, Duration::from_millis(100));
            let _ = timer.join();

            let stats = listener.shutdown();
            let _ = forwarder.join();
            pipeline.process_pending();

            let (total, max) = pipeline
                .state()
                .with_histogram(|h| (h.total(), h.min_max().1));
            println!(
                "Packets: {} ({} dropped)",
                stats.packets, stats.dropped_packets
            );
            println!(
                "Events: {} ({} dropped records)",
                stats.events, stats.dropped_records
            );
            println!("Histogram total: {:.0}, max: {:.0}", total, max);
        }

        Commands::Integrate {
            input,
            calibration,
            ub,
            workers,
        } => {
            let mut pipeline = pipeline_for(&calibration, PipelineConfig::default())?;
            let replies = pipeline.tap(&[
                MessageKind::LoadFailed,
                MessageKind::Error,
                MessageKind::IntegrationResults,
            ]);
            pipeline.post(Message::SetOrientationMatrix(parse_ub(&ub)?));
            pipeline.post(Message::LoadFileData {
                path: input.clone(),
                request: load_request(&input, 0, None, workers)?,
            });
            pipeline.post(Message::QuickIntegrate);
            pipeline.process_pending();

            for message in drain(&replies)? {
                if let Message::IntegrationResults(results) = message {
                    println!("{} lattice points with signal", results.peaks.len());
                    for (level, count) in results.levels.iter().zip(&results.level_counts) {
                        println!("I/sigI >= {:>4}: {}", level, count);
                    }
                }
            }
        }
    }

    Ok(())
}
