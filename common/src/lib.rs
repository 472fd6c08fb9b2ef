//! Resumable multipart upload engine behind the `rup` tool
//!
//! `rup` copies files from a local folder into an object store using multipart uploads. It is
//! safe to run over and over on the same folder, including while files in it are still being
//! written:
//!
//! - files already complete remotely are skipped,
//! - files with an open multipart session are resumed, re-uploading only missing parts,
//! - files with a `<name>.lock` next to them are uploaded as far as whole parts allow and
//!   committed only once the lock is gone (or its writer process has died).
//!
//! # Layers
//!
//! - [`destination`] - the object store contract and its implementations
//! - [`multipart`] - reconciles one file with its remote session
//! - [`uploader`] - bounded pool of part-upload workers
//! - [`strategy`] - one upload attempt of one file
//! - [`sync`] and [`source`] - walks a folder and drives the per-file attempts
//!
//! # Logging Convention
//!
//! Errors carry their causes as `anyhow` chains; log them with `{:#}`.

pub mod checksum;
pub mod chunk;
pub mod config;
pub mod destination;
pub mod filter;
pub mod lockfile;
pub mod multipart;
pub mod progress;
pub mod source;
pub mod strategy;
pub mod sync;
#[cfg(test)]
pub mod testutils;
pub mod upload;
pub mod uploader;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, UploadConfig};

use std::sync::LazyLock;

static PROGRESS: LazyLock<progress::Progress> = LazyLock::new(progress::Progress::new);

pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// progress bar on a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    #[value(alias = "ProgressBar")]
    ProgressBar,
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// human readable duration, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

struct ProgressPrinterThread {
    done: std::sync::Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>,
    handle: std::thread::JoinHandle<()>,
}

impl ProgressPrinterThread {
    fn start(settings: &ProgressSettings) -> anyhow::Result<Self> {
        let progress_type = match settings.progress_type {
            ProgressType::Auto => {
                if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
                    ProgressType::ProgressBar
                } else {
                    ProgressType::TextUpdates
                }
            }
            other => other,
        };
        let delay = match &settings.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay '{}': {}", delay, err))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        let done = std::sync::Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let handle = {
            let done = done.clone();
            std::thread::spawn(move || {
                let mut printer = progress::ProgressPrinter::new(&PROGRESS);
                let bar = (progress_type == ProgressType::ProgressBar).then(|| {
                    let bar = indicatif::ProgressBar::new_spinner();
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    bar
                });
                let (lock, cvar) = &*done;
                let mut finished = lock.lock().unwrap_or_else(|err| err.into_inner());
                loop {
                    finished = cvar
                        .wait_timeout(finished, delay)
                        .unwrap_or_else(|err| err.into_inner())
                        .0;
                    let text = match printer.print() {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::warn!("failed printing progress: {:#}", &error);
                            break;
                        }
                    };
                    match &bar {
                        Some(bar) => {
                            bar.set_message(text);
                            bar.tick();
                        }
                        None => eprintln!("{}", text),
                    }
                    if *finished {
                        break;
                    }
                }
                if let Some(bar) = bar {
                    bar.finish_and_clear();
                }
            })
        };
        Ok(Self { done, handle })
    }

    fn stop(self) {
        let (lock, cvar) = &*self.done;
        *lock.lock().unwrap_or_else(|err| err.into_inner()) = true;
        cvar.notify_one();
        if self.handle.join().is_err() {
            tracing::warn!("progress printer thread panicked");
        }
    }
}

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = if output.verbose == 0 && !output.quiet {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    } else {
        tracing_subscriber::EnvFilter::new(level)
    };
    // keep a subscriber installed by the embedding program
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .try_init();
}

/// Splits a per-second rate into tokens added every interval.
fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second.div_ceil(10), std::time::Duration::from_millis(100))
    } else {
        (1, std::time::Duration::from_secs(1) / per_second.max(1) as u32)
    }
}

/// Sets up logging, the tokio runtime, throttling and progress, then runs `func`.
///
/// Returns the summary on success. On failure the error is printed (unless quiet) and `None`
/// is returned.
pub fn run<Fut, Summary, Error>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    if let Err(error) = throttle_config.validate() {
        if !output.quiet {
            eprintln!("{}", error);
        }
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the tokio runtime: {}", error);
            }
            return None;
        }
    };
    if let Some(max_open_files) = throttle_config.max_open_files {
        throttle::set_max_open_files(max_open_files);
    }
    if throttle_config.ops_throttle > 0 {
        let (tokens, interval) = replenish_schedule(throttle_config.ops_throttle);
        throttle::init_ops_tokens(tokens);
        tokio_runtime.spawn(throttle::run_ops_replenish_thread(tokens, interval));
    }
    if throttle_config.iops_throttle > 0 {
        let (tokens, interval) = replenish_schedule(throttle_config.iops_throttle);
        throttle::init_iops_tokens(tokens);
        tokio_runtime.spawn(throttle::run_iops_replenish_thread(tokens, interval));
    }
    let printer = match progress_settings.as_ref().map(ProgressPrinterThread::start) {
        Some(Ok(printer)) => Some(printer),
        Some(Err(error)) => {
            if !output.quiet {
                eprintln!("{:#}", error);
            }
            return None;
        }
        None => None,
    };
    let res = tokio_runtime.block_on(func());
    if let Some(printer) = printer {
        printer.stop();
    }
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{}", &error);
            }
            None
        }
    }
}
