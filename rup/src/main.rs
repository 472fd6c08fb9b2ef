use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use tracing::instrument;

use common::destination::{
    CountingDestination, DestinationStats, LocalDestination, LoggingDestination,
    ThrottledDestination,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rup",
    version,
    about = "Upload a local folder into an object store, resuming where the last run stopped",
    long_about = "`rup` uploads files with multipart uploads and can be re-run on the same folder at any time.

Files already present remotely are skipped, interrupted uploads are resumed and files that are
still being written (a `<name>.lock` file exists next to them) are uploaded part by part and
committed once the lock is released.

EXAMPLE:
    # Upload recordings into a local object store under the 'cam1' prefix
    rup /data/recordings /mnt/bucket --prefix cam1 -r --progress --summary"
)]
struct Args {
    // Upload options
    /// Key prefix prepended to every uploaded file
    #[arg(long, default_value = "", value_name = "PREFIX", help_heading = "Upload options")]
    prefix: String,

    /// Upload files in subdirectories as well
    #[arg(short = 'r', long, help_heading = "Upload options")]
    recursive: bool,

    /// Number of parts of one file uploaded concurrently
    #[arg(long, default_value = "4", value_name = "N", help_heading = "Upload options")]
    threads: usize,

    /// Upload attempts per file before it is reported as failed
    #[arg(long, default_value = "3", value_name = "N", help_heading = "Upload options")]
    max_attempts: usize,

    /// Delay after the first failed attempt, grows with every further attempt
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "2s" etc.
    #[arg(long, default_value = "1s", value_name = "DELAY", value_parser = humantime::parse_duration, help_heading = "Upload options")]
    retry_delay: std::time::Duration,

    /// How long to wait for outstanding part uploads of a file
    #[arg(long, default_value = "30min", value_name = "TIMEOUT", value_parser = humantime::parse_duration, help_heading = "Upload options")]
    drain_timeout: std::time::Duration,

    /// Checksum sent along with every part
    #[arg(long, default_value = "sha256", value_name = "ALGORITHM", help_heading = "Upload options")]
    checksum: common::checksum::ChecksumAlgorithm,

    /// Number of parts returned per listing request
    #[arg(long, default_value = "1000", value_name = "N", help_heading = "Upload options")]
    list_page_size: usize,

    /// Exit on first file that fails to upload
    #[arg(short = 'e', long = "fail-early", help_heading = "Upload options")]
    fail_early: bool,

    // Filtering options
    /// Glob pattern for files to include (can be specified multiple times)
    ///
    /// Only files matching at least one include pattern will be uploaded. Patterns use glob
    /// syntax: * matches anything except /, ** matches anything including /, ? matches single
    /// char, [...] for character classes. Leading / anchors to source root, trailing / matches
    /// only directories.
    #[arg(long, value_name = "PATTERN", action = clap::ArgAction::Append, help_heading = "Filtering")]
    include: Vec<String>,

    /// Glob pattern for files to exclude (can be specified multiple times)
    ///
    /// Files matching any exclude pattern will be skipped. Excludes are checked before includes.
    /// Lock files are never uploaded.
    #[arg(long, value_name = "PATTERN", action = clap::ArgAction::Append, help_heading = "Filtering")]
    exclude: Vec<String>,

    /// Read filter patterns from file
    #[arg(long, value_name = "PATH", conflicts_with_all = ["include", "exclude"], help_heading = "Filtering")]
    filter_file: Option<std::path::PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of local files open at once, leaving unspecified means no limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of backend requests per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of uploaded chunks per second, 0 means no throttle
    ///
    /// A part of size S counts as ((S - 1) / chunk size) + 1 chunks.
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size used to calculate number of I/O per part
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --iops-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: u64,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Local file or folder to upload
    #[arg()]
    src: std::path::PathBuf,

    /// Root directory of the object store
    #[arg()]
    dst_root: std::path::PathBuf,
}

struct Summary {
    sync: common::sync::Summary,
    stats: Arc<DestinationStats>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", &self.sync, &self.stats)
    }
}

fn build_filters(args: &Args) -> Result<common::filter::Filters> {
    if let Some(ref path) = args.filter_file {
        return common::filter::Filters::from_file(path);
    }
    common::filter::Filters::from_patterns(&args.include, &args.exclude)
}

#[instrument(skip(args), fields(src = ?args.src, dst_root = ?args.dst_root))]
async fn async_main(args: Args) -> Result<Summary> {
    let config = common::UploadConfig {
        threads: args.threads,
        recursive: args.recursive,
        max_attempts: args.max_attempts,
        retry_delay: args.retry_delay,
        checksum_algorithm: args.checksum,
        drain_timeout: args.drain_timeout,
        fail_early: args.fail_early,
    };
    config.validate().map_err(|err| anyhow!(err))?;
    let filters = build_filters(&args)?;
    tokio::fs::create_dir_all(&args.dst_root)
        .await
        .with_context(|| format!("cannot create destination root {:?}", &args.dst_root))?;
    let backend = LocalDestination::new(args.dst_root.clone(), &args.prefix)
        .with_page_size(args.list_page_size);
    let destination = CountingDestination::new(LoggingDestination::new(
        ThrottledDestination::new(backend, args.chunk_size),
    ));
    let stats = destination.stats();
    let strategy = common::strategy::MultipartUploadFileUploadingStrategy::new(
        Arc::new(destination),
        Arc::new(common::progress::ProgressTracker::new(common::get_progress())),
        Arc::new(common::lockfile::SystemProcessProbe),
        config.strategy_settings(),
    )?;
    let source = common::source::Source::new(args.src.clone(), config.recursive, filters);
    let synchronizer =
        common::sync::FolderSynchronizer::new(source, strategy, config.sync_settings())?
            .with_progress(common::get_progress());
    match synchronizer.sync().await {
        Ok(sync) => Ok(Summary { sync, stats }),
        Err(error) => {
            tracing::error!("{:#}", &error);
            if args.summary {
                let summary = Summary {
                    sync: error.summary,
                    stats,
                };
                return Err(anyhow!("{:#}\n\n{}", error, &summary));
            }
            Err(anyhow!("{:#}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size,
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
