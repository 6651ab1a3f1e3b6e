use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Env, Target};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use tfrecord_convert::{
    ArchiveExtractor, DatasetConfig, HttpFetcher, NoProgress, ProgressReporter, RunOptions, run,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Download the artist prediction batches and convert them to TFRecords"
)]
struct Cli {
    /// Directory to download and extract the dataset to (default: current directory)
    #[arg(long, value_name = "DIR", default_value = "")]
    data_dir: String,

    /// JSON file overriding the dataset layout
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keep the downloaded archive and extracted batches
    #[arg(long)]
    keep_sources: bool,

    /// Re-read every container after writing it
    #[arg(long)]
    verify: bool,

    /// Write run metrics as JSON to this file
    #[arg(long, value_name = "FILE")]
    metrics_out: Option<PathBuf>,

    /// Do not draw a download progress bar
    #[arg(long)]
    no_progress: bool,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,
}

/// Download progress drawn with indicatif.
struct BarProgress {
    pb: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let pb = ProgressBar::no_length();
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        pb.set_style(style);
        Self { pb }
    }
}

impl ProgressReporter for BarProgress {
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>) {
        if let Some(total) = total
            && self.pb.length() != Some(total)
        {
            self.pb.set_length(total);
        }
        self.pb.set_position(downloaded);
    }

    fn finish(&mut self) {
        self.pb.finish_and_clear();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .target(Target::Stdout)
        .init();

    let config = match &cli.config {
        Some(path) => DatasetConfig::from_json_file(path)
            .with_context(|| format!("load dataset layout {}", path.display()))?,
        None => DatasetConfig::default(),
    };
    let options = RunOptions {
        data_dir: PathBuf::from(cli.data_dir),
        keep_sources: cli.keep_sources,
        verify: cli.verify,
        metrics_out: cli.metrics_out,
    };

    let fetcher = HttpFetcher::new().context("initialise HTTP client")?;
    let extractor = ArchiveExtractor::new();
    let mut bar;
    let mut silent = NoProgress;
    let progress: &mut dyn ProgressReporter = if cli.no_progress || cli.quiet {
        &mut silent
    } else {
        bar = BarProgress::new();
        &mut bar
    };

    let summary = run(&config, &options, &fetcher, &extractor, progress).with_context(|| {
        format!(
            "convert dataset in {}",
            options.resolved_data_dir().display()
        )
    })?;
    info!(
        "Wrote {} records to {} containers in {:.1}s",
        summary.total_records(),
        summary.splits.len(),
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
