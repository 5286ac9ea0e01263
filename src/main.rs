use anyhow::Result;
use chrono::{Days, Local, NaiveDate};
use clap::Parser;
use segscraper::{
    aggregate::{RunOutcome, RunReport},
    config::{Credentials, ReportConfig},
    error::PipelineError,
    export::{self, ExportFormat},
    fetch::SegmentFetcher,
    grid::Grid,
    pipeline::{self, CancelToken, PipelineOptions, RetryPolicy},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Fetch Amplitude segmentation totals per day and channel into one report.
#[derive(Parser, Debug)]
#[command(name = "segscraper", version)]
struct Cli {
    /// First day of the range (YYYY-MM-DD). Defaults to seven days ago.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of the range, inclusive (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    end: Option<NaiveDate>,

    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// YAML file overriding the channel list and query parameters.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the report is written to.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = ExportFormat::Xlsx)]
    format: ExportFormat,

    /// Maximum requests in flight.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..=32))]
    concurrency: u16,

    /// Per-request timeout in seconds. Overrides the config file.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,

    /// Extra attempts for a cell whose request failed.
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Delay between attempts, in milliseconds.
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Number of rows to log after the run.
    #[arg(long, default_value = "10")]
    preview: usize,

    /// Disable TLS certificate verification. Only for legacy endpoints.
    #[arg(long)]
    insecure_skip_tls_verify: bool,
}

const EXIT_FATAL: u8 = 2;
const EXIT_NO_DATA: u8 = 3;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    let cli = Cli::parse();

    // ─── 2) configuration ───────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => ReportConfig::load(path)?,
        None => ReportConfig::default(),
    };
    if let Some(secs) = cli.timeout_secs {
        config.fetch.timeout_secs = secs;
    }
    if cli.insecure_skip_tls_verify {
        config.fetch.insecure_skip_tls_verify = true;
    }
    config.fetch.validate()?;
    if config.fetch.insecure_skip_tls_verify {
        warn!("TLS certificate verification is DISABLED");
    }

    let today = Local::now().date_naive();
    let end = cli.end.unwrap_or(today);
    let start = cli.start.unwrap_or(end - Days::new(7));

    // ─── 3) fatal preconditions ─────────────────────────────────────
    let credentials = match Credentials::new(cli.api_key.clone(), cli.secret_key.clone()) {
        Ok(c) => c,
        Err(e) => return Ok(fatal(e.into())),
    };
    let grid = match Grid::new(start, end, config.channels.clone()) {
        Ok(g) => g,
        Err(e) => return Ok(fatal(e.into())),
    };

    // ─── 4) run ─────────────────────────────────────────────────────
    let options = PipelineOptions {
        concurrency: usize::from(cli.concurrency),
        retry: RetryPolicy {
            retries: cli.retries,
            delay: Duration::from_millis(cli.retry_delay_ms),
        },
        limit: config.fetch.limit,
    };
    let fetcher = Arc::new(SegmentFetcher::new(config.fetch.clone(), credentials)?);

    let cancel = CancelToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight requests");
                cancel.cancel();
            }
        }
    });

    info!(%start, %end, units = grid.len(), "fetching segmentation data");
    let started = Instant::now();
    let report = pipeline::run(fetcher, &grid, &options, &cancel, |p| {
        info!(
            "progress {}/{} ({:.0}% contributed, {} rows)",
            p.settled,
            p.expected,
            p.completion_ratio() * 100.0,
            p.rows
        );
    })
    .await;
    info!(elapsed = ?started.elapsed(), "fetch finished");

    // ─── 5) diagnostics & preview ───────────────────────────────────
    for diagnostic in &report.diagnostics {
        if diagnostic.error.keeps_rows() {
            warn!("{}", diagnostic);
        } else {
            error!("{}", diagnostic);
        }
    }

    if report.outcome() == RunOutcome::NoData {
        warn!("no data was fetched; check the credentials and the date range");
        return Ok(ExitCode::from(EXIT_NO_DATA));
    }
    log_preview(&report, cli.preview);

    // ─── 6) export ──────────────────────────────────────────────────
    let path = export::write_report(&report.table, &cli.out_dir, start, end, cli.format)?;
    info!(
        "wrote {} rows ({}/{} cells) to {}",
        report.table.len(),
        report.contributed,
        report.expected,
        path.display()
    );

    Ok(ExitCode::SUCCESS)
}

fn fatal(err: PipelineError) -> ExitCode {
    error!("{}", err);
    ExitCode::from(EXIT_FATAL)
}

fn log_preview(report: &RunReport, limit: usize) {
    for s in report.table.channel_summary() {
        info!(
            channel = %s.channel,
            rows = s.rows,
            transactions = s.transactions,
            "channel summary"
        );
    }
    for row in report.table.iter().take(limit) {
        info!(
            "{} | {} | {} | {}",
            row.payment_date, row.entity_id, row.count, row.channel
        );
    }
}
