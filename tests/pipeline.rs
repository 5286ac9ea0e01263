use chrono::NaiveDate;
use segscraper::{
    aggregate::{Progress, RunOutcome, RunReport},
    error::{CellError, FetchError, PipelineError},
    export::{export_bytes, ExportFormat},
    fetch::SegmentSource,
    grid::{ChannelSet, Grid, WorkUnit},
    pipeline::{fetch_report, run, CancelToken, PipelineOptions, RetryPolicy},
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn body(date: &str, rows: &[(&str, f64)]) -> Value {
    json!({
        "data": {
            "seriesLabels": rows.iter().map(|(id, _)| json!([0, id])).collect::<Vec<_>>(),
            "series": rows.iter().map(|(_, n)| json!([n])).collect::<Vec<_>>(),
            "xValues": [date],
        }
    })
}

/// Two rows per unit, ids derived from the unit.
fn two_rows(unit: &WorkUnit) -> Value {
    let date = unit.date.to_string();
    let a = format!("{}-{}-a", date, unit.channel);
    let b = format!("{}-{}-b", date, unit.channel);
    body(&date, &[(a.as_str(), 1.0), (b.as_str(), 2.0)])
}

enum Reply {
    Body(Value),
    Broken,
    /// Fail this many times, then answer with two rows.
    Flaky(u32),
}

#[derive(Default)]
struct StubSource {
    replies: HashMap<WorkUnit, Reply>,
    delays: HashMap<WorkUnit, Duration>,
    calls: Mutex<Vec<WorkUnit>>,
}

impl StubSource {
    fn with(mut self, unit: WorkUnit, reply: Reply) -> Self {
        self.replies.insert(unit, reply);
        self
    }

    fn delayed(mut self, unit: WorkUnit, delay: Duration) -> Self {
        self.delays.insert(unit, delay);
        self
    }

    fn calls(&self) -> Vec<WorkUnit> {
        self.calls.lock().unwrap().clone()
    }
}

fn broken(unit: &WorkUnit) -> FetchError {
    FetchError::Decode {
        unit: unit.clone(),
        source: serde_json::from_str::<Value>("<html>").unwrap_err(),
    }
}

impl SegmentSource for StubSource {
    async fn fetch(&self, unit: &WorkUnit) -> Result<Value, FetchError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(unit.clone());
            calls.iter().filter(|u| *u == unit).count() as u32
        };

        if let Some(delay) = self.delays.get(unit) {
            tokio::time::sleep(*delay).await;
        }

        match self.replies.get(unit) {
            None => Ok(two_rows(unit)),
            Some(Reply::Body(v)) => Ok(v.clone()),
            Some(Reply::Broken) => Err(broken(unit)),
            Some(Reply::Flaky(n)) if attempt <= *n => Err(broken(unit)),
            Some(Reply::Flaky(_)) => Ok(two_rows(unit)),
        }
    }
}

fn small_grid() -> Grid {
    let channels = ChannelSet::new(["Email", "Direct"]).unwrap();
    Grid::new(d(1), d(2), channels).unwrap()
}

async fn run_stub(source: StubSource, grid: &Grid, options: &PipelineOptions) -> RunReport {
    run(Arc::new(source), grid, options, &CancelToken::new(), |_| {}).await
}

fn row_keys(report: &RunReport) -> Vec<(String, String, String)> {
    report
        .table
        .iter()
        .map(|r| {
            (
                r.payment_date.clone(),
                r.channel.clone(),
                r.entity_id.clone(),
            )
        })
        .collect()
}

#[tokio::test]
async fn end_to_end_rows_are_date_major_channel_minor() {
    init_logging();
    let report = run_stub(StubSource::default(), &small_grid(), &PipelineOptions::default()).await;

    assert_eq!(report.outcome(), RunOutcome::Complete);
    assert_eq!(report.table.len(), 8);
    assert!(report.diagnostics.is_empty());

    let groups: Vec<(String, String)> = report
        .table
        .iter()
        .map(|r| (r.payment_date.clone(), r.channel.clone()))
        .collect();
    let expected: Vec<(String, String)> = [
        ("2024-01-01", "Email"),
        ("2024-01-01", "Email"),
        ("2024-01-01", "Direct"),
        ("2024-01-01", "Direct"),
        ("2024-01-02", "Email"),
        ("2024-01-02", "Email"),
        ("2024-01-02", "Direct"),
        ("2024-01-02", "Direct"),
    ]
    .iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect();
    assert_eq!(groups, expected);

    let counts: Vec<f64> = report.table.iter().map(|r| r.count).collect();
    assert_eq!(counts, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
}

#[tokio::test]
async fn parallel_fetch_keeps_grid_order() {
    init_logging();
    let grid = small_grid();

    // first units finish last
    let mut source = StubSource::default();
    for (i, unit) in grid.iter().enumerate() {
        let ms = 40 - 10 * i as u64;
        source = source.delayed(unit, Duration::from_millis(ms));
    }
    let options = PipelineOptions {
        concurrency: 4,
        ..PipelineOptions::default()
    };
    let parallel = run_stub(source, &grid, &options).await;
    let sequential =
        run_stub(StubSource::default(), &grid, &PipelineOptions::default()).await;

    assert_eq!(parallel.table.len(), 8);
    assert_eq!(row_keys(&parallel), row_keys(&sequential));
}

#[tokio::test]
async fn failed_unit_does_not_affect_siblings() {
    init_logging();
    let grid = small_grid();
    let failing = WorkUnit::new(d(1), "Direct");
    let source = Arc::new(StubSource::default().with(failing.clone(), Reply::Broken));

    let report = run(
        Arc::clone(&source),
        &grid,
        &PipelineOptions::default(),
        &CancelToken::new(),
        |_| {},
    )
    .await;

    assert_eq!(source.calls().len(), 4);
    assert_eq!(report.outcome(), RunOutcome::Partial);
    assert_eq!(report.contributed, 3);
    assert_eq!(report.expected, 4);
    assert_eq!(report.table.len(), 6);
    assert!(report.table.iter().all(|r| !(r.payment_date == "2024-01-01"
        && r.channel == "Direct")));

    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].unit, failing);
    assert!(matches!(report.diagnostics[0].error, CellError::Fetch(_)));
}

#[tokio::test]
async fn malformed_response_is_reported_per_cell() {
    init_logging();
    let grid = small_grid();
    let bad = WorkUnit::new(d(2), "Email");
    let mismatched = json!({
        "data": {
            "seriesLabels": [[0, "A"], [0, "B"], [0, "C"]],
            "series": [[1], [2]],
            "xValues": ["2024-01-02"],
        }
    });
    let api_error = WorkUnit::new(d(2), "Direct");
    let source = StubSource::default()
        .with(bad.clone(), Reply::Body(mismatched))
        .with(
            api_error.clone(),
            Reply::Body(json!({"error": "rate limited"})),
        );

    let report = run_stub(source, &grid, &PipelineOptions::default()).await;

    assert_eq!(report.contributed, 2);
    assert_eq!(report.table.len(), 4);
    let failed: Vec<&WorkUnit> = report.diagnostics.iter().map(|d| &d.unit).collect();
    assert_eq!(failed, vec![&bad, &api_error]);
    assert!(report
        .diagnostics
        .iter()
        .all(|d| matches!(d.error, CellError::Malformed(_))));
    assert!(report.diagnostics[1].to_string().contains("rate limited"));
}

#[tokio::test]
async fn all_failures_give_no_data() {
    init_logging();
    let grid = small_grid();
    let mut source = StubSource::default();
    for unit in grid.iter() {
        source = source.with(unit, Reply::Broken);
    }

    let report = run_stub(source, &grid, &PipelineOptions::default()).await;

    assert_eq!(report.outcome(), RunOutcome::NoData);
    assert!(report.table.is_empty());
    assert_eq!(report.diagnostics.len(), 4);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn rerun_exports_identical_bytes() {
    init_logging();
    let grid = small_grid();
    let first = run_stub(StubSource::default(), &grid, &PipelineOptions::default()).await;
    let options = PipelineOptions {
        concurrency: 3,
        ..PipelineOptions::default()
    };
    let second = run_stub(StubSource::default(), &grid, &options).await;

    let a = export_bytes(&first.table, ExportFormat::Csv).unwrap();
    let b = export_bytes(&second.table, ExportFormat::Csv).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn cancellation_skips_undispatched_units() {
    init_logging();
    let grid = small_grid();
    let source = Arc::new(StubSource::default());
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = run(
        Arc::clone(&source),
        &grid,
        &PipelineOptions::default(),
        &cancel,
        |_| {},
    )
    .await;

    assert!(source.calls().is_empty());
    assert!(report.cancelled);
    assert_eq!(report.outcome(), RunOutcome::NoData);
    assert_eq!(report.diagnostics.len(), 4);
    assert!(report
        .diagnostics
        .iter()
        .all(|d| matches!(d.error, CellError::Cancelled)));
}

#[tokio::test]
async fn cancelling_mid_run_keeps_finished_rows() {
    init_logging();
    let grid = small_grid();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    let mut source = StubSource::default();
    for unit in grid.iter() {
        source = source.delayed(unit, Duration::from_millis(20));
    }

    let report = run(
        Arc::new(source),
        &grid,
        &PipelineOptions::default(),
        &cancel,
        move |p: &Progress| {
            if p.settled == 1 {
                trigger.cancel();
            }
        },
    )
    .await;

    assert!(report.cancelled);
    assert!(report.contributed >= 1);
    assert!(report.contributed < 4);
    assert_eq!(report.table.len(), report.contributed * 2);
    assert_eq!(
        report.diagnostics.len(),
        report.expected - report.contributed
    );
}

#[tokio::test]
async fn cancellation_stops_pending_retries() {
    init_logging();
    let channels = ChannelSet::new(["Email"]).unwrap();
    let grid = Grid::new(d(1), d(1), channels).unwrap();
    let failing = WorkUnit::new(d(1), "Email");
    let options = PipelineOptions {
        retry: RetryPolicy {
            retries: 5,
            delay: Duration::from_millis(300),
        },
        ..PipelineOptions::default()
    };

    let source = Arc::new(StubSource::default().with(failing.clone(), Reply::Broken));
    let cancel = CancelToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        }
    });

    let report = run(Arc::clone(&source), &grid, &options, &cancel, |_| {}).await;

    assert!(report.cancelled);
    assert_eq!(source.calls(), vec![failing.clone()]);
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].unit, failing);
    assert!(matches!(report.diagnostics[0].error, CellError::Fetch(_)));
}

#[tokio::test]
async fn retry_recovers_transient_failure() {
    init_logging();
    let grid = small_grid();
    let flaky = WorkUnit::new(d(1), "Email");
    let options = PipelineOptions {
        retry: RetryPolicy {
            retries: 2,
            delay: Duration::from_millis(1),
        },
        ..PipelineOptions::default()
    };

    let source = Arc::new(StubSource::default().with(flaky.clone(), Reply::Flaky(2)));
    let report = run(
        Arc::clone(&source),
        &grid,
        &options,
        &CancelToken::new(),
        |_| {},
    )
    .await;

    assert_eq!(report.outcome(), RunOutcome::Complete);
    assert_eq!(source.calls().iter().filter(|u| **u == flaky).count(), 3);

    // without retries the same unit fails
    let report = run_stub(
        StubSource::default().with(flaky.clone(), Reply::Flaky(1)),
        &grid,
        &PipelineOptions::default(),
    )
    .await;
    assert_eq!(report.contributed, 3);
    assert_eq!(report.diagnostics[0].unit, flaky);
}

#[tokio::test]
async fn full_responses_are_flagged_as_possibly_truncated() {
    init_logging();
    let grid = small_grid();
    let options = PipelineOptions {
        limit: 2,
        ..PipelineOptions::default()
    };

    let report = run_stub(StubSource::default(), &grid, &options).await;

    assert_eq!(report.outcome(), RunOutcome::Complete);
    assert_eq!(report.table.len(), 8);
    assert_eq!(report.diagnostics.len(), 4);
    assert!(report.diagnostics.iter().all(|d| matches!(
        d.error,
        CellError::PossibleTruncation { rows: 2, limit: 2 }
    )));
}

#[tokio::test]
async fn progress_is_reported_per_unit() {
    init_logging();
    let grid = small_grid();
    let mut seen = Vec::new();

    run(
        Arc::new(StubSource::default()),
        &grid,
        &PipelineOptions::default(),
        &CancelToken::new(),
        |p| seen.push(*p),
    )
    .await;

    assert_eq!(
        seen.iter().map(|p| p.settled).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    let last = seen.last().unwrap();
    assert_eq!(last.expected, 4);
    assert_eq!(last.rows, 8);
    assert_eq!(last.completion_ratio(), 1.0);
}

#[tokio::test]
async fn inverted_range_aborts_before_any_fetch() {
    init_logging();
    let source = Arc::new(StubSource::default());

    let result = fetch_report(
        Arc::clone(&source),
        d(2),
        d(1),
        ChannelSet::default(),
        &PipelineOptions::default(),
        &CancelToken::new(),
        |_| {},
    )
    .await;

    assert!(matches!(result, Err(PipelineError::InvalidRange(_))));
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn single_day_fetches_each_channel_once() {
    init_logging();
    let source = Arc::new(StubSource::default());

    let report = fetch_report(
        Arc::clone(&source),
        d(5),
        d(5),
        ChannelSet::default(),
        &PipelineOptions::default(),
        &CancelToken::new(),
        |_| {},
    )
    .await
    .unwrap();

    assert_eq!(report.expected, 10);
    assert_eq!(source.calls().len(), 10);
    assert_eq!(report.table.len(), 20);
}
