// src/pipeline.rs

use chrono::NaiveDate;
use futures::FutureExt;
use serde_json::Value;
use std::{
    any::Any,
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::aggregate::{Aggregator, Progress, RunReport};
use crate::error::{CellError, PipelineError};
use crate::fetch::SegmentSource;
use crate::grid::{ChannelSet, Grid, WorkUnit};
use crate::normalize::normalize;

/// Shared flag checked before each unit is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed-delay retry for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Maximum number of requests in flight. 1 = strictly sequential.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Row count at which a response is flagged as possibly truncated.
    pub limit: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::default(),
            limit: 20_000,
        }
    }
}

enum Settled {
    Fetched {
        index: usize,
        unit: WorkUnit,
        result: Result<Value, CellError>,
    },
    Cancelled {
        index: usize,
        unit: WorkUnit,
    },
}

impl Settled {
    fn index(&self) -> usize {
        match self {
            Settled::Fetched { index, .. } | Settled::Cancelled { index, .. } => *index,
        }
    }
}

/// Build the grid for `start..=end` and run it.
pub async fn fetch_report<S, F>(
    source: Arc<S>,
    start: NaiveDate,
    end: NaiveDate,
    channels: ChannelSet,
    options: &PipelineOptions,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<RunReport, PipelineError>
where
    S: SegmentSource,
    F: FnMut(&Progress),
{
    let grid = Grid::new(start, end, channels)?;
    Ok(run(source, &grid, options, cancel, on_progress).await)
}

/// Fetch, normalize and aggregate every unit of `grid`.
///
/// Fetches run on spawned tasks, at most `options.concurrency` at a time,
/// and report back over a channel. This task is the only consumer: it
/// re-orders results by grid position before they reach the aggregator, so
/// the table order does not depend on completion order.
pub async fn run<S, F>(
    source: Arc<S>,
    grid: &Grid,
    options: &PipelineOptions,
    cancel: &CancelToken,
    mut on_progress: F,
) -> RunReport
where
    S: SegmentSource,
    F: FnMut(&Progress),
{
    let expected = grid.len();
    let concurrency = options.concurrency.max(1);
    info!(
        start = %grid.start(),
        end = %grid.end(),
        expected,
        concurrency,
        "starting run"
    );

    let (tx, mut rx) = mpsc::channel::<Settled>(concurrency * 2);
    let dispatcher = tokio::spawn(dispatch(
        source,
        grid.clone(),
        options.retry,
        concurrency,
        cancel.clone(),
        tx,
    ));

    let mut aggregator = Aggregator::new(expected);
    let mut pending: BTreeMap<usize, Settled> = BTreeMap::new();
    let mut next = 0;

    while let Some(msg) = rx.recv().await {
        pending.insert(msg.index(), msg);
        while let Some(msg) = pending.remove(&next) {
            settle(&mut aggregator, msg, options.limit);
            next += 1;
            on_progress(&aggregator.progress());
        }
    }

    if let Err(e) = dispatcher.await {
        error!("dispatcher failed: {}", e);
    }
    // only reachable if the dispatcher itself died
    for (_, msg) in pending {
        settle(&mut aggregator, msg, options.limit);
        on_progress(&aggregator.progress());
    }

    let report = aggregator.finish(cancel.is_cancelled());
    info!(
        rows = report.table.len(),
        contributed = report.contributed,
        expected = report.expected,
        diagnostics = report.diagnostics.len(),
        cancelled = report.cancelled,
        "run complete"
    );
    report
}

async fn dispatch<S: SegmentSource>(
    source: Arc<S>,
    grid: Grid,
    retry: RetryPolicy,
    concurrency: usize,
    cancel: CancelToken,
    tx: mpsc::Sender<Settled>,
) {
    let sem = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    for (index, unit) in grid.iter().enumerate() {
        // never closed
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
            break;
        };

        if cancel.is_cancelled() {
            drop(permit);
            if tx.send(Settled::Cancelled { index, unit }).await.is_err() {
                break;
            }
            continue;
        }

        let source = Arc::clone(&source);
        let tx = tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = AssertUnwindSafe(fetch_with_retry(&*source, &unit, retry, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(CellError::Panicked(panic_message(payload))));
            drop(permit);
            let _ = tx.send(Settled::Fetched {
                index,
                unit,
                result,
            })
            .await;
        });
    }
    // drop the original sender so `rx.recv()` ends once every task has reported
    drop(tx);

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!("fetch task failed: {}", e);
        }
    }
}

async fn fetch_with_retry<S: SegmentSource>(
    source: &S,
    unit: &WorkUnit,
    retry: RetryPolicy,
    cancel: &CancelToken,
) -> Result<Value, CellError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match source.fetch(unit).await {
            Ok(body) => return Ok(body),
            Err(e) if attempt <= retry.retries && !cancel.is_cancelled() => {
                warn!(unit = %unit, attempt, "fetch failed, retrying: {}", e);
                sleep(retry.delay).await;
                if cancel.is_cancelled() {
                    debug!(unit = %unit, attempt, "retry abandoned after cancellation");
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn settle(aggregator: &mut Aggregator, msg: Settled, limit: usize) {
    match msg {
        Settled::Cancelled { unit, .. } => {
            debug!(unit = %unit, "skipped after cancellation");
            aggregator.reject(unit, CellError::Cancelled);
        }
        Settled::Fetched { unit, result, .. } => {
            match result.and_then(|body| normalize(&body).map_err(CellError::from)) {
                Ok(fragments) => {
                    let rows = aggregator.accept(&unit, fragments);
                    debug!(unit = %unit, rows, "unit settled");
                    if rows >= limit {
                        warn!(unit = %unit, rows, limit, "response may be truncated");
                        aggregator.warn(unit, CellError::PossibleTruncation { rows, limit });
                    }
                }
                Err(e) => {
                    error!(unit = %unit, "{}", e);
                    aggregator.reject(unit, e);
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
