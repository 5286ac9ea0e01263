// src/aggregate/mod.rs

use serde::Serialize;
use std::{collections::BTreeMap, fmt};

use crate::error::CellError;
use crate::grid::WorkUnit;
use crate::normalize::RowFragment;

/// A fragment row tagged with the channel it was fetched for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub payment_date: String,
    pub entity_id: String,
    pub count: f64,
    pub channel: String,
}

impl ReportRow {
    pub fn from_fragment(fragment: RowFragment, channel: &str) -> Self {
        Self {
            payment_date: fragment.payment_date,
            entity_id: fragment.entity_id,
            count: fragment.count,
            channel: channel.to_string(),
        }
    }
}

/// Rows in grid order. Appends never merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    rows: Vec<ReportRow>,
}

/// Per-channel totals for the run summary.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSummary {
    pub channel: String,
    pub rows: usize,
    pub transactions: f64,
}

impl ReportTable {
    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReportRow> {
        self.rows.iter()
    }

    fn extend(&mut self, rows: impl IntoIterator<Item = ReportRow>) {
        self.rows.extend(rows);
    }

    /// Row count and transaction total per channel, channels sorted by name.
    pub fn channel_summary(&self) -> Vec<ChannelSummary> {
        let mut by_channel: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
        for row in &self.rows {
            let entry = by_channel.entry(row.channel.as_str()).or_default();
            entry.0 += 1;
            entry.1 += row.count;
        }
        by_channel
            .into_iter()
            .map(|(channel, (rows, transactions))| ChannelSummary {
                channel: channel.to_string(),
                rows,
                transactions,
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a ReportTable {
    type Item = &'a ReportRow;
    type IntoIter = std::slice::Iter<'a, ReportRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// A problem recorded for one cell.
#[derive(Debug)]
pub struct Diagnostic {
    pub unit: WorkUnit,
    pub error: CellError,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error fetching data for {} on {}: {}",
            self.unit.channel, self.unit.date, self.error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
}

/// Snapshot emitted after every settled unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub settled: usize,
    pub expected: usize,
    pub contributed: usize,
    pub rows: usize,
}

impl Progress {
    pub fn completion_ratio(&self) -> f64 {
        ratio(self.contributed, self.expected)
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Accumulates normalized fragments for one run.
#[derive(Debug)]
pub struct Aggregator {
    state: RunState,
    expected: usize,
    settled: usize,
    contributed: usize,
    table: ReportTable,
    diagnostics: Vec<Diagnostic>,
}

impl Aggregator {
    pub fn new(expected: usize) -> Self {
        Self {
            state: RunState::Idle,
            expected,
            settled: 0,
            contributed: 0,
            table: ReportTable::default(),
            diagnostics: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Append a successful unit's rows, tagged with its channel.
    /// Returns the number of rows added.
    pub fn accept(&mut self, unit: &WorkUnit, fragments: Vec<RowFragment>) -> usize {
        self.state = RunState::Running;
        let n = fragments.len();
        self.table.extend(
            fragments
                .into_iter()
                .map(|f| ReportRow::from_fragment(f, &unit.channel)),
        );
        self.settled += 1;
        self.contributed += 1;
        n
    }

    /// Record a unit that produced no rows.
    pub fn reject(&mut self, unit: WorkUnit, error: CellError) {
        self.state = RunState::Running;
        self.settled += 1;
        self.diagnostics.push(Diagnostic { unit, error });
    }

    /// Record a diagnostic for a unit whose rows were kept.
    pub fn warn(&mut self, unit: WorkUnit, error: CellError) {
        self.diagnostics.push(Diagnostic { unit, error });
    }

    pub fn progress(&self) -> Progress {
        Progress {
            settled: self.settled,
            expected: self.expected,
            contributed: self.contributed,
            rows: self.table.len(),
        }
    }

    pub fn finish(mut self, cancelled: bool) -> RunReport {
        self.state = RunState::Completed;
        RunReport {
            state: self.state,
            table: self.table,
            diagnostics: self.diagnostics,
            expected: self.expected,
            contributed: self.contributed,
            cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every unit contributed rows.
    Complete,
    /// Some units contributed rows.
    Partial,
    /// No unit contributed rows.
    NoData,
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    pub table: ReportTable,
    pub diagnostics: Vec<Diagnostic>,
    pub expected: usize,
    pub contributed: usize,
    pub cancelled: bool,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.contributed == 0 {
            RunOutcome::NoData
        } else if self.contributed == self.expected {
            RunOutcome::Complete
        } else {
            RunOutcome::Partial
        }
    }

    pub fn completion_ratio(&self) -> f64 {
        ratio(self.contributed, self.expected)
    }
}
