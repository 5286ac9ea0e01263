use chrono::NaiveDate;
use thiserror::Error;

use crate::grid::WorkUnit;

/// The requested end date precedes the start date.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid date range: end date {end} is before start date {start}")]
pub struct InvalidRangeError {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// One or more required secrets were not supplied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("missing credentials: {} not set", .missing.join(", "))]
pub struct MissingCredentialsError {
    pub missing: Vec<&'static str>,
}

/// A channel name appears more than once in a channel list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("duplicate channel `{0}`")]
pub struct DuplicateChannelError(pub String);

/// Transport-level failure for a single work unit.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("could not encode event filter: {source}")]
    Encode {
        unit: WorkUnit,
        #[source]
        source: serde_json::Error,
    },

    #[error("request failed: {source}")]
    Transport {
        unit: WorkUnit,
        #[source]
        source: reqwest::Error,
    },

    #[error("response body is not JSON: {source}")]
    Decode {
        unit: WorkUnit,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// The work unit whose request failed.
    pub fn unit(&self) -> &WorkUnit {
        match self {
            FetchError::Encode { unit, .. }
            | FetchError::Transport { unit, .. }
            | FetchError::Decode { unit, .. } => unit,
        }
    }
}

/// A segmentation payload that does not have the expected shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedResponseError {
    #[error("API returned an error: {0}")]
    Api(String),

    #[error("response has no `data` object")]
    MissingData,

    #[error("unexpected response shape: {0}")]
    Shape(String),

    #[error("{labels} series labels but {values} series values")]
    LengthMismatch { labels: usize, values: usize },

    #[error("response has no series labels")]
    NoLabels,

    #[error("response has no date bucket")]
    NoDateBucket,

    #[error("series label {0} has no entity identifier")]
    BadLabel(usize),

    #[error("series value {0} has no numeric total")]
    BadValue(usize),
}

/// Everything that can go wrong for one (date, channel) cell.
///
/// None of these abort a run; they are collected as diagnostics.
#[derive(Error, Debug)]
pub enum CellError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("malformed response: {0}")]
    Malformed(#[from] MalformedResponseError),

    #[error("possible truncation: {rows} rows returned with a limit of {limit}")]
    PossibleTruncation { rows: usize, limit: usize },

    #[error("cancelled before the request was sent")]
    Cancelled,

    #[error("fetch task panicked: {0}")]
    Panicked(String),
}

impl CellError {
    /// Whether the cell's rows are still part of the report.
    pub fn keeps_rows(&self) -> bool {
        matches!(self, CellError::PossibleTruncation { .. })
    }
}

/// Errors that stop a run before any work is dispatched.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidRange(#[from] InvalidRangeError),

    #[error(transparent)]
    MissingCredentials(#[from] MissingCredentialsError),
}
