//! Fetch per-day, per-channel event segmentation totals from Amplitude and
//! flatten them into a single exportable report.
//!
//! The pipeline is `grid` → `fetch` → `normalize` → `aggregate` → `export`,
//! driven by [`pipeline::run`].

pub mod aggregate;
pub mod config;
pub mod error;
pub mod export;
pub mod fetch;
pub mod grid;
pub mod normalize;
pub mod pipeline;
