// src/grid/mod.rs

pub mod channels;

use chrono::NaiveDate;
use std::fmt;

use crate::error::InvalidRangeError;
pub use channels::{ChannelSet, DEFAULT_CHANNELS};

/// One (date, channel) cell of the report grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkUnit {
    pub date: NaiveDate,
    pub channel: String,
}

impl WorkUnit {
    pub fn new(date: NaiveDate, channel: impl Into<String>) -> Self {
        Self {
            date,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.channel, self.date)
    }
}

/// The inclusive date range crossed with a channel list.
///
/// Units are produced lazily, dates ascending in the outer loop and
/// channels in list order in the inner loop. `iter()` may be called any
/// number of times; each call restarts from the first unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    start: NaiveDate,
    end: NaiveDate,
    channels: ChannelSet,
}

impl Grid {
    pub fn new(
        start: NaiveDate,
        end: NaiveDate,
        channels: ChannelSet,
    ) -> Result<Self, InvalidRangeError> {
        if end < start {
            return Err(InvalidRangeError { start, end });
        }
        Ok(Self {
            start,
            end,
            channels,
        })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Number of calendar days, both endpoints included.
    pub fn days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    /// Total number of work units.
    pub fn len(&self) -> usize {
        self.days() * self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> GridIter<'_> {
        GridIter {
            grid: self,
            date: (!self.channels.is_empty()).then_some(self.start),
            channel_idx: 0,
            remaining: self.len(),
        }
    }
}

impl<'a> IntoIterator for &'a Grid {
    type Item = WorkUnit;
    type IntoIter = GridIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct GridIter<'a> {
    grid: &'a Grid,
    date: Option<NaiveDate>,
    channel_idx: usize,
    remaining: usize,
}

impl Iterator for GridIter<'_> {
    type Item = WorkUnit;

    fn next(&mut self) -> Option<WorkUnit> {
        let date = self.date?;
        let channel = self.grid.channels.get(self.channel_idx)?;
        let unit = WorkUnit::new(date, channel);

        self.channel_idx += 1;
        if self.channel_idx == self.grid.channels.len() {
            self.channel_idx = 0;
            self.date = date.succ_opt().filter(|d| *d <= self.grid.end);
        }
        self.remaining -= 1;

        Some(unit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for GridIter<'_> {}
