// src/grid/channels.rs

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::DuplicateChannelError;

/// Marketing channels queried when no channel list is configured.
pub static DEFAULT_CHANNELS: &[&str] = &[
    "Email",
    "Paid Search",
    "Affiliates",
    "Metasearch",
    "Direct",
    "Organic Search",
    "Display",
    "Web Push",
    "Referral",
    "Social",
];

/// An ordered list of distinct channel names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChannelSet(Vec<String>);

impl ChannelSet {
    pub fn new<I, S>(channels: I) -> Result<Self, DuplicateChannelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        let mut seen = HashSet::with_capacity(channels.len());
        for c in &channels {
            if !seen.insert(c.as_str()) {
                return Err(DuplicateChannelError(c.clone()));
            }
        }
        Ok(Self(channels))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self(DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect())
    }
}

impl TryFrom<Vec<String>> for ChannelSet {
    type Error = DuplicateChannelError;

    fn try_from(channels: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(channels)
    }
}

impl From<ChannelSet> for Vec<String> {
    fn from(set: ChannelSet) -> Self {
        set.0
    }
}
