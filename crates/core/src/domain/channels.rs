//! Channel numbering and selection
//!
//! Callers address channels with 1-based identifiers; node ports are 0-based.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 1-based, externally visible channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(u32);

impl ChannelId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map a channel count to the identifiers exposed to callers: `[1, 2, …, count]`
pub fn map_channels(count: u16) -> Vec<ChannelId> {
    (1..=u32::from(count)).map(ChannelId::new).collect()
}

/// Which per-channel slots an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelection {
    All,
    Index(usize),
}

impl ChannelSelection {
    /// Resolve an optional channel identifier against the mapped channel list.
    ///
    /// A missing identifier selects every channel. So does an identifier that
    /// is not in `channels`: unknown channels are accepted and widened to the
    /// whole graph rather than rejected.
    pub fn resolve(channel: Option<ChannelId>, channels: &[ChannelId]) -> Self {
        let Some(channel) = channel else {
            return Self::All;
        };

        match channels.iter().position(|c| *c == channel) {
            Some(index) => Self::Index(index),
            None => Self::All,
        }
    }

    /// Slot indices covered by this selection out of `len` slots
    pub fn indices(self, len: usize) -> Vec<usize> {
        match self {
            Self::All => (0..len).collect(),
            Self::Index(index) if index < len => vec![index],
            Self::Index(_) => Vec::new(),
        }
    }
}
