//! Domain entities and business rules

pub mod audio;
pub mod channels;
pub mod command;
pub mod config;
pub mod graph;
pub mod registry;

#[cfg(test)]
pub(crate) mod mock;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioContext, AudioError, Edge, MediaStream, NodeId, PlaybackElement, StreamId,
};
pub use channels::{map_channels, ChannelId, ChannelSelection};
pub use command::{Action, Command, CommandError, CommandResult};
pub use config::{
    AppConfig, ChannelLayout, ConfigError, ConfigManager, LayoutOverride, PatchbayConfig,
    RouterConfig, RoutingOverride,
};
pub use graph::{AudioGraph, GraphState, NodeSet, PlaybackMode};
pub use registry::{AudioRouter, ChannelStream, GroupId, InstanceStatus, TrackId};
