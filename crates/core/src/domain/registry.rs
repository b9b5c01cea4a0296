//! Instance registry
//!
//! Owns the shared audio context and every routing graph, addressed by
//! (group, track). A group is typically one remote client; its tracks are the
//! streams that client publishes.

use crate::domain::audio::{
    AudioContext, AudioError, Edge, MediaStream, NodeId, Result, StreamId,
};
use crate::domain::channels::ChannelId;
use crate::domain::config::{self, RouterConfig, RoutingOverride};
use crate::domain::graph::{AudioGraph, GraphState, PlaybackMode};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier of an instance group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a track within a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub group: GroupId,
    pub track: TrackId,
    pub state: GraphState,
    pub playing: bool,
    pub muted: bool,
    pub mode: PlaybackMode,
    pub stream: Option<StreamId>,
}

impl InstanceStatus {
    fn of(group: &GroupId, graph: &AudioGraph) -> Self {
        Self {
            group: group.clone(),
            track: graph.id().clone(),
            state: graph.state(),
            playing: graph.is_playing(),
            muted: graph.is_muted(),
            mode: graph.mode(),
            stream: graph.stream().map(|s| s.id),
        }
    }
}

/// Registry of routing graphs sharing one audio context
pub struct AudioRouter {
    context: Arc<dyn AudioContext>,
    config: RouterConfig,
    graphs: HashMap<GroupId, HashMap<TrackId, AudioGraph>>,
}

impl AudioRouter {
    /// Create a router with the default (stereo) configuration
    pub fn new(context: Arc<dyn AudioContext>) -> Self {
        Self::with_config(context, RouterConfig::default())
    }

    pub fn with_config(context: Arc<dyn AudioContext>, config: RouterConfig) -> Self {
        Self {
            context,
            config,
            graphs: HashMap::new(),
        }
    }

    /// Replace the configuration with `overrides` deep-merged over the defaults.
    ///
    /// Only instances added afterwards use the new configuration.
    pub fn set_configuration(&mut self, overrides: &RoutingOverride) -> config::Result<()> {
        self.config = RouterConfig::from_overrides(overrides)?;
        info!(
            input = self.config.input.channels,
            output = self.config.output.channels,
            "Router configuration updated"
        );
        Ok(())
    }

    pub fn configuration(&self) -> &RouterConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<dyn AudioContext> {
        &self.context
    }

    pub fn input_channels(&self) -> Vec<ChannelId> {
        self.config.input_channels()
    }

    /// Create the graph for (group, track), replacing any existing one
    pub fn add_instance(
        &mut self,
        group: GroupId,
        track: TrackId,
        mode: PlaybackMode,
    ) -> &mut AudioGraph {
        debug!(%group, %track, ?mode, "Adding instance");
        let graph = AudioGraph::new(track.clone(), self.context.clone(), self.config, mode);
        match self.graphs.entry(group).or_default().entry(track) {
            Entry::Occupied(mut entry) => {
                // the replaced graph releases its nodes on drop
                entry.insert(graph);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(graph),
        }
    }

    pub fn instance_group(&self, group: &GroupId) -> Option<&HashMap<TrackId, AudioGraph>> {
        self.graphs.get(group)
    }

    pub fn instance(&self, group: &GroupId, track: &TrackId) -> Option<&AudioGraph> {
        self.graphs.get(group)?.get(track)
    }

    pub fn instance_mut(&mut self, group: &GroupId, track: &TrackId) -> Option<&mut AudioGraph> {
        self.graphs.get_mut(group)?.get_mut(track)
    }

    /// Disconnect and drop an instance. Returns whether it existed.
    pub fn remove_instance(&mut self, group: &GroupId, track: &TrackId) -> Result<bool> {
        let Some(tracks) = self.graphs.get_mut(group) else {
            return Ok(false);
        };
        let Some(mut graph) = tracks.remove(track) else {
            return Ok(false);
        };
        if tracks.is_empty() {
            self.graphs.remove(group);
        }

        graph.disconnect()?;
        debug!(%group, %track, "Instance removed");
        Ok(true)
    }

    /// Status of every instance, ordered by group then track
    pub fn status(&self) -> Vec<InstanceStatus> {
        let mut status: Vec<_> = self
            .graphs
            .iter()
            .flat_map(|(group, tracks)| {
                tracks
                    .values()
                    .map(move |graph| InstanceStatus::of(group, graph))
            })
            .collect();
        status.sort_by(|a, b| (&a.group, &a.track).cmp(&(&b.group, &b.track)));
        status
    }

    pub fn instance_status(&self, group: &GroupId, track: &TrackId) -> Option<InstanceStatus> {
        self.instance(group, track)
            .map(|graph| InstanceStatus::of(group, graph))
    }

    /// Extract one input channel of `stream` into a new single-channel stream.
    ///
    /// The transient source/splitter chain belongs to the returned handle and
    /// is released when the handle is dropped. Unlike the graph controls, an
    /// unknown channel is an error here: there is no "all channels"
    /// single-channel stream.
    pub fn channel_stream(
        &self,
        stream: &MediaStream,
        channel: ChannelId,
    ) -> Result<ChannelStream> {
        let index = self
            .input_channels()
            .iter()
            .position(|c| *c == channel)
            .ok_or(AudioError::InvalidChannel(channel.get()))?;

        let mut nodes = Vec::with_capacity(3);
        match self.build_extraction(stream, index, &mut nodes) {
            Ok(extracted) => {
                debug!(
                    stream = %stream.id,
                    %channel,
                    extracted = %extracted.id,
                    "Channel stream extracted"
                );
                Ok(ChannelStream {
                    context: self.context.clone(),
                    channel,
                    stream: extracted,
                    nodes,
                })
            }
            Err(e) => {
                release_nodes(self.context.as_ref(), nodes);
                Err(e)
            }
        }
    }

    fn build_extraction(
        &self,
        stream: &MediaStream,
        index: usize,
        created: &mut Vec<NodeId>,
    ) -> Result<MediaStream> {
        let ctx = &self.context;
        let source = ctx.create_source(stream)?;
        created.push(source);
        let splitter = ctx.create_splitter(usize::from(self.config.input.channels))?;
        created.push(splitter);
        let (destination, extracted) = ctx.create_stream_destination(1)?;
        created.push(destination);

        ctx.connect(Edge::new(source, 0, splitter, 0))?;
        ctx.connect(Edge::new(splitter, index, destination, 0))?;
        Ok(extracted)
    }
}

fn release_nodes(context: &dyn AudioContext, nodes: Vec<NodeId>) {
    for node in nodes {
        if let Err(e) = context.release(node) {
            debug!(%node, error = %e, "Failed to release extraction node");
        }
    }
}

/// One channel of a stream, extracted by [`AudioRouter::channel_stream`]
///
/// Dropping the handle releases the extraction chain, after which the
/// extracted stream carries no more audio.
pub struct ChannelStream {
    context: Arc<dyn AudioContext>,
    channel: ChannelId,
    stream: MediaStream,
    nodes: Vec<NodeId>,
}

impl ChannelStream {
    /// The single-channel stream
    pub fn stream(&self) -> MediaStream {
        self.stream
    }

    /// Input channel it carries
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStream")
            .field("channel", &self.channel)
            .field("stream", &self.stream)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        release_nodes(self.context.as_ref(), nodes);
        debug!(stream = %self.stream.id, "Channel stream released");
    }
}

impl fmt::Debug for AudioRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioRouter")
            .field("config", &self.config)
            .field("graphs", &self.graphs)
            .finish_non_exhaustive()
    }
}
