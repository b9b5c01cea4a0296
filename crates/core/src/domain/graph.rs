//! Per-instance routing graph
//!
//! Each graph owns one node set wired as
//!
//! ```text
//! source ─► splitter ─┬─► gain[0] ─┐
//!                     ├─► gain[1] ─┼─► merger (every input) ─► destination
//!                     └─► gain[n] ─┘
//! ```
//!
//! Mute and unmute act on the splitter→gain links, play and stop on the
//! gain→merger links, so neither pair touches the source/splitter/merger
//! topology and gain levels survive both.

use crate::domain::audio::{AudioContext, Edge, MediaStream, NodeId, PlaybackElement, Result};
use crate::domain::channels::{ChannelId, ChannelSelection};
use crate::domain::config::RouterConfig;
use crate::domain::registry::TrackId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// How the attached stream reaches the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// The graph's merger feeds the destination directly
    #[default]
    Graph,

    /// A muted playback element is started alongside the graph on play.
    /// Needed for remote streams the substrate only pulls while an element
    /// consumes them.
    Element,
}

/// Coarse lifecycle state; mute is tracked separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    Detached,
    Attached,
    Playing,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "detached",
            Self::Attached => "attached",
            Self::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// Nodes of an attached graph
///
/// Held as `Option<NodeSet>`: a graph has all of them or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSet {
    pub source: NodeId,
    pub splitter: NodeId,
    pub merger: NodeId,
    /// One gain node per input channel, in channel order
    pub gains: Vec<NodeId>,
}

impl NodeSet {
    /// splitter output `index` → gain `index`
    fn feed_edge(&self, index: usize) -> Edge {
        Edge::new(self.splitter, index, self.gains[index], 0)
    }

    /// gain `index` → every merger input
    fn route_edges(&self, index: usize, outputs: usize) -> impl Iterator<Item = Edge> + '_ {
        (0..outputs).map(move |output| Edge::new(self.gains[index], 0, self.merger, output))
    }

    fn all_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        [self.source, self.splitter, self.merger]
            .into_iter()
            .chain(self.gains.iter().copied())
    }
}

/// Routing graph for one track
pub struct AudioGraph {
    id: TrackId,
    config: RouterConfig,
    context: Arc<dyn AudioContext>,
    mode: PlaybackMode,
    input_channels: Vec<ChannelId>,
    nodes: Option<NodeSet>,
    stream: Option<MediaStream>,
    element: Option<Box<dyn PlaybackElement>>,
    playing: bool,
    muted: bool,
    /// Channels cut by the last `mute`, so a re-attach keeps them cut
    muted_selection: Option<ChannelSelection>,
}

impl AudioGraph {
    pub fn new(
        id: TrackId,
        context: Arc<dyn AudioContext>,
        config: RouterConfig,
        mode: PlaybackMode,
    ) -> Self {
        Self {
            id,
            input_channels: config.input_channels(),
            config,
            context,
            mode,
            nodes: None,
            stream: None,
            element: None,
            playing: false,
            muted: false,
            muted_selection: None,
        }
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    /// Input channel identifiers, `[1..=input.channels]`
    pub fn input_channels(&self) -> &[ChannelId] {
        &self.input_channels
    }

    pub fn output_channels(&self) -> Vec<ChannelId> {
        self.config.output_channels()
    }

    pub fn nodes(&self) -> Option<&NodeSet> {
        self.nodes.as_ref()
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn element(&self) -> Option<&dyn PlaybackElement> {
        self.element.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.nodes.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn state(&self) -> GraphState {
        match (&self.nodes, self.playing) {
            (None, _) => GraphState::Detached,
            (Some(_), false) => GraphState::Attached,
            (Some(_), true) => GraphState::Playing,
        }
    }

    fn select(&self, channel: Option<ChannelId>) -> ChannelSelection {
        ChannelSelection::resolve(channel, &self.input_channels)
    }

    fn outputs(&self) -> usize {
        usize::from(self.config.output.channels)
    }

    /// Bind `stream` to a freshly built node set.
    ///
    /// The new nodes are built and wired before the previous set is torn down,
    /// so a substrate error leaves the graph exactly as it was. Playback stops;
    /// the mute flag and the channels it covers carry over to the new nodes.
    pub fn attach_stream(&mut self, stream: MediaStream) -> Result<()> {
        let mut created = Vec::new();
        let nodes = match self.build(&stream, &mut created) {
            Ok(nodes) => nodes,
            Err(e) => {
                self.release_all(created);
                return Err(e);
            }
        };

        if let Err(e) = self.disconnect() {
            self.release_all(nodes.all_nodes().collect());
            return Err(e);
        }

        debug!(
            track = %self.id,
            stream = %stream.id,
            gains = nodes.gains.len(),
            "Stream attached"
        );

        self.nodes = Some(nodes);
        self.stream = Some(stream);
        self.playing = false;
        Ok(())
    }

    /// Create and wire a node set for `stream`, recording every node created
    /// in `created` so a failure can release them
    fn build(&self, stream: &MediaStream, created: &mut Vec<NodeId>) -> Result<NodeSet> {
        let ctx = &self.context;
        let source = ctx.create_source(stream)?;
        created.push(source);
        let splitter = ctx.create_splitter(self.input_channels.len())?;
        created.push(splitter);
        let merger = ctx.create_merger(self.outputs())?;
        created.push(merger);

        let mut gains = Vec::with_capacity(self.input_channels.len());
        for _ in &self.input_channels {
            let gain = ctx.create_gain()?;
            created.push(gain);
            gains.push(gain);
        }

        let nodes = NodeSet {
            source,
            splitter,
            merger,
            gains,
        };

        ctx.connect(Edge::new(nodes.source, 0, nodes.splitter, 0))?;

        let cut = match (self.muted, self.muted_selection) {
            (true, Some(selection)) => selection.indices(nodes.gains.len()),
            _ => Vec::new(),
        };
        for index in 0..nodes.gains.len() {
            if !cut.contains(&index) {
                ctx.connect(nodes.feed_edge(index))?;
            }
        }

        ctx.connect(Edge::new(nodes.merger, 0, ctx.destination(), 0))?;
        Ok(nodes)
    }

    fn release_all(&self, nodes: Vec<NodeId>) {
        for node in nodes {
            if let Err(e) = self.context.release(node) {
                debug!(track = %self.id, %node, error = %e, "Failed to release node");
            }
        }
    }

    /// Detach the stream and drop every node. A no-op when already detached.
    ///
    /// `playing` and `muted` keep their values; they only take effect again
    /// after the next attach.
    pub fn disconnect(&mut self) -> Result<()> {
        self.release_element();

        let Some(nodes) = self.nodes.take() else {
            return Ok(());
        };

        self.context
            .disconnect(Edge::new(nodes.source, 0, nodes.splitter, 0))?;
        for node in nodes.all_nodes() {
            self.context.release(node)?;
        }
        self.stream = None;

        debug!(track = %self.id, "Graph disconnected");
        Ok(())
    }

    /// Set the gain coefficient of one channel, or of all channels when
    /// `channel` is `None`, effective at the context's current time.
    pub fn set_gain(&mut self, value: f32, channel: Option<ChannelId>) -> Result<()> {
        let Some(nodes) = &self.nodes else {
            debug!(track = %self.id, "set_gain ignored: no stream attached");
            return Ok(());
        };

        let time = self.context.current_time();
        for index in self.select(channel).indices(nodes.gains.len()) {
            self.context.set_gain_at_time(nodes.gains[index], value, time)?;
            trace!(track = %self.id, channel = index + 1, value, time, "Gain set");
        }
        Ok(())
    }

    /// Route the selected gain stage(s) to every output channel.
    ///
    /// A no-op while already playing.
    pub fn play(&mut self, channel: Option<ChannelId>) -> Result<()> {
        if self.playing {
            return Ok(());
        }
        let Some(nodes) = &self.nodes else {
            debug!(track = %self.id, "play ignored: no stream attached");
            return Ok(());
        };

        let outputs = self.outputs();
        let selection = self.select(channel);
        for index in selection.indices(nodes.gains.len()) {
            for edge in nodes.route_edges(index, outputs) {
                self.context.connect(edge)?;
                trace!(track = %self.id, %edge, "Connected");
            }
        }
        self.playing = true;

        if self.mode == PlaybackMode::Element {
            self.start_element()?;
        }

        debug!(track = %self.id, ?selection, "Playing");
        Ok(())
    }

    /// Undo the gain→merger links `play` creates for the same selection.
    ///
    /// A no-op while not playing.
    pub fn stop(&mut self, channel: Option<ChannelId>) -> Result<()> {
        if !self.playing {
            return Ok(());
        }
        let Some(nodes) = &self.nodes else {
            debug!(track = %self.id, "stop ignored: no stream attached");
            return Ok(());
        };

        let outputs = self.outputs();
        let selection = self.select(channel);
        for index in selection.indices(nodes.gains.len()) {
            for edge in nodes.route_edges(index, outputs) {
                self.context.disconnect(edge)?;
                trace!(track = %self.id, %edge, "Disconnected");
            }
        }
        self.playing = false;
        self.release_element();

        debug!(track = %self.id, ?selection, "Stopped");
        Ok(())
    }

    /// Cut the splitter→gain link(s) of the selected channel(s).
    ///
    /// A no-op while already muted, whichever channels the earlier mute covered.
    pub fn mute(&mut self, channel: Option<ChannelId>) -> Result<()> {
        if self.muted {
            return Ok(());
        }
        let Some(nodes) = &self.nodes else {
            debug!(track = %self.id, "mute ignored: no stream attached");
            return Ok(());
        };

        let selection = self.select(channel);
        for index in selection.indices(nodes.gains.len()) {
            self.context.disconnect(nodes.feed_edge(index))?;
        }
        self.muted = true;
        self.muted_selection = Some(selection);

        debug!(track = %self.id, ?selection, "Muted");
        Ok(())
    }

    /// Restore the splitter→gain link(s) of the selected channel(s).
    ///
    /// A no-op while not muted.
    pub fn unmute(&mut self, channel: Option<ChannelId>) -> Result<()> {
        if !self.muted {
            return Ok(());
        }
        let Some(nodes) = &self.nodes else {
            debug!(track = %self.id, "unmute ignored: no stream attached");
            return Ok(());
        };

        let selection = self.select(channel);
        for index in selection.indices(nodes.gains.len()) {
            self.context.connect(nodes.feed_edge(index))?;
        }
        self.muted = false;
        self.muted_selection = None;

        debug!(track = %self.id, ?selection, "Unmuted");
        Ok(())
    }

    fn start_element(&mut self) -> Result<()> {
        let Some(stream) = self.stream else {
            return Ok(());
        };

        self.release_element();
        let mut element = self.context.create_playback_element(&stream)?;
        element.set_muted(true);
        element.play()?;
        self.element = Some(element);
        Ok(())
    }

    fn release_element(&mut self) {
        if let Some(mut element) = self.element.take() {
            element.pause();
        }
    }
}

impl fmt::Debug for AudioGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioGraph")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("nodes", &self.nodes)
            .field("stream", &self.stream)
            .field("playing", &self.playing)
            .field("muted", &self.muted)
            .finish_non_exhaustive()
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!(track = %self.id, error = %e, "Failed to release graph on drop");
        }
    }
}
