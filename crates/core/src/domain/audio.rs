//! Audio substrate abstractions and domain models
//!
//! This module defines the node-graph capability set the routing core needs
//! from an audio-processing engine. Implementations (the in-process software
//! engine, device drivers) live in the `infra` crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or processing
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Stream handle is not registered with the context
    #[error("Unknown stream: {0}")]
    UnknownStream(StreamId),

    /// Node handle is not (or no longer) part of the context
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Edge references a port the node does not have
    #[error("Port {port} out of range for node {node} ({available} available)")]
    PortOutOfRange {
        node: NodeId,
        port: usize,
        available: usize,
    },

    /// Channel identifier outside the configured channel range
    #[error("Invalid channel: {0}")]
    InvalidChannel(u32),

    /// Invalid configuration for a node or stream
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Opaque handle to a node created by an [`AudioContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Opaque handle to a media stream known to an [`AudioContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// A multi-channel audio stream (capture device, remote peer, or the output
/// of a stream destination node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: StreamId,
    pub channels: u16,
}

impl MediaStream {
    pub fn new(id: StreamId, channels: u16) -> Self {
        Self { id, channels }
    }
}

/// Directed, channel-indexed connection between two nodes
///
/// `output` is the port on `from`, `input` the port on `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub output: usize,
    pub to: NodeId,
    pub input: usize,
}

impl Edge {
    pub fn new(from: NodeId, output: usize, to: NodeId, input: usize) -> Self {
        Self {
            from,
            output,
            to,
            input,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.from, self.output, self.to, self.input
        )
    }
}

/// Element that plays a stream straight to the output device, bypassing the
/// node graph. Used for remote streams that the graph cannot render on its own.
pub trait PlaybackElement: Send {
    /// Stream this element is bound to
    fn stream(&self) -> StreamId;

    fn set_muted(&mut self, muted: bool);

    fn is_muted(&self) -> bool;

    /// Start playback
    fn play(&mut self) -> Result<()>;

    /// Pause playback; the element can be restarted with [`PlaybackElement::play`]
    fn pause(&mut self);

    fn is_playing(&self) -> bool;
}

/// Node-graph audio engine shared by every routing graph
///
/// All methods take `&self`: the context is created once, handed out as
/// `Arc<dyn AudioContext>` and mutated through its own synchronisation, so the
/// rendering side observes each topology change atomically.
pub trait AudioContext: Send + Sync {
    /// Monotonic clock in seconds, used to timestamp parameter changes
    fn current_time(&self) -> f64;

    /// The singleton output destination node
    fn destination(&self) -> NodeId;

    /// Create a source node emitting `stream` on output 0
    fn create_source(&self, stream: &MediaStream) -> Result<NodeId>;

    /// Create a splitter with one input and `outputs` single-channel outputs
    fn create_splitter(&self, outputs: usize) -> Result<NodeId>;

    /// Create a merger with `inputs` single-channel inputs and one output
    fn create_merger(&self, inputs: usize) -> Result<NodeId>;

    /// Create a gain node with a unity coefficient
    fn create_gain(&self) -> Result<NodeId>;

    /// Create a destination node whose input is exposed as a new stream
    fn create_stream_destination(&self, channels: u16) -> Result<(NodeId, MediaStream)>;

    fn connect(&self, edge: Edge) -> Result<()>;

    fn disconnect(&self, edge: Edge) -> Result<()>;

    /// Drop a node together with every edge touching it. Unknown nodes are ignored.
    fn release(&self, node: NodeId) -> Result<()>;

    /// Schedule `value` on a gain node's coefficient at `time`
    fn set_gain_at_time(&self, gain: NodeId, value: f32, time: f64) -> Result<()>;

    /// Create a playback element bound to `stream`
    fn create_playback_element(&self, stream: &MediaStream) -> Result<Box<dyn PlaybackElement>>;
}
