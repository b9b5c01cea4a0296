//! In-process node-graph engine
//!
//! `SoftwareContext` implements [`AudioContext`] on plain sample buffers. The
//! control thread edits the topology through the trait; the device callback
//! (or a test) pulls audio with [`SoftwareContext::render`]. Both sides go
//! through one mutex, so a render always sees a complete topology.
//!
//! Signals are planar blocks (`channels × frames`). Several edges into the
//! same input are summed.

use crossbeam::channel::Receiver;
use patchbay_core::domain::audio::{
    AudioContext, AudioError, Edge, MediaStream, NodeId, PlaybackElement, Result, StreamId,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Planar audio: one `Vec<f32>` per channel
pub type Block = Vec<Vec<f32>>;

/// Seconds of audio a stream buffers before the oldest frames are dropped
const MAX_BUFFERED_SECONDS: usize = 2;

#[derive(Debug, Clone)]
enum Node {
    Destination { channels: u16 },
    Source { stream: StreamId },
    Splitter { outputs: usize },
    Merger { inputs: usize },
    /// `(time, value)` events sorted by time
    Gain { automation: Vec<(f64, f32)> },
    StreamDestination { stream: StreamId, channels: u16 },
}

impl Node {
    fn inputs(&self) -> usize {
        match self {
            Node::Source { .. } => 0,
            Node::Merger { inputs } => *inputs,
            _ => 1,
        }
    }

    fn outputs(&self) -> usize {
        match self {
            Node::Destination { .. } | Node::StreamDestination { .. } => 0,
            Node::Splitter { outputs } => *outputs,
            _ => 1,
        }
    }
}

fn gain_at(automation: &[(f64, f32)], time: f64) -> f32 {
    automation
        .iter()
        .rev()
        .find(|(at, _)| *at <= time)
        .map(|(_, value)| *value)
        .unwrap_or(1.0)
}

/// Frames queued for one stream
struct StreamBuffer {
    channels: u16,
    pending: Vec<VecDeque<f32>>,
    /// Interleaved buffers from a capture callback
    feed: Option<Receiver<Vec<f32>>>,
    capacity: usize,
}

impl StreamBuffer {
    fn new(channels: u16, capacity: usize) -> Self {
        Self {
            channels,
            pending: vec![VecDeque::new(); usize::from(channels)],
            feed: None,
            capacity,
        }
    }

    fn buffered(&self) -> usize {
        self.pending.first().map_or(0, VecDeque::len)
    }

    fn push_planar(&mut self, block: &[Vec<f32>]) {
        let frames = block.iter().map(Vec::len).max().unwrap_or(0);
        for (channel, queue) in self.pending.iter_mut().enumerate() {
            match block.get(channel) {
                Some(samples) => {
                    queue.extend(samples.iter().copied());
                    queue.extend(std::iter::repeat(0.0).take(frames - samples.len()));
                }
                None => queue.extend(std::iter::repeat(0.0).take(frames)),
            }
        }
        self.enforce_capacity();
    }

    fn push_interleaved(&mut self, data: &[f32]) {
        let channels = usize::from(self.channels);
        if channels == 0 {
            return;
        }
        for frame in data.chunks_exact(channels) {
            for (queue, sample) in self.pending.iter_mut().zip(frame) {
                queue.push_back(*sample);
            }
        }
        self.enforce_capacity();
    }

    fn drain_feed(&mut self) {
        let Some(feed) = self.feed.take() else {
            return;
        };
        while let Ok(data) = feed.try_recv() {
            self.push_interleaved(&data);
        }
        self.feed = Some(feed);
    }

    fn enforce_capacity(&mut self) {
        let excess = self.buffered().saturating_sub(self.capacity);
        if excess > 0 {
            trace!(excess, "Dropping oldest buffered frames");
            for queue in &mut self.pending {
                queue.drain(..excess);
            }
        }
    }

    /// Up to `frames` frames, without padding
    fn read(&mut self, frames: usize) -> Block {
        let n = frames.min(self.buffered());
        self.pending
            .iter_mut()
            .map(|queue| queue.drain(..n).collect())
            .collect()
    }

    /// Exactly `frames` frames, padded with silence on underrun
    fn take_block(&mut self, frames: usize) -> Block {
        let mut block = self.read(frames);
        for channel in &mut block {
            channel.resize(frames, 0.0);
        }
        block
    }
}

/// Add `add` into `acc`, growing `acc` to the wider channel count
fn mix_into(acc: &mut Block, add: &[Vec<f32>], frames: usize) {
    if acc.len() < add.len() {
        acc.resize(add.len(), vec![0.0; frames]);
    }
    for (out, samples) in acc.iter_mut().zip(add) {
        for (o, s) in out.iter_mut().zip(samples) {
            *o += s;
        }
    }
}

/// Pad with silent channels or drop extra ones
fn fit(mut block: Block, channels: usize, frames: usize) -> Block {
    block.resize(channels, vec![0.0; frames]);
    block
}

/// Average all channels into one
fn downmix(block: &[Vec<f32>], frames: usize) -> Vec<f32> {
    let mut mono = vec![0.0; frames];
    if block.is_empty() {
        return mono;
    }
    for channel in block {
        for (m, s) in mono.iter_mut().zip(channel) {
            *m += s;
        }
    }
    let scale = 1.0 / block.len() as f32;
    mono.iter_mut().for_each(|m| *m *= scale);
    mono
}

struct ElementState {
    stream: StreamId,
    muted: AtomicBool,
    playing: AtomicBool,
}

/// Playback element of the software engine
///
/// While playing and unmuted it mixes its stream straight into the
/// destination, next to whatever the node graph renders.
pub struct SoftwareElement {
    state: Arc<ElementState>,
}

impl PlaybackElement for SoftwareElement {
    fn stream(&self) -> StreamId {
        self.state.stream
    }

    fn set_muted(&mut self, muted: bool) {
        self.state.muted.store(muted, Ordering::Release);
    }

    fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Acquire)
    }

    fn play(&mut self) -> Result<()> {
        self.state.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) {
        self.state.playing.store(false, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.state.playing.load(Ordering::Acquire)
    }
}

/// Snapshot of a live playback element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementInfo {
    pub stream: StreamId,
    pub muted: bool,
    pub playing: bool,
}

struct Graph {
    nodes: HashMap<NodeId, Node>,
    edges: BTreeSet<Edge>,
    streams: HashMap<StreamId, StreamBuffer>,
    elements: Vec<Arc<ElementState>>,
    next_node: u64,
    next_stream: u64,
    frames_rendered: u64,
}

impl Graph {
    fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        trace!(%id, ?node, "Node created");
        self.nodes.insert(id, node);
        id
    }

    fn add_stream(&mut self, channels: u16, capacity: usize) -> MediaStream {
        let id = StreamId::new(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(id, StreamBuffer::new(channels, capacity));
        MediaStream::new(id, channels)
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(AudioError::UnknownNode(id))
    }

    fn live_elements(&self) -> impl Iterator<Item = &Arc<ElementState>> {
        // the context's own reference is the last one once the element is dropped
        self.elements.iter().filter(|e| Arc::strong_count(e) > 1)
    }
}

/// Pull-based evaluation of one render quantum
struct Render<'a> {
    graph: &'a Graph,
    blocks: &'a HashMap<StreamId, Block>,
    frames: usize,
    time: f64,
    memo: HashMap<(NodeId, usize), Block>,
    visiting: HashSet<NodeId>,
}

impl Render<'_> {
    fn input(&mut self, node: NodeId, port: usize) -> Block {
        let edges: Vec<Edge> = self
            .graph
            .edges
            .iter()
            .filter(|e| e.to == node && e.input == port)
            .copied()
            .collect();

        let mut acc = Block::new();
        for edge in edges {
            let block = self.output(edge.from, edge.output);
            mix_into(&mut acc, &block, self.frames);
        }
        acc
    }

    fn output(&mut self, node: NodeId, port: usize) -> Block {
        if let Some(block) = self.memo.get(&(node, port)) {
            return block.clone();
        }
        if !self.visiting.insert(node) {
            warn!(%node, "Cycle in audio graph, rendering silence");
            return Block::new();
        }

        let frames = self.frames;
        let graph = self.graph;
        let block = match graph.nodes.get(&node) {
            Some(Node::Source { stream }) => self.blocks.get(stream).cloned().unwrap_or_default(),
            Some(Node::Splitter { .. }) => {
                let input = self.input(node, 0);
                vec![input.get(port).cloned().unwrap_or_else(|| vec![0.0; frames])]
            }
            Some(Node::Gain { automation }) => {
                let gain = gain_at(automation, self.time);
                let mut input = self.input(node, 0);
                for channel in &mut input {
                    channel.iter_mut().for_each(|s| *s *= gain);
                }
                input
            }
            Some(Node::Merger { inputs }) => (0..*inputs)
                .map(|i| {
                    let input = self.input(node, i);
                    downmix(&input, frames)
                })
                .collect(),
            _ => Block::new(),
        };

        self.visiting.remove(&node);
        self.memo.insert((node, port), block.clone());
        block
    }
}

/// Software implementation of [`AudioContext`]
pub struct SoftwareContext {
    sample_rate: u32,
    destination: NodeId,
    destination_channels: u16,
    graph: Mutex<Graph>,
}

impl SoftwareContext {
    /// Create a context rendering `destination_channels` at `sample_rate`
    pub fn new(sample_rate: u32, destination_channels: u16) -> Self {
        let mut graph = Graph {
            nodes: HashMap::new(),
            edges: BTreeSet::new(),
            streams: HashMap::new(),
            elements: Vec::new(),
            next_node: 0,
            next_stream: 0,
            frames_rendered: 0,
        };
        let destination = graph.add_node(Node::Destination {
            channels: destination_channels,
        });

        debug!(sample_rate, destination_channels, "Software context created");
        Self {
            sample_rate,
            destination,
            destination_channels,
            graph: Mutex::new(graph),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn destination_channels(&self) -> u16 {
        self.destination_channels
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        // a panic while holding the lock cannot leave the topology half-edited
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn time_of(&self, frames: u64) -> f64 {
        frames as f64 / f64::from(self.sample_rate)
    }

    fn stream_capacity(&self) -> usize {
        self.sample_rate as usize * MAX_BUFFERED_SECONDS
    }

    /// Register a new external stream, fed with [`Self::push_frames`] or a feed
    pub fn create_input_stream(&self, channels: u16) -> Result<MediaStream> {
        if channels == 0 {
            return Err(AudioError::InvalidConfiguration(
                "stream needs at least one channel".to_string(),
            ));
        }
        let capacity = self.stream_capacity();
        let stream = self.lock().add_stream(channels, capacity);
        debug!(stream = %stream.id, channels, "Input stream registered");
        Ok(stream)
    }

    /// Queue planar frames on a stream
    pub fn push_frames(&self, stream: StreamId, block: &[Vec<f32>]) -> Result<()> {
        let mut graph = self.lock();
        let buffer = graph
            .streams
            .get_mut(&stream)
            .ok_or(AudioError::UnknownStream(stream))?;
        buffer.push_planar(block);
        Ok(())
    }

    /// Let a stream pull interleaved buffers from `feed` at every render
    pub fn attach_feed(&self, stream: StreamId, feed: Receiver<Vec<f32>>) -> Result<()> {
        let mut graph = self.lock();
        let buffer = graph
            .streams
            .get_mut(&stream)
            .ok_or(AudioError::UnknownStream(stream))?;
        buffer.feed = Some(feed);
        Ok(())
    }

    /// Take up to `frames` buffered frames from a stream (typically the
    /// output of a stream destination)
    pub fn read_frames(&self, stream: StreamId, frames: usize) -> Result<Block> {
        let mut graph = self.lock();
        let buffer = graph
            .streams
            .get_mut(&stream)
            .ok_or(AudioError::UnknownStream(stream))?;
        Ok(buffer.read(frames))
    }

    pub fn buffered_frames(&self, stream: StreamId) -> Result<usize> {
        let graph = self.lock();
        graph
            .streams
            .get(&stream)
            .map(StreamBuffer::buffered)
            .ok_or(AudioError::UnknownStream(stream))
    }

    /// Render `frames` frames at the destination and advance the clock.
    ///
    /// Stream destinations are rendered in the same pass and their output
    /// queued on their streams.
    pub fn render(&self, frames: usize) -> Block {
        let mut graph = self.lock();
        let time = self.time_of(graph.frames_rendered);

        let mut wanted: HashSet<StreamId> = graph
            .nodes
            .values()
            .filter_map(|node| match node {
                Node::Source { stream } => Some(*stream),
                _ => None,
            })
            .collect();
        wanted.extend(graph.live_elements().map(|e| e.stream));

        let mut blocks = HashMap::new();
        for id in wanted {
            if let Some(buffer) = graph.streams.get_mut(&id) {
                buffer.drain_feed();
                blocks.insert(id, buffer.take_block(frames));
            }
        }

        let destination_channels = usize::from(self.destination_channels);
        let (mut output, captured) = {
            let mut render = Render {
                graph: &graph,
                blocks: &blocks,
                frames,
                time,
                memo: HashMap::new(),
                visiting: HashSet::new(),
            };

            let output = render.input(self.destination, 0);

            let stream_destinations: Vec<(NodeId, StreamId, u16)> = graph
                .nodes
                .iter()
                .filter_map(|(id, node)| match node {
                    Node::StreamDestination { stream, channels } => {
                        Some((*id, *stream, *channels))
                    }
                    _ => None,
                })
                .collect();
            let captured: Vec<(StreamId, Block)> = stream_destinations
                .into_iter()
                .map(|(id, stream, channels)| {
                    let block = render.input(id, 0);
                    (stream, fit(block, usize::from(channels), frames))
                })
                .collect();

            (output, captured)
        };

        for element in graph.live_elements() {
            if element.playing.load(Ordering::Acquire) && !element.muted.load(Ordering::Acquire) {
                if let Some(block) = blocks.get(&element.stream) {
                    mix_into(&mut output, block, frames);
                }
            }
        }
        output = fit(output, destination_channels, frames);

        for (stream, block) in captured {
            if let Some(buffer) = graph.streams.get_mut(&stream) {
                buffer.push_planar(&block);
            }
        }

        graph.elements.retain(|e| Arc::strong_count(e) > 1);
        graph.frames_rendered += frames as u64;
        output
    }

    /// Live edges, in a stable order
    pub fn edges(&self) -> Vec<Edge> {
        self.lock().edges.iter().copied().collect()
    }

    pub fn has_edge(&self, edge: Edge) -> bool {
        self.lock().edges.contains(&edge)
    }

    /// Number of nodes, the destination included
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.lock().nodes.contains_key(&node)
    }

    /// Gain coefficient in force at the current time
    pub fn gain_value(&self, node: NodeId) -> Option<f32> {
        let graph = self.lock();
        let time = self.time_of(graph.frames_rendered);
        match graph.nodes.get(&node) {
            Some(Node::Gain { automation }) => Some(gain_at(automation, time)),
            _ => None,
        }
    }

    pub fn elements(&self) -> Vec<ElementInfo> {
        self.lock()
            .live_elements()
            .map(|e| ElementInfo {
                stream: e.stream,
                muted: e.muted.load(Ordering::Acquire),
                playing: e.playing.load(Ordering::Acquire),
            })
            .collect()
    }
}

impl AudioContext for SoftwareContext {
    fn current_time(&self) -> f64 {
        let frames = self.lock().frames_rendered;
        self.time_of(frames)
    }

    fn destination(&self) -> NodeId {
        self.destination
    }

    fn create_source(&self, stream: &MediaStream) -> Result<NodeId> {
        let mut graph = self.lock();
        if !graph.streams.contains_key(&stream.id) {
            return Err(AudioError::UnknownStream(stream.id));
        }
        Ok(graph.add_node(Node::Source { stream: stream.id }))
    }

    fn create_splitter(&self, outputs: usize) -> Result<NodeId> {
        if outputs == 0 {
            return Err(AudioError::InvalidConfiguration(
                "splitter needs at least one output".to_string(),
            ));
        }
        Ok(self.lock().add_node(Node::Splitter { outputs }))
    }

    fn create_merger(&self, inputs: usize) -> Result<NodeId> {
        if inputs == 0 {
            return Err(AudioError::InvalidConfiguration(
                "merger needs at least one input".to_string(),
            ));
        }
        Ok(self.lock().add_node(Node::Merger { inputs }))
    }

    fn create_gain(&self) -> Result<NodeId> {
        Ok(self.lock().add_node(Node::Gain {
            automation: Vec::new(),
        }))
    }

    fn create_stream_destination(&self, channels: u16) -> Result<(NodeId, MediaStream)> {
        if channels == 0 {
            return Err(AudioError::InvalidConfiguration(
                "stream destination needs at least one channel".to_string(),
            ));
        }
        let capacity = self.stream_capacity();
        let mut graph = self.lock();
        let stream = graph.add_stream(channels, capacity);
        let node = graph.add_node(Node::StreamDestination {
            stream: stream.id,
            channels,
        });
        Ok((node, stream))
    }

    fn connect(&self, edge: Edge) -> Result<()> {
        let mut graph = self.lock();

        let outputs = graph.node(edge.from)?.outputs();
        if edge.output >= outputs {
            return Err(AudioError::PortOutOfRange {
                node: edge.from,
                port: edge.output,
                available: outputs,
            });
        }
        let inputs = graph.node(edge.to)?.inputs();
        if edge.input >= inputs {
            return Err(AudioError::PortOutOfRange {
                node: edge.to,
                port: edge.input,
                available: inputs,
            });
        }

        if graph.edges.insert(edge) {
            trace!(%edge, "Edge connected");
        }
        Ok(())
    }

    fn disconnect(&self, edge: Edge) -> Result<()> {
        if self.lock().edges.remove(&edge) {
            trace!(%edge, "Edge disconnected");
        }
        Ok(())
    }

    fn release(&self, node: NodeId) -> Result<()> {
        if node == self.destination {
            return Ok(());
        }
        let mut graph = self.lock();
        let Some(released) = graph.nodes.remove(&node) else {
            return Ok(());
        };
        graph.edges.retain(|e| e.from != node && e.to != node);
        // nothing renders into the stream any more
        if let Node::StreamDestination { stream, .. } = released {
            graph.streams.remove(&stream);
        }
        trace!(%node, "Node released");
        Ok(())
    }

    fn set_gain_at_time(&self, gain: NodeId, value: f32, time: f64) -> Result<()> {
        let mut graph = self.lock();
        let now = self.time_of(graph.frames_rendered);
        match graph.nodes.get_mut(&gain) {
            Some(Node::Gain { automation }) => {
                let at = automation.partition_point(|(t, _)| *t <= time);
                automation.insert(at, (time, value.max(0.0)));
                // only the latest event at or before now still matters
                let settled = automation.partition_point(|(t, _)| *t <= now);
                if settled > 1 {
                    automation.drain(..settled - 1);
                }
                Ok(())
            }
            Some(_) => Err(AudioError::InvalidConfiguration(format!(
                "{gain} is not a gain node"
            ))),
            None => Err(AudioError::UnknownNode(gain)),
        }
    }

    fn create_playback_element(&self, stream: &MediaStream) -> Result<Box<dyn PlaybackElement>> {
        let mut graph = self.lock();
        if !graph.streams.contains_key(&stream.id) {
            return Err(AudioError::UnknownStream(stream.id));
        }
        let state = Arc::new(ElementState {
            stream: stream.id,
            muted: AtomicBool::new(false),
            playing: AtomicBool::new(false),
        });
        graph.elements.push(state.clone());
        Ok(Box::new(SoftwareElement { state }))
    }
}
