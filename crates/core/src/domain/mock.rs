//! Recording context for unit tests
//!
//! Tracks nodes, live edges and gain events without rendering any audio.

use crate::domain::audio::{
    AudioContext, AudioError, Edge, MediaStream, NodeId, PlaybackElement, Result, StreamId,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockNode {
    Destination,
    Source(StreamId),
    Splitter(usize),
    Merger(usize),
    Gain,
    StreamDestination(StreamId),
}

/// Substrate call the mock rejects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// `create_source` for this stream
    Source(StreamId),
    /// every `create_gain`
    Gain,
    /// every `create_stream_destination`
    StreamDestination,
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, MockNode>,
    edges: BTreeSet<Edge>,
    gain_events: Vec<(NodeId, f32, f64)>,
    next_id: u64,
    failure: Option<Failure>,
}

#[derive(Default)]
pub struct ElementFlags {
    pub muted: AtomicBool,
    pub playing: AtomicBool,
}

struct MockElement {
    stream: StreamId,
    flags: Arc<ElementFlags>,
}

impl PlaybackElement for MockElement {
    fn stream(&self) -> StreamId {
        self.stream
    }

    fn set_muted(&mut self, muted: bool) {
        self.flags.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.flags.muted.load(Ordering::SeqCst)
    }

    fn play(&mut self) -> Result<()> {
        self.flags.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) {
        self.flags.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.flags.playing.load(Ordering::SeqCst)
    }
}

pub struct MockContext {
    state: Mutex<State>,
    destination: NodeId,
    time: f64,
    pub elements: Mutex<Vec<Arc<ElementFlags>>>,
}

impl MockContext {
    pub fn new() -> Arc<Self> {
        Self::at_time(0.0)
    }

    pub fn at_time(time: f64) -> Arc<Self> {
        let mut state = State::default();
        let destination = NodeId::new(0);
        state.nodes.insert(destination, MockNode::Destination);
        state.next_id = 1;
        Arc::new(Self {
            state: Mutex::new(state),
            destination,
            time,
            elements: Mutex::new(Vec::new()),
        })
    }

    pub fn edges(&self) -> BTreeSet<Edge> {
        self.state.lock().unwrap().edges.clone()
    }

    pub fn has_edge(&self, edge: Edge) -> bool {
        self.state.lock().unwrap().edges.contains(&edge)
    }

    pub fn node(&self, id: NodeId) -> Option<MockNode> {
        self.state.lock().unwrap().nodes.get(&id).copied()
    }

    /// Nodes alive, the destination included
    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    pub fn fail_on(&self, failure: Failure) {
        self.state.lock().unwrap().failure = Some(failure);
    }

    pub fn gain_events(&self) -> Vec<(NodeId, f32, f64)> {
        self.state.lock().unwrap().gain_events.clone()
    }

    fn add(&self, node: MockNode) -> NodeId {
        let mut state = self.state.lock().unwrap();
        let id = NodeId::new(state.next_id);
        state.next_id += 1;
        state.nodes.insert(id, node);
        id
    }
}

impl AudioContext for MockContext {
    fn current_time(&self) -> f64 {
        self.time
    }

    fn destination(&self) -> NodeId {
        self.destination
    }

    fn create_source(&self, stream: &MediaStream) -> Result<NodeId> {
        if self.state.lock().unwrap().failure == Some(Failure::Source(stream.id)) {
            return Err(AudioError::UnknownStream(stream.id));
        }
        Ok(self.add(MockNode::Source(stream.id)))
    }

    fn create_splitter(&self, outputs: usize) -> Result<NodeId> {
        Ok(self.add(MockNode::Splitter(outputs)))
    }

    fn create_merger(&self, inputs: usize) -> Result<NodeId> {
        Ok(self.add(MockNode::Merger(inputs)))
    }

    fn create_gain(&self) -> Result<NodeId> {
        if self.state.lock().unwrap().failure == Some(Failure::Gain) {
            return Err(AudioError::InvalidConfiguration("gain rejected".to_string()));
        }
        Ok(self.add(MockNode::Gain))
    }

    fn create_stream_destination(&self, channels: u16) -> Result<(NodeId, MediaStream)> {
        if self.state.lock().unwrap().failure == Some(Failure::StreamDestination) {
            return Err(AudioError::InvalidConfiguration(
                "stream destination rejected".to_string(),
            ));
        }
        let next = self.state.lock().unwrap().next_id;
        let stream = MediaStream::new(StreamId::new(1000 + next), channels);
        Ok((self.add(MockNode::StreamDestination(stream.id)), stream))
    }

    fn connect(&self, edge: Edge) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for node in [edge.from, edge.to] {
            if !state.nodes.contains_key(&node) {
                return Err(AudioError::UnknownNode(node));
            }
        }
        state.edges.insert(edge);
        Ok(())
    }

    fn disconnect(&self, edge: Edge) -> Result<()> {
        self.state.lock().unwrap().edges.remove(&edge);
        Ok(())
    }

    fn release(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.nodes.remove(&node);
        state.edges.retain(|e| e.from != node && e.to != node);
        Ok(())
    }

    fn set_gain_at_time(&self, gain: NodeId, value: f32, time: f64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .gain_events
            .push((gain, value, time));
        Ok(())
    }

    fn create_playback_element(&self, stream: &MediaStream) -> Result<Box<dyn PlaybackElement>> {
        let flags = Arc::new(ElementFlags::default());
        self.elements.lock().unwrap().push(flags.clone());
        Ok(Box::new(MockElement {
            stream: stream.id,
            flags,
        }))
    }
}
