//! Integration tests for the routing core on the software engine
//!
//! These tests drive `AudioRouter` and `AudioGraph` through their public
//! API and check the audio the software context actually renders.

use patchbay_core::domain::{
    Action, AudioContext, AudioError, AudioRouter, ChannelId, Command, CommandResult, GraphState,
    GroupId, MediaStream, PatchbayConfig, PlaybackMode, RouterConfig, RoutingOverride, StreamId,
    TrackId,
};
use patchbay_infra::audio::SoftwareContext;
use std::sync::Arc;

const FRAMES: usize = 8;

fn setup() -> (Arc<SoftwareContext>, AudioRouter) {
    let context = Arc::new(SoftwareContext::new(48000, 2));
    let router = AudioRouter::new(context.clone());
    (context, router)
}

fn ids() -> (GroupId, TrackId) {
    (GroupId::new("client-1"), TrackId::new("drums"))
}

/// Queue one block with a constant level per channel
fn feed(context: &SoftwareContext, stream: &MediaStream, levels: &[f32]) {
    let block: Vec<Vec<f32>> = levels.iter().map(|level| vec![*level; FRAMES]).collect();
    context.push_frames(stream.id, &block).unwrap();
}

/// Render one block and return the level of each output channel
fn render_levels(context: &SoftwareContext) -> Vec<f32> {
    context
        .render(FRAMES)
        .iter()
        .map(|channel| {
            assert!(channel.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-6));
            channel[0]
        })
        .collect()
}

fn assert_levels(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "channel count");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "expected {expected:?}, got {actual:?}");
    }
}

/// Attach a fresh stereo input to the default instance
fn attached(mode: PlaybackMode) -> (Arc<SoftwareContext>, AudioRouter, MediaStream) {
    let (context, mut router) = setup();
    let (group, track) = ids();
    let input = context.create_input_stream(2).unwrap();
    router
        .add_instance(group, track, mode)
        .attach_stream(input)
        .unwrap();
    (context, router, input)
}

// ============================================================================
// PLAYBACK
// ============================================================================

#[test]
fn test_attached_graph_is_silent_until_played() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();

    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.0, 0.0]);

    router.instance_mut(&group, &track).unwrap().play(None).unwrap();
    feed(&context, &input, &[0.25, 0.5]);
    // every input channel reaches every output channel
    assert_levels(&render_levels(&context), &[0.75, 0.75]);
}

#[test]
fn test_stop_and_replay() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.play(None).unwrap();
    graph.stop(None).unwrap();
    assert_eq!(graph.state(), GraphState::Attached);
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.0, 0.0]);

    graph.play(None).unwrap();
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75, 0.75]);
}

#[test]
fn test_play_single_channel() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();

    router
        .instance_mut(&group, &track)
        .unwrap()
        .play(Some(ChannelId::new(2)))
        .unwrap();
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.5, 0.5]);
}

#[test]
fn test_play_is_idempotent() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.play(None).unwrap();
    let edges = context.edges();
    graph.play(None).unwrap();
    assert_eq!(context.edges(), edges);

    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75, 0.75]);
}

// ============================================================================
// GAIN AND MUTE
// ============================================================================

#[test]
fn test_gain_scales_one_channel() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.play(None).unwrap();
    graph.set_gain(0.5, Some(ChannelId::new(2))).unwrap();
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.5, 0.5]);

    // unknown channel targets all channels
    graph.set_gain(0.0, Some(ChannelId::new(7))).unwrap();
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.0, 0.0]);
}

#[test]
fn test_gain_survives_stop_and_mute() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.set_gain(2.0, None).unwrap();
    graph.play(None).unwrap();
    graph.mute(None).unwrap();
    graph.stop(None).unwrap();
    graph.unmute(None).unwrap();
    graph.play(None).unwrap();

    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[1.5, 1.5]);
}

#[test]
fn test_mute_one_channel() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.play(None).unwrap();
    graph.mute(Some(ChannelId::new(1))).unwrap();
    assert!(graph.is_muted());
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.5, 0.5]);

    graph.unmute(None).unwrap();
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75, 0.75]);
}

#[test]
fn test_mute_carries_over_reattach() {
    let (context, mut router, _) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.mute(Some(ChannelId::new(2))).unwrap();
    let next = context.create_input_stream(2).unwrap();
    graph.attach_stream(next).unwrap();
    graph.play(None).unwrap();

    feed(&context, &next, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.25, 0.25]);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_reattach_releases_previous_nodes() {
    let (context, mut router, first) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();
    graph.play(None).unwrap();

    let second = context.create_input_stream(2).unwrap();
    graph.attach_stream(second).unwrap();
    assert_eq!(graph.state(), GraphState::Attached);
    assert_eq!(graph.stream(), Some(&second));

    // destination + source, splitter, merger and two gains
    assert_eq!(context.node_count(), 6);
    // source→splitter, two splitter→gain links, merger→destination
    assert_eq!(context.edges().len(), 4);

    graph.play(None).unwrap();
    feed(&context, &first, &[1.0, 1.0]);
    feed(&context, &second, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75, 0.75]);
}

#[test]
fn test_controls_on_detached_graph_are_no_ops() {
    let (context, mut router) = setup();
    let (group, track) = ids();
    let graph = router.add_instance(group, track, PlaybackMode::Graph);

    graph.play(None).unwrap();
    graph.mute(None).unwrap();
    graph.set_gain(0.5, None).unwrap();
    graph.disconnect().unwrap();

    assert_eq!(graph.state(), GraphState::Detached);
    assert!(!graph.is_muted());
    assert_eq!(context.node_count(), 1);
}

#[test]
fn test_remove_instance_releases_everything() {
    let (context, mut router, _) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    router.instance_mut(&group, &track).unwrap().play(None).unwrap();

    assert!(router.remove_instance(&group, &track).unwrap());
    assert!(!router.remove_instance(&group, &track).unwrap());
    assert!(router.instance_group(&group).is_none());
    assert_eq!(context.node_count(), 1);
    assert!(context.edges().is_empty());
}

#[test]
fn test_replacing_instance_releases_old_graph() {
    let (context, mut router, _) = attached(PlaybackMode::Graph);
    let (group, track) = ids();

    router.add_instance(group.clone(), track.clone(), PlaybackMode::Graph);
    assert!(!router.instance(&group, &track).unwrap().is_attached());
    assert_eq!(context.node_count(), 1);
}

// ============================================================================
// ELEMENT MODE
// ============================================================================

#[test]
fn test_element_mode_starts_muted_element() {
    let (context, mut router, input) = attached(PlaybackMode::Element);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.play(None).unwrap();
    let elements = context.elements();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].stream, input.id);
    assert!(elements[0].muted);
    assert!(elements[0].playing);

    // the muted element adds nothing on top of the graph
    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75, 0.75]);

    graph.stop(None).unwrap();
    assert!(context.elements().is_empty());
}

#[test]
fn test_element_released_on_disconnect() {
    let (context, mut router, _) = attached(PlaybackMode::Element);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();

    graph.play(None).unwrap();
    graph.disconnect().unwrap();
    assert!(context.elements().is_empty());
    assert!(graph.element().is_none());
}

// ============================================================================
// CHANNEL EXTRACTION
// ============================================================================

#[test]
fn test_channel_stream_extracts_one_channel() {
    let (context, router) = setup();
    let input = context.create_input_stream(2).unwrap();

    let extracted = router.channel_stream(&input, ChannelId::new(2)).unwrap();
    let output = extracted.stream();
    assert_eq!(output.channels, 1);

    let left: Vec<f32> = (0..FRAMES).map(|i| i as f32).collect();
    let right: Vec<f32> = (0..FRAMES).map(|i| -(i as f32)).collect();
    context.push_frames(input.id, &[left, right.clone()]).unwrap();
    context.render(FRAMES);

    assert_eq!(context.read_frames(output.id, FRAMES).unwrap(), vec![right]);
}

#[test]
fn test_dropped_channel_stream_stops_rendering() {
    let (context, router) = setup();
    let input = context.create_input_stream(2).unwrap();

    for _ in 0..100 {
        let extracted = router.channel_stream(&input, ChannelId::new(1)).unwrap();
        let output = extracted.stream();
        feed(&context, &input, &[0.25, 0.5]);
        context.render(FRAMES);
        assert_eq!(context.buffered_frames(output.id).unwrap(), FRAMES);

        drop(extracted);
        assert!(matches!(
            context.buffered_frames(output.id),
            Err(AudioError::UnknownStream(_))
        ));
    }

    // only the destination node remains
    assert_eq!(context.node_count(), 1);
    assert!(context.edges().is_empty());
}

#[test]
fn test_failed_attach_keeps_graph_playing() {
    let (context, mut router, input) = attached(PlaybackMode::Graph);
    let (group, track) = ids();
    let graph = router.instance_mut(&group, &track).unwrap();
    graph.play(None).unwrap();
    let edges = context.edges();

    // never registered with the context
    let stray = MediaStream::new(StreamId::new(999), 2);
    assert!(matches!(
        graph.attach_stream(stray),
        Err(AudioError::UnknownStream(_))
    ));
    assert_eq!(graph.state(), GraphState::Playing);
    assert_eq!(context.edges(), edges);

    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75, 0.75]);
}

#[test]
fn test_channel_stream_unknown_channel() {
    let (context, router) = setup();
    let input = context.create_input_stream(2).unwrap();

    assert!(matches!(
        router.channel_stream(&input, ChannelId::new(3)),
        Err(AudioError::InvalidChannel(3))
    ));
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_configuration_applies_to_new_instances() {
    let (context, mut router) = setup();
    let (group, track) = ids();
    router
        .set_configuration(&RoutingOverride::default().with_input_channels(4))
        .unwrap();
    assert_eq!(router.configuration(), &RouterConfig::new(4, 2).unwrap());

    let input = context.create_input_stream(4).unwrap();
    let graph = router.add_instance(group, track, PlaybackMode::Graph);
    graph.attach_stream(input).unwrap();
    graph.play(Some(ChannelId::new(4))).unwrap();
    assert_eq!(graph.nodes().unwrap().gains.len(), 4);

    feed(&context, &input, &[0.1, 0.2, 0.3, 0.4]);
    assert_levels(&render_levels(&context), &[0.4, 0.4]);
}

#[tokio::test]
async fn test_router_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    tokio::fs::write(&path, "[routing.output]\nchannels = 1\n")
        .await
        .unwrap();

    let config = PatchbayConfig::load_from_file(&path).await.unwrap();
    let router_config = config.router_config().unwrap();
    assert_eq!(router_config, RouterConfig::new(2, 1).unwrap());

    let context = Arc::new(SoftwareContext::new(48000, 1));
    let mut router = AudioRouter::with_config(context.clone(), router_config);
    let input = context.create_input_stream(2).unwrap();
    let (group, track) = ids();
    let graph = router.add_instance(group, track, PlaybackMode::Graph);
    graph.attach_stream(input).unwrap();
    graph.play(None).unwrap();

    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.75]);
}

// ============================================================================
// COMMAND BUS
// ============================================================================

#[test]
fn test_command_lines_drive_router() {
    let (context, mut router) = setup();
    let (group, track) = ids();
    let input = context.create_input_stream(2).unwrap();

    let added = router.execute(Command::AddInstance {
        group: group.clone(),
        track: track.clone(),
        mode: PlaybackMode::Graph,
    });
    assert!(matches!(added, CommandResult::InstanceAdded(_)));
    router
        .instance_mut(&group, &track)
        .unwrap()
        .attach_stream(input)
        .unwrap();

    for line in ["play", "gain 0 1"] {
        let action: Action = line.parse().unwrap();
        let result = router.execute(Command::control(group.clone(), track.clone(), action));
        assert!(!result.is_error(), "{line}: {result:?}");
    }

    feed(&context, &input, &[0.25, 0.5]);
    assert_levels(&render_levels(&context), &[0.5, 0.5]);

    let status = router.instance_status(&group, &track).unwrap();
    assert_eq!(status.state, GraphState::Playing);
    assert_eq!(status.stream, Some(input.id));
}

#[test]
fn test_context_clock_advances_with_rendering() {
    let (context, _router) = setup();
    assert_eq!(context.current_time(), 0.0);
    context.render(48000);
    assert!((context.current_time() - 1.0).abs() < 1e-9);
}
