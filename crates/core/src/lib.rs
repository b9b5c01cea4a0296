//! Patchbay core: per-instance audio routing graphs
//!
//! The domain layer is platform-agnostic. It drives an external node-graph
//! audio substrate through the [`domain::audio::AudioContext`] trait; concrete
//! substrates and device drivers live in the `infra` crate.

pub mod domain;
