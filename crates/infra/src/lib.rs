//! Patchbay infrastructure
//!
//! Concrete audio engines behind the core's `AudioContext` abstraction.

pub mod audio;
