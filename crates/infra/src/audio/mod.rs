//! Audio engine implementations
//!
//! - [`software`]: the in-process node graph every routing graph runs on
//! - [`cpal_backend`] and [`stream`]: device discovery and the CPAL streams
//!   that feed and drain the software context (WASAPI on Windows,
//!   ALSA/PulseAudio on Linux, CoreAudio on macOS)

pub mod cpal_backend;
pub mod software;
pub mod stream;

pub use cpal_backend::*;
pub use software::*;
pub use stream::*;
