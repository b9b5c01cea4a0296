//! Device streams bridging CPAL and the software context
//!
//! [`CpalCapture`] pushes the default input device into a context stream;
//! [`CpalOutput`] pulls rendered blocks from the context into the default
//! output device. Capture buffers cross threads over a bounded crossbeam
//! channel; a full channel drops the buffer rather than block the callback.

use crate::audio::cpal_backend::{
    default_input_device, default_output_device, device_name, DeviceConfig,
};
use crate::audio::software::SoftwareContext;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Stream;
use crossbeam::channel::bounded;
use patchbay_core::domain::audio::{AudioError, MediaStream, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Capture buffers held between two renders
const CAPTURE_QUEUE_DEPTH: usize = 16;

/// Linear-interpolation sample-rate converter for interleaved audio
///
/// Keeps the last input frame between calls so consecutive buffers join
/// without a discontinuity.
pub struct Resampler {
    channels: usize,
    /// Input frames consumed per output frame
    step: f64,
    position: f64,
    last: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: u16) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || channels == 0 {
            return Err(AudioError::InvalidConfiguration(format!(
                "cannot resample {source_rate}Hz -> {target_rate}Hz with {channels} channels"
            )));
        }
        Ok(Self {
            channels: usize::from(channels),
            step: f64::from(source_rate) / f64::from(target_rate),
            position: 0.0,
            last: vec![0.0; usize::from(channels)],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Convert one interleaved buffer
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }

        let channels = self.channels;
        let frames = input.len() / channels;
        let sample = |frame: isize, channel: usize| -> f32 {
            // frame -1 is the tail of the previous buffer
            if frame < 0 {
                self.last[channel]
            } else {
                input[frame as usize * channels + channel]
            }
        };

        let estimate = (frames as f64 / self.step) as usize + 1;
        let mut output = Vec::with_capacity(estimate * channels);
        // positions are relative to the previous buffer's last frame
        while self.position < frames as f64 {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let i0 = base as isize - 1;
            for channel in 0..channels {
                let a = sample(i0, channel);
                let b = sample(i0 + 1, channel);
                output.push(a + frac * (b - a));
            }
            self.position += self.step;
        }
        self.position -= frames as f64;

        if frames > 0 {
            self.last
                .copy_from_slice(&input[(frames - 1) * channels..frames * channels]);
        }
        output
    }
}

/// Default input device captured into a context stream
pub struct CpalCapture {
    _stream: Stream,
    media: MediaStream,
    config: DeviceConfig,
}

impl CpalCapture {
    /// Open the default input device and register it on `context`
    pub fn open_default(context: &SoftwareContext) -> Result<Self> {
        let (device, config) = default_input_device()?;
        info!(
            device = %device_name(&device),
            channels = config.channels,
            sample_rate = config.sample_rate,
            "Opening capture stream"
        );

        let media = context.create_input_stream(config.channels)?;
        let (sender, receiver) = bounded(CAPTURE_QUEUE_DEPTH);
        context.attach_feed(media.id, receiver)?;

        let mut resampler =
            Resampler::new(config.sample_rate, context.sample_rate(), config.channels)?;
        if !resampler.is_passthrough() {
            info!(
                "Resampling capture {}Hz -> {}Hz",
                config.sample_rate,
                context.sample_rate()
            );
        }

        let stream = device
            .build_input_stream(
                &config.to_cpal(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let buffer = resampler.process(data);
                    let _ = sender.try_send(buffer);
                },
                |err| error!("Input stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;

        Ok(Self {
            _stream: stream,
            media,
            config,
        })
    }

    /// The context stream carrying the captured audio
    pub fn media(&self) -> MediaStream {
        self.media
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }
}

/// Default output device rendering a software context
pub struct CpalOutput {
    _stream: Stream,
    config: DeviceConfig,
}

impl CpalOutput {
    /// Start pulling blocks from `context` into the default output device.
    ///
    /// The context should have been created at the device's sample rate
    /// (see [`super::cpal_backend::default_output_config`]).
    pub fn start(context: Arc<SoftwareContext>) -> Result<Self> {
        let (device, config) = default_output_device()?;
        info!(
            device = %device_name(&device),
            channels = config.channels,
            sample_rate = config.sample_rate,
            "Opening output stream"
        );
        if config.sample_rate != context.sample_rate() {
            warn!(
                "Output runs at {}Hz but the context renders at {}Hz",
                config.sample_rate,
                context.sample_rate()
            );
        }

        let channels = usize::from(config.channels);
        let stream = device
            .build_output_stream(
                &config.to_cpal(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let block = context.render(frames);
                    interleave(&block, data, channels);
                },
                |err| error!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;

        Ok(Self {
            _stream: stream,
            config,
        })
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }
}

/// Write a planar block into an interleaved device buffer, silencing
/// channels the block does not have
fn interleave(block: &[Vec<f32>], data: &mut [f32], channels: usize) {
    for (frame, out) in data.chunks_exact_mut(channels).enumerate() {
        for (channel, sample) in out.iter_mut().enumerate() {
            *sample = block
                .get(channel)
                .and_then(|samples| samples.get(frame))
                .copied()
                .unwrap_or(0.0);
        }
    }
}
