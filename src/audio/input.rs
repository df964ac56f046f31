//! Microphone capture using cpal.
//!
//! Captures at the device's native configuration, mixes down to mono, and
//! resamples to the rate the speech engines expect. Frames are handed out
//! synchronously through a condvar-guarded ring so the listener's blocking
//! loop is paced by the device.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info};

use crate::config::AudioConfig;
use crate::engines::AudioInput;
use crate::error::{AssistantError, Result};

/// Give up on a read when the device stays silent this long. A healthy
/// microphone delivers frames continuously, even for silence.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on buffered capture audio before the oldest samples are dropped.
const RING_CAPACITY_SEC: usize = 10;

struct FrameRing {
    samples: Mutex<VecDeque<i16>>,
    available: Condvar,
}

/// Microphone input for the listener.
pub struct CpalInput {
    device: cpal::Device,
    stream_config: StreamConfig,
    frame_length: usize,
    target_sample_rate: u32,
    ring: Arc<FrameRing>,
    stream: Option<cpal::Stream>,
}

impl CpalInput {
    /// Open the configured input device (or the system default).
    ///
    /// Uses the device's default configuration for maximum compatibility and
    /// resamples to `sample_rate` in software.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable input device is available.
    pub fn new(config: &AudioConfig, frame_length: usize, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| AssistantError::Audio(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| AssistantError::Audio("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| AssistantError::Audio(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels",
            native_rate, native_channels
        );
        if native_rate != sample_rate {
            info!("will resample from {native_rate}Hz to {sample_rate}Hz");
        }

        Ok(Self {
            device,
            stream_config,
            frame_length,
            target_sample_rate: sample_rate,
            ring: Arc::new(FrameRing {
                samples: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
            stream: None,
        })
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let capacity = RING_CAPACITY_SEC * target_rate as usize;
        let ring = Arc::clone(&self.ring);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate == target_rate {
                        mono
                    } else {
                        resample(&mono, native_rate, target_rate)
                    };
                    let Ok(mut queue) = ring.samples.lock() else {
                        return;
                    };
                    queue.extend(samples.iter().map(|s| to_i16(*s)));
                    let excess = queue.len().saturating_sub(capacity);
                    if excess > 0 {
                        debug!("capture ring full, dropping {excess} samples");
                        queue.drain(..excess);
                    }
                    ring.available.notify_one();
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AssistantError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AssistantError::Audio(format!("failed to start input stream: {e}")))?;
        info!("audio capture started: native {native_rate}Hz -> target {target_rate}Hz");
        self.stream = Some(stream);
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<i16>> {
        let started = Instant::now();
        let mut queue = self
            .ring
            .samples
            .lock()
            .map_err(|_| AssistantError::Audio("capture ring lock poisoned".into()))?;
        loop {
            if queue.len() >= self.frame_length {
                return Ok(queue.drain(..self.frame_length).collect());
            }
            if started.elapsed() > STALL_TIMEOUT {
                return Err(AssistantError::Audio(format!(
                    "no audio from input device for {}s",
                    STALL_TIMEOUT.as_secs()
                )));
            }
            let (guard, _timeout) = self
                .ring
                .available
                .wait_timeout(queue, Duration::from_millis(100))
                .map_err(|_| AssistantError::Audio("capture ring lock poisoned".into()))?;
            queue = guard;
        }
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Sufficient quality for speech (48kHz -> 16kHz); no anti-alias filter
/// needed since speech energy sits below 8kHz.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
