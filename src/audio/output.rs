//! Speaker playback using cpal.
//!
//! The device callback pulls from a bounded ring that the speaker stage
//! tops up with non-blocking writes. Underruns play silence; `flush` blocks
//! until the ring drains, mirroring the turn-final drain semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info};

use crate::config::AudioConfig;
use crate::engines::AudioOutput;
use crate::error::{AssistantError, Result};

/// How much audio the ring holds before writes are rejected.
const RING_CAPACITY_SEC: usize = 1;

/// Pad after a drain so the device's own buffer finishes playing.
const DRAIN_TAIL: Duration = Duration::from_millis(60);

/// Speaker output for the playback stage.
pub struct CpalOutput {
    device: cpal::Device,
    stream_config: StreamConfig,
    capacity: usize,
    ring: Arc<Mutex<VecDeque<i16>>>,
    stream: Option<cpal::Stream>,
}

impl CpalOutput {
    /// Open the configured output device (or the system default) at the
    /// synthesis engine's sample rate.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable output device is available.
    pub fn new(config: &AudioConfig, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| AssistantError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| AssistantError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
            capacity: RING_CAPACITY_SEC * sample_rate as usize,
            ring: Arc::new(Mutex::new(VecDeque::new())),
            stream: None,
        })
    }

    fn buffered(&self) -> usize {
        self.ring.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl AudioOutput for CpalOutput {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let ring = Arc::clone(&self.ring);
        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let Ok(mut queue) = ring.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    for sample in data.iter_mut() {
                        *sample = queue
                            .pop_front()
                            .map_or(0.0, |s| f32::from(s) / 32768.0);
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| AssistantError::Audio(format!("failed to build output stream: {e}")))?;
        stream
            .play()
            .map_err(|e| AssistantError::Audio(format!("failed to start output stream: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, pcm: &[i16]) -> Result<usize> {
        if self.stream.is_none() {
            return Err(AssistantError::Audio("output stream not started".into()));
        }
        let mut queue = self
            .ring
            .lock()
            .map_err(|_| AssistantError::Audio("playback ring lock poisoned".into()))?;
        let space = self.capacity.saturating_sub(queue.len());
        let accepted = pcm.len().min(space);
        queue.extend(&pcm[..accepted]);
        Ok(accepted)
    }

    fn flush(&mut self) -> Result<()> {
        let pending = self.buffered();
        let rate = self.stream_config.sample_rate.max(1);
        let deadline = Instant::now()
            + Duration::from_secs_f64(pending as f64 / f64::from(rate))
            + Duration::from_secs(2);
        while self.buffered() > 0 {
            if Instant::now() > deadline {
                return Err(AssistantError::Audio("output stream stalled".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(DRAIN_TAIL);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream = None;
        if let Ok(mut queue) = self.ring.lock() {
            queue.clear();
        }
        Ok(())
    }
}
