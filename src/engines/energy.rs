//! Energy-threshold wake word.
//!
//! Fires on sustained audio energy rather than a trained keyword, which is
//! enough to drive the live harness mode without a vendor engine. Any loud
//! utterance "wakes" it.

use crate::error::Result;

use super::WakeWord;

/// RMS threshold at sensitivity 0 (least sensitive).
const MAX_THRESHOLD: f32 = 0.09;
/// RMS threshold at sensitivity 1 (most sensitive).
const MIN_THRESHOLD: f32 = 0.01;
/// Consecutive loud frames required to fire (~160 ms at 512/16kHz frames).
const ACTIVATION_FRAMES: u32 = 5;

/// Loudness-based [`WakeWord`] implementation.
pub struct EnergyWakeWord {
    frame_length: usize,
    sample_rate: u32,
    threshold: f32,
    streak: u32,
}

impl EnergyWakeWord {
    /// `sensitivity` in \[0, 1\] maps linearly to the RMS threshold; higher
    /// sensitivity fires on quieter audio.
    pub fn new(frame_length: usize, sample_rate: u32, sensitivity: f32) -> Self {
        let sensitivity = sensitivity.clamp(0.0, 1.0);
        let threshold = MAX_THRESHOLD - sensitivity * (MAX_THRESHOLD - MIN_THRESHOLD);
        tracing::debug!(threshold, "energy wake word initialized");
        Self {
            frame_length,
            sample_rate,
            threshold,
            streak: 0,
        }
    }
}

impl WakeWord for EnergyWakeWord {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>> {
        if rms_energy(frame) > self.threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        if self.streak >= ACTIVATION_FRAMES {
            self.streak = 0;
            return Ok(Some(0));
        }
        Ok(None)
    }
}

/// RMS energy of i16 samples normalized to \[0, 1\].
#[allow(clippy::cast_precision_loss)]
fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let x = f32::from(s) / 32768.0;
            x * x
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}
