//! Latency and throughput profilers for the pipeline stages.
//!
//! Plain owned structs; each stage constructs the ones it reports. Reading a
//! profiler resets it, so every report line covers exactly one measurement
//! window (one wake word, one utterance, one completion).

use std::time::{Duration, Instant};

/// Real-time factor: accumulated compute time over accumulated audio time.
///
/// An RTF below 1.0 means the engine keeps up with real time. Call [`tick`]
/// before each engine call and [`tock`] with the processed or produced sample
/// count after it returns.
///
/// [`tick`]: RtfProfiler::tick
/// [`tock`]: RtfProfiler::tock
#[derive(Debug)]
pub struct RtfProfiler {
    sample_rate: u32,
    compute: Duration,
    audio_sec: f64,
    ticked_at: Option<Instant>,
}

impl RtfProfiler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            compute: Duration::ZERO,
            audio_sec: 0.0,
            ticked_at: None,
        }
    }

    /// Mark the start of an engine call.
    pub fn tick(&mut self) {
        self.ticked_at = Some(Instant::now());
    }

    /// Mark the end of an engine call that processed `samples` samples.
    ///
    /// A tock without a preceding tick contributes audio time only.
    pub fn tock(&mut self, samples: usize) {
        if let Some(started) = self.ticked_at.take() {
            self.compute += started.elapsed();
        }
        self.audio_sec += samples as f64 / f64::from(self.sample_rate);
    }

    /// The RTF for the window since the last read. Resets the window.
    pub fn rtf(&mut self) -> f64 {
        let rtf = if self.audio_sec > 0.0 {
            self.compute.as_secs_f64() / self.audio_sec
        } else {
            0.0
        };
        self.compute = Duration::ZERO;
        self.audio_sec = 0.0;
        self.ticked_at = None;
        rtf
    }
}

/// Tokens per second for a streamed completion.
///
/// The first [`tock`] starts the clock and is not counted, so the reported
/// rate covers steady-state decoding rather than prompt processing.
///
/// [`tock`]: TpsProfiler::tock
#[derive(Debug, Default)]
pub struct TpsProfiler {
    tokens: u32,
    started_at: Option<Instant>,
}

impl TpsProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one token callback.
    pub fn tock(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        } else {
            self.tokens += 1;
        }
    }

    /// Tokens per second since the first tock. Resets the window.
    pub fn tps(&mut self) -> f64 {
        let tps = match self.started_at {
            Some(started) => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    f64::from(self.tokens) / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.tokens = 0;
        self.started_at = None;
        tps
    }
}

/// Time from utterance end to the first synthesized audio chunk.
///
/// Re-armed at the start of every utterance; the first observation wins.
#[derive(Debug, Default)]
pub struct DelayProfiler {
    utterance_end: Option<Instant>,
    delay: Option<Duration>,
}

impl DelayProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the profiler with the instant the user stopped speaking.
    pub fn arm(&mut self, utterance_end: Instant) {
        self.utterance_end = Some(utterance_end);
        self.delay = None;
    }

    /// Record the first audio observation. Later calls are ignored until the
    /// profiler is re-armed.
    pub fn observe_first_audio(&mut self) {
        if self.delay.is_none()
            && let Some(end) = self.utterance_end
        {
            self.delay = Some(end.elapsed());
        }
    }

    /// The measured delay, if one was observed since arming.
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }
}
