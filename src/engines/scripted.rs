//! Deterministic scripted engines and devices.
//!
//! Used by the integration tests and the latency harness to drive the full
//! pipeline without vendor SDKs or real audio hardware. Input audio is a
//! script of marker-valued frames; the scripted wake word and transcriber
//! react to markers, the scripted completion model plays back a token script
//! with a real interrupt flag, and the scripted synthesizer stamps every PCM
//! sample with its session index so a test can prove which turn's audio
//! reached the output device.
//!
//! Every recorded event carries a ticket from a shared [`Sequencer`], so
//! ordering can be asserted across engines ("no session-1 write after the
//! first device stop").

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;

use super::{
    AudioInput, AudioOutput, Completion, CompletionModel, CompletionRequest, GenerationOutcome,
    SynthesisStream, TextToSpeech, Transcriber, Transcript, WakeWord,
};

/// Marker value for silence frames.
pub const SILENCE: i16 = 0;
/// Marker value that triggers the scripted wake word.
pub const WAKE_MARKER: i16 = 1;
/// Marker value that ends an utterance in the scripted transcriber.
pub const ENDPOINT_MARKER: i16 = 2;

/// Marker value for the nth scripted speech segment.
#[must_use]
pub const fn speech_marker(n: i16) -> i16 {
    10 + n
}

/// Shared monotonic ticket source for cross-engine event ordering.
#[derive(Clone, Debug, Default)]
pub struct Sequencer(Arc<AtomicU64>);

impl Sequencer {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// A recorded event stream shared between an engine and the test observing it.
pub type EventLog<E> = Arc<Mutex<Vec<(u64, E)>>>;

fn record<E>(log: &EventLog<E>, seq: &Sequencer, event: E) {
    let ticket = seq.next();
    if let Ok(mut events) = log.lock() {
        events.push((ticket, event));
    }
}

// ─── Input device ────────────────────────────────────────────────────────────

/// One stretch of identical marker frames in an input script.
#[derive(Debug, Clone)]
pub struct Segment {
    pub marker: i16,
    pub frames: usize,
    /// Delay before each frame is handed out (simulated capture pacing).
    pub pace: Duration,
}

impl Segment {
    #[must_use]
    pub fn new(marker: i16, frames: usize) -> Self {
        Self {
            marker,
            frames,
            pace: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn paced(marker: i16, frames: usize, pace: Duration) -> Self {
        Self {
            marker,
            frames,
            pace,
        }
    }
}

/// Scripted [`AudioInput`]: plays its segments, then idles on paced silence
/// forever so the listener keeps running until the pipeline is cancelled.
pub struct ScriptedInput {
    frame_length: usize,
    segments: VecDeque<Segment>,
    remaining: usize,
    idle_pace: Duration,
}

impl ScriptedInput {
    #[must_use]
    pub fn new(frame_length: usize, segments: Vec<Segment>) -> Self {
        let segments: VecDeque<Segment> = segments.into();
        let remaining = segments.front().map_or(0, |s| s.frames);
        Self {
            frame_length,
            segments,
            remaining,
            idle_pace: Duration::from_millis(5),
        }
    }
}

impl AudioInput for ScriptedInput {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<i16>> {
        while self.remaining == 0 {
            self.segments.pop_front();
            match self.segments.front() {
                Some(next) => self.remaining = next.frames,
                None => {
                    // Script exhausted: idle silence until cancellation.
                    std::thread::sleep(self.idle_pace);
                    return Ok(vec![SILENCE; self.frame_length]);
                }
            }
        }
        let segment = self
            .segments
            .front()
            .cloned()
            .unwrap_or_else(|| Segment::new(SILENCE, 1));
        if !segment.pace.is_zero() {
            std::thread::sleep(segment.pace);
        }
        self.remaining -= 1;
        Ok(vec![segment.marker; self.frame_length])
    }
}

// ─── Wake word ───────────────────────────────────────────────────────────────

/// Fires on any frame whose samples carry [`WAKE_MARKER`].
pub struct ScriptedWakeWord {
    frame_length: usize,
    sample_rate: u32,
}

impl ScriptedWakeWord {
    #[must_use]
    pub fn new(frame_length: usize, sample_rate: u32) -> Self {
        Self {
            frame_length,
            sample_rate,
        }
    }
}

impl WakeWord for ScriptedWakeWord {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>> {
        Ok((frame.first() == Some(&WAKE_MARKER)).then_some(0))
    }
}

// ─── Transcriber ─────────────────────────────────────────────────────────────

/// Emits a configured text fragment the first time each speech marker
/// appears, and an endpoint on [`ENDPOINT_MARKER`].
pub struct ScriptedTranscriber {
    frame_length: usize,
    sample_rate: u32,
    fragments: HashMap<i16, String>,
    prev_marker: i16,
}

impl ScriptedTranscriber {
    /// `fragments` maps a speech marker (see [`speech_marker`]) to the
    /// partial transcript it produces.
    #[must_use]
    pub fn new(frame_length: usize, sample_rate: u32, fragments: Vec<(i16, &str)>) -> Self {
        Self {
            frame_length,
            sample_rate,
            fragments: fragments
                .into_iter()
                .map(|(m, t)| (m, t.to_string()))
                .collect(),
            prev_marker: SILENCE,
        }
    }
}

impl Transcriber for ScriptedTranscriber {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn process(&mut self, frame: &[i16]) -> Result<Transcript> {
        let marker = frame.first().copied().unwrap_or(SILENCE);
        let mut step = Transcript::default();
        if marker == ENDPOINT_MARKER {
            step.endpoint = true;
        } else if marker != self.prev_marker
            && let Some(text) = self.fragments.get(&marker)
        {
            step.text = text.clone();
        }
        self.prev_marker = marker;
        Ok(step)
    }

    fn flush(&mut self) -> Result<String> {
        self.prev_marker = SILENCE;
        Ok(String::new())
    }
}

// ─── Completion model ────────────────────────────────────────────────────────

/// Recorded completion-engine activity.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    Generate { prompt: String },
    Finished { outcome: GenerationOutcome },
    Interrupt,
}

/// Token script for one generation call.
#[derive(Debug, Clone)]
pub struct CompletionScript {
    pub tokens: Vec<&'static str>,
    /// Outcome reported when the call is not interrupted.
    pub outcome: GenerationOutcome,
    /// Delay between token callbacks.
    pub token_pace: Duration,
    /// After the last token, block until [`CompletionModel::interrupt`] is
    /// called. Makes barge-in tests independent of scheduling luck.
    pub hold_until_interrupt: bool,
}

impl CompletionScript {
    #[must_use]
    pub fn new(tokens: Vec<&'static str>) -> Self {
        Self {
            tokens,
            outcome: GenerationOutcome::Stopped,
            token_pace: Duration::ZERO,
            hold_until_interrupt: false,
        }
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: GenerationOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    #[must_use]
    pub fn with_token_pace(mut self, pace: Duration) -> Self {
        self.token_pace = pace;
        self
    }

    #[must_use]
    pub fn holding_until_interrupt(mut self) -> Self {
        self.hold_until_interrupt = true;
        self
    }
}

/// Scripted [`CompletionModel`] with a real cross-thread interrupt flag.
pub struct ScriptedCompletion {
    scripts: Mutex<VecDeque<CompletionScript>>,
    interrupted: AtomicBool,
    interrupt_calls: AtomicU64,
    events: EventLog<CompletionEvent>,
    seq: Sequencer,
}

impl ScriptedCompletion {
    #[must_use]
    pub fn new(scripts: Vec<CompletionScript>, seq: &Sequencer) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            interrupted: AtomicBool::new(false),
            interrupt_calls: AtomicU64::new(0),
            events: Arc::new(Mutex::new(Vec::new())),
            seq: seq.clone(),
        }
    }

    #[must_use]
    pub fn events(&self) -> EventLog<CompletionEvent> {
        Arc::clone(&self.events)
    }

    /// How many times `interrupt()` has been called.
    #[must_use]
    pub fn interrupt_calls(&self) -> u64 {
        self.interrupt_calls.load(Ordering::SeqCst)
    }
}

impl CompletionModel for ScriptedCompletion {
    fn generate(
        &self,
        request: &CompletionRequest,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Completion> {
        // An interrupt only applies to the call that is active when it
        // arrives; a new call starts clean.
        self.interrupted.store(false, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| CompletionScript::new(Vec::new()));
        record(
            &self.events,
            &self.seq,
            CompletionEvent::Generate {
                prompt: request.prompt.clone(),
            },
        );

        let mut text = String::new();
        let finish = |outcome: GenerationOutcome, text: String| {
            record(&self.events, &self.seq, CompletionEvent::Finished { outcome });
            Ok(Completion { text, outcome })
        };

        for token in &script.tokens {
            if self.interrupted.load(Ordering::SeqCst) {
                return finish(GenerationOutcome::Interrupted, text);
            }
            on_token(token);
            text.push_str(token);
            if !script.token_pace.is_zero() {
                std::thread::sleep(script.token_pace);
            }
        }
        if script.hold_until_interrupt {
            while !self.interrupted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            return finish(GenerationOutcome::Interrupted, text);
        }
        finish(script.outcome, text)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_calls.fetch_add(1, Ordering::SeqCst);
        record(&self.events, &self.seq, CompletionEvent::Interrupt);
    }
}

// ─── Text-to-speech ──────────────────────────────────────────────────────────

/// Recorded synthesis activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsEvent {
    Open { session: u64 },
    Synthesize { session: u64, text: String },
    Flush { session: u64 },
}

/// Scripted [`TextToSpeech`]: every sample of session `n` has value `n`, so
/// downstream logs reveal exactly which turn produced any given audio.
pub struct ScriptedTts {
    sample_rate: u32,
    samples_per_char: usize,
    flush_tail: usize,
    next_session: u64,
    events: EventLog<TtsEvent>,
    seq: Sequencer,
}

impl ScriptedTts {
    #[must_use]
    pub fn new(sample_rate: u32, samples_per_char: usize, seq: &Sequencer) -> Self {
        Self {
            sample_rate,
            samples_per_char,
            flush_tail: 0,
            next_session: 1,
            events: Arc::new(Mutex::new(Vec::new())),
            seq: seq.clone(),
        }
    }

    /// Emit `samples` trailing samples from every flush.
    #[must_use]
    pub fn with_flush_tail(mut self, samples: usize) -> Self {
        self.flush_tail = samples;
        self
    }

    #[must_use]
    pub fn events(&self) -> EventLog<TtsEvent> {
        Arc::clone(&self.events)
    }
}

impl TextToSpeech for ScriptedTts {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open_stream(&mut self, _speech_rate: f32) -> Result<Box<dyn SynthesisStream>> {
        let session = self.next_session;
        self.next_session += 1;
        record(&self.events, &self.seq, TtsEvent::Open { session });
        Ok(Box::new(ScriptedStream {
            session,
            samples_per_char: self.samples_per_char,
            flush_tail: self.flush_tail,
            events: Arc::clone(&self.events),
            seq: self.seq.clone(),
        }))
    }
}

struct ScriptedStream {
    session: u64,
    samples_per_char: usize,
    flush_tail: usize,
    events: EventLog<TtsEvent>,
    seq: Sequencer,
}

impl ScriptedStream {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn stamp(&self) -> i16 {
        self.session as i16
    }
}

impl SynthesisStream for ScriptedStream {
    fn synthesize(&mut self, text: &str) -> Result<Option<Vec<i16>>> {
        record(
            &self.events,
            &self.seq,
            TtsEvent::Synthesize {
                session: self.session,
                text: text.to_string(),
            },
        );
        let samples = text.chars().count() * self.samples_per_char;
        if samples == 0 {
            return Ok(None);
        }
        Ok(Some(vec![self.stamp(); samples]))
    }

    fn flush(&mut self) -> Result<Option<Vec<i16>>> {
        record(
            &self.events,
            &self.seq,
            TtsEvent::Flush {
                session: self.session,
            },
        );
        if self.flush_tail == 0 {
            return Ok(None);
        }
        Ok(Some(vec![self.stamp(); self.flush_tail]))
    }
}

// ─── Output device ───────────────────────────────────────────────────────────

/// Recorded output-device activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Start,
    /// The samples the device accepted from one write call.
    Write(Vec<i16>),
    Flush,
    Stop,
}

/// Recording [`AudioOutput`] with a configurable per-write acceptance limit,
/// which forces the speaker's partial-write retention path.
pub struct ScriptedOutput {
    max_accept: usize,
    events: EventLog<OutputEvent>,
    seq: Sequencer,
}

impl ScriptedOutput {
    #[must_use]
    pub fn new(seq: &Sequencer) -> Self {
        Self {
            max_accept: usize::MAX,
            events: Arc::new(Mutex::new(Vec::new())),
            seq: seq.clone(),
        }
    }

    /// Accept at most `samples` per write call.
    #[must_use]
    pub fn with_max_accept(mut self, samples: usize) -> Self {
        self.max_accept = samples.max(1);
        self
    }

    #[must_use]
    pub fn events(&self) -> EventLog<OutputEvent> {
        Arc::clone(&self.events)
    }
}

impl AudioOutput for ScriptedOutput {
    fn start(&mut self) -> Result<()> {
        record(&self.events, &self.seq, OutputEvent::Start);
        Ok(())
    }

    fn write(&mut self, pcm: &[i16]) -> Result<usize> {
        let accepted = pcm.len().min(self.max_accept);
        record(
            &self.events,
            &self.seq,
            OutputEvent::Write(pcm[..accepted].to_vec()),
        );
        Ok(accepted)
    }

    fn flush(&mut self) -> Result<()> {
        record(&self.events, &self.seq, OutputEvent::Flush);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        record(&self.events, &self.seq, OutputEvent::Stop);
        Ok(())
    }
}

/// Flatten every sample the device accepted, in order.
#[must_use]
pub fn written_samples(events: &EventLog<OutputEvent>) -> Vec<i16> {
    let Ok(events) = events.lock() else {
        return Vec::new();
    };
    events
        .iter()
        .filter_map(|(_, e)| match e {
            OutputEvent::Write(samples) => Some(samples.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn input_plays_segments_then_idles_on_silence() {
        let mut input = ScriptedInput::new(4, vec![
            Segment::new(WAKE_MARKER, 1),
            Segment::new(speech_marker(0), 2),
        ]);
        input.start().unwrap();
        assert_eq!(input.read().unwrap(), vec![WAKE_MARKER; 4]);
        assert_eq!(input.read().unwrap(), vec![speech_marker(0); 4]);
        assert_eq!(input.read().unwrap(), vec![speech_marker(0); 4]);
        assert_eq!(input.read().unwrap(), vec![SILENCE; 4]);
        assert_eq!(input.read().unwrap(), vec![SILENCE; 4]);
    }

    #[test]
    fn wake_word_fires_on_marker_only() {
        let mut wake = ScriptedWakeWord::new(4, 16_000);
        assert_eq!(wake.process(&[SILENCE; 4]).unwrap(), None);
        assert_eq!(wake.process(&[WAKE_MARKER; 4]).unwrap(), Some(0));
        assert_eq!(wake.process(&[speech_marker(0); 4]).unwrap(), None);
    }

    #[test]
    fn transcriber_emits_fragment_once_per_segment() {
        let mut stt =
            ScriptedTranscriber::new(4, 16_000, vec![(speech_marker(0), "hello there")]);
        let first = stt.process(&[speech_marker(0); 4]).unwrap();
        assert_eq!(first.text, "hello there");
        assert!(!first.endpoint);

        let repeat = stt.process(&[speech_marker(0); 4]).unwrap();
        assert!(repeat.text.is_empty());

        let end = stt.process(&[ENDPOINT_MARKER; 4]).unwrap();
        assert!(end.endpoint);
        assert_eq!(stt.flush().unwrap(), "");
    }

    #[test]
    fn completion_plays_tokens_and_reports_outcome() {
        let seq = Sequencer::default();
        let model = ScriptedCompletion::new(
            vec![CompletionScript::new(vec!["Hi", " there"])
                .with_outcome(GenerationOutcome::TokenLimitReached)],
            &seq,
        );
        let mut seen = Vec::new();
        let request = CompletionRequest {
            prompt: "User: hi".to_string(),
            token_limit: None,
            stop_phrases: Vec::new(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            temperature: 0.0,
            top_p: 1.0,
        };
        let done = model
            .generate(&request, &mut |t| seen.push(t.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["Hi", " there"]);
        assert_eq!(done.text, "Hi there");
        assert_eq!(done.outcome, GenerationOutcome::TokenLimitReached);
    }

    #[test]
    fn completion_interrupt_cuts_generation_short() {
        let seq = Sequencer::default();
        let model = Arc::new(ScriptedCompletion::new(
            vec![
                CompletionScript::new(vec!["a", "b", "c", "d"])
                    .with_token_pace(Duration::from_millis(5))
                    .holding_until_interrupt(),
            ],
            &seq,
        ));
        let request = CompletionRequest {
            prompt: String::new(),
            token_limit: None,
            stop_phrases: Vec::new(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            temperature: 0.0,
            top_p: 1.0,
        };

        let interrupter = Arc::clone(&model);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(8));
            interrupter.interrupt();
        });
        let done = model.generate(&request, &mut |_| {}).unwrap();
        handle.join().unwrap();

        assert_eq!(done.outcome, GenerationOutcome::Interrupted);
        assert!(done.text.starts_with('a'), "partial text expected, got {:?}", done.text);
        assert_eq!(model.interrupt_calls(), 1);
    }

    #[test]
    fn tts_stamps_samples_with_session_index() {
        let seq = Sequencer::default();
        let mut tts = ScriptedTts::new(16_000, 2, &seq);
        let mut first = tts.open_stream(1.0).unwrap();
        assert_eq!(first.synthesize("abc").unwrap(), Some(vec![1; 6]));
        assert_eq!(first.flush().unwrap(), None);

        let mut second = tts.open_stream(1.0).unwrap();
        assert_eq!(second.synthesize("x").unwrap(), Some(vec![2; 2]));
    }

    #[test]
    fn output_respects_acceptance_limit() {
        let seq = Sequencer::default();
        let mut output = ScriptedOutput::new(&seq).with_max_accept(3);
        output.start().unwrap();
        assert_eq!(output.write(&[7; 10]).unwrap(), 3);
        assert_eq!(output.write(&[7; 2]).unwrap(), 2);
        assert_eq!(written_samples(&output.events()), vec![7; 5]);
    }

    #[test]
    fn event_tickets_are_globally_ordered() {
        let seq = Sequencer::default();
        let mut tts = ScriptedTts::new(16_000, 1, &seq);
        let mut output = ScriptedOutput::new(&seq);
        let mut stream = tts.open_stream(1.0).unwrap();
        stream.synthesize("a").unwrap();
        output.start().unwrap();

        let tts_events = tts.events();
        let out_events = output.events();
        let last_tts = tts_events.lock().unwrap().last().unwrap().0;
        let first_out = out_events.lock().unwrap().first().unwrap().0;
        assert!(first_out > last_tts);
    }
}
