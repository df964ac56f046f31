//! End-to-end session harness for the assistant pipeline.
//!
//! By default drives the full pipeline against the scripted engine set with
//! realistic pacing: two turns, the second spoken over the first answer so it
//! barges in. Prints a JSON session report (per-turn outcome, utterance to
//! first-audio latency, samples played) to stdout; logs go to stderr.
//!
//! Environment:
//! - `CONFAB_LIVE=1` swaps in the real audio devices and the energy wake
//!   word for a hardware smoke run. Wear headphones: there is no echo
//!   cancellation, so over speakers the wake word hears the assistant too.
//! - `CONFAB_WAV=<path>` saves the audio that reached the output device as a
//!   16-bit mono WAV (scripted mode only).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use confab::audio::{CpalInput, CpalOutput};
use confab::engines::energy::EnergyWakeWord;
use confab::engines::scripted::{
    CompletionScript, ENDPOINT_MARKER, EventLog, OutputEvent, ScriptedCompletion, ScriptedInput,
    ScriptedOutput, ScriptedTranscriber, ScriptedTts, ScriptedWakeWord, Segment, Sequencer,
    SILENCE, WAKE_MARKER, speech_marker, written_samples,
};
use confab::engines::{
    AudioOutput, EngineSet, GenerationOutcome, SynthesisStream, TextToSpeech, Transcriber,
    Transcript,
};
use confab::pipeline::TurnId;
use confab::{AssistantConfig, AssistantPipeline, PipelineEvent};

/// Samples per input frame, shared by the wake word and the transcriber.
const FRAME_LENGTH: usize = 512;
/// Input sample rate.
const SAMPLE_RATE: u32 = 16_000;
/// Synthesis sample rate.
const TTS_RATE: u32 = 22_050;
/// Simulated capture pacing per scripted frame.
const FRAME_PACE: Duration = Duration::from_millis(2);
/// Turns in the scripted session.
const SESSION_TURNS: usize = 2;
/// Give up on the scripted session if no event arrives for this long.
const STALL_LIMIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Logs go to stderr so the JSON report owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("confab=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("confab-harness failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let live = std::env::var("CONFAB_LIVE").is_ok_and(|v| v == "1");
    let wav_path = std::env::var_os("CONFAB_WAV").map(PathBuf::from);

    let mut config = AssistantConfig::default();
    config.profile = true;
    config.generator.short_answers = true;

    let seq = Sequencer::default();
    let (engines, output_events, first_writes) = if live {
        let (engines, first_writes) = live_engines(&config, &seq)?;
        (engines, None, first_writes)
    } else {
        let (engines, output_events, first_writes) = scripted_engines(&seq);
        (engines, Some(output_events), first_writes)
    };

    let mut pipeline = AssistantPipeline::new(config, engines)?;
    let cancel = pipeline.cancel_token();
    let Some(mut events) = pipeline.take_events() else {
        anyhow::bail!("pipeline event stream already taken");
    };

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            ctrl_c_cancel.cancel();
        }
    });

    if live {
        println!("confab v{}", env!("CARGO_PKG_VERSION"));
        println!("\nSpeak loudly to wake the assistant. Press Ctrl+C to stop.\n");
    } else {
        info!("running scripted session ({SESSION_TURNS} turns, one barge-in)");
    }

    let pipeline_task = tokio::spawn(pipeline.run());

    let mut session = Session::new(live);
    loop {
        let event = if live {
            events.recv().await
        } else {
            match tokio::time::timeout(STALL_LIMIT, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    warn!("no pipeline event for {STALL_LIMIT:?}, cancelling session");
                    break;
                }
            }
        };
        let Some(event) = event else { break };
        session.observe(event);
        if !live && session.finished() {
            break;
        }
    }

    cancel.cancel();
    pipeline_task.await??;

    let samples = output_events.as_ref().map(written_samples);
    let report = session.into_report(&first_writes, samples.as_ref().map(Vec::len));
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let (Some(path), Some(samples)) = (wav_path, samples) {
        save_wav(&path, &samples, TTS_RATE)?;
        println!("saved played audio: {}", path.display());
    }
    Ok(())
}

// ─── Engine assembly ─────────────────────────────────────────────────────────

/// Scripted two-turn session. The first answer holds mid-generation until it
/// is interrupted, so the second wake word always lands as a barge-in.
fn scripted_engines(seq: &Sequencer) -> (EngineSet, EventLog<OutputEvent>, FirstWriteLog) {
    let script = vec![
        Segment::paced(SILENCE, 5, FRAME_PACE),
        Segment::paced(WAKE_MARKER, 1, FRAME_PACE),
        Segment::paced(speech_marker(0), 8, FRAME_PACE),
        Segment::paced(ENDPOINT_MARKER, 1, FRAME_PACE),
        // The first answer is still streaming when this wake word lands.
        Segment::paced(SILENCE, 25, FRAME_PACE),
        Segment::paced(WAKE_MARKER, 1, FRAME_PACE),
        Segment::paced(speech_marker(1), 8, FRAME_PACE),
        Segment::paced(ENDPOINT_MARKER, 1, FRAME_PACE),
    ];
    let transcriber = ScriptedTranscriber::new(
        FRAME_LENGTH,
        SAMPLE_RATE,
        vec![
            (speech_marker(0), "what's the weather like today"),
            (speech_marker(1), "never mind, what time is it"),
        ],
    );
    let completion = ScriptedCompletion::new(
        vec![
            CompletionScript::new(vec![
                "Right", " now", " it", " is", " sunny", " and", " twenty", " degrees", " with",
                " a", " light", " breeze",
            ])
            .with_token_pace(Duration::from_millis(4))
            .holding_until_interrupt(),
            CompletionScript::new(vec!["It", " is", " half", " past", " nine", ".", "</s>"])
                .with_token_pace(Duration::from_millis(4)),
        ],
        seq,
    );
    let output = ScriptedOutput::new(seq);
    let output_events = output.events();
    let (output, first_writes) = TimedOutput::new(Box::new(output));

    let engines = EngineSet {
        wake: Box::new(ScriptedWakeWord::new(FRAME_LENGTH, SAMPLE_RATE)),
        transcriber: Box::new(transcriber),
        completion: Arc::new(completion),
        tts: Box::new(ScriptedTts::new(TTS_RATE, 2, seq).with_flush_tail(16)),
        input: Box::new(ScriptedInput::new(FRAME_LENGTH, script)),
        output: Box::new(output),
    };
    (engines, output_events, first_writes)
}

/// Real microphone and speaker, energy wake word, canned speech engines.
fn live_engines(
    config: &AssistantConfig,
    seq: &Sequencer,
) -> anyhow::Result<(EngineSet, FirstWriteLog)> {
    let input = CpalInput::new(&config.audio, FRAME_LENGTH, SAMPLE_RATE)?;
    let output = CpalOutput::new(&config.audio, TTS_RATE)?;
    let (output, first_writes) = TimedOutput::new(Box::new(output));

    let completion = ScriptedCompletion::new(
        vec![
            CompletionScript::new(vec![
                "I", " listen", " for", " a", " wake", " word,", " transcribe", " what", " you",
                " say,", " and", " answer", " out", " loud.",
            ])
            .with_token_pace(Duration::from_millis(40)),
            CompletionScript::new(vec![
                "Honey", " never", " spoils.", " Sealed", " jars", " from", " ancient", " tombs",
                " are", " still", " edible.",
            ])
            .with_token_pace(Duration::from_millis(40)),
            CompletionScript::new(vec![
                "I", " cannot", " see", " a", " clock,", " but", " your", " terminal", " can.",
            ])
            .with_token_pace(Duration::from_millis(40)),
            CompletionScript::new(vec!["Goodbye."]).with_token_pace(Duration::from_millis(40)),
        ],
        seq,
    );

    let engines = EngineSet {
        wake: Box::new(EnergyWakeWord::new(
            FRAME_LENGTH,
            SAMPLE_RATE,
            config.listener.wake_sensitivity,
        )),
        transcriber: Box::new(CannedTranscriber::new(
            FRAME_LENGTH,
            SAMPLE_RATE,
            config.listener.endpoint_duration_sec,
        )),
        completion: Arc::new(completion),
        tts: Box::new(ToneTts { sample_rate: TTS_RATE }),
        input: Box::new(input),
        output: Box::new(output),
    };
    Ok((engines, first_writes))
}

// ─── Session report ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SessionReport {
    generated_at: String,
    mode: &'static str,
    turns: Vec<TurnReport>,
    samples_played: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TurnReport {
    turn: String,
    barge_in: bool,
    utterance: Option<String>,
    outcome: Option<String>,
    /// Milliseconds from the utterance endpoint to the first sample the
    /// output device accepted.
    first_write_ms: Option<f64>,
    status: String,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnStatus {
    InFlight,
    Completed,
    Superseded,
    Abandoned,
}

impl TurnStatus {
    fn as_str(self) -> &'static str {
        match self {
            TurnStatus::InFlight => "in flight",
            TurnStatus::Completed => "completed",
            TurnStatus::Superseded => "superseded",
            TurnStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug)]
struct TurnEntry {
    id: TurnId,
    barge_in: bool,
    utterance: Option<String>,
    utterance_at: Option<Instant>,
    outcome: Option<GenerationOutcome>,
    status: TurnStatus,
    error: Option<String>,
}

/// Accumulates pipeline events into per-turn records.
struct Session {
    live: bool,
    turns: Vec<TurnEntry>,
}

impl Session {
    fn new(live: bool) -> Self {
        Self {
            live,
            turns: Vec::new(),
        }
    }

    fn observe(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::TurnStarted { turn, barge_in } => {
                if barge_in
                    && let Some(previous) = self
                        .turns
                        .iter_mut()
                        .rev()
                        .find(|t| t.status == TurnStatus::InFlight)
                {
                    previous.status = TurnStatus::Superseded;
                    if self.live {
                        println!("(interrupted)");
                    }
                }
                self.turns.push(TurnEntry {
                    id: turn,
                    barge_in,
                    utterance: None,
                    utterance_at: None,
                    outcome: None,
                    status: TurnStatus::InFlight,
                    error: None,
                });
            }
            PipelineEvent::UtteranceCaptured { turn, text } => {
                if self.live {
                    println!("You: {text}");
                }
                if let Some(entry) = self.entry(turn) {
                    entry.utterance = Some(text);
                    entry.utterance_at = Some(Instant::now());
                }
            }
            PipelineEvent::GenerationCompleted { turn, outcome } => {
                if let Some(entry) = self.entry(turn) {
                    entry.outcome = Some(outcome);
                }
            }
            PipelineEvent::TurnCompleted { turn } => {
                if self.live {
                    println!("(turn {turn} done)");
                }
                if let Some(entry) = self.entry(turn) {
                    entry.status = TurnStatus::Completed;
                }
            }
            PipelineEvent::TurnAbandoned { turn, error } => {
                if let Some(entry) = self.entry(turn) {
                    entry.status = TurnStatus::Abandoned;
                    entry.error = Some(error);
                }
            }
        }
    }

    fn entry(&mut self, turn: TurnId) -> Option<&mut TurnEntry> {
        self.turns.iter_mut().rev().find(|t| t.id == turn)
    }

    /// The scripted session is over once every scripted turn has settled.
    fn finished(&self) -> bool {
        self.turns.len() >= SESSION_TURNS
            && self.turns.iter().all(|t| t.status != TurnStatus::InFlight)
    }

    fn into_report(self, first_writes: &FirstWriteLog, samples_played: Option<usize>) -> SessionReport {
        let mode = if self.live { "live" } else { "scripted" };
        let first_writes: Vec<Instant> =
            first_writes.lock().map(|log| log.clone()).unwrap_or_default();

        // Each playback's first write follows its turn's utterance; walking
        // both lists in time order pairs them up.
        let mut next_write = 0;
        let turns = self
            .turns
            .into_iter()
            .map(|entry| {
                let first_write_ms = entry.utterance_at.and_then(|at| {
                    while next_write < first_writes.len() && first_writes[next_write] < at {
                        next_write += 1;
                    }
                    (next_write < first_writes.len()).then(|| {
                        let delay = first_writes[next_write].duration_since(at);
                        next_write += 1;
                        delay.as_secs_f64() * 1000.0
                    })
                });
                TurnReport {
                    turn: entry.id.to_string(),
                    barge_in: entry.barge_in,
                    utterance: entry.utterance,
                    outcome: entry.outcome.map(|o| format!("{o:?}")),
                    first_write_ms,
                    status: entry.status.as_str().to_string(),
                    error: entry.error,
                }
            })
            .collect();

        SessionReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            mode,
            turns,
            samples_played,
        }
    }
}

// ─── Harness devices and engine stands-ins ───────────────────────────────────

type FirstWriteLog = Arc<Mutex<Vec<Instant>>>;

/// Wraps the output device and timestamps the first write of each playback
/// run, which gives the report its utterance-to-audio latency column.
struct TimedOutput {
    inner: Box<dyn AudioOutput>,
    log: FirstWriteLog,
    armed: bool,
}

impl TimedOutput {
    fn new(inner: Box<dyn AudioOutput>) -> (Self, FirstWriteLog) {
        let log = FirstWriteLog::default();
        (
            Self {
                inner,
                log: Arc::clone(&log),
                armed: true,
            },
            log,
        )
    }
}

impl AudioOutput for TimedOutput {
    fn start(&mut self) -> confab::Result<()> {
        self.inner.start()
    }

    fn write(&mut self, pcm: &[i16]) -> confab::Result<usize> {
        if self.armed {
            self.armed = false;
            if let Ok(mut log) = self.log.lock() {
                log.push(Instant::now());
            }
        }
        self.inner.write(pcm)
    }

    fn flush(&mut self) -> confab::Result<()> {
        self.inner.flush()
    }

    fn stop(&mut self) -> confab::Result<()> {
        self.armed = true;
        self.inner.stop()
    }
}

/// RMS below which a frame counts as silence for the canned endpointer.
const QUIET_RMS: f32 = 0.01;

/// Stands in for a real transcription engine during live runs: waits for
/// trailing silence after speech, then yields the next canned utterance.
struct CannedTranscriber {
    frame_length: usize,
    sample_rate: u32,
    endpoint_frames: u32,
    utterances: Vec<&'static str>,
    next_utterance: usize,
    heard_speech: bool,
    quiet_streak: u32,
}

impl CannedTranscriber {
    fn new(frame_length: usize, sample_rate: u32, endpoint_sec: f32) -> Self {
        let frames_per_sec = sample_rate as f32 / frame_length as f32;
        Self {
            frame_length,
            sample_rate,
            endpoint_frames: (endpoint_sec * frames_per_sec).ceil() as u32,
            utterances: vec![
                "what can you do",
                "tell me something interesting",
                "what time is it",
                "goodbye",
            ],
            next_utterance: 0,
            heard_speech: false,
            quiet_streak: 0,
        }
    }
}

impl Transcriber for CannedTranscriber {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn process(&mut self, frame: &[i16]) -> confab::Result<Transcript> {
        if rms(frame) > QUIET_RMS {
            self.heard_speech = true;
            self.quiet_streak = 0;
        } else if self.heard_speech {
            self.quiet_streak += 1;
        }

        let mut step = Transcript::default();
        if self.heard_speech && self.quiet_streak >= self.endpoint_frames {
            self.heard_speech = false;
            self.quiet_streak = 0;
            step.text = self.utterances[self.next_utterance % self.utterances.len()].to_string();
            self.next_utterance += 1;
            step.endpoint = true;
        }
        Ok(step)
    }

    fn flush(&mut self) -> confab::Result<String> {
        self.heard_speech = false;
        self.quiet_streak = 0;
        Ok(String::new())
    }
}

fn rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = frame
        .iter()
        .map(|&s| {
            let x = f32::from(s) / 32768.0;
            x * x
        })
        .sum();
    (sum_squares / frame.len() as f32).sqrt()
}

/// Seconds of tone per character at speech rate 1.0.
const TONE_SEC_PER_CHAR: f32 = 0.04;
/// Tone pitch in Hz.
const TONE_PITCH: f32 = 440.0;

/// Stands in for a real synthesis engine during live runs: each character
/// becomes a short tone burst, so playback is verifiable by ear.
struct ToneTts {
    sample_rate: u32,
}

impl TextToSpeech for ToneTts {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open_stream(&mut self, speech_rate: f32) -> confab::Result<Box<dyn SynthesisStream>> {
        let samples_per_char =
            (TONE_SEC_PER_CHAR * self.sample_rate as f32 / speech_rate.max(0.1)) as usize;
        Ok(Box::new(ToneStream {
            sample_rate: self.sample_rate,
            samples_per_char,
            phase: 0.0,
        }))
    }
}

struct ToneStream {
    sample_rate: u32,
    samples_per_char: usize,
    phase: f32,
}

impl SynthesisStream for ToneStream {
    fn synthesize(&mut self, text: &str) -> confab::Result<Option<Vec<i16>>> {
        let mut pcm = Vec::with_capacity(text.chars().count() * self.samples_per_char);
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                for _ in 0..self.samples_per_char {
                    self.phase = (self.phase + TONE_PITCH / self.sample_rate as f32).fract();
                    let s = (self.phase * std::f32::consts::TAU).sin();
                    pcm.push((s * 8_000.0) as i16);
                }
            } else {
                // Whitespace and punctuation become rests, which gives the
                // tones a word rhythm.
                pcm.resize(pcm.len() + self.samples_per_char, 0);
            }
        }
        Ok((!pcm.is_empty()).then_some(pcm))
    }

    fn flush(&mut self) -> confab::Result<Option<Vec<i16>>> {
        Ok(None)
    }
}

// ─── WAV dump ────────────────────────────────────────────────────────────────

fn save_wav(path: &Path, samples: &[i16], sample_rate: u32) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}
