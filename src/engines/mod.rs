//! Engine and device seams.
//!
//! The pipeline core never talks to vendor SDKs directly; every engine and
//! audio device arrives as a trait object inside an [`EngineSet`]. The caller
//! builds the set (and handles vendor init failures) before the pipeline
//! exists.
//!
//! All audio crossing these seams is mono signed 16-bit PCM. Input frames are
//! fixed-length at the wake-word engine's frame length; output runs at the
//! sample rate reported by the synthesis engine.

pub mod energy;
pub mod scripted;

use std::sync::Arc;

use crate::error::Result;

/// One streaming transcription step.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Partial transcript text produced by this frame (often empty).
    pub text: String,
    /// True when the engine detected the end of the utterance.
    pub endpoint: bool,
}

/// Why a completion call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The model produced a natural stop.
    Stopped,
    /// The configured token limit was hit.
    TokenLimitReached,
    /// [`CompletionModel::interrupt`] cut the call short.
    Interrupted,
}

/// Sampling and limit parameters for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Fully rendered prompt (dialog transcript ending with an open
    /// assistant line).
    pub prompt: String,
    /// Maximum tokens to produce (None = engine default).
    pub token_limit: Option<u32>,
    /// Stop phrases that end the completion.
    pub stop_phrases: Vec<String>,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub temperature: f32,
    pub top_p: f32,
}

/// A finished completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw accumulated completion text (partial if interrupted).
    pub text: String,
    pub outcome: GenerationOutcome,
}

/// Wake-word detector fed fixed-length frames.
pub trait WakeWord: Send {
    /// Samples per frame this engine expects.
    fn frame_length(&self) -> usize;
    /// Sample rate the engine expects.
    fn sample_rate(&self) -> u32;
    /// Process one frame. Returns the detected keyword index, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine rejects the frame; listener errors
    /// are fatal to the pipeline.
    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>>;
}

/// Streaming speech-to-text with endpoint detection.
pub trait Transcriber: Send {
    /// Samples per frame this engine expects. Must match the wake-word
    /// engine's frame length; validated at pipeline construction.
    fn frame_length(&self) -> usize;
    /// Sample rate the engine expects.
    fn sample_rate(&self) -> u32;
    /// Process one frame of speech.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine rejects the frame; listener errors
    /// are fatal to the pipeline.
    fn process(&mut self, frame: &[i16]) -> Result<Transcript>;
    /// Drain any buffered transcript after an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot finalize the utterance.
    fn flush(&mut self) -> Result<String>;
}

/// Streaming completion engine.
///
/// `Send + Sync` because [`interrupt`] is called from the coordinator while
/// [`generate`] blocks on the generator worker; implementations synchronize
/// internally.
///
/// [`interrupt`]: CompletionModel::interrupt
/// [`generate`]: CompletionModel::generate
pub trait CompletionModel: Send + Sync {
    /// Run one completion, streaming token fragments through `on_token`.
    ///
    /// Fragment boundaries are arbitrary; a stop phrase may span several
    /// callbacks. The returned [`Completion`] carries the raw accumulated
    /// text and the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error when inference fails; the turn is abandoned but the
    /// pipeline survives.
    fn generate(
        &self,
        request: &CompletionRequest,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Completion>;

    /// Ask the active generation to stop early with
    /// [`GenerationOutcome::Interrupted`]. Safe to call when no generation is
    /// in progress (it then has no effect).
    fn interrupt(&self);
}

/// One per-utterance synthesis session.
pub trait SynthesisStream: Send {
    /// Feed released completion text. The engine may buffer and return no
    /// audio until it has enough text to speak.
    ///
    /// # Errors
    ///
    /// Returns an error when synthesis fails; the turn is abandoned.
    fn synthesize(&mut self, text: &str) -> Result<Option<Vec<i16>>>;
    /// Drain buffered audio and end the session.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot finalize the stream.
    fn flush(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Streaming text-to-speech engine.
pub trait TextToSpeech: Send {
    /// Sample rate of produced PCM.
    fn sample_rate(&self) -> u32;
    /// Open a synthesis session for one utterance.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot start a stream.
    fn open_stream(&mut self, speech_rate: f32) -> Result<Box<dyn SynthesisStream>>;
}

/// Microphone-side audio device producing fixed-length frames.
pub trait AudioInput: Send {
    /// Begin capturing.
    ///
    /// # Errors
    ///
    /// Returns an error when the device cannot start; fatal to the pipeline.
    fn start(&mut self) -> Result<()>;
    /// Read the next frame, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns an error on device failure (e.g. disconnect); fatal to the
    /// pipeline.
    fn read(&mut self) -> Result<Vec<i16>>;
}

/// Speaker-side audio device with non-blocking partial writes.
pub trait AudioOutput: Send {
    /// Begin playback for one turn.
    ///
    /// # Errors
    ///
    /// Returns an error when the device cannot start; the turn is abandoned.
    fn start(&mut self) -> Result<()>;
    /// Offer samples; returns how many the device accepted (possibly fewer,
    /// possibly zero). Never blocks on device buffer space.
    ///
    /// # Errors
    ///
    /// Returns an error on device failure; the turn is abandoned.
    fn write(&mut self, pcm: &[i16]) -> Result<usize>;
    /// Block until everything written has been played.
    ///
    /// # Errors
    ///
    /// Returns an error on device failure.
    fn flush(&mut self) -> Result<()>;
    /// Stop playback and discard anything still queued in the device.
    ///
    /// # Errors
    ///
    /// Returns an error on device failure.
    fn stop(&mut self) -> Result<()>;
}

/// The full set of engines and devices the pipeline runs against.
///
/// Built by the caller; construction failures surface there, before any
/// pipeline state exists.
pub struct EngineSet {
    pub wake: Box<dyn WakeWord>,
    pub transcriber: Box<dyn Transcriber>,
    /// Shared handle: the generator worker generates through it while the
    /// coordinator interrupts through its own clone.
    pub completion: Arc<dyn CompletionModel>,
    pub tts: Box<dyn TextToSpeech>,
    pub input: Box<dyn AudioInput>,
    pub output: Box<dyn AudioOutput>,
}

impl std::fmt::Debug for EngineSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSet")
            .field("wake_frame_length", &self.wake.frame_length())
            .field("wake_sample_rate", &self.wake.sample_rate())
            .field("transcriber_sample_rate", &self.transcriber.sample_rate())
            .field("tts_sample_rate", &self.tts.sample_rate())
            .finish_non_exhaustive()
    }
}
