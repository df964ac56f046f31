//! Message types passed between pipeline stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::engines::GenerationOutcome;

/// Identifier of one wake-word-to-playback turn.
///
/// Assigned by the coordinator; strictly increasing over the pipeline's
/// lifetime. Every inter-stage message carries the turn it belongs to, and
/// stages drop messages from superseded turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TurnId(u64);

impl TurnId {
    /// The value before any wake word has been heard.
    pub(crate) const NONE: TurnId = TurnId(0);
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared record of the turn currently allowed to produce output.
///
/// The coordinator advances it; every stage compares dequeued messages
/// against it. Advancing is the whole interruption story as far as data
/// messages are concerned: anything stamped with an older turn becomes
/// droppable the instant the counter moves.
#[derive(Debug, Default)]
pub struct ActiveTurn(AtomicU64);

impl ActiveTurn {
    pub fn current(&self) -> TurnId {
        TurnId(self.0.load(Ordering::SeqCst))
    }

    /// Begin the next turn and return its id.
    pub fn advance(&self) -> TurnId {
        TurnId(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_stale(&self, turn: TurnId) -> bool {
        turn != self.current()
    }
}

/// A finished user utterance from the listener.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Full transcript text.
    pub text: String,
    /// When the endpoint was reached (seeds the response-delay measurement).
    pub captured_at: Instant,
}

/// Work order for the generator.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub turn: TurnId,
    pub text: String,
    pub utterance_end: Instant,
}

/// Commands consumed by the synthesizer worker.
#[derive(Debug)]
pub enum SynthCommand {
    /// Released completion text to speak.
    Speak {
        turn: TurnId,
        text: String,
        utterance_end: Instant,
    },
    /// No more text for this turn; drain the session.
    Flush { turn: TurnId },
    /// Abandon any open session and discard its output.
    Interrupt,
}

/// A chunk of synthesized audio.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub turn: TurnId,
    /// Mono i16 samples at the synthesis engine's rate.
    pub samples: Vec<i16>,
}

/// Commands consumed by the speaker worker.
#[derive(Debug)]
pub enum SpeakerCommand {
    Play(PcmChunk),
    /// No more audio for this turn; drain and report completion.
    Flush { turn: TurnId },
    /// Discard buffered audio and stop the device.
    Interrupt,
}

/// Events reported by the stages to the coordinator.
#[derive(Debug)]
pub enum ControlEvent {
    WakeWordDetected { at: Instant },
    UtteranceCaptured(Utterance),
    /// Listener worker died; fatal to the pipeline.
    ListenerFailed { error: String },
    GenerationCompleted { turn: TurnId, outcome: GenerationOutcome },
    GenerationFailed { turn: TurnId, error: String },
    SynthesisFailed { turn: TurnId, error: String },
    PlaybackCompleted { turn: TurnId },
    PlaybackFailed { turn: TurnId, error: String },
}

/// Publicly observable pipeline activity (harness output, tests, UIs).
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A wake word was heard and a turn began.
    TurnStarted { turn: TurnId, barge_in: bool },
    /// The user's request was transcribed.
    UtteranceCaptured { turn: TurnId, text: String },
    /// The completion finished streaming.
    GenerationCompleted {
        turn: TurnId,
        outcome: GenerationOutcome,
    },
    /// Playback drained; the assistant is ready for the next wake word.
    TurnCompleted { turn: TurnId },
    /// The turn was abandoned after a stage failure.
    TurnAbandoned { turn: TurnId, error: String },
}
