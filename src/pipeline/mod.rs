//! The streaming voice-assistant pipeline.
//!
//! Four stages connected by channels: the listener routes microphone frames
//! through wake-word detection and transcription, the generator streams a
//! completion for each captured utterance, the synthesizer turns released
//! text into PCM, and the speaker plays it. The coordinator owns the turn
//! state machine that ties them together and unwinds them on barge-in.

pub mod coordinator;
pub mod dialog;
pub mod filter;
mod generator;
mod listener;
pub mod messages;
mod speaker;
mod synthesizer;

pub use coordinator::AssistantPipeline;
pub use filter::CompletionFilter;
pub use messages::{PipelineEvent, TurnId};
