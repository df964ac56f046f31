//! Confab: a hands-free streaming voice assistant pipeline.
//!
//! This crate coordinates a wake-word-gated conversation loop:
//! Microphone → Wake word → STT → LLM → TTS → Speaker
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by channels:
//! - **Listener**: Routes microphone frames through wake-word detection and
//!   streaming transcription
//! - **Generator**: Streams an LLM completion for each captured utterance,
//!   with dialog history and stop-phrase filtering
//! - **Synthesizer**: Turns released text into PCM through a per-turn
//!   synthesis session
//! - **Speaker**: Plays audio with a warm-up buffer via `cpal`
//!
//! Turns are identified by a monotonically increasing [`pipeline::TurnId`];
//! a wake word spoken while the assistant is generating or speaking starts a
//! new turn and every in-flight message of the old one is dropped where it
//! is dequeued. Engines are trait objects behind [`engines::EngineSet`], so
//! the same pipeline runs against real vendor SDKs, the energy-based wake
//! word, or fully scripted engines in tests.

pub mod audio;
pub mod config;
pub mod engines;
pub mod error;
pub mod pipeline;
pub mod profiling;

pub use config::AssistantConfig;
pub use engines::EngineSet;
pub use error::{AssistantError, Result};
pub use pipeline::{AssistantPipeline, PipelineEvent};
