//! Error types for the assistant pipeline.

/// Top-level error type for the voice-assistant system.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Wake-word engine error.
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Streaming transcription engine error.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Completion (LLM) engine error.
    #[error("completion error: {0}")]
    Completion(String),

    /// Speech synthesis engine error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
