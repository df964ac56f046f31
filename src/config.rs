//! Configuration types for the voice-assistant pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AssistantError, Result};

/// Default stop phrases withheld from synthesized output.
///
/// These are the end-of-turn markers emitted by the model families the
/// assistant is commonly paired with (Llama 2/3, Gemma, Phi, GPT-style).
pub const DEFAULT_STOP_PHRASES: [&str; 7] = [
    "</s>",
    "<end_of_turn>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end|>",
    "<|user|>",
    "<|assistant|>",
];

/// System instruction used when `short_answers` is enabled.
pub const SHORT_ANSWERS_INSTRUCTION: &str =
    "You are a voice assistant and your answers are very short but informative";

/// Top-level configuration for the assistant pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Engine construction settings (credentials, model paths, device).
    pub engine: EngineConfig,
    /// Wake-word + transcription settings.
    pub listener: ListenerConfig,
    /// Completion generation settings.
    pub generator: GeneratorConfig,
    /// Speech synthesis settings.
    pub synthesizer: SynthesizerConfig,
    /// Playback settings.
    pub speaker: SpeakerConfig,
    /// Audio device selection.
    pub audio: AudioConfig,
    /// Emit RTF / tokens-per-second / delay report lines.
    pub profile: bool,
}

/// Settings consumed by engine builders, not by the pipeline core.
///
/// The pipeline takes engines as ready trait objects; these fields exist so
/// one config file can also drive whatever constructs them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Vendor access credential, if the engine stack needs one.
    pub access_key: String,
    /// Completion model file path.
    pub completion_model_path: Option<PathBuf>,
    /// Custom wake-word model file path (None = engine builtin).
    pub wake_model_path: Option<PathBuf>,
    /// Completion inference device selector (e.g. `best`, `cpu`, `gpu:0`).
    pub completion_device: String,
}

/// Wake-word and transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Wake-word sensitivity in \[0, 1\]. Higher values trigger more easily
    /// at the cost of false activations.
    pub wake_sensitivity: f32,
    /// Trailing silence, in seconds, that ends an utterance.
    pub endpoint_duration_sec: f32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            wake_sensitivity: 0.5,
            endpoint_duration_sec: 1.0,
        }
    }
}

/// Completion generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Maximum tokens per completion (None = engine default / unlimited).
    pub token_limit: Option<u32>,
    /// Presence penalty passed to the engine.
    pub presence_penalty: f32,
    /// Frequency penalty passed to the engine.
    pub frequency_penalty: f32,
    /// Sampling temperature. 0 selects greedy decoding.
    pub temperature: f32,
    /// Nucleus sampling cutoff in (0, 1].
    pub top_p: f32,
    /// System instruction for the dialog (ignored when `short_answers` is
    /// set; see [`SHORT_ANSWERS_INSTRUCTION`]).
    pub system_prompt: Option<String>,
    /// Steer the model toward brief spoken-style answers.
    pub short_answers: bool,
    /// Stop phrases withheld from released completion text.
    pub stop_phrases: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            token_limit: Some(256),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            temperature: 0.0,
            top_p: 1.0,
            system_prompt: None,
            short_answers: false,
            stop_phrases: DEFAULT_STOP_PHRASES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    /// Speech rate multiplier (1.0 = natural pace).
    pub speech_rate: f32,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self { speech_rate: 1.0 }
    }
}

/// Playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    /// Seconds of synthesized audio to buffer before playback starts.
    ///
    /// A larger warm-up trades response latency for resilience against
    /// synthesis underruns. 0 starts playback on the first chunk.
    pub warmup_sec: f32,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self { warmup_sec: 0.0 }
    }
}

/// Audio device selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl AssistantConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AssistantError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/confab/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("confab").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("confab")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/confab-config/config.toml")
        }
    }

    /// Check numeric ranges before the pipeline is built.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Config`] naming the first out-of-range field.
    pub fn validate(&self) -> Result<()> {
        let l = &self.listener;
        if !(0.0..=1.0).contains(&l.wake_sensitivity) {
            return Err(AssistantError::Config(format!(
                "wake_sensitivity must be in [0, 1], got {}",
                l.wake_sensitivity
            )));
        }
        if l.endpoint_duration_sec <= 0.0 {
            return Err(AssistantError::Config(format!(
                "endpoint_duration_sec must be positive, got {}",
                l.endpoint_duration_sec
            )));
        }
        let g = &self.generator;
        if g.temperature < 0.0 {
            return Err(AssistantError::Config(format!(
                "temperature must be non-negative, got {}",
                g.temperature
            )));
        }
        if !(g.top_p > 0.0 && g.top_p <= 1.0) {
            return Err(AssistantError::Config(format!(
                "top_p must be in (0, 1], got {}",
                g.top_p
            )));
        }
        if g.token_limit == Some(0) {
            return Err(AssistantError::Config(
                "token_limit must be at least 1".to_string(),
            ));
        }
        if g.stop_phrases.iter().any(|p| p.is_empty()) {
            return Err(AssistantError::Config(
                "stop_phrases must not contain empty strings".to_string(),
            ));
        }
        if self.synthesizer.speech_rate <= 0.0 {
            return Err(AssistantError::Config(format!(
                "speech_rate must be positive, got {}",
                self.synthesizer.speech_rate
            )));
        }
        if self.speaker.warmup_sec < 0.0 {
            return Err(AssistantError::Config(format!(
                "warmup_sec must be non-negative, got {}",
                self.speaker.warmup_sec
            )));
        }
        Ok(())
    }

    /// The system instruction the dialog should carry, honoring the
    /// short-answers flag.
    pub fn system_instruction(&self) -> Option<String> {
        if self.generator.short_answers {
            Some(SHORT_ANSWERS_INSTRUCTION.to_string())
        } else {
            self.generator.system_prompt.clone()
        }
    }
}
