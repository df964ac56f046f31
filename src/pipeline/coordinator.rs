//! Pipeline assembly and the turn state machine.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AssistantConfig;
use crate::engines::{CompletionModel, EngineSet, GenerationOutcome};
use crate::error::{AssistantError, Result};

use super::generator::Generator;
use super::listener::Listener;
use super::messages::{
    ActiveTurn, ControlEvent, GenerateRequest, PipelineEvent, SpeakerCommand, SynthCommand, TurnId,
    Utterance,
};
use super::speaker::Speaker;
use super::synthesizer::Synthesizer;

/// Where the current turn stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a wake word.
    Idle,
    /// Wake word heard; the listener is capturing the utterance.
    Listening,
    /// The completion is streaming (synthesis runs concurrently).
    Generating,
    /// Generation finished; synthesis and playback are draining.
    Synthesizing,
}

/// The assembled voice assistant.
///
/// Owns the engines and the stage topology. [`run`] drives everything until
/// the cancellation token fires or the listener dies.
///
/// [`run`]: AssistantPipeline::run
#[derive(Debug)]
pub struct AssistantPipeline {
    config: AssistantConfig,
    engines: EngineSet,
    cancel: CancellationToken,
    event_tx: mpsc::UnboundedSender<PipelineEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<PipelineEvent>>,
}

impl AssistantPipeline {
    /// Validate the configuration and the engine pairing.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the wake-word
    /// and transcription engines disagree on frame format, since both are
    /// fed from the same capture loop.
    pub fn new(config: AssistantConfig, engines: EngineSet) -> Result<Self> {
        config.validate()?;
        let wake_frame = engines.wake.frame_length();
        let stt_frame = engines.transcriber.frame_length();
        if wake_frame != stt_frame {
            return Err(AssistantError::Pipeline(format!(
                "wake and transcription frame lengths differ ({wake_frame} vs {stt_frame})"
            )));
        }
        let wake_rate = engines.wake.sample_rate();
        let stt_rate = engines.transcriber.sample_rate();
        if wake_rate != stt_rate {
            return Err(AssistantError::Pipeline(format!(
                "wake and transcription sample rates differ ({wake_rate} vs {stt_rate})"
            )));
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            engines,
            cancel: CancellationToken::new(),
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Token that stops the pipeline when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PipelineEvent>> {
        self.event_rx.take()
    }

    /// Run the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener fails; everything downstream of it
    /// is recoverable per turn and never tears the pipeline down.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn run(mut self) -> Result<()> {
        // Nobody can take the event stream past this point; let emits fail
        // silently if it was never claimed.
        drop(self.event_rx.take());

        let frame_length = self.engines.wake.frame_length();
        let sample_rate = self.engines.wake.sample_rate();
        info!("assistant pipeline running (frame {frame_length} samples at {sample_rate} Hz)");

        let active = Arc::new(ActiveTurn::default());
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (generate_tx, generate_rx) = mpsc::unbounded_channel();
        let (synth_tx, synth_rx) = mpsc::unbounded_channel();
        let (speaker_tx, speaker_rx) = mpsc::unbounded_channel();

        let EngineSet {
            wake,
            transcriber,
            completion,
            tts,
            input,
            output,
        } = self.engines;
        let tts_rate = tts.sample_rate();

        let listener = Listener::new(
            input,
            wake,
            transcriber,
            control_tx.clone(),
            self.cancel.clone(),
            self.config.profile,
        );
        let listener_control = control_tx.clone();
        let listener_task: JoinHandle<()> = tokio::task::spawn_blocking(move || {
            if let Err(e) = listener.run() {
                let _ = listener_control.send(ControlEvent::ListenerFailed {
                    error: e.to_string(),
                });
            }
        });

        let generator = Generator::new(
            Arc::clone(&completion),
            self.config.generator.clone(),
            self.config.system_instruction(),
            generate_rx,
            synth_tx.clone(),
            control_tx.clone(),
            Arc::clone(&active),
            self.config.profile,
        );
        let generator_task = tokio::task::spawn_blocking(move || generator.run());

        let synthesizer = Synthesizer::new(
            tts,
            self.config.synthesizer.speech_rate,
            synth_rx,
            speaker_tx.clone(),
            control_tx.clone(),
            Arc::clone(&active),
            self.config.profile,
        );
        let synthesizer_task = tokio::task::spawn_blocking(move || synthesizer.run());

        let warmup_samples =
            (self.config.speaker.warmup_sec.max(0.0) * tts_rate as f32).round() as usize;
        let speaker = Speaker::new(
            output,
            warmup_samples,
            speaker_rx,
            control_tx.clone(),
            Arc::clone(&active),
        );
        let speaker_task = tokio::spawn(speaker.run());
        drop(control_tx);

        let mut coordinator = Coordinator {
            phase: Phase::Idle,
            turn: TurnId::NONE,
            active,
            completion,
            generate_tx,
            synth_tx,
            speaker_tx,
            event_tx: self.event_tx,
        };

        let outcome = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                event = control_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = coordinator.on_event(event) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        info!("assistant pipeline shutting down");
        self.cancel.cancel();
        coordinator.shutdown();
        drop(coordinator);
        let _ = tokio::join!(listener_task, generator_task, synthesizer_task, speaker_task);
        outcome
    }
}

/// Turn state machine, driven by [`ControlEvent`]s.
struct Coordinator {
    phase: Phase,
    turn: TurnId,
    active: Arc<ActiveTurn>,
    completion: Arc<dyn CompletionModel>,
    generate_tx: mpsc::UnboundedSender<GenerateRequest>,
    synth_tx: mpsc::UnboundedSender<SynthCommand>,
    speaker_tx: mpsc::UnboundedSender<SpeakerCommand>,
    event_tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl Coordinator {
    fn on_event(&mut self, event: ControlEvent) -> Result<()> {
        match event {
            ControlEvent::WakeWordDetected { at } => self.on_wake(at),
            ControlEvent::UtteranceCaptured(utterance) => self.on_utterance(utterance),
            ControlEvent::GenerationCompleted { turn, outcome } => {
                if turn != self.turn {
                    debug!("ignoring completion of superseded turn {turn}");
                    return Ok(());
                }
                self.emit(PipelineEvent::GenerationCompleted { turn, outcome });
                if outcome != GenerationOutcome::Interrupted && self.phase == Phase::Generating {
                    self.phase = Phase::Synthesizing;
                }
                Ok(())
            }
            ControlEvent::GenerationFailed { turn, error }
            | ControlEvent::SynthesisFailed { turn, error }
            | ControlEvent::PlaybackFailed { turn, error } => {
                if turn != self.turn {
                    debug!("ignoring failure of superseded turn {turn}");
                    return Ok(());
                }
                self.abandon(error);
                Ok(())
            }
            ControlEvent::PlaybackCompleted { turn } => {
                if turn != self.turn {
                    debug!("ignoring playback completion of superseded turn {turn}");
                    return Ok(());
                }
                // Generation's completion report can still be in flight when
                // a short answer drains; accept either order.
                if matches!(self.phase, Phase::Generating | Phase::Synthesizing) {
                    info!("turn {turn} complete, waiting for wake word");
                    self.phase = Phase::Idle;
                    self.emit(PipelineEvent::TurnCompleted { turn });
                }
                Ok(())
            }
            ControlEvent::ListenerFailed { error } => {
                error!("listener failed: {error}");
                Err(AssistantError::Pipeline(format!("listener failed: {error}")))
            }
        }
    }

    fn on_wake(&mut self, _at: Instant) -> Result<()> {
        match self.phase {
            Phase::Idle => {
                self.turn = self.active.advance();
                self.phase = Phase::Listening;
                info!("turn {} started", self.turn);
                self.emit(PipelineEvent::TurnStarted {
                    turn: self.turn,
                    barge_in: false,
                });
            }
            Phase::Listening => {
                debug!("wake word while already listening; ignored");
            }
            Phase::Generating | Phase::Synthesizing => {
                let superseded = self.turn;
                // Advance before interrupting: every in-flight message of the
                // old turn is stale from this instant, whatever order the
                // stages drain their queues in.
                self.turn = self.active.advance();
                if self.phase == Phase::Generating {
                    self.completion.interrupt();
                }
                let _ = self.synth_tx.send(SynthCommand::Interrupt);
                let _ = self.speaker_tx.send(SpeakerCommand::Interrupt);
                self.phase = Phase::Listening;
                info!(
                    "barge-in: turn {superseded} superseded, turn {} listening",
                    self.turn
                );
                self.emit(PipelineEvent::TurnStarted {
                    turn: self.turn,
                    barge_in: true,
                });
            }
        }
        Ok(())
    }

    fn on_utterance(&mut self, utterance: Utterance) -> Result<()> {
        if self.phase != Phase::Listening {
            debug!("utterance outside a listening turn; ignored");
            return Ok(());
        }
        self.emit(PipelineEvent::UtteranceCaptured {
            turn: self.turn,
            text: utterance.text.clone(),
        });
        let _ = self.generate_tx.send(GenerateRequest {
            turn: self.turn,
            text: utterance.text,
            utterance_end: utterance.captured_at,
        });
        self.phase = Phase::Generating;
        Ok(())
    }

    /// Unwind the current turn after a stage failure and return to idle.
    fn abandon(&mut self, error: String) {
        let turn = self.turn;
        warn!("turn {turn} abandoned: {error}");
        self.active.advance();
        if self.phase == Phase::Generating {
            self.completion.interrupt();
        }
        let _ = self.synth_tx.send(SynthCommand::Interrupt);
        let _ = self.speaker_tx.send(SpeakerCommand::Interrupt);
        self.phase = Phase::Idle;
        self.turn = TurnId::NONE;
        self.emit(PipelineEvent::TurnAbandoned { turn, error });
    }

    /// Stale every in-flight message and silence the stages before teardown.
    fn shutdown(&mut self) {
        self.active.advance();
        if self.phase == Phase::Generating {
            self.completion.interrupt();
        }
        let _ = self.synth_tx.send(SynthCommand::Interrupt);
        let _ = self.speaker_tx.send(SpeakerCommand::Interrupt);
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }
}
