//! Generator stage: dialog-aware completion streaming.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::engines::{CompletionModel, CompletionRequest, GenerationOutcome};
use crate::profiling::TpsProfiler;

use super::dialog::Dialog;
use super::filter::CompletionFilter;
use super::messages::{ActiveTurn, ControlEvent, GenerateRequest, SynthCommand};

/// Blocking completion worker.
///
/// Requests arrive one per captured utterance. Each one is appended to the
/// dialog, rendered into a prompt, and streamed through the stop-phrase
/// filter to the synthesizer. The model's `interrupt` flag is flipped by the
/// coordinator from outside; this worker only observes the outcome.
pub(crate) struct Generator {
    completion: Arc<dyn CompletionModel>,
    params: GeneratorConfig,
    dialog: Dialog,
    filter: CompletionFilter,
    request_rx: mpsc::UnboundedReceiver<GenerateRequest>,
    synth_tx: mpsc::UnboundedSender<SynthCommand>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    active: Arc<ActiveTurn>,
    profile: bool,
}

impl Generator {
    pub(crate) fn new(
        completion: Arc<dyn CompletionModel>,
        params: GeneratorConfig,
        system_instruction: Option<String>,
        request_rx: mpsc::UnboundedReceiver<GenerateRequest>,
        synth_tx: mpsc::UnboundedSender<SynthCommand>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
        active: Arc<ActiveTurn>,
        profile: bool,
    ) -> Self {
        let filter = CompletionFilter::new(params.stop_phrases.clone());
        Self {
            completion,
            params,
            dialog: Dialog::new(system_instruction),
            filter,
            request_rx,
            synth_tx,
            control_tx,
            active,
            profile,
        }
    }

    /// Run until the request channel closes.
    pub(crate) fn run(mut self) {
        while let Some(request) = self.request_rx.blocking_recv() {
            if self.active.is_stale(request.turn) {
                debug!("dropping stale generate request (turn {})", request.turn);
                continue;
            }
            self.handle(request);
        }
        debug!("generator channel closed");
    }

    fn handle(&mut self, request: GenerateRequest) {
        let turn = request.turn;
        self.dialog.push_human(request.text);
        self.filter.reset();

        let call = CompletionRequest {
            prompt: self.dialog.prompt(),
            token_limit: self.params.token_limit,
            stop_phrases: self.params.stop_phrases.clone(),
            presence_penalty: self.params.presence_penalty,
            frequency_penalty: self.params.frequency_penalty,
            temperature: self.params.temperature,
            top_p: self.params.top_p,
        };
        info!("generating response (turn {turn})");

        let mut tps = self.profile.then(TpsProfiler::new);
        let filter = &mut self.filter;
        let synth_tx = &self.synth_tx;
        let active = &self.active;
        let utterance_end = request.utterance_end;
        let ticker = &mut tps;
        let mut on_token = move |token: &str| {
            if let Some(p) = ticker.as_mut() {
                p.tock();
            }
            let released = filter.push(token);
            if !released.is_empty() && !active.is_stale(turn) {
                let _ = synth_tx.send(SynthCommand::Speak {
                    turn,
                    text: released,
                    utterance_end,
                });
            }
        };

        match self.completion.generate(&call, &mut on_token) {
            Ok(completion) => {
                let outcome = completion.outcome;
                // The raw text goes into the dialog even when interrupted, so
                // follow-up questions can refer to what was actually said.
                self.dialog.push_assistant(completion.text);
                if let Some(p) = tps.as_mut() {
                    info!("completion TPS: {:.1}", p.tps());
                }
                info!("generation finished (turn {turn}, {outcome:?})");
                if outcome != GenerationOutcome::Interrupted {
                    let _ = self.synth_tx.send(SynthCommand::Flush { turn });
                }
                let _ = self
                    .control_tx
                    .send(ControlEvent::GenerationCompleted { turn, outcome });
            }
            Err(e) => {
                warn!("generation failed (turn {turn}): {e}");
                let partial = self.filter.raw().to_string();
                if !partial.is_empty() {
                    self.dialog.push_assistant(partial);
                }
                let _ = self.control_tx.send(ControlEvent::GenerationFailed {
                    turn,
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::engines::scripted::{CompletionEvent, CompletionScript, ScriptedCompletion, Sequencer};
    use crate::engines::Completion;
    use crate::error::Result;

    struct Harness {
        request_tx: mpsc::UnboundedSender<GenerateRequest>,
        synth_rx: mpsc::UnboundedReceiver<SynthCommand>,
        control_rx: mpsc::UnboundedReceiver<ControlEvent>,
        active: Arc<ActiveTurn>,
        worker: std::thread::JoinHandle<()>,
    }

    fn start(completion: Arc<dyn CompletionModel>, params: GeneratorConfig) -> Harness {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (synth_tx, synth_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let active = Arc::new(ActiveTurn::default());
        let generator = Generator::new(
            completion,
            params,
            None,
            request_rx,
            synth_tx,
            control_tx,
            Arc::clone(&active),
            false,
        );
        let worker = std::thread::spawn(move || generator.run());
        Harness {
            request_tx,
            synth_rx,
            control_rx,
            active,
            worker,
        }
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn spoken(commands: &[SynthCommand]) -> String {
        commands
            .iter()
            .filter_map(|c| match c {
                SynthCommand::Speak { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    // ─── streaming ───────────────────────────────────────────────────────────

    #[test]
    fn streams_filtered_text_then_flushes() {
        let seq = Sequencer::default();
        let model = Arc::new(ScriptedCompletion::new(
            vec![CompletionScript::new(vec!["Hello", " world", "</s>", "junk"])],
            &seq,
        ));
        let params = GeneratorConfig::default();
        let mut harness = start(model, params);

        let turn = harness.active.advance();
        harness
            .request_tx
            .send(GenerateRequest {
                turn,
                text: "hi".to_string(),
                utterance_end: Instant::now(),
            })
            .unwrap();
        drop(harness.request_tx);
        harness.worker.join().unwrap();

        let commands = drain(&mut harness.synth_rx);
        assert_eq!(spoken(&commands), "Hello world");
        assert!(
            matches!(commands.last(), Some(SynthCommand::Flush { turn: t }) if *t == turn),
            "commands: {commands:?}"
        );

        let events = drain(&mut harness.control_rx);
        assert!(matches!(
            events.as_slice(),
            [ControlEvent::GenerationCompleted {
                outcome: GenerationOutcome::Stopped,
                ..
            }]
        ));
    }

    #[test]
    fn stale_requests_are_dropped_unseen() {
        let seq = Sequencer::default();
        let model = Arc::new(ScriptedCompletion::new(
            vec![CompletionScript::new(vec!["never"])],
            &seq,
        ));
        let events = model.events();
        let mut harness = start(Arc::clone(&model) as Arc<dyn CompletionModel>, GeneratorConfig::default());

        let stale = harness.active.advance();
        harness.active.advance();
        harness
            .request_tx
            .send(GenerateRequest {
                turn: stale,
                text: "too late".to_string(),
                utterance_end: Instant::now(),
            })
            .unwrap();
        drop(harness.request_tx);
        harness.worker.join().unwrap();

        assert!(drain(&mut harness.synth_rx).is_empty());
        assert!(drain(&mut harness.control_rx).is_empty());
        assert!(events.lock().unwrap().is_empty(), "model must never be called");
    }

    #[test]
    fn interrupted_generation_skips_the_flush() {
        let seq = Sequencer::default();
        let model = Arc::new(ScriptedCompletion::new(
            vec![CompletionScript::new(vec!["part"]).holding_until_interrupt()],
            &seq,
        ));
        let mut harness = start(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            GeneratorConfig::default(),
        );

        let turn = harness.active.advance();
        harness
            .request_tx
            .send(GenerateRequest {
                turn,
                text: "question".to_string(),
                utterance_end: Instant::now(),
            })
            .unwrap();
        // Wait for the first Speak so we know the model is inside generate.
        let mut attempts = 0;
        let first = loop {
            match harness.synth_rx.try_recv() {
                Ok(command) => break command,
                Err(_) => {
                    attempts += 1;
                    assert!(attempts < 2_000, "no Speak command arrived");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        };
        assert!(matches!(first, SynthCommand::Speak { .. }));
        model.interrupt();
        drop(harness.request_tx);
        harness.worker.join().unwrap();

        let commands = drain(&mut harness.synth_rx);
        assert!(
            !commands.iter().any(|c| matches!(c, SynthCommand::Flush { .. })),
            "interrupted turn must not flush: {commands:?}"
        );
        let events = drain(&mut harness.control_rx);
        assert!(matches!(
            events.as_slice(),
            [ControlEvent::GenerationCompleted {
                outcome: GenerationOutcome::Interrupted,
                ..
            }]
        ));
    }

    // ─── dialog context ──────────────────────────────────────────────────────

    #[test]
    fn dialog_carries_earlier_turns_into_the_prompt() {
        let seq = Sequencer::default();
        let model = Arc::new(ScriptedCompletion::new(
            vec![
                CompletionScript::new(vec!["Four."]),
                CompletionScript::new(vec!["Eight."]),
            ],
            &seq,
        ));
        let events = model.events();
        let mut harness = start(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            GeneratorConfig::default(),
        );

        for text in ["what is two plus two", "double it"] {
            let turn = harness.active.advance();
            harness
                .request_tx
                .send(GenerateRequest {
                    turn,
                    text: text.to_string(),
                    utterance_end: Instant::now(),
                })
                .unwrap();
            // Each turn must finish before the next advance, or the pending
            // request would be dropped as stale.
            let mut attempts = 0;
            while harness.control_rx.try_recv().is_err() {
                attempts += 1;
                assert!(attempts < 2_000, "turn never completed");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        drop(harness.request_tx);
        harness.worker.join().unwrap();

        let log = events.lock().unwrap();
        let prompts: Vec<&str> = log
            .iter()
            .filter_map(|(_, e)| match e {
                CompletionEvent::Generate { prompt } => Some(prompt.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("what is two plus two"));
        assert!(prompts[1].contains("Four."));
        assert!(prompts[1].contains("double it"));
    }

    // ─── failure ─────────────────────────────────────────────────────────────

    struct FailingCompletion {
        prompts: Mutex<Vec<String>>,
    }

    impl CompletionModel for FailingCompletion {
        fn generate(
            &self,
            request: &CompletionRequest,
            on_token: &mut (dyn FnMut(&str) + Send),
        ) -> Result<Completion> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            on_token("Half an answer");
            Err(crate::error::AssistantError::Completion(
                "inference backend lost".to_string(),
            ))
        }

        fn interrupt(&self) {}
    }

    #[test]
    fn failure_reports_without_flushing_and_commits_the_partial() {
        let model = Arc::new(FailingCompletion {
            prompts: Mutex::new(Vec::new()),
        });
        let mut harness = start(
            Arc::clone(&model) as Arc<dyn CompletionModel>,
            GeneratorConfig::default(),
        );

        let turn = harness.active.advance();
        harness
            .request_tx
            .send(GenerateRequest {
                turn,
                text: "anything".to_string(),
                utterance_end: Instant::now(),
            })
            .unwrap();
        // Wait for the failure report before advancing the turn, so the first
        // request is never mistaken for stale.
        let mut attempts = 0;
        let first = loop {
            match harness.control_rx.try_recv() {
                Ok(event) => break event,
                Err(_) => {
                    attempts += 1;
                    assert!(attempts < 2_000, "no failure event arrived");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        };
        match &first {
            ControlEvent::GenerationFailed { turn: t, error } => {
                assert_eq!(*t, turn);
                assert!(error.contains("inference backend lost"));
            }
            other => panic!("expected GenerationFailed, got {other:?}"),
        }

        let second = harness.active.advance();
        harness
            .request_tx
            .send(GenerateRequest {
                turn: second,
                text: "again".to_string(),
                utterance_end: Instant::now(),
            })
            .unwrap();
        drop(harness.request_tx);
        harness.worker.join().unwrap();

        let commands = drain(&mut harness.synth_rx);
        assert!(
            !commands.iter().any(|c| matches!(c, SynthCommand::Flush { .. })),
            "a failed turn must not flush: {commands:?}"
        );
        // The partial answer from the failed turn still reached the dialog.
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Half an answer"), "prompt: {}", prompts[1]);
    }
}
