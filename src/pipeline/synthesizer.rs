//! Synthesizer stage: per-turn streaming text-to-speech sessions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engines::{SynthesisStream, TextToSpeech};
use crate::profiling::{DelayProfiler, RtfProfiler};

use super::messages::{ActiveTurn, ControlEvent, PcmChunk, SpeakerCommand, SynthCommand, TurnId};

/// Blocking synthesis worker.
///
/// Opens one [`SynthesisStream`] per turn, feeds it released completion text
/// as it arrives, and forwards PCM to the speaker. `Flush` drains the session
/// and hands the drain on to the speaker; `Interrupt` drops the session and
/// its pending audio on the floor.
pub(crate) struct Synthesizer {
    tts: Box<dyn TextToSpeech>,
    speech_rate: f32,
    command_rx: mpsc::UnboundedReceiver<SynthCommand>,
    speaker_tx: mpsc::UnboundedSender<SpeakerCommand>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    active: Arc<ActiveTurn>,
    profile: bool,
    session: Option<(TurnId, Box<dyn SynthesisStream>)>,
    rtf: Option<RtfProfiler>,
    delay: Option<DelayProfiler>,
}

impl Synthesizer {
    pub(crate) fn new(
        tts: Box<dyn TextToSpeech>,
        speech_rate: f32,
        command_rx: mpsc::UnboundedReceiver<SynthCommand>,
        speaker_tx: mpsc::UnboundedSender<SpeakerCommand>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
        active: Arc<ActiveTurn>,
        profile: bool,
    ) -> Self {
        let rtf = profile.then(|| RtfProfiler::new(tts.sample_rate()));
        Self {
            tts,
            speech_rate,
            command_rx,
            speaker_tx,
            control_tx,
            active,
            profile,
            session: None,
            rtf,
            delay: None,
        }
    }

    /// Run until the command channel closes.
    pub(crate) fn run(mut self) {
        while let Some(command) = self.command_rx.blocking_recv() {
            match command {
                SynthCommand::Speak {
                    turn,
                    text,
                    utterance_end,
                } => {
                    if self.active.is_stale(turn) {
                        debug!("dropping stale speak command (turn {turn})");
                        continue;
                    }
                    self.speak(turn, &text, utterance_end);
                }
                SynthCommand::Flush { turn } => {
                    if self.active.is_stale(turn) {
                        debug!("dropping stale flush command (turn {turn})");
                        continue;
                    }
                    self.flush(turn);
                }
                SynthCommand::Interrupt => {
                    if let Some((turn, _)) = self.session.take() {
                        debug!("synthesis session abandoned (turn {turn})");
                    }
                    self.delay = None;
                }
            }
        }
        debug!("synthesizer channel closed");
    }

    fn speak(&mut self, turn: TurnId, text: &str, utterance_end: std::time::Instant) {
        if self.session.as_ref().is_none_or(|(t, _)| *t != turn) {
            match self.tts.open_stream(self.speech_rate) {
                Ok(stream) => {
                    debug!("synthesis session opened (turn {turn})");
                    self.session = Some((turn, stream));
                    self.delay = self.profile.then(|| {
                        let mut profiler = DelayProfiler::new();
                        profiler.arm(utterance_end);
                        profiler
                    });
                }
                Err(e) => {
                    warn!("failed to open synthesis session (turn {turn}): {e}");
                    let _ = self.control_tx.send(ControlEvent::SynthesisFailed {
                        turn,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
        // Sentence breaks synthesize more naturally than raw newlines.
        let text = text.replace('\n', " . ");
        let Some((_, stream)) = self.session.as_mut() else {
            return;
        };
        if let Some(p) = &mut self.rtf {
            p.tick();
        }
        match stream.synthesize(&text) {
            Ok(Some(samples)) => {
                if let Some(p) = &mut self.rtf {
                    p.tock(samples.len());
                }
                self.forward(turn, samples);
            }
            Ok(None) => {
                if let Some(p) = &mut self.rtf {
                    p.tock(0);
                }
            }
            Err(e) => {
                warn!("synthesis failed (turn {turn}): {e}");
                self.session = None;
                let _ = self.control_tx.send(ControlEvent::SynthesisFailed {
                    turn,
                    error: e.to_string(),
                });
            }
        }
    }

    fn flush(&mut self, turn: TurnId) {
        if let Some((session_turn, mut stream)) = self.session.take() {
            if session_turn == turn {
                if let Some(p) = &mut self.rtf {
                    p.tick();
                }
                match stream.flush() {
                    Ok(Some(samples)) => {
                        if let Some(p) = &mut self.rtf {
                            p.tock(samples.len());
                        }
                        self.forward(turn, samples);
                    }
                    Ok(None) => {
                        if let Some(p) = &mut self.rtf {
                            p.tock(0);
                        }
                    }
                    Err(e) => {
                        warn!("synthesis flush failed (turn {turn}): {e}");
                        let _ = self.control_tx.send(ControlEvent::SynthesisFailed {
                            turn,
                            error: e.to_string(),
                        });
                        return;
                    }
                }
                if let Some(p) = &mut self.rtf {
                    info!("synthesis RTF: {:.2}", p.rtf());
                }
                if let Some(elapsed) = self.delay.take().and_then(|p| p.delay()) {
                    info!("response delay: {:.0} ms", elapsed.as_secs_f64() * 1000.0);
                }
            }
        }
        // Forwarded even when no text was ever spoken, so the speaker still
        // reports the turn complete.
        let _ = self.speaker_tx.send(SpeakerCommand::Flush { turn });
    }

    fn forward(&mut self, turn: TurnId, samples: Vec<i16>) {
        if samples.is_empty() {
            return;
        }
        if let Some(profiler) = self.delay.as_mut() {
            profiler.observe_first_audio();
        }
        let _ = self
            .speaker_tx
            .send(SpeakerCommand::Play(PcmChunk { turn, samples }));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use std::time::Instant;

    use super::*;
    use crate::engines::scripted::{ScriptedTts, Sequencer, TtsEvent};

    struct Harness {
        command_tx: mpsc::UnboundedSender<SynthCommand>,
        speaker_rx: mpsc::UnboundedReceiver<SpeakerCommand>,
        control_rx: mpsc::UnboundedReceiver<ControlEvent>,
        active: Arc<ActiveTurn>,
        worker: std::thread::JoinHandle<()>,
    }

    fn start(tts: ScriptedTts, profile: bool) -> Harness {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (speaker_tx, speaker_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let active = Arc::new(ActiveTurn::default());
        let synthesizer = Synthesizer::new(
            Box::new(tts),
            1.0,
            command_rx,
            speaker_tx,
            control_tx,
            Arc::clone(&active),
            profile,
        );
        let worker = std::thread::spawn(move || synthesizer.run());
        Harness {
            command_tx,
            speaker_rx,
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

    fn speak(turn: TurnId, text: &str) -> SynthCommand {
        SynthCommand::Speak {
            turn,
            text: text.to_string(),
            utterance_end: Instant::now(),
        }
    }

    #[test]
    fn speak_then_flush_produces_audio_and_a_speaker_flush() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 2, &seq);
        let events = tts.events();
        let mut harness = start(tts, false);

        let turn = harness.active.advance();
        harness.command_tx.send(speak(turn, "Hi")).unwrap();
        harness.command_tx.send(SynthCommand::Flush { turn }).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        let commands = drain(&mut harness.speaker_rx);
        match commands.as_slice() {
            [SpeakerCommand::Play(chunk), SpeakerCommand::Flush { turn: t }] => {
                assert_eq!(chunk.turn, turn);
                assert_eq!(chunk.samples, vec![1; 4]);
                assert_eq!(*t, turn);
            }
            other => panic!("unexpected speaker commands: {other:?}"),
        }
        let log = events.lock().unwrap();
        let kinds: Vec<&TtsEvent> = log.iter().map(|(_, e)| e).collect();
        assert!(matches!(
            kinds.as_slice(),
            [
                TtsEvent::Open { session: 1 },
                TtsEvent::Synthesize { session: 1, .. },
                TtsEvent::Flush { session: 1 },
            ]
        ));
    }

    #[test]
    fn one_session_serves_every_speak_of_a_turn() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 1, &seq);
        let events = tts.events();
        let mut harness = start(tts, false);

        let turn = harness.active.advance();
        harness.command_tx.send(speak(turn, "one")).unwrap();
        harness.command_tx.send(speak(turn, "two")).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        let opens = events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| matches!(e, TtsEvent::Open { .. }))
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn newlines_become_sentence_breaks() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 1, &seq);
        let events = tts.events();
        let mut harness = start(tts, false);

        let turn = harness.active.advance();
        harness.command_tx.send(speak(turn, "first\nsecond")).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        let log = events.lock().unwrap();
        let texts: Vec<&str> = log
            .iter()
            .filter_map(|(_, e)| match e {
                TtsEvent::Synthesize { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first . second"]);
    }

    #[test]
    fn stale_commands_never_reach_the_engine() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 1, &seq);
        let events = tts.events();
        let mut harness = start(tts, false);

        let stale = harness.active.advance();
        harness.active.advance();
        harness.command_tx.send(speak(stale, "late")).unwrap();
        harness.command_tx.send(SynthCommand::Flush { turn: stale }).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        assert!(drain(&mut harness.speaker_rx).is_empty());
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn interrupt_abandons_the_session_without_flushing() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 1, &seq).with_flush_tail(8);
        let events = tts.events();
        let mut harness = start(tts, false);

        let first = harness.active.advance();
        harness.command_tx.send(speak(first, "cut off")).unwrap();
        // Let the worker open session 1 before the turn moves on.
        let mut attempts = 0;
        while harness.speaker_rx.try_recv().is_err() {
            attempts += 1;
            assert!(attempts < 2_000, "no audio arrived for the first turn");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        harness.command_tx.send(SynthCommand::Interrupt).unwrap();
        let second = harness.active.advance();
        harness.command_tx.send(speak(second, "next")).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        let log = events.lock().unwrap();
        assert!(
            !log.iter().any(|(_, e)| matches!(e, TtsEvent::Flush { .. })),
            "no session may be drained: {log:?}"
        );
        let opens: Vec<u64> = log
            .iter()
            .filter_map(|(_, e)| match e {
                TtsEvent::Open { session } => Some(*session),
                _ => None,
            })
            .collect();
        assert_eq!(opens, vec![1, 2]);
    }

    #[test]
    fn flush_without_audio_still_reaches_the_speaker() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 1, &seq);
        let events = tts.events();
        let mut harness = start(tts, false);

        let turn = harness.active.advance();
        harness.command_tx.send(SynthCommand::Flush { turn }).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        let commands = drain(&mut harness.speaker_rx);
        assert!(
            matches!(commands.as_slice(), [SpeakerCommand::Flush { turn: t }] if *t == turn),
            "commands: {commands:?}"
        );
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn flush_tail_audio_is_forwarded_before_the_flush() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 1, &seq).with_flush_tail(6);
        let mut harness = start(tts, false);

        let turn = harness.active.advance();
        harness.command_tx.send(speak(turn, "abc")).unwrap();
        harness.command_tx.send(SynthCommand::Flush { turn }).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        let commands = drain(&mut harness.speaker_rx);
        match commands.as_slice() {
            [
                SpeakerCommand::Play(body),
                SpeakerCommand::Play(tail),
                SpeakerCommand::Flush { .. },
            ] => {
                assert_eq!(body.samples.len(), 3);
                assert_eq!(tail.samples.len(), 6);
            }
            other => panic!("unexpected speaker commands: {other:?}"),
        }
    }

    #[test]
    fn a_profiled_turn_flows_like_an_unprofiled_one() {
        let seq = Sequencer::default();
        let tts = ScriptedTts::new(22_050, 2, &seq).with_flush_tail(3);
        let events = tts.events();
        let mut harness = start(tts, true);

        let turn = harness.active.advance();
        harness.command_tx.send(speak(turn, "Hi")).unwrap();
        harness.command_tx.send(SynthCommand::Flush { turn }).unwrap();
        drop(harness.command_tx);
        harness.worker.join().unwrap();

        // The RTF and delay measurements around every synthesize and flush
        // must not change what reaches the speaker.
        let commands = drain(&mut harness.speaker_rx);
        match commands.as_slice() {
            [
                SpeakerCommand::Play(body),
                SpeakerCommand::Play(tail),
                SpeakerCommand::Flush { turn: t },
            ] => {
                assert_eq!(body.samples, vec![1; 4]);
                assert_eq!(tail.samples.len(), 3);
                assert_eq!(*t, turn);
            }
            other => panic!("unexpected speaker commands: {other:?}"),
        }
        assert!(drain(&mut harness.control_rx).is_empty());
        let log = events.lock().unwrap();
        assert!(
            log.iter().any(|(_, e)| matches!(e, TtsEvent::Flush { .. })),
            "the session must still drain: {log:?}"
        );
    }
}
