//! Listener stage: wake-word scanning and streaming transcription.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engines::{AudioInput, Transcriber, WakeWord};
use crate::error::Result;
use crate::profiling::RtfProfiler;

use super::messages::{ControlEvent, Utterance};

/// What the listener does with the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Scanning for the wake word.
    Wake,
    /// Streaming frames into the transcriber until the endpoint.
    Transcribe,
}

/// Blocking frame loop over the input device.
///
/// Runs on its own worker; the device paces it. Wake scanning resumes as
/// soon as an utterance ends, so wake words spoken while the assistant is
/// answering are still heard (that is what makes barge-in possible). Device
/// and engine failures here are fatal to the pipeline.
pub(crate) struct Listener {
    input: Box<dyn AudioInput>,
    wake: Box<dyn WakeWord>,
    transcriber: Box<dyn Transcriber>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    cancel: CancellationToken,
    phase: Phase,
    transcript: String,
    wake_rtf: Option<RtfProfiler>,
    stt_rtf: Option<RtfProfiler>,
}

impl Listener {
    pub(crate) fn new(
        input: Box<dyn AudioInput>,
        wake: Box<dyn WakeWord>,
        transcriber: Box<dyn Transcriber>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
        cancel: CancellationToken,
        profile: bool,
    ) -> Self {
        let wake_rtf = profile.then(|| RtfProfiler::new(wake.sample_rate()));
        let stt_rtf = profile.then(|| RtfProfiler::new(transcriber.sample_rate()));
        Self {
            input,
            wake,
            transcriber,
            control_tx,
            cancel,
            phase: Phase::Wake,
            transcript: String::new(),
            wake_rtf,
            stt_rtf,
        }
    }

    /// Run until cancelled or the device/engines fail.
    pub(crate) fn run(mut self) -> Result<()> {
        self.input.start()?;
        info!("listener started, waiting for wake word");
        while !self.cancel.is_cancelled() {
            let frame = self.input.read()?;
            self.on_frame(&frame)?;
        }
        debug!("listener cancelled");
        Ok(())
    }

    fn on_frame(&mut self, frame: &[i16]) -> Result<()> {
        match self.phase {
            Phase::Wake => {
                if let Some(p) = &mut self.wake_rtf {
                    p.tick();
                }
                let detected = self.wake.process(frame)?;
                if let Some(p) = &mut self.wake_rtf {
                    p.tock(frame.len());
                }
                if let Some(keyword) = detected {
                    if let Some(p) = &mut self.wake_rtf {
                        info!("wake word RTF: {:.3}", p.rtf());
                    }
                    info!("wake word detected (keyword {keyword})");
                    let _ = self
                        .control_tx
                        .send(ControlEvent::WakeWordDetected { at: Instant::now() });
                    self.transcript.clear();
                    self.phase = Phase::Transcribe;
                }
            }
            Phase::Transcribe => {
                if let Some(p) = &mut self.stt_rtf {
                    p.tick();
                }
                let step = self.transcriber.process(frame)?;
                if let Some(p) = &mut self.stt_rtf {
                    p.tock(frame.len());
                }
                if !step.text.is_empty() {
                    debug!("transcript fragment: {}", step.text);
                    self.transcript.push_str(&step.text);
                }
                if step.endpoint {
                    let remainder = self.transcriber.flush()?;
                    self.transcript.push_str(&remainder);
                    if let Some(p) = &mut self.stt_rtf {
                        info!("transcription RTF: {:.3}", p.rtf());
                    }
                    let text = std::mem::take(&mut self.transcript);
                    info!("utterance captured: {text:?}");
                    let _ = self.control_tx.send(ControlEvent::UtteranceCaptured(Utterance {
                        text,
                        captured_at: Instant::now(),
                    }));
                    self.phase = Phase::Wake;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::engines::scripted::{
        ENDPOINT_MARKER, ScriptedInput, ScriptedTranscriber, ScriptedWakeWord, Segment, SILENCE,
        WAKE_MARKER, speech_marker,
    };

    const FRAME: usize = 8;
    const RATE: u32 = 16_000;

    fn run_script(segments: Vec<Segment>, fragments: Vec<(i16, &str)>) -> Vec<ControlEvent> {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let listener = Listener::new(
            Box::new(ScriptedInput::new(FRAME, segments)),
            Box::new(ScriptedWakeWord::new(FRAME, RATE)),
            Box::new(ScriptedTranscriber::new(FRAME, RATE, fragments)),
            control_tx,
            cancel.clone(),
            false,
        );
        let worker = std::thread::spawn(move || listener.run());
        // The scripted input idles on silence once the script ends; give the
        // loop a moment to consume everything, then cancel.
        std::thread::sleep(std::time::Duration::from_millis(50));
        cancel.cancel();
        worker.join().unwrap().unwrap();

        let mut events = Vec::new();
        while let Ok(event) = control_rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn wake_then_endpoint_emits_both_events() {
        let events = run_script(
            vec![
                Segment::new(SILENCE, 3),
                Segment::new(WAKE_MARKER, 1),
                Segment::new(speech_marker(0), 4),
                Segment::new(ENDPOINT_MARKER, 1),
            ],
            vec![(speech_marker(0), "what time is it")],
        );
        assert_eq!(events.len(), 2, "events: {events:?}");
        assert!(matches!(events[0], ControlEvent::WakeWordDetected { .. }));
        match &events[1] {
            ControlEvent::UtteranceCaptured(utterance) => {
                assert_eq!(utterance.text, "what time is it");
            }
            other => panic!("expected utterance, got {other:?}"),
        }
    }

    #[test]
    fn no_wake_word_means_no_events() {
        let events = run_script(
            vec![Segment::new(SILENCE, 5), Segment::new(speech_marker(0), 5)],
            vec![(speech_marker(0), "ignored without wake")],
        );
        assert!(events.is_empty(), "events: {events:?}");
    }

    #[test]
    fn transcript_accumulates_across_segments() {
        let events = run_script(
            vec![
                Segment::new(WAKE_MARKER, 1),
                Segment::new(speech_marker(0), 2),
                Segment::new(speech_marker(1), 2),
                Segment::new(ENDPOINT_MARKER, 1),
            ],
            vec![(speech_marker(0), "turn the lights"), (speech_marker(1), " off please")],
        );
        match &events[1] {
            ControlEvent::UtteranceCaptured(utterance) => {
                assert_eq!(utterance.text, "turn the lights off please");
            }
            other => panic!("expected utterance, got {other:?}"),
        }
    }

    #[test]
    fn listener_rearms_for_a_second_turn() {
        let events = run_script(
            vec![
                Segment::new(WAKE_MARKER, 1),
                Segment::new(speech_marker(0), 2),
                Segment::new(ENDPOINT_MARKER, 1),
                Segment::new(SILENCE, 3),
                Segment::new(WAKE_MARKER, 1),
                Segment::new(speech_marker(1), 2),
                Segment::new(ENDPOINT_MARKER, 1),
            ],
            vec![(speech_marker(0), "first"), (speech_marker(1), "second")],
        );
        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ControlEvent::UtteranceCaptured(u) => Some(u.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        let wakes = events
            .iter()
            .filter(|e| matches!(e, ControlEvent::WakeWordDetected { .. }))
            .count();
        assert_eq!(wakes, 2);
    }
}
