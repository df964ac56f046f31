//! Speaker stage: warm-up buffered playback on the output device.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engines::AudioOutput;
use crate::error::AssistantError;

use super::messages::{ActiveTurn, ControlEvent, SpeakerCommand, TurnId};

/// Pending playback audio with a warm-up gate.
///
/// Nothing is handed to the device until `warmup_samples` have accumulated,
/// so short synthesis stalls at the start of a turn do not cause audible
/// underruns. A drain (end of turn) releases whatever is buffered regardless.
#[derive(Debug)]
pub(crate) struct PlaybackBuffer {
    warmup_samples: usize,
    pending: Vec<i16>,
    cursor: usize,
    warmed: bool,
    draining: bool,
}

impl PlaybackBuffer {
    pub(crate) fn new(warmup_samples: usize) -> Self {
        Self {
            warmup_samples,
            pending: Vec::new(),
            cursor: 0,
            warmed: false,
            draining: false,
        }
    }

    pub(crate) fn push(&mut self, samples: &[i16]) {
        self.pending.extend_from_slice(samples);
        if self.buffered() >= self.warmup_samples {
            self.warmed = true;
        }
    }

    /// Samples queued but not yet accepted by the device.
    pub(crate) fn buffered(&self) -> usize {
        self.pending.len() - self.cursor
    }

    /// The turn's audio is complete; release everything that is buffered.
    pub(crate) fn begin_drain(&mut self) {
        self.draining = true;
        self.warmed = true;
    }

    /// True when samples may be written to the device right now.
    pub(crate) fn playable(&self) -> bool {
        self.warmed && self.buffered() > 0
    }

    /// True once a drain has delivered every sample.
    pub(crate) fn drained(&self) -> bool {
        self.draining && self.buffered() == 0
    }

    pub(crate) fn pending_slice(&self) -> &[i16] {
        &self.pending[self.cursor..]
    }

    /// Record that the device accepted `n` samples.
    pub(crate) fn consume(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.pending.len());
        if self.cursor == self.pending.len() {
            self.pending.clear();
            self.cursor = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.cursor = 0;
        self.warmed = false;
        self.draining = false;
    }
}

/// Async playback worker.
///
/// Writes are opportunistic: the device accepts what fits and the remainder
/// is retried on a short tick. The first audio chunk of a turn starts the
/// device; the warm-up gate only delays writes. The device is stopped once
/// the turn drains, so the output stream is only live while the assistant is
/// actually speaking.
pub(crate) struct Speaker {
    output: Box<dyn AudioOutput>,
    command_rx: mpsc::UnboundedReceiver<SpeakerCommand>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    active: Arc<ActiveTurn>,
    buffer: PlaybackBuffer,
    current: TurnId,
    started: bool,
}

impl Speaker {
    pub(crate) fn new(
        output: Box<dyn AudioOutput>,
        warmup_samples: usize,
        command_rx: mpsc::UnboundedReceiver<SpeakerCommand>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
        active: Arc<ActiveTurn>,
    ) -> Self {
        Self {
            output,
            command_rx,
            control_tx,
            active,
            buffer: PlaybackBuffer::new(warmup_samples),
            current: TurnId::NONE,
            started: false,
        }
    }

    /// Run until the command channel closes.
    pub(crate) async fn run(mut self) {
        let mut tick = time::interval(Duration::from_millis(5));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                }
                _ = tick.tick(), if self.buffer.playable() => self.pump(),
            }
        }
        if self.started {
            let _ = self.output.stop();
        }
        debug!("speaker channel closed");
    }

    fn on_command(&mut self, command: SpeakerCommand) {
        match command {
            SpeakerCommand::Play(chunk) => {
                if self.active.is_stale(chunk.turn) {
                    debug!("dropping stale audio chunk (turn {})", chunk.turn);
                    return;
                }
                if self.current != chunk.turn {
                    self.buffer.clear();
                    self.current = chunk.turn;
                    if !self.started {
                        if let Err(e) = self.output.start() {
                            self.fail(e);
                            return;
                        }
                        self.started = true;
                    }
                }
                self.buffer.push(&chunk.samples);
                self.pump();
            }
            SpeakerCommand::Flush { turn } => {
                if self.active.is_stale(turn) {
                    debug!("dropping stale playback flush (turn {turn})");
                    return;
                }
                if self.current != turn {
                    self.buffer.clear();
                    self.current = turn;
                }
                self.buffer.begin_drain();
                self.pump();
            }
            SpeakerCommand::Interrupt => self.interrupt(),
        }
    }

    fn pump(&mut self) {
        while self.buffer.playable() {
            let offered = self.buffer.buffered();
            let accepted = match self.output.write(self.buffer.pending_slice()) {
                Ok(n) => n,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            self.buffer.consume(accepted);
            if accepted < offered {
                // Device ring is full; the tick retries shortly.
                break;
            }
        }
        if self.buffer.drained() {
            self.finish_turn();
        }
    }

    fn finish_turn(&mut self) {
        let turn = self.current;
        if self.started {
            self.started = false;
            let result = self.output.flush().and_then(|()| self.output.stop());
            if let Err(e) = result {
                self.fail_turn(turn, e);
                return;
            }
        }
        info!("playback complete (turn {turn})");
        self.buffer.clear();
        self.current = TurnId::NONE;
        let _ = self.control_tx.send(ControlEvent::PlaybackCompleted { turn });
    }

    fn interrupt(&mut self) {
        self.buffer.clear();
        self.current = TurnId::NONE;
        if self.started {
            self.started = false;
            if let Err(e) = self.output.stop() {
                warn!("output device stop failed: {e}");
            }
            debug!("playback interrupted, device stopped");
        }
    }

    fn fail(&mut self, e: AssistantError) {
        let turn = self.current;
        self.fail_turn(turn, e);
    }

    fn fail_turn(&mut self, turn: TurnId, e: AssistantError) {
        warn!("playback failed (turn {turn}): {e}");
        self.buffer.clear();
        self.current = TurnId::NONE;
        if self.started {
            self.started = false;
            let _ = self.output.stop();
        }
        let _ = self.control_tx.send(ControlEvent::PlaybackFailed {
            turn,
            error: e.to_string(),
        });
    }
}
