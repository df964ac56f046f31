//! Incremental stop-phrase filtering for streamed completion text.

/// Streaming filter that withholds stop phrases from released output.
///
/// Completion tokens arrive with arbitrary fragment boundaries, so a stop
/// phrase may be split across several pushes. The filter accumulates all raw
/// text and maintains a release cursor: on every push it releases the span
/// between the cursor and the earliest of (a) the first complete stop phrase
/// in the buffer and (b) a proper prefix of any stop phrase hanging off the
/// end of the buffer. Text after a complete stop phrase is withheld forever;
/// a hanging prefix is withheld until more input resolves it one way or the
/// other. The cursor never moves backwards.
///
/// The filter never releases more than it has seen and never holds back more
/// than `max(phrase lengths) - 1` bytes past a committed stop position.
#[derive(Debug)]
pub struct CompletionFilter {
    stop_phrases: Vec<String>,
    buffer: String,
    start: usize,
}

impl CompletionFilter {
    pub fn new(stop_phrases: Vec<String>) -> Self {
        Self {
            stop_phrases,
            buffer: String::new(),
            start: 0,
        }
    }

    /// Clear accumulated state for the next turn.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.start = 0;
    }

    /// Append a raw fragment and return the newly releasable text.
    pub fn push(&mut self, fragment: &str) -> String {
        self.buffer.push_str(fragment);

        let mut end = self.buffer.len();
        for phrase in &self.stop_phrases {
            if let Some(index) = self.buffer.find(phrase.as_str()) {
                end = end.min(index);
            }
            // A proper prefix of the phrase at the end of the buffer may
            // still grow into the full phrase; hold it back.
            for (split, _) in phrase.char_indices().skip(1) {
                if self.buffer.ends_with(&phrase[..split]) {
                    end = end.min(self.buffer.len() - split);
                }
            }
        }

        // A new fragment can move the candidate end before text that was
        // already released; the cursor never regresses.
        let end = end.max(self.start);
        let released = self.buffer[self.start..end].to_string();
        self.start = end;
        released
    }

    /// Everything accumulated so far, unfiltered.
    pub fn raw(&self) -> &str {
        &self.buffer
    }
}
