//! Conversation history for the generator.

/// Who said a dialog turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Human,
    Assistant,
}

/// Ordered conversation turns plus an optional system instruction.
///
/// The generator appends the human turn before generation starts and the
/// assistant turn after it ends, using the raw accumulated completion.
/// Interrupted turns commit their partial completion; nothing is ever rolled
/// back. History is not windowed: assistant sessions are short-lived and the
/// engine owns its own context limits.
#[derive(Debug, Clone, Default)]
pub struct Dialog {
    system: Option<String>,
    turns: Vec<(Role, String)>,
}

impl Dialog {
    pub fn new(system: Option<String>) -> Self {
        Self {
            system,
            turns: Vec::new(),
        }
    }

    pub fn push_human(&mut self, text: impl Into<String>) {
        self.turns.push((Role::Human, text.into()));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push((Role::Assistant, text.into()));
    }

    pub fn turns(&self) -> &[(Role, String)] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Render the dialog as a prompt transcript ending with an open
    /// assistant line. The engine applies its own model-specific template on
    /// top of this plain form.
    pub fn prompt(&self) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str("System: ");
            out.push_str(system);
            out.push_str("\n\n");
        }
        for (role, text) in &self.turns {
            match role {
                Role::Human => out.push_str("User: "),
                Role::Assistant => out.push_str("Assistant: "),
            }
            out.push_str(text);
            out.push('\n');
        }
        out.push_str("Assistant:");
        out
    }
}
