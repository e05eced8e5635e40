use chrono::{DateTime, Utc};

use crate::booking::BookingState;
use crate::completion::{Role, ToolCallRequest};
use crate::relay::event::CallSetup;

/// One message in the conversation history. Immutable once appended.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Tool invocations requested by an assistant turn.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Correlation id on a tool-result turn.
    pub tool_call_id: Option<String>,
}

impl Turn {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// Per-call conversation state. Created on connection open, discarded on
/// close; nothing is persisted.
#[derive(Debug)]
pub struct Session {
    pub setup: CallSetup,
    pub stream_sid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub booking: BookingState,
    turns: Vec<Turn>,
}

impl Session {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            setup: CallSetup::default(),
            stream_sid: None,
            started_at: Utc::now(),
            booking: BookingState::new(),
            turns: vec![Turn::system(system_prompt)],
        }
    }

    pub fn record_setup(&mut self, setup: CallSetup) {
        self.setup = setup;
    }

    pub fn call_sid(&self) -> Option<&str> {
        self.setup.call_sid.as_deref()
    }

    /// Append one turn. History is append-only; nothing is ever rewritten.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The turns replayed on a completion request.
    ///
    /// Stored history is unbounded for the call's duration; the replayed
    /// window is capped at `max_turns` (0 = unlimited), always keeping the
    /// leading system-instruction turn. The window never starts on a
    /// tool-result turn, since that would orphan it from the assistant turn
    /// that requested it.
    pub fn context_window(&self, max_turns: usize) -> Vec<Turn> {
        if max_turns == 0 || self.turns.len() <= max_turns {
            return self.turns.clone();
        }

        // Caps below 2 degrade to system turn + newest turn
        let mut start = self
            .turns
            .len()
            .saturating_sub(max_turns.saturating_sub(1))
            .min(self.turns.len() - 1);
        while start > 1 && self.turns[start].role == Role::Tool {
            start -= 1;
        }

        let mut window = Vec::with_capacity(self.turns.len() - start + 1);
        window.push(self.turns[0].clone());
        window.extend_from_slice(&self.turns[start..]);
        window
    }
}
