//! Chat transcript
//!
//! The transcript is append-only and independent of the session generation:
//! a new top-level request leaves it untouched, only an explicit clear
//! empties it.

use crate::session::Generation;
use crate::subject::Subject;
use crate::usage::UsageReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tickerflow_llm::Message;
use uuid::Uuid;

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
    System,
}

/// A single transcript entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub usage: Option<UsageReport>,
    pub is_error: bool,
}

impl ChatTurn {
    fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
            usage: None,
            is_error: false,
        }
    }

    /// Prompt submitted by the user or the auto-chat trigger
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    /// Successful reply
    pub fn assistant(text: impl Into<String>, usage: Option<UsageReport>) -> Self {
        Self {
            usage,
            ..Self::new(Sender::Assistant, text)
        }
    }

    /// Failed reply, kept in the transcript instead of halting anything
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(Sender::Assistant, text)
        }
    }

    /// Conversation message for the generation backend
    pub fn to_message(&self) -> Message {
        match self.sender {
            Sender::User => Message::user(self.text.clone()),
            Sender::Assistant => Message::assistant(self.text.clone()),
            Sender::System => Message::system(self.text.clone()),
        }
    }
}

/// Ordered chat history with an optional retention cap
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: VecDeque<ChatTurn>,
    limit: Option<usize>,
}

impl Transcript {
    /// Unbounded transcript
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` turns, dropping the oldest
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            turns: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push_back(turn);
        if let Some(limit) = self.limit {
            while self.turns.len() > limit {
                self.turns.pop_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns in order
    pub fn turns(&self) -> impl Iterator<Item = &ChatTurn> {
        self.turns.iter()
    }

    /// Owned copy of the turns, oldest first
    pub fn to_vec(&self) -> Vec<ChatTurn> {
        self.turns.iter().cloned().collect()
    }

    /// Non-error turns as conversation history
    pub fn history(turns: &[ChatTurn]) -> Vec<Message> {
        turns
            .iter()
            .filter(|turn| !turn.is_error)
            .map(ChatTurn::to_message)
            .collect()
    }
}

/// What submitted a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatOrigin {
    User,
    Auto { generation: Generation },
}

/// Input to the chat stage
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub prompt: String,
    /// Context built from the session at submit time; `None` means
    /// general-purpose Q&A
    pub digest: Option<String>,
    pub subject: Option<Subject>,
    pub origin: ChatOrigin,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>, origin: ChatOrigin) -> Self {
        Self {
            prompt: prompt.into(),
            digest: None,
            subject: None,
            origin,
        }
    }

    pub fn with_digest(mut self, digest: Option<String>) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_subject(mut self, subject: Option<Subject>) -> Self {
        self.subject = subject;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickerflow_llm::Role;

    #[test]
    fn test_transcript_is_ordered() {
        let mut transcript = Transcript::new();
        transcript.push(ChatTurn::user("first"));
        transcript.push(ChatTurn::assistant("second", None));
        transcript.push(ChatTurn::user("third"));

        let texts: Vec<_> = transcript.turns().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let mut transcript = Transcript::with_limit(Some(2));
        for text in ["a", "b", "c"] {
            transcript.push(ChatTurn::user(text));
        }
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.to_vec()[0].text, "b");
    }

    #[test]
    fn test_history_skips_errors() {
        let turns = vec![
            ChatTurn::user("q1"),
            ChatTurn::error("Remote call failed: timeout"),
            ChatTurn::user("q2"),
            ChatTurn::assistant("a2", None),
        ];
        let history = Transcript::history(&turns);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].role, Role::Assistant);
        assert_eq!(history[2].text(), "a2");
    }

    #[test]
    fn test_turn_ids_are_unique() {
        let a = ChatTurn::user("x");
        let b = ChatTurn::user("x");
        assert_ne!(a.id, b.id);
        assert!(ChatTurn::error("boom").is_error);
    }

    #[test]
    fn test_turn_serialization() {
        let json = serde_json::to_value(ChatTurn::user("hello")).unwrap();
        assert_eq!(json["sender"], "user");
        assert_eq!(json["is_error"], false);
    }
}
