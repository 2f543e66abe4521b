//! Read-only view published by the orchestrator

use crate::chat::{ChatTurn, Sender};
use crate::session::Session;
use crate::usage::CumulativeStats;
use serde::Serialize;

/// Everything a UI or exporter needs, captured after a mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub session: Session,
    pub stats: CumulativeStats,
    pub transcript: Vec<ChatTurn>,
    pub chat_pending: bool,
}

impl PipelineSnapshot {
    /// Latest successful assistant reply
    pub fn last_reply(&self) -> Option<&ChatTurn> {
        self.transcript
            .iter()
            .rev()
            .find(|turn| turn.sender == Sender::Assistant && !turn.is_error)
    }

    /// Pretty JSON for export
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
