//! Automatic follow-up chat
//!
//! An observer of session transitions, kept out of the reconciler so the
//! pipeline runs the same with or without a conversational step.

use crate::chat::{ChatOrigin, ChatRequest};
use crate::digest::build_digest;
use crate::session::{Generation, PipelineStage, Session};
use tracing::{debug, info};

/// Prompt submitted when a full-narrative analysis completes
pub const AUTO_CHAT_PROMPT: &str = "Give me a comprehensive analysis of this ticker: \
summarize the price action, the key support and resistance levels, momentum, \
the main risks and the near-term outlook, and explain how they fit together.";

/// Fires one chat turn per generation once the analysis completes
#[derive(Debug, Default)]
pub struct AutoChatTrigger {
    fired_for: Option<Generation>,
}

impl AutoChatTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation the trigger last fired for
    pub fn fired_for(&self) -> Option<Generation> {
        self.fired_for
    }

    /// Evaluate after a session mutation
    ///
    /// Returns the request to submit when the session asked for auto-chat,
    /// reached `Complete`, has not fired yet and no chat is pending. Any
    /// `*Failed` state consumes the request without firing.
    pub fn evaluate(&mut self, session: &mut Session, chat_pending: bool) -> Option<ChatRequest> {
        if !session.wants_auto_chat() {
            return None;
        }

        let generation = session.generation();
        match session.stage() {
            stage if stage.is_failed() => {
                debug!(%generation, %stage, "Pipeline failed, skipping auto-chat");
                session.clear_auto_chat();
                return None;
            }
            PipelineStage::Complete => {}
            _ => return None,
        }

        if self.fired_for == Some(generation) {
            session.clear_auto_chat();
            return None;
        }

        if chat_pending {
            debug!(%generation, "Auto-chat waiting for the pending chat turn");
            return None;
        }

        self.fired_for = Some(generation);
        session.clear_auto_chat();
        info!(%generation, "Submitting automatic chat turn");

        Some(
            ChatRequest::new(AUTO_CHAT_PROMPT, ChatOrigin::Auto { generation })
                .with_digest(build_digest(session))
                .with_subject(session.subject().cloned()),
        )
    }
}
