//! Chat context digest
//!
//! Built at submit time from whatever the session currently holds. Without a
//! successful analysis there is no digest and chat runs as general Q&A.

use crate::session::Session;
use crate::stages::StagePayload;

const PLACEHOLDER_PREFIXES: [&str; 6] = ["pending", "loading", "fetching", "analyzing", "n/a", "..."];

/// Whether `text` still reads as a pending or placeholder value
pub fn is_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return true;
    }
    let lower = trimmed.to_lowercase();
    PLACEHOLDER_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Concatenate the human-readable stage summaries of the current session
///
/// Returns `None` unless the Analyze stage succeeded.
pub fn build_digest(session: &Session) -> Option<String> {
    let takeaways = session.analyze()?.payload()?;
    let subject = session.subject()?;

    let mut sections = vec![format!("Ticker: {subject}")];

    if let Some(data) = session.fetch().and_then(|r| r.payload()) {
        push_section(&mut sections, "Market data", data.summary());
    }
    if let Some(derived) = session.derive().and_then(|r| r.payload()) {
        push_section(&mut sections, "Derived levels", derived.summary());
    }

    let narrative: Vec<String> = takeaways
        .iter()
        .filter(|(_, takeaway)| !is_placeholder(&takeaway.text))
        .map(|(field, takeaway)| {
            format!("- {} ({}): {}", field.label(), takeaway.sentiment, takeaway.text)
        })
        .collect();
    if !narrative.is_empty() {
        sections.push(format!("Takeaways:\n{}", narrative.join("\n")));
    }

    Some(sections.join("\n\n"))
}

fn push_section(sections: &mut Vec<String>, title: &str, body: String) {
    if !is_placeholder(&body) {
        sections.push(format!("{title}: {body}"));
    }
}
