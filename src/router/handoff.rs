//! Handoff directive parsing.
//!
//! Agents declare where their reply should go by ending it with a
//! directive: `[handoff: researcher]` to a named agent, `[handoff:
//! capability:verification]` to whichever agent the router picks for a
//! capability tag, or `[handoff: user]` to end the exchange with a final
//! answer. A reply with no directive is implicitly a final answer.
//!
//! Only a trailing directive counts; the last one wins if the model
//! stuttered and emitted several.

use std::sync::OnceLock;

use regex::Regex;

/// Where a directive points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffTarget {
    User,
    Agent(String),
    Capability(String),
}

/// A parsed directive plus the reply text with the directive removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub target: HandoffTarget,
    pub content: String,
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?si)^(.*)\[handoff:\s*([^\]]+)\]\s*$").expect("directive regex compiles")
    })
}

/// Parse a trailing handoff directive out of an agent reply. Returns `None`
/// when the reply carries no usable directive.
pub fn parse_handoff(reply: &str) -> Option<Handoff> {
    let caps = directive_regex().captures(reply)?;
    let raw_target = caps.get(2)?.as_str().trim().to_lowercase();
    if raw_target.is_empty() {
        return None;
    }

    let target = if raw_target == "user" {
        HandoffTarget::User
    } else if let Some(tag) = raw_target.strip_prefix("capability:") {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }
        HandoffTarget::Capability(tag.to_string())
    } else {
        HandoffTarget::Agent(raw_target)
    };

    let content = caps.get(1).map(|m| m.as_str().trim_end()).unwrap_or("");
    Some(Handoff {
        target,
        content: content.to_string(),
    })
}
