//! Conversation state: participants, messages, transcripts, and lifecycle.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A party in a conversation: the human user or a named agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Participant {
    User,
    Agent(String),
}

impl Participant {
    pub fn agent(id: impl Into<String>) -> Self {
        Participant::Agent(id.into())
    }

    pub fn from_name(name: &str) -> Self {
        if name == "user" {
            Participant::User
        } else {
            Participant::Agent(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Participant::User => "user",
            Participant::Agent(id) => id,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Participant::User)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Participant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Participant {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Participant::from_name(&name))
    }
}

/// One routed message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender: Participant,
    pub recipients: Vec<Participant>,
    pub content: String,
    /// Capability tags the sender routed by, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intent: Vec<String>,
    pub turn_index: u32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: &str,
        sender: Participant,
        recipients: Vec<Participant>,
        content: impl Into<String>,
        turn_index: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            sender,
            recipients,
            content: content.into(),
            intent: Vec::new(),
            turn_index,
            created_at: Utc::now(),
        }
    }

    pub fn with_intent(mut self, intent: Vec<String>) -> Self {
        self.intent = intent;
        self
    }
}

/// Lifecycle of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    /// Ended cleanly: explicit close or idle expiry.
    Terminated,
    /// Ended by a guard or failure; needs human attention.
    Escalated,
}

/// Why a conversation ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    NoRoute,
    BudgetExceeded,
    TierExhausted,
    LoopDetected,
    Timeout,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCode::NoRoute => "NO_ROUTE",
            FailureCode::BudgetExceeded => "BUDGET_EXCEEDED",
            FailureCode::TierExhausted => "TIER_EXHAUSTED",
            FailureCode::LoopDetected => "LOOP_DETECTED",
            FailureCode::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// Mutable state of one conversation. Owned by that conversation's worker
/// task; turns within a conversation are strictly sequential.
#[derive(Debug)]
pub struct ConversationState {
    pub conversation_id: String,
    pub status: ConversationStatus,
    pub failure: Option<FailureCode>,
    /// Agent turns taken so far; checked against `max_turns` before each hop.
    pub turn_count: u32,
    /// Turns per agent, for the fewest-turns tie-break.
    pub agent_turns: HashMap<String, u32>,
    /// Directed-edge traversal counts within the sliding window.
    pub visited_edges: HashMap<(String, String), u32>,
    recent_edges: VecDeque<(String, String)>,
    edge_window: usize,
    transcript: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>, edge_window: usize) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            status: ConversationStatus::Active,
            failure: None,
            turn_count: 0,
            agent_turns: HashMap::new(),
            visited_edges: HashMap::new(),
            recent_edges: VecDeque::new(),
            edge_window,
            transcript: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, message: Message) {
        self.updated_at = message.created_at;
        self.transcript.push(message);
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    /// The last `k` messages, oldest first. This is the history window that
    /// goes into agent prompts.
    pub fn recent(&self, k: usize) -> &[Message] {
        let start = self.transcript.len().saturating_sub(k);
        &self.transcript[start..]
    }

    /// Sequence number for the next message; the transcript is totally
    /// ordered by it.
    pub fn next_turn_index(&self) -> u32 {
        self.transcript.len() as u32
    }

    /// Current traversal count of a directed edge within the window.
    pub fn edge_count(&self, from: &Participant, to: &Participant) -> u32 {
        let key = (from.as_str().to_string(), to.as_str().to_string());
        self.visited_edges.get(&key).copied().unwrap_or(0)
    }

    /// Note one traversal of `from -> to`. The oldest traversal falls out
    /// of the count once the window slides past it.
    pub fn note_edge(&mut self, from: &Participant, to: &Participant) {
        let key = (from.as_str().to_string(), to.as_str().to_string());
        *self.visited_edges.entry(key.clone()).or_insert(0) += 1;
        self.recent_edges.push_back(key);

        while self.recent_edges.len() > self.edge_window {
            if let Some(old) = self.recent_edges.pop_front() {
                if let Some(count) = self.visited_edges.get_mut(&old) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.visited_edges.remove(&old);
                    }
                }
            }
        }
    }

    pub fn note_agent_turn(&mut self, agent_id: &str) {
        *self.agent_turns.entry(agent_id.to_string()).or_insert(0) += 1;
    }

    /// Turns an agent has taken, for candidate ranking.
    pub fn turns_taken(&self, agent_id: &str) -> u32 {
        self.agent_turns.get(agent_id).copied().unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }

    pub fn end(&mut self, status: ConversationStatus, failure: Option<FailureCode>) {
        self.status = status;
        self.failure = failure;
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            status: self.status,
            failure: self.failure,
            turn_count: self.turn_count,
            message_count: self.transcript.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a conversation for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub status: ConversationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCode>,
    pub turn_count: u32,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_serializes_as_plain_string() {
        let user = serde_json::to_string(&Participant::User).unwrap();
        let agent = serde_json::to_string(&Participant::agent("researcher")).unwrap();
        assert_eq!(user, "\"user\"");
        assert_eq!(agent, "\"researcher\"");

        let back: Participant = serde_json::from_str("\"user\"").unwrap();
        assert!(back.is_user());
        let back: Participant = serde_json::from_str("\"researcher\"").unwrap();
        assert_eq!(back, Participant::agent("researcher"));
    }

    #[test]
    fn test_failure_codes_use_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&FailureCode::BudgetExceeded).unwrap(),
            "\"BUDGET_EXCEEDED\""
        );
        assert_eq!(
            serde_json::to_string(&FailureCode::NoRoute).unwrap(),
            "\"NO_ROUTE\""
        );
        assert_eq!(FailureCode::LoopDetected.to_string(), "LOOP_DETECTED");
    }

    #[test]
    fn test_recent_returns_trailing_window() {
        let mut state = ConversationState::new("c1", 20);
        for i in 0..5 {
            state.push_message(Message::new(
                "c1",
                Participant::User,
                vec![Participant::agent("a")],
                format!("m{}", i),
                i,
            ));
        }
        let recent: Vec<&str> = state.recent(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(recent, vec!["m3", "m4"]);
        assert_eq!(state.recent(50).len(), 5);
    }

    #[test]
    fn test_edge_counts_slide_with_the_window() {
        let mut state = ConversationState::new("c1", 3);
        let a = Participant::agent("a");
        let b = Participant::agent("b");

        state.note_edge(&a, &b);
        state.note_edge(&a, &b);
        assert_eq!(state.edge_count(&a, &b), 2);

        // Two unrelated hops push the first a->b traversal out of the window.
        state.note_edge(&b, &a);
        state.note_edge(&a, &Participant::agent("c"));
        assert_eq!(state.edge_count(&a, &b), 1);
        assert_eq!(state.edge_count(&b, &a), 1);
    }

    #[test]
    fn test_turns_taken_tracks_per_agent() {
        let mut state = ConversationState::new("c1", 20);
        state.note_agent_turn("a");
        state.note_agent_turn("a");
        state.note_agent_turn("b");
        assert_eq!(state.turns_taken("a"), 2);
        assert_eq!(state.turns_taken("b"), 1);
        assert_eq!(state.turns_taken("c"), 0);
    }

    #[test]
    fn test_end_records_status_and_failure() {
        let mut state = ConversationState::new("c1", 20);
        assert!(state.is_active());
        state.end(ConversationStatus::Escalated, Some(FailureCode::LoopDetected));
        assert!(!state.is_active());
        assert_eq!(state.summary().failure, Some(FailureCode::LoopDetected));
    }
}
