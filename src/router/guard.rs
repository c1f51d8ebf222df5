//! Anti-recursion guard: hard stops for runaway agent chains.
//!
//! Both limits are checked before the count moves, so `turn_count` never
//! exceeds `max_turns` and no edge count exceeds `max_repeats` in any
//! state an observer can see. The attempt that would cross the line is
//! the one that trips.

use thiserror::Error;

use super::conversation::{ConversationState, Participant};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardTrip {
    #[error("conversation reached the turn cap ({max_turns})")]
    MaxTurns { max_turns: u32 },

    #[error("edge {from} -> {to} repeated {count} times within the window")]
    RepeatedEdge {
        from: String,
        to: String,
        count: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RecursionGuard {
    pub max_turns: u32,
    pub max_repeats: u32,
}

impl RecursionGuard {
    pub fn new(max_turns: u32, max_repeats: u32) -> Self {
        Self {
            max_turns,
            max_repeats,
        }
    }

    /// Admit one more agent turn, incrementing the count, or trip.
    pub fn admit_turn(&self, state: &mut ConversationState) -> Result<(), GuardTrip> {
        if state.turn_count >= self.max_turns {
            return Err(GuardTrip::MaxTurns {
                max_turns: self.max_turns,
            });
        }
        state.turn_count += 1;
        Ok(())
    }

    /// Admit one traversal of `from -> to`, noting it, or trip when the
    /// edge already sits at the repeat limit.
    pub fn admit_edge(
        &self,
        state: &mut ConversationState,
        from: &Participant,
        to: &Participant,
    ) -> Result<(), GuardTrip> {
        let count = state.edge_count(from, to);
        if count >= self.max_repeats {
            return Err(GuardTrip::RepeatedEdge {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                count,
            });
        }
        state.note_edge(from, to);
        Ok(())
    }
}
