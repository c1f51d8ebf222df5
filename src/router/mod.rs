//! Message router - the conversation engine.
//!
//! Each conversation gets one worker task holding its state, so turns
//! within a conversation are strictly sequential while separate
//! conversations run concurrently. A turn walks the same path every time:
//! admit the hop past the recursion guard, resolve the recipient, let the
//! cascade pick a model, authorize-call-commit against the ledger, then
//! follow the reply's handoff directive to the next hop or back to the
//! user.

pub mod conversation;
pub mod guard;
pub mod handoff;

pub use conversation::{
    ConversationStatus, ConversationSummary, FailureCode, Message, Participant,
};
pub use guard::{GuardTrip, RecursionGuard};
pub use handoff::{parse_handoff, Handoff, HandoffTarget};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::budget::{pricing, Pressure, SharedBudgetLedger};
use crate::cascade::{AttemptOutcome, Cascade, Selection};
use crate::catalog::{ModelDescriptor, SharedTierCatalog};
use crate::config::RouterSettings;
use crate::events::{EventBus, RouterEvent};
use crate::llm::{ChatMessage, ChatOptions, LlmClient, Role};
use crate::metrics::SharedMetrics;
use crate::registry::{AgentDescriptor, RegistryTable, SharedAgentRegistry};
use conversation::ConversationState;

const INPUT_QUEUE_CAPACITY: usize = 32;
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("conversation {0} not found")]
    UnknownConversation(String),

    #[error("conversation {0} has ended")]
    ConversationEnded(String),

    #[error("conversation {0} is unavailable")]
    Unavailable(String),
}

/// Full view of one conversation for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub messages: Vec<Message>,
}

enum ConversationInput {
    Message {
        content: String,
        recipient: Option<String>,
    },
    Close,
}

struct ConversationHandle {
    tx: mpsc::Sender<ConversationInput>,
    state: Arc<RwLock<ConversationState>>,
    closing: Arc<AtomicBool>,
}

struct RouterInner {
    registry: SharedAgentRegistry,
    catalog: SharedTierCatalog,
    ledger: SharedBudgetLedger,
    llm: Arc<dyn LlmClient>,
    metrics: SharedMetrics,
    events: EventBus,
    settings: RouterSettings,
    guard: RecursionGuard,
    conversations: RwLock<HashMap<String, ConversationHandle>>,
}

/// Cheaply cloneable handle to the router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        registry: SharedAgentRegistry,
        catalog: SharedTierCatalog,
        ledger: SharedBudgetLedger,
        llm: Arc<dyn LlmClient>,
        metrics: SharedMetrics,
        settings: RouterSettings,
    ) -> Self {
        let guard = RecursionGuard::new(settings.max_turns, settings.max_repeats);
        Self {
            inner: Arc::new(RouterInner {
                registry,
                catalog,
                ledger,
                llm,
                metrics,
                events: EventBus::new(),
                settings,
                guard,
                conversations: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    pub fn ledger(&self) -> &SharedBudgetLedger {
        &self.inner.ledger
    }

    /// Enqueue a user message. Creates the conversation and its worker on
    /// first contact; later messages join the same queue and are processed
    /// strictly in order.
    pub async fn submit(
        &self,
        conversation_id: &str,
        content: String,
        recipient: Option<String>,
    ) -> Result<(), RouterError> {
        let tx = {
            let mut conversations = self.inner.conversations.write().await;
            if let Some(handle) = conversations.get(conversation_id) {
                if !handle.state.read().await.is_active() {
                    return Err(RouterError::ConversationEnded(conversation_id.to_string()));
                }
                handle.tx.clone()
            } else {
                let (tx, rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
                let state = Arc::new(RwLock::new(ConversationState::new(
                    conversation_id,
                    self.inner.settings.repeat_window,
                )));
                let closing = Arc::new(AtomicBool::new(false));
                conversations.insert(
                    conversation_id.to_string(),
                    ConversationHandle {
                        tx: tx.clone(),
                        state: state.clone(),
                        closing: closing.clone(),
                    },
                );
                tracing::info!("Conversation {} started", conversation_id);

                let router = self.clone();
                let id = conversation_id.to_string();
                tokio::spawn(async move {
                    router.run_conversation(id, state, closing, rx).await;
                });
                tx
            }
        };
        self.refresh_active_gauge().await;

        tx.send(ConversationInput::Message { content, recipient })
            .await
            .map_err(|_| RouterError::Unavailable(conversation_id.to_string()))
    }

    /// Ask a conversation to stop. The turn in flight finishes (and its
    /// cost commits); the chain stops at the next hop boundary.
    pub async fn close(&self, conversation_id: &str) -> Result<(), RouterError> {
        let conversations = self.inner.conversations.read().await;
        let handle = conversations
            .get(conversation_id)
            .ok_or_else(|| RouterError::UnknownConversation(conversation_id.to_string()))?;

        if !handle.state.read().await.is_active() {
            return Err(RouterError::ConversationEnded(conversation_id.to_string()));
        }
        handle.closing.store(true, Ordering::Relaxed);
        // Wake the worker if it is idle; if the queue is full it will see
        // the flag on its next hop anyway.
        let _ = handle.tx.try_send(ConversationInput::Close);
        Ok(())
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<ConversationDetail> {
        let conversations = self.inner.conversations.read().await;
        let handle = conversations.get(conversation_id)?;
        let state = handle.state.read().await;
        Some(ConversationDetail {
            summary: state.summary(),
            messages: state.transcript().to_vec(),
        })
    }

    pub async fn list_conversations(&self) -> Vec<ConversationSummary> {
        let conversations = self.inner.conversations.read().await;
        let mut summaries = Vec::with_capacity(conversations.len());
        for handle in conversations.values() {
            summaries.push(handle.state.read().await.summary());
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Periodically drop ended conversations once they have been quiet for
    /// the idle TTL. Keeps transcripts queryable for a while after the end.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_PERIOD).await;
                router.sweep_ended().await;
            }
        })
    }

    async fn sweep_ended(&self) {
        let ttl = chrono::Duration::seconds(self.inner.settings.idle_ttl_secs as i64);
        let now = chrono::Utc::now();

        let expired: Vec<String> = {
            let conversations = self.inner.conversations.read().await;
            let mut expired = Vec::new();
            for (id, handle) in conversations.iter() {
                let state = handle.state.read().await;
                if !state.is_active() && now - state.updated_at > ttl {
                    expired.push(id.clone());
                }
            }
            expired
        };

        if expired.is_empty() {
            return;
        }
        let mut conversations = self.inner.conversations.write().await;
        for id in &expired {
            conversations.remove(id);
            tracing::debug!("Swept ended conversation {}", id);
        }
    }

    async fn refresh_active_gauge(&self) {
        let conversations = self.inner.conversations.read().await;
        let mut active = 0i64;
        for handle in conversations.values() {
            if handle.state.read().await.is_active() {
                active += 1;
            }
        }
        self.inner.metrics.set_active_conversations(active);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Worker
    // ─────────────────────────────────────────────────────────────────────

    async fn run_conversation(
        &self,
        conversation_id: String,
        state: Arc<RwLock<ConversationState>>,
        closing: Arc<AtomicBool>,
        mut rx: mpsc::Receiver<ConversationInput>,
    ) {
        let idle_ttl = Duration::from_secs(self.inner.settings.idle_ttl_secs);
        loop {
            match tokio::time::timeout(idle_ttl, rx.recv()).await {
                Err(_) => {
                    tracing::info!("Conversation {} idle for {:?}, closing", conversation_id, idle_ttl);
                    self.end_conversation(&state, ConversationStatus::Terminated, None)
                        .await;
                    break;
                }
                Ok(None) => break,
                Ok(Some(ConversationInput::Close)) => {
                    self.end_conversation(&state, ConversationStatus::Terminated, None)
                        .await;
                    break;
                }
                Ok(Some(ConversationInput::Message { content, recipient })) => {
                    let ended = self
                        .process_message(&conversation_id, &state, &closing, content, recipient)
                        .await;
                    if ended {
                        break;
                    }
                }
            }
        }
    }

    /// Drive one user message through the hop chain. Returns true when the
    /// conversation ended.
    async fn process_message(
        &self,
        conversation_id: &str,
        state: &Arc<RwLock<ConversationState>>,
        closing: &Arc<AtomicBool>,
        content: String,
        recipient: Option<String>,
    ) -> bool {
        let registry = self.inner.registry.snapshot().await;

        let target_name = recipient.unwrap_or_else(|| registry.entry_agent().id.clone());
        {
            let mut st = state.write().await;
            let turn_index = st.next_turn_index();
            st.push_message(Message::new(
                conversation_id,
                Participant::User,
                vec![Participant::from_name(&target_name)],
                content,
                turn_index,
            ));
        }

        let Some(first) = registry.resolve(&target_name) else {
            tracing::warn!(
                "Conversation {}: recipient {} does not resolve",
                conversation_id,
                target_name
            );
            self.end_conversation(
                state,
                ConversationStatus::Escalated,
                Some(FailureCode::NoRoute),
            )
            .await;
            return true;
        };

        let mut sender = Participant::User;
        let mut agent = first.clone();

        loop {
            if closing.load(Ordering::Relaxed) {
                self.end_conversation(state, ConversationStatus::Terminated, None)
                    .await;
                return true;
            }

            // Guard admission happens before any money moves.
            let to = Participant::agent(&agent.id);
            let turn = {
                let mut st = state.write().await;
                let admitted = self
                    .inner
                    .guard
                    .admit_turn(&mut st)
                    .and_then(|_| self.inner.guard.admit_edge(&mut st, &sender, &to));
                if let Err(trip) = admitted {
                    drop(st);
                    tracing::warn!("Conversation {}: {}", conversation_id, trip);
                    self.inner.metrics.record_loop_break();
                    self.end_conversation(
                        state,
                        ConversationStatus::Escalated,
                        Some(FailureCode::LoopDetected),
                    )
                    .await;
                    return true;
                }
                st.note_agent_turn(&agent.id);
                st.turn_count
            };

            let reply = match self.dispatch_turn(conversation_id, state, &agent).await {
                Ok(reply) => reply,
                Err(code) => {
                    self.end_conversation(state, ConversationStatus::Escalated, Some(code))
                        .await;
                    return true;
                }
            };

            // Follow the directive to the next hop.
            let parsed = parse_handoff(&reply.content);
            let (body, route) = match parsed {
                None => (reply.content.clone(), Route::Final),
                Some(Handoff {
                    target: HandoffTarget::User,
                    content,
                }) => (content, Route::Final),
                Some(Handoff {
                    target: HandoffTarget::Agent(next_id),
                    content,
                }) => {
                    let resolved = registry
                        .resolve(&next_id)
                        .filter(|next| next.id != agent.id)
                        .filter(|next| agent.allowed_recipients.permits(&next.id))
                        .cloned();
                    match resolved {
                        Some(next) => (content, Route::Next(next, Vec::new())),
                        None => (content, Route::Dead(next_id)),
                    }
                }
                Some(Handoff {
                    target: HandoffTarget::Capability(tag),
                    content,
                }) => {
                    let picked = {
                        let st = state.read().await;
                        self.pick_by_capability(&registry, &st, &agent, &tag)
                    };
                    match picked {
                        Some(next) => (content, Route::Next(next, vec![tag])),
                        None => (content, Route::DeadCapability(tag)),
                    }
                }
            };

            let recipients = match &route {
                Route::Final => vec![Participant::User],
                Route::Next(next, _) => vec![Participant::agent(&next.id)],
                Route::Dead(name) => vec![Participant::from_name(name)],
                Route::DeadCapability(_) => Vec::new(),
            };
            let intent = match &route {
                Route::Next(_, intent) => intent.clone(),
                Route::DeadCapability(tag) => vec![tag.clone()],
                _ => Vec::new(),
            };
            let is_final = matches!(route, Route::Final);

            let turn_index = {
                let mut st = state.write().await;
                let turn_index = st.next_turn_index();
                st.push_message(
                    Message::new(
                        conversation_id,
                        Participant::agent(&agent.id),
                        recipients,
                        body.clone(),
                        turn_index,
                    )
                    .with_intent(intent),
                );
                turn_index
            };
            self.inner.events.publish(RouterEvent::AgentReply {
                conversation_id: conversation_id.to_string(),
                agent_id: agent.id.clone(),
                content: body,
                turn_index,
                model_id: reply.model_id.clone(),
                is_final,
            });

            match route {
                Route::Final => {
                    tracing::info!(
                        "Conversation {}: {} answered the user (turn {})",
                        conversation_id,
                        agent.id,
                        turn
                    );
                    return false;
                }
                Route::Dead(name) => {
                    tracing::warn!(
                        "Conversation {}: handoff target {} does not resolve",
                        conversation_id,
                        name
                    );
                    self.end_conversation(
                        state,
                        ConversationStatus::Escalated,
                        Some(FailureCode::NoRoute),
                    )
                    .await;
                    return true;
                }
                Route::DeadCapability(tag) => {
                    tracing::warn!(
                        "Conversation {}: no eligible agent for capability {}",
                        conversation_id,
                        tag
                    );
                    self.end_conversation(
                        state,
                        ConversationStatus::Escalated,
                        Some(FailureCode::NoRoute),
                    )
                    .await;
                    return true;
                }
                Route::Next(next, _) => {
                    tracing::debug!(
                        "Conversation {}: {} -> {}",
                        conversation_id,
                        agent.id,
                        next.id
                    );
                    sender = Participant::agent(&agent.id);
                    agent = next;
                }
            }
        }
    }

    /// Rank candidates for a capability tag: fewest turns taken, then
    /// registry priority, then lexical id. The sender itself and agents
    /// outside its allow-list are not eligible.
    fn pick_by_capability(
        &self,
        registry: &RegistryTable,
        state: &ConversationState,
        sender: &AgentDescriptor,
        tag: &str,
    ) -> Option<AgentDescriptor> {
        registry
            .candidates(tag)
            .into_iter()
            .filter(|c| c.id != sender.id)
            .filter(|c| sender.allowed_recipients.permits(&c.id))
            .min_by_key(|c| {
                (
                    state.turns_taken(&c.id),
                    registry.priority(&c.id).unwrap_or(usize::MAX),
                    c.id.clone(),
                )
            })
            .cloned()
    }

    /// One agent turn: cascade over models, authorize-call-commit, until a
    /// reply lands or the cascade gives a terminal failure code.
    async fn dispatch_turn(
        &self,
        conversation_id: &str,
        state: &Arc<RwLock<ConversationState>>,
        agent: &AgentDescriptor,
    ) -> Result<TurnReply, FailureCode> {
        let started = Instant::now();
        let catalog = self.inner.catalog.snapshot().await;

        // Elevated budget pressure overrides the agent's preference and
        // starts the cascade at the cheapest tier.
        let pressure = self.inner.ledger.pressure(conversation_id).await;
        let start_tier = if pressure == Pressure::Elevated {
            tracing::warn!(
                "Conversation {}: budget pressure elevated, starting {} at the cheapest tier",
                conversation_id,
                agent.id
            );
            0
        } else {
            catalog.tier_index(&agent.preferred_tier).unwrap_or_else(|| {
                tracing::warn!(
                    "Agent {} prefers unknown tier {}, using the cheapest",
                    agent.id,
                    agent.preferred_tier
                );
                0
            })
        };

        let prompt = {
            let st = state.read().await;
            build_prompt(&st, agent, self.inner.settings.history_window)
        };
        let prompt_tokens: u64 = prompt.iter().map(|m| pricing::estimate_tokens(&m.content)).sum();
        let expected_output = self.inner.settings.default_output_tokens;
        let estimate = move |m: &ModelDescriptor| {
            pricing::cost_micros(m, prompt_tokens, expected_output.min(m.max_tokens))
        };

        let mut cascade = Cascade::new(
            catalog,
            conversation_id,
            start_tier,
            self.inner.settings.max_attempts,
        );
        let deadline = Duration::from_secs(self.inner.settings.turn_timeout_secs);

        let result = loop {
            let pick = match cascade.next(&self.inner.ledger, &estimate).await {
                Selection::Pick(pick) => pick,
                Selection::Exhausted { budget_limited } => {
                    break Err(self.classify_exhaustion(&cascade, budget_limited));
                }
            };

            let decision = self
                .inner
                .ledger
                .authorize(
                    conversation_id,
                    pick.attempt_id,
                    &pick.model.id,
                    estimate(&pick.model),
                )
                .await;
            if !decision.is_allow() {
                cascade.record(
                    pick.attempt_id,
                    AttemptOutcome::Denied,
                    Some("authorization denied".to_string()),
                );
                self.inner.metrics.record_request(&agent.id, "denied");
                break Err(FailureCode::BudgetExceeded);
            }

            let options = ChatOptions {
                temperature: None,
                max_tokens: Some(expected_output.min(pick.model.max_tokens)),
            };
            match tokio::time::timeout(
                deadline,
                self.inner.llm.chat(&pick.model.id, &prompt, options),
            )
            .await
            {
                Err(_) => {
                    // The call future is dropped; nothing will be billed.
                    self.inner.ledger.release(conversation_id, pick.attempt_id).await;
                    cascade.record(
                        pick.attempt_id,
                        AttemptOutcome::TimedOut,
                        Some(format!("deadline {:?}", deadline)),
                    );
                    self.inner.metrics.record_request(&agent.id, "timeout");
                    self.inner.metrics.record_error("timeout");
                    tracing::warn!(
                        "Conversation {}: {} timed out on {} after {:?}",
                        conversation_id,
                        agent.id,
                        pick.model.id,
                        deadline
                    );
                }
                Ok(Err(err)) => {
                    self.inner.ledger.release(conversation_id, pick.attempt_id).await;
                    cascade.record(pick.attempt_id, AttemptOutcome::Failed, Some(err.to_string()));
                    self.inner.metrics.record_request(&agent.id, "failed");
                    self.inner.metrics.record_error(&err.kind.to_string());
                    tracing::warn!(
                        "Conversation {}: {} failed on {}: {}",
                        conversation_id,
                        agent.id,
                        pick.model.id,
                        err
                    );
                }
                Ok(Ok(response)) => {
                    let actual = match &response.usage {
                        Some(usage) => pricing::cost_micros(
                            &pick.model,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                        ),
                        // No usage reported: charge what was reserved.
                        None => estimate(&pick.model),
                    };
                    let remaining = self
                        .inner
                        .ledger
                        .commit(conversation_id, pick.attempt_id, &pick.model.id, actual)
                        .await;

                    let content = response.content.unwrap_or_default();
                    if content.is_empty() {
                        cascade.record(
                            pick.attempt_id,
                            AttemptOutcome::Failed,
                            Some("empty response".to_string()),
                        );
                        self.inner.metrics.record_request(&agent.id, "failed");
                        self.inner.metrics.record_error("empty_response");
                        tracing::warn!(
                            "Conversation {}: {} returned an empty reply on {}",
                            conversation_id,
                            agent.id,
                            pick.model.id
                        );
                        continue;
                    }

                    cascade.record(pick.attempt_id, AttemptOutcome::Succeeded, None);
                    self.inner.metrics.record_request(&agent.id, "ok");
                    if let Some(usage) = &response.usage {
                        self.inner.metrics.record_usage(
                            &agent.id,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                        );
                    }
                    self.inner.metrics.record_cost(&pick.model.tier, actual);
                    tracing::info!(
                        "Conversation {}: {} replied via {} (cost {} micros, {} remaining)",
                        conversation_id,
                        agent.id,
                        pick.model.id,
                        actual,
                        remaining
                    );
                    break Ok(TurnReply {
                        content,
                        model_id: pick.model.id.clone(),
                    });
                }
            }
        };

        self.inner
            .metrics
            .observe_turn_latency(started.elapsed().as_secs_f64());
        if let Err(code) = &result {
            let tried: Vec<String> = cascade
                .attempts()
                .iter()
                .map(|a| format!("{}:{:?}", a.model_id, a.outcome))
                .collect();
            tracing::warn!(
                "Conversation {}: turn for {} failed with {} after [{}]",
                conversation_id,
                agent.id,
                code,
                tried.join(", ")
            );
            self.inner.metrics.record_error(&code.to_string().to_lowercase());
        }
        result
    }

    fn classify_exhaustion(&self, cascade: &Cascade, budget_limited: bool) -> FailureCode {
        if budget_limited {
            return FailureCode::BudgetExceeded;
        }
        let attempts = cascade.attempts();
        let all_timeouts = !attempts.is_empty()
            && attempts
                .iter()
                .all(|a| a.outcome == AttemptOutcome::TimedOut);
        if all_timeouts {
            FailureCode::Timeout
        } else {
            FailureCode::TierExhausted
        }
    }

    async fn end_conversation(
        &self,
        state: &Arc<RwLock<ConversationState>>,
        status: ConversationStatus,
        failure: Option<FailureCode>,
    ) {
        let (conversation_id, turn_count) = {
            let mut st = state.write().await;
            if !st.is_active() {
                return;
            }
            st.end(status, failure);
            (st.conversation_id.clone(), st.turn_count)
        };

        self.inner.ledger.forget(&conversation_id).await;
        self.inner.events.publish(RouterEvent::ConversationEnded {
            conversation_id: conversation_id.clone(),
            status,
            failure,
            turn_count,
        });
        self.refresh_active_gauge().await;
        match failure {
            Some(code) => tracing::warn!(
                "Conversation {} ended {:?} ({})",
                conversation_id,
                status,
                code
            ),
            None => tracing::info!("Conversation {} ended {:?}", conversation_id, status),
        }
    }
}

enum Route {
    /// Reply goes to the user; the conversation stays open.
    Final,
    Next(AgentDescriptor, Vec<String>),
    Dead(String),
    DeadCapability(String),
}

struct TurnReply {
    content: String,
    model_id: String,
}

/// System prompt plus the recent history window. The newest message is
/// always presented with the user role so the model answers it instead of
/// continuing as the previous speaker.
fn build_prompt(state: &ConversationState, agent: &AgentDescriptor, window: usize) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(window + 2);
    messages.push(ChatMessage::system(system_prompt(agent)));

    let recent = state.recent(window);
    let last = recent.len().saturating_sub(1);
    for (i, msg) in recent.iter().enumerate() {
        let line = format!("[{}] {}", msg.sender, msg.content);
        let role = if i == last || msg.sender.is_user() {
            Role::User
        } else {
            Role::Assistant
        };
        messages.push(ChatMessage::new(role, line));
    }
    messages
}

fn system_prompt(agent: &AgentDescriptor) -> String {
    let recipients = match &agent.allowed_recipients {
        crate::registry::AllowedRecipients::Any => "any registered agent".to_string(),
        crate::registry::AllowedRecipients::Only(ids) => {
            let mut ids: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
            ids.sort_unstable();
            ids.join(", ")
        }
    };
    format!(
        "{}\n\nYou are \"{}\" in a multi-agent conversation. To pass the \
         conversation on, end your reply with [handoff: <agent_id>] or \
         [handoff: capability:<tag>]. End with [handoff: user] or with no \
         directive to answer the user directly. You may hand off to: {}.",
        agent.instructions, agent.id, recipients
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, BudgetLedger, BudgetPeriod};
    use crate::catalog::TierCatalog;
    use crate::llm::{ChatResponse, LlmError, LlmResult, TokenUsage};
    use crate::metrics::RouterMetrics;
    use crate::registry::AgentRegistry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Prices of 0.001 per 1k tokens make one token cost exactly one micro.
    const TIERS: &str = r#"
tiers:
  - name: cheap
    models:
      - { id: cheap/a, provider: test, input_per_1k: 0.001, output_per_1k: 0.001 }
      - { id: cheap/b, provider: test, input_per_1k: 0.001, output_per_1k: 0.001 }
  - name: standard
    models:
      - { id: std/a, provider: test, input_per_1k: 0.001, output_per_1k: 0.001 }
"#;

    const AGENTS: &str = r#"
entry_agent: communicator
agents:
  - id: communicator
    capabilities: [dialogue]
    preferred_tier: cheap
    allowed_recipients: any
    instructions: You coordinate.
  - id: researcher
    capabilities: [research]
    preferred_tier: standard
    allowed_recipients: [fact_checker, communicator]
    instructions: You research.
  - id: fact_checker
    capabilities: [research, verification]
    preferred_tier: standard
    allowed_recipients: [communicator]
    instructions: You verify.
"#;

    enum Scripted {
        Reply(&'static str, u64, u64),
        Fail(LlmError),
        Hang,
    }

    struct ScriptedLlm {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(
            &self,
            model: &str,
            _messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> LlmResult<ChatResponse> {
            self.calls.lock().unwrap().push(model.to_string());
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Scripted::Reply(content, prompt, completion)) => Ok(ChatResponse {
                    content: Some(content.to_string()),
                    finish_reason: Some("stop".to_string()),
                    usage: Some(TokenUsage::new(prompt, completion)),
                    model: Some(model.to_string()),
                }),
                Some(Scripted::Fail(err)) => Err(err),
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(LlmError::network_error("hung".to_string()))
                }
                None => Err(LlmError::client_error(400, "script over".to_string())),
            }
        }
    }

    struct Harness {
        router: Router,
        llm: Arc<ScriptedLlm>,
        metrics: SharedMetrics,
        events: broadcast::Receiver<RouterEvent>,
    }

    fn harness(script: Vec<Scripted>, limit_micros: i64, settings: RouterSettings) -> Harness {
        let catalog = Arc::new(TierCatalog::from_yaml(TIERS).unwrap());
        let registry = Arc::new(AgentRegistry::from_yaml(AGENTS).unwrap());
        let ledger = Arc::new(BudgetLedger::new(
            BudgetConfig {
                limit_micros,
                period: BudgetPeriod::Session,
                warn_ratio: 0.8,
                currency: "USD".to_string(),
            },
            None,
        ));
        let llm = ScriptedLlm::new(script);
        let metrics = Arc::new(RouterMetrics::new());
        let router = Router::new(
            registry,
            catalog,
            ledger,
            llm.clone(),
            metrics.clone(),
            settings,
        );
        let events = router.subscribe();
        Harness {
            router,
            llm,
            metrics,
            events,
        }
    }

    fn default_settings() -> RouterSettings {
        RouterSettings {
            default_output_tokens: 64,
            ..RouterSettings::default()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<RouterEvent>) -> RouterEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_user_message_routes_to_entry_agent() {
        let mut h = harness(
            vec![Scripted::Reply("All set.", 10, 5)],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "hello".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::AgentReply {
                agent_id,
                content,
                is_final,
                model_id,
                ..
            } => {
                assert_eq!(agent_id, "communicator");
                assert_eq!(content, "All set.");
                assert!(is_final);
                assert_eq!(model_id, "cheap/a");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let detail = h.router.conversation("c1").await.unwrap();
        assert_eq!(detail.summary.status, ConversationStatus::Active);
        assert_eq!(detail.summary.turn_count, 1);
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[0].sender, Participant::User);
        assert_eq!(
            detail.messages[0].recipients,
            vec![Participant::agent("communicator")]
        );
        assert_eq!(detail.messages[1].sender, Participant::agent("communicator"));
        assert_eq!(detail.messages[1].recipients, vec![Participant::User]);
    }

    #[tokio::test]
    async fn test_handoff_chain_with_capability_tie_break() {
        // communicator -> capability research (researcher wins on priority)
        // -> capability research again (researcher excludes itself, picks
        // fact_checker) -> back to the user.
        let mut h = harness(
            vec![
                Scripted::Reply("Digging in. [handoff: capability:research]", 10, 5),
                Scripted::Reply("Verify this. [handoff: capability:research]", 10, 5),
                Scripted::Reply("Confirmed. [handoff: user]", 10, 5),
            ],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "question".to_string(), None).await.unwrap();

        let mut repliers = Vec::new();
        for _ in 0..3 {
            if let RouterEvent::AgentReply {
                agent_id, is_final, ..
            } = next_event(&mut h.events).await
            {
                repliers.push((agent_id, is_final));
            }
        }
        assert_eq!(
            repliers,
            vec![
                ("communicator".to_string(), false),
                ("researcher".to_string(), false),
                ("fact_checker".to_string(), true),
            ]
        );

        // Preferred tiers drove model selection per agent.
        assert_eq!(h.llm.calls(), vec!["cheap/a", "std/a", "std/a"]);

        let detail = h.router.conversation("c1").await.unwrap();
        assert_eq!(detail.summary.status, ConversationStatus::Active);
        assert_eq!(detail.summary.turn_count, 3);
        // The capability hop records its intent tag.
        assert_eq!(detail.messages[1].intent, vec!["research"]);
        assert_eq!(
            detail.messages[1].recipients,
            vec![Participant::agent("researcher")]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_handoff_ends_no_route() {
        let mut h = harness(
            vec![Scripted::Reply("Over to you. [handoff: ghost]", 10, 5)],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        // The reply itself is still delivered to subscribers...
        let first = next_event(&mut h.events).await;
        assert!(matches!(first, RouterEvent::AgentReply { is_final: false, .. }));

        // ...then the conversation ends with NO_ROUTE.
        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded {
                status, failure, ..
            } => {
                assert_eq!(status, ConversationStatus::Escalated);
                assert_eq!(failure, Some(FailureCode::NoRoute));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_first_recipient_ends_no_route() {
        let mut h = harness(vec![], 5_000_000, default_settings());

        h.router
            .submit("c1", "hi".to_string(), Some("nobody".to_string()))
            .await
            .unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded { failure, .. } => {
                assert_eq!(failure, Some(FailureCode::NoRoute));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_edge_trips_loop_guard() {
        // communicator and researcher bounce the conversation between each
        // other until the edge guard steps in.
        let mut script = Vec::new();
        for _ in 0..6 {
            script.push(Scripted::Reply("you take it [handoff: researcher]", 5, 5));
            script.push(Scripted::Reply("no you [handoff: communicator]", 5, 5));
        }
        let settings = RouterSettings {
            max_repeats: 2,
            default_output_tokens: 64,
            ..RouterSettings::default()
        };
        let mut h = harness(script, 5_000_000, settings);

        h.router.submit("c1", "go".to_string(), None).await.unwrap();

        let ended = loop {
            match next_event(&mut h.events).await {
                RouterEvent::ConversationEnded {
                    status, failure, ..
                } => break (status, failure),
                RouterEvent::AgentReply { .. } => continue,
            }
        };
        assert_eq!(ended.0, ConversationStatus::Escalated);
        assert_eq!(ended.1, Some(FailureCode::LoopDetected));

        let export = h.metrics.export();
        assert!(export.contains("switchboard_loop_breaks_total 1"));

        // No edge ever ran past the limit.
        let detail = h.router.conversation("c1").await.unwrap();
        assert!(detail.summary.turn_count <= 24);
    }

    #[tokio::test]
    async fn test_turn_cap_ends_escalated() {
        let mut script = Vec::new();
        for _ in 0..10 {
            script.push(Scripted::Reply("next [handoff: researcher]", 5, 5));
            script.push(Scripted::Reply("next [handoff: fact_checker]", 5, 5));
            script.push(Scripted::Reply("next [handoff: communicator]", 5, 5));
        }
        let settings = RouterSettings {
            max_turns: 4,
            max_repeats: 100,
            default_output_tokens: 64,
            ..RouterSettings::default()
        };
        let mut h = harness(script, 5_000_000, settings);

        h.router.submit("c1", "go".to_string(), None).await.unwrap();

        loop {
            match next_event(&mut h.events).await {
                RouterEvent::ConversationEnded {
                    status,
                    failure,
                    turn_count,
                    ..
                } => {
                    assert_eq!(status, ConversationStatus::Escalated);
                    assert_eq!(failure, Some(FailureCode::LoopDetected));
                    assert_eq!(turn_count, 4);
                    break;
                }
                RouterEvent::AgentReply { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_model_failure_cascades_within_tier() {
        let mut h = harness(
            vec![
                Scripted::Fail(LlmError::server_error(502, "bad gateway".to_string())),
                Scripted::Reply("Recovered.", 10, 5),
            ],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::AgentReply { content, model_id, .. } => {
                assert_eq!(content, "Recovered.");
                assert_eq!(model_id, "cheap/b");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(h.llm.calls(), vec!["cheap/a", "cheap/b"]);

        let export = h.metrics.export();
        assert!(export.contains("switchboard_errors_total{kind=\"server_error\"} 1"));
    }

    #[tokio::test]
    async fn test_every_model_failing_ends_tier_exhausted() {
        let script = (0..4)
            .map(|_| Scripted::Fail(LlmError::server_error(500, "down".to_string())))
            .collect();
        let mut h = harness(script, 5_000_000, default_settings());

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded {
                status, failure, ..
            } => {
                assert_eq!(status, ConversationStatus::Escalated);
                assert_eq!(failure, Some(FailureCode::TierExhausted));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // All three catalog models were tried exactly once.
        assert_eq!(h.llm.calls(), vec!["cheap/a", "cheap/b", "std/a"]);
    }

    #[tokio::test]
    async fn test_budget_denial_ends_budget_exceeded_without_calls() {
        let mut h = harness(vec![], 10, default_settings());

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded {
                status, failure, ..
            } => {
                assert_eq!(status, ConversationStatus::Escalated);
                assert_eq!(failure, Some(FailureCode::BudgetExceeded));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_advances_cascade_and_releases_reservation() {
        let settings = RouterSettings {
            turn_timeout_secs: 1,
            default_output_tokens: 64,
            ..RouterSettings::default()
        };
        let mut h = harness(
            vec![Scripted::Hang, Scripted::Reply("Late but here.", 10, 5)],
            5_000_000,
            settings,
        );

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::AgentReply { model_id, .. } => assert_eq!(model_id, "cheap/b"),
            other => panic!("unexpected event: {:?}", other),
        }

        // The timed-out attempt must not leave a reservation behind: only
        // the successful call's cost (15 tokens = 15 micros) is held.
        let remaining = h.router.ledger().remaining("c1").await;
        assert_eq!(remaining, 5_000_000 - 15);

        let export = h.metrics.export();
        assert!(export.contains("switchboard_errors_total{kind=\"timeout\"} 1"));
    }

    #[tokio::test]
    async fn test_all_attempts_timing_out_ends_timeout() {
        let settings = RouterSettings {
            turn_timeout_secs: 1,
            max_attempts: 2,
            default_output_tokens: 64,
            ..RouterSettings::default()
        };
        let mut h = harness(vec![Scripted::Hang, Scripted::Hang], 5_000_000, settings);

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded { failure, .. } => {
                assert_eq!(failure, Some(FailureCode::Timeout));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_elevated_pressure_starts_at_cheapest_tier() {
        // First turn burns 8_500 of 10_000 micros; the second turn goes to
        // an agent preferring the standard tier but starts cheap anyway.
        let mut h = harness(
            vec![
                Scripted::Reply("Noted.", 8_000, 500),
                Scripted::Reply("Cheap seats.", 10, 5),
            ],
            10_000,
            default_settings(),
        );

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();
        let _ = next_event(&mut h.events).await;

        h.router
            .submit("c1", "more".to_string(), Some("researcher".to_string()))
            .await
            .unwrap();
        match next_event(&mut h.events).await {
            RouterEvent::AgentReply {
                agent_id, model_id, ..
            } => {
                assert_eq!(agent_id, "researcher");
                assert_eq!(model_id, "cheap/a");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_turns_within_a_conversation_are_sequential() {
        let mut h = harness(
            vec![
                Scripted::Reply("first answer", 10, 5),
                Scripted::Reply("second answer", 10, 5),
            ],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "one".to_string(), None).await.unwrap();
        h.router.submit("c1", "two".to_string(), None).await.unwrap();

        let _ = next_event(&mut h.events).await;
        let _ = next_event(&mut h.events).await;

        let detail = h.router.conversation("c1").await.unwrap();
        let contents: Vec<&str> = detail.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "first answer", "two", "second answer"]);
        assert_eq!(detail.summary.turn_count, 2);

        // The transcript is totally ordered by turn_index.
        let indices: Vec<u32> = detail.messages.iter().map(|m| m.turn_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_conversations_run_independently() {
        let mut h = harness(
            vec![
                Scripted::Reply("for one of you", 10, 5),
                Scripted::Reply("for the other", 10, 5),
            ],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "a".to_string(), None).await.unwrap();
        h.router.submit("c2", "b".to_string(), None).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            if let RouterEvent::AgentReply {
                conversation_id, ..
            } = next_event(&mut h.events).await
            {
                seen.push(conversation_id);
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["c1", "c2"]);
        assert_eq!(h.router.list_conversations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_terminates_and_rejects_new_messages() {
        let mut h = harness(
            vec![Scripted::Reply("done", 10, 5)],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();
        let _ = next_event(&mut h.events).await;

        h.router.close("c1").await.unwrap();
        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded {
                status, failure, ..
            } => {
                assert_eq!(status, ConversationStatus::Terminated);
                assert_eq!(failure, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The transcript stays readable after the end...
        let detail = h.router.conversation("c1").await.unwrap();
        assert_eq!(detail.summary.status, ConversationStatus::Terminated);

        // ...but new input is refused.
        let err = h.router.submit("c1", "again".to_string(), None).await;
        assert!(matches!(err, Err(RouterError::ConversationEnded(_))));

        let err = h.router.close("c1").await;
        assert!(matches!(err, Err(RouterError::ConversationEnded(_))));
        let err = h.router.close("missing").await;
        assert!(matches!(err, Err(RouterError::UnknownConversation(_))));
    }

    #[tokio::test]
    async fn test_final_reply_keeps_conversation_open_for_followups() {
        let mut h = harness(
            vec![
                Scripted::Reply("Answer one. [handoff: user]", 10, 5),
                Scripted::Reply("Answer two.", 10, 5),
            ],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "q1".to_string(), None).await.unwrap();
        let _ = next_event(&mut h.events).await;

        h.router.submit("c1", "q2".to_string(), None).await.unwrap();
        match next_event(&mut h.events).await {
            RouterEvent::AgentReply { content, .. } => assert_eq!(content, "Answer two."),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_conversation_expires() {
        let settings = RouterSettings {
            idle_ttl_secs: 1,
            default_output_tokens: 64,
            ..RouterSettings::default()
        };
        let mut h = harness(vec![Scripted::Reply("hi", 10, 5)], 5_000_000, settings);

        h.router.submit("c1", "hello".to_string(), None).await.unwrap();
        let _ = next_event(&mut h.events).await;

        match next_event(&mut h.events).await {
            RouterEvent::ConversationEnded { status, .. } => {
                assert_eq!(status, ConversationStatus::Terminated);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_reply_is_treated_as_a_failed_attempt() {
        let mut h = harness(
            vec![Scripted::Reply("", 10, 5), Scripted::Reply("real answer", 10, 5)],
            5_000_000,
            default_settings(),
        );

        h.router.submit("c1", "hi".to_string(), None).await.unwrap();

        match next_event(&mut h.events).await {
            RouterEvent::AgentReply { content, model_id, .. } => {
                assert_eq!(content, "real answer");
                assert_eq!(model_id, "cheap/b");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
