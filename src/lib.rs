//! # Switchboard
//!
//! A multi-agent conversation orchestrator with tiered model selection and
//! budget enforcement.
//!
//! This library provides:
//! - An HTTP API for posting messages, inspecting conversations, and
//!   streaming events
//! - A router that walks messages across a roster of agents, guarded
//!   against runaway loops
//! - A model cascade that picks the cheapest viable model and escalates
//!   tier by tier
//! - A budget ledger that authorizes spend before each call and commits
//!   the real cost after it
//!
//! ## Architecture
//!
//! ```text
//!   user message
//!        │
//!        ▼
//!  ┌───────────┐   resolve    ┌────────────┐
//!  │  Router   │─────────────▶│  Registry  │  (agents.yaml, reloadable)
//!  │ (per-conv │              └────────────┘
//!  │  worker)  │   pick       ┌────────────┐   probe   ┌──────────┐
//!  │           │─────────────▶│  Cascade   │──────────▶│  Ledger  │
//!  └─────┬─────┘              └─────┬──────┘           └──────────┘
//!        │                          │ tiers.yaml (reloadable)
//!        ▼                          ▼
//!   agent reply ◀────────── model call (OpenRouter)
//! ```
//!
//! ## Turn Flow
//! 1. Receive a user message via the API
//! 2. Admit the hop past the anti-recursion guard
//! 3. Cascade over catalog tiers; authorize each attempt with the ledger
//! 4. Call the model, commit the actual cost
//! 5. Follow the reply's `[handoff: ...]` directive or answer the user
//!
//! ## Modules
//! - `router`: conversation workers, routing, guards
//! - `cascade`: per-turn model selection over catalog tiers
//! - `budget`: ledger, pricing arithmetic, durable audit stores
//! - `catalog` / `registry`: reloadable tier and agent configuration

pub mod api;
pub mod budget;
pub mod cascade;
pub mod catalog;
pub mod config;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod registry;
pub mod router;

pub use config::Config;
pub use router::Router;
