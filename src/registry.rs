//! Agent registry - the roster of conversational agents.
//!
//! An agent is a named configuration combining:
//! - Capability tags the router matches handoff targets against
//! - A preferred cost tier the cascade starts from
//! - An allow-list of recipients it may hand off to
//! - Instructions that become its system prompt
//!
//! Declaration order in the config file is registry priority; the router
//! uses it to break ties between equally qualified candidates. Reload
//! swaps the whole roster atomically.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read agent config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse agent config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid agent config: {0}")]
    Invalid(String),
}

/// Who an agent is allowed to hand off to. Handing back to the user is
/// always permitted; the list only constrains agent-to-agent hops.
#[derive(Debug, Clone)]
pub enum AllowedRecipients {
    Any,
    Only(HashSet<String>),
}

impl AllowedRecipients {
    pub fn permits(&self, agent_id: &str) -> bool {
        if agent_id == "user" {
            return true;
        }
        match self {
            AllowedRecipients::Any => true,
            AllowedRecipients::Only(ids) => ids.contains(agent_id),
        }
    }
}

/// One registered agent.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: String,
    pub display_name: String,
    pub capability_tags: Vec<String>,
    /// Tier the cascade starts from for this agent's turns.
    pub preferred_tier: String,
    pub allowed_recipients: AllowedRecipients,
    /// System prompt for the agent's model calls.
    pub instructions: String,
}

/// Immutable roster snapshot; the router resolves against one snapshot per
/// turn so a reload never changes a turn mid-flight.
#[derive(Debug)]
pub struct RegistryTable {
    agents: Vec<AgentDescriptor>,
    by_id: HashMap<String, usize>,
    entry: String,
}

impl RegistryTable {
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn resolve(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.by_id.get(agent_id).map(|&idx| &self.agents[idx])
    }

    /// Agents carrying a capability tag, in declaration (priority) order.
    pub fn candidates(&self, capability_tag: &str) -> Vec<&AgentDescriptor> {
        self.agents
            .iter()
            .filter(|a| a.capability_tags.iter().any(|t| t == capability_tag))
            .collect()
    }

    /// Declaration position; lower wins ties.
    pub fn priority(&self, agent_id: &str) -> Option<usize> {
        self.by_id.get(agent_id).copied()
    }

    /// The agent user messages land on when they name no recipient.
    pub fn entry_agent(&self) -> &AgentDescriptor {
        // Validated at load time: entry always resolves.
        &self.agents[self.by_id[&self.entry]]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File format
// ─────────────────────────────────────────────────────────────────────────────

/// `allowed_recipients` accepts either the keyword `any` or an explicit
/// list of agent ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RecipientsSpec {
    Keyword(String),
    List(Vec<String>),
}

impl Default for RecipientsSpec {
    fn default() -> Self {
        RecipientsSpec::Keyword("any".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entry_agent: Option<String>,
    agents: Vec<AgentFileEntry>,
}

#[derive(Debug, Deserialize)]
struct AgentFileEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    preferred_tier: String,
    #[serde(default)]
    allowed_recipients: RecipientsSpec,
    #[serde(default)]
    instructions: String,
}

fn parse(text: &str) -> Result<RegistryTable, RegistryError> {
    let file: RegistryFile = serde_yaml::from_str(text)?;

    if file.agents.is_empty() {
        return Err(RegistryError::Invalid("no agents declared".to_string()));
    }

    let declared: HashSet<&str> = file.agents.iter().map(|a| a.id.as_str()).collect();

    let mut agents = Vec::with_capacity(file.agents.len());
    let mut by_id = HashMap::with_capacity(file.agents.len());
    for entry in &file.agents {
        if entry.id.is_empty() {
            return Err(RegistryError::Invalid("agent with empty id".to_string()));
        }
        if entry.id == "user" {
            return Err(RegistryError::Invalid(
                "agent id 'user' is reserved".to_string(),
            ));
        }
        if by_id.contains_key(&entry.id) {
            return Err(RegistryError::Invalid(format!(
                "duplicate agent id: {}",
                entry.id
            )));
        }

        let allowed_recipients = match &entry.allowed_recipients {
            RecipientsSpec::Keyword(word) if word == "any" => AllowedRecipients::Any,
            RecipientsSpec::Keyword(word) => {
                return Err(RegistryError::Invalid(format!(
                    "agent {}: unknown recipients keyword {:?} (expected \"any\" or a list)",
                    entry.id, word
                )));
            }
            RecipientsSpec::List(ids) => {
                for id in ids {
                    if id != "user" && !declared.contains(id.as_str()) {
                        return Err(RegistryError::Invalid(format!(
                            "agent {}: allowed recipient {} is not a declared agent",
                            entry.id, id
                        )));
                    }
                }
                AllowedRecipients::Only(ids.iter().cloned().collect())
            }
        };

        by_id.insert(entry.id.clone(), agents.len());
        agents.push(AgentDescriptor {
            id: entry.id.clone(),
            display_name: entry.display_name.clone().unwrap_or_else(|| entry.id.clone()),
            capability_tags: entry.capabilities.clone(),
            preferred_tier: entry.preferred_tier.clone(),
            allowed_recipients,
            instructions: entry.instructions.clone(),
        });
    }

    let entry = match file.entry_agent {
        Some(id) => {
            if !by_id.contains_key(&id) {
                return Err(RegistryError::Invalid(format!(
                    "entry_agent {} is not a declared agent",
                    id
                )));
            }
            id
        }
        None => agents[0].id.clone(),
    };

    Ok(RegistryTable {
        agents,
        by_id,
        entry,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Reloadable registry
// ─────────────────────────────────────────────────────────────────────────────

/// Reloadable agent roster backed by a YAML file.
pub struct AgentRegistry {
    path: PathBuf,
    inner: RwLock<Arc<RegistryTable>>,
}

impl AgentRegistry {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let table = Self::read_table(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(Arc::new(table)),
        })
    }

    /// Build a registry from YAML text, without a backing file.
    pub fn from_yaml(text: &str) -> Result<Self, RegistryError> {
        let table = parse(text)?;
        Ok(Self {
            path: PathBuf::new(),
            inner: RwLock::new(Arc::new(table)),
        })
    }

    fn read_table(path: &Path) -> Result<RegistryTable, RegistryError> {
        let text = std::fs::read_to_string(path)?;
        parse(&text)
    }

    /// Re-read the backing file and swap the roster in one step.
    pub async fn reload(&self) -> Result<(), RegistryError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let table = Self::read_table(&self.path)?;
        let mut inner = self.inner.write().await;
        *inner = Arc::new(table);
        tracing::info!("Reloaded agent registry from {}", self.path.display());
        Ok(())
    }

    pub async fn snapshot(&self) -> Arc<RegistryTable> {
        self.inner.read().await.clone()
    }
}

/// Shared registry handle.
pub type SharedAgentRegistry = Arc<AgentRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ROSTER_YAML: &str = r#"
entry_agent: communicator
agents:
  - id: communicator
    display_name: Communicator
    capabilities: [dialogue, summarization]
    preferred_tier: cheap
    allowed_recipients: any
    instructions: You talk to the user and delegate research.
  - id: researcher
    capabilities: [research]
    preferred_tier: standard
    allowed_recipients: [fact_checker, communicator]
    instructions: You dig up sources.
  - id: fact_checker
    capabilities: [research, verification]
    preferred_tier: standard
    allowed_recipients: [communicator]
    instructions: You verify claims.
"#;

    #[test]
    fn test_resolve_and_declaration_priority() {
        let table = parse(ROSTER_YAML).unwrap();
        assert_eq!(table.len(), 3);

        let researcher = table.resolve("researcher").unwrap();
        assert_eq!(researcher.preferred_tier, "standard");
        assert_eq!(researcher.display_name, "researcher"); // defaulted from id

        assert_eq!(table.priority("communicator"), Some(0));
        assert_eq!(table.priority("fact_checker"), Some(2));
        assert!(table.resolve("nobody").is_none());
        assert_eq!(table.priority("nobody"), None);
    }

    #[test]
    fn test_candidates_keep_declaration_order() {
        let table = parse(ROSTER_YAML).unwrap();
        let research: Vec<&str> = table
            .candidates("research")
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(research, vec!["researcher", "fact_checker"]);
        assert!(table.candidates("no-such-tag").is_empty());
    }

    #[test]
    fn test_recipient_permissions() {
        let table = parse(ROSTER_YAML).unwrap();

        let communicator = table.resolve("communicator").unwrap();
        assert!(communicator.allowed_recipients.permits("researcher"));

        let researcher = table.resolve("researcher").unwrap();
        assert!(researcher.allowed_recipients.permits("fact_checker"));
        assert!(!researcher.allowed_recipients.permits("researcher"));

        // Ending the conversation is always allowed.
        let fact_checker = table.resolve("fact_checker").unwrap();
        assert!(fact_checker.allowed_recipients.permits("user"));
    }

    #[test]
    fn test_entry_agent_explicit_and_defaulted() {
        let table = parse(ROSTER_YAML).unwrap();
        assert_eq!(table.entry_agent().id, "communicator");

        let no_entry = r#"
agents:
  - id: solo
    preferred_tier: cheap
"#;
        let table = parse(no_entry).unwrap();
        assert_eq!(table.entry_agent().id, "solo");
    }

    #[test]
    fn test_rejects_invalid_rosters() {
        assert!(matches!(
            parse("agents: []"),
            Err(RegistryError::Invalid(_))
        ));

        let dup = r#"
agents:
  - { id: a, preferred_tier: cheap }
  - { id: a, preferred_tier: cheap }
"#;
        assert!(matches!(parse(dup), Err(RegistryError::Invalid(_))));

        let reserved = r#"
agents:
  - { id: user, preferred_tier: cheap }
"#;
        assert!(matches!(parse(reserved), Err(RegistryError::Invalid(_))));

        let unknown_recipient = r#"
agents:
  - { id: a, preferred_tier: cheap, allowed_recipients: [ghost] }
"#;
        assert!(matches!(
            parse(unknown_recipient),
            Err(RegistryError::Invalid(_))
        ));

        let bad_keyword = r#"
agents:
  - { id: a, preferred_tier: cheap, allowed_recipients: all }
"#;
        assert!(matches!(
            parse(bad_keyword),
            Err(RegistryError::Invalid(_))
        ));

        let bad_entry = r#"
entry_agent: ghost
agents:
  - { id: a, preferred_tier: cheap }
"#;
        assert!(matches!(parse(bad_entry), Err(RegistryError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_reload_swaps_roster_atomically() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROSTER_YAML.as_bytes()).unwrap();
        file.flush().unwrap();

        let registry = AgentRegistry::load(file.path()).unwrap();
        let before = registry.snapshot().await;
        assert_eq!(before.len(), 3);

        let replacement = r#"
agents:
  - { id: solo, preferred_tier: cheap }
"#;
        std::fs::write(file.path(), replacement).unwrap();
        registry.reload().await.unwrap();

        let after = registry.snapshot().await;
        assert_eq!(after.len(), 1);
        assert_eq!(after.entry_agent().id, "solo");

        // A turn resolving against the old snapshot is unaffected.
        assert_eq!(before.len(), 3);
        assert!(before.resolve("researcher").is_some());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_roster() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROSTER_YAML.as_bytes()).unwrap();
        file.flush().unwrap();

        let registry = AgentRegistry::load(file.path()).unwrap();
        std::fs::write(file.path(), "agents: []").unwrap();
        assert!(registry.reload().await.is_err());

        let current = registry.snapshot().await;
        assert_eq!(current.len(), 3);
    }
}
