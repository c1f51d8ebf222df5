//! Tier catalog - ordered cost tiers of language models.
//!
//! Tiers are declared cheapest-first in a YAML file; the order of models
//! within a tier is the priority order the cascade walks. The catalog is
//! read-mostly: a reload swaps the whole snapshot atomically, so a cascade
//! that started before the reload keeps selecting from the snapshot it
//! started with.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read tier config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse tier config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid tier config: {0}")]
    Invalid(String),
}

/// A concrete model a tier can serve.
///
/// Prices are per single token. The config file declares them per 1,000
/// tokens (the convention provider pricing pages use); conversion happens
/// at load time.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: String,
    /// Name of the tier this descriptor was loaded under.
    pub tier: String,
    pub price_per_input_token: f64,
    pub price_per_output_token: f64,
    pub max_tokens: u64,
    pub capability_tags: Vec<String>,
}

/// One cost tier, models in declared priority order.
#[derive(Debug, Clone)]
pub struct TierEntry {
    pub name: String,
    pub models: Vec<ModelDescriptor>,
}

/// Immutable catalog view.
///
/// Selections hold one snapshot for their whole lifetime, which is what
/// makes `pick(tier, attempt)` deterministic even across reloads.
#[derive(Debug)]
pub struct CatalogSnapshot {
    tiers: Vec<TierEntry>,
}

impl CatalogSnapshot {
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    pub fn tiers(&self) -> &[TierEntry] {
        &self.tiers
    }

    /// Index of a tier by name, in the declared (cheapest-first) order.
    pub fn tier_index(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.name == name)
    }

    pub fn tier_name(&self, idx: usize) -> Option<&str> {
        self.tiers.get(idx).map(|t| t.name.as_str())
    }

    /// The model ranked `attempt`-th within a tier, or `None` when the
    /// attempt index runs past the tier's model list (the tier itself
    /// escalates at that point).
    pub fn model(&self, tier_idx: usize, attempt: usize) -> Option<&ModelDescriptor> {
        self.tiers.get(tier_idx).and_then(|t| t.models.get(attempt))
    }

    /// Cheapest model of a tier by combined per-token price. Used to decide
    /// whether an escalation into this tier could be authorized at all.
    pub fn cheapest(&self, tier_idx: usize) -> Option<&ModelDescriptor> {
        self.tiers.get(tier_idx).and_then(|t| {
            t.models.iter().min_by(|a, b| {
                let pa = a.price_per_input_token + a.price_per_output_token;
                let pb = b.price_per_input_token + b.price_per_output_token;
                pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
            })
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TierFile {
    tiers: Vec<TierFileEntry>,
}

#[derive(Debug, Deserialize)]
struct TierFileEntry {
    name: String,
    models: Vec<TierFileModel>,
}

#[derive(Debug, Deserialize)]
struct TierFileModel {
    id: String,
    provider: String,
    /// USD per 1,000 input tokens.
    input_per_1k: f64,
    /// USD per 1,000 output tokens.
    output_per_1k: f64,
    #[serde(default = "default_max_tokens")]
    max_tokens: u64,
    #[serde(default)]
    capabilities: Vec<String>,
}

fn default_max_tokens() -> u64 {
    4096
}

fn parse(text: &str) -> Result<CatalogSnapshot, CatalogError> {
    let file: TierFile = serde_yaml::from_str(text)?;

    if file.tiers.is_empty() {
        return Err(CatalogError::Invalid("no tiers declared".to_string()));
    }

    let mut tiers = Vec::with_capacity(file.tiers.len());
    for entry in file.tiers {
        if entry.name.is_empty() {
            return Err(CatalogError::Invalid("tier with empty name".to_string()));
        }
        if tiers.iter().any(|t: &TierEntry| t.name == entry.name) {
            return Err(CatalogError::Invalid(format!(
                "duplicate tier name: {}",
                entry.name
            )));
        }
        if entry.models.is_empty() {
            return Err(CatalogError::Invalid(format!(
                "tier {} has no models",
                entry.name
            )));
        }

        let mut models = Vec::with_capacity(entry.models.len());
        for m in entry.models {
            if m.id.is_empty() {
                return Err(CatalogError::Invalid(format!(
                    "tier {} has a model with an empty id",
                    entry.name
                )));
            }
            if models.iter().any(|d: &ModelDescriptor| d.id == m.id) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate model {} in tier {}",
                    m.id, entry.name
                )));
            }
            if !m.input_per_1k.is_finite()
                || !m.output_per_1k.is_finite()
                || m.input_per_1k < 0.0
                || m.output_per_1k < 0.0
            {
                return Err(CatalogError::Invalid(format!(
                    "model {} has an invalid price",
                    m.id
                )));
            }
            models.push(ModelDescriptor {
                id: m.id,
                provider: m.provider,
                tier: entry.name.clone(),
                price_per_input_token: m.input_per_1k / 1000.0,
                price_per_output_token: m.output_per_1k / 1000.0,
                max_tokens: m.max_tokens,
                capability_tags: m.capabilities,
            });
        }

        tiers.push(TierEntry {
            name: entry.name,
            models,
        });
    }

    Ok(CatalogSnapshot { tiers })
}

// ─────────────────────────────────────────────────────────────────────────────
// Reloadable catalog
// ─────────────────────────────────────────────────────────────────────────────

/// Reloadable tier catalog backed by a YAML file.
pub struct TierCatalog {
    path: PathBuf,
    inner: RwLock<Arc<CatalogSnapshot>>,
}

impl TierCatalog {
    /// Load the catalog from disk. Called once at startup.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let snapshot = Self::read_snapshot(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build a catalog from YAML text, without a backing file. Reload is a
    /// no-op for catalogs created this way.
    pub fn from_yaml(text: &str) -> Result<Self, CatalogError> {
        let snapshot = parse(text)?;
        Ok(Self {
            path: PathBuf::new(),
            inner: RwLock::new(Arc::new(snapshot)),
        })
    }

    fn read_snapshot(path: &Path) -> Result<CatalogSnapshot, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        parse(&text)
    }

    /// Re-read the backing file and swap the snapshot in one step. Readers
    /// either see the old catalog or the new one, never a mix.
    pub async fn reload(&self) -> Result<(), CatalogError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let snapshot = Self::read_snapshot(&self.path)?;
        let mut inner = self.inner.write().await;
        *inner = Arc::new(snapshot);
        tracing::info!("Reloaded tier catalog from {}", self.path.display());
        Ok(())
    }

    /// Current snapshot. Cheap to call; clones an `Arc`.
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.inner.read().await.clone()
    }
}

/// Shared catalog handle.
pub type SharedTierCatalog = Arc<TierCatalog>;
