//! Workload spec model and the spec mutator.
//!
//! A [`WorkloadSpec`] is what the control plane hands back: a [`SpecDraft`]
//! body plus server-assigned fields. [`mutate`] turns a registered spec into a
//! fresh draft with the requested [`SpecChange`]s applied. Server-assigned
//! fields cannot leak into a draft because the draft type has no slot for
//! them; unknown keys carried in `extra` are filtered against
//! [`SERVER_ASSIGNED_FIELDS`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, RolloutError};
use crate::types::SpecId;

/// Fields owned by the store. Registering a draft that carries any of them is rejected.
pub const SERVER_ASSIGNED_FIELDS: &[&str] = &[
    "spec_id",
    "revision",
    "status",
    "requires_attributes",
    "compatibilities",
    "registered_at",
    "registered_by",
    "placement_constraints",
    "tags",
];

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(default = "default_essential")]
    pub essential: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Port mappings, log configuration and anything else the orchestrator
    /// does not interpret. Ordered so serialization is deterministic.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_essential() -> bool {
    true
}

impl ContainerDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cpu: None,
            memory: None,
            essential: true,
            environment: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// The client-authored body of a workload spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecDraft {
    pub family: String,
    pub containers: Vec<ContainerDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SpecDraft {
    pub fn new(family: impl Into<String>, containers: Vec<ContainerDefinition>) -> Self {
        Self {
            family: family.into(),
            containers,
            cpu: None,
            memory: None,
            network_mode: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Names of server-assigned fields present in `extra`, if any.
    pub fn server_assigned_keys(&self) -> Vec<&str> {
        self.extra
            .keys()
            .map(|k| k.as_str())
            .filter(|k| SERVER_ASSIGNED_FIELDS.contains(k))
            .collect()
    }
}

/// A registered, immutable workload spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub spec_id: SpecId,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatibilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_attributes: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_by: Option<String>,
    #[serde(flatten)]
    pub draft: SpecDraft,
}

// ---------------------------------------------------------------------------
// SpecChange
// ---------------------------------------------------------------------------

/// A change to apply to one container of a spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpecChange {
    SetImage {
        container: String,
        image: String,
    },
    SetEnv {
        container: String,
        key: String,
        value: String,
    },
}

impl SpecChange {
    pub fn set_image(container: impl Into<String>, image: impl Into<String>) -> Self {
        SpecChange::SetImage {
            container: container.into(),
            image: image.into(),
        }
    }

    /// Parse a `KEY=VALUE` pair into an environment change.
    pub fn parse_env(container: impl Into<String>, pair: &str) -> Result<Self> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| RolloutError::InvalidChange(format!("expected KEY=VALUE, got '{pair}'")))?;
        if key.trim().is_empty() {
            return Err(RolloutError::InvalidChange(format!(
                "empty environment key in '{pair}'"
            )));
        }
        Ok(SpecChange::SetEnv {
            container: container.into(),
            key: key.trim().to_string(),
            value: value.to_string(),
        })
    }

    pub fn container(&self) -> &str {
        match self {
            SpecChange::SetImage { container, .. } | SpecChange::SetEnv { container, .. } => {
                container
            }
        }
    }

    /// The image this change points at, if it is an image change.
    pub fn image(&self) -> Option<&str> {
        match self {
            SpecChange::SetImage { image, .. } => Some(image),
            SpecChange::SetEnv { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Mutator
// ---------------------------------------------------------------------------

/// Build a new draft from `current` with `changes` applied.
///
/// Pure: no I/O, `current` is untouched. Every targeted container is checked
/// before anything is applied, so a bad container name never costs a spec
/// registration.
pub fn mutate(current: &WorkloadSpec, changes: &[SpecChange]) -> Result<SpecDraft> {
    if changes.is_empty() {
        return Err(RolloutError::InvalidChange("no changes requested".into()));
    }
    for change in changes {
        if current.draft.container(change.container()).is_none() {
            return Err(RolloutError::ContainerNotFound {
                container: change.container().to_string(),
                spec_id: current.spec_id.clone(),
            });
        }
        if let Some(image) = change.image() {
            if image.trim().is_empty() {
                return Err(RolloutError::InvalidChange("image reference is empty".into()));
            }
        }
    }

    let mut draft = current.draft.clone();
    draft
        .extra
        .retain(|k, _| !SERVER_ASSIGNED_FIELDS.contains(&k.as_str()));

    for change in changes {
        let Some(container) = draft
            .containers
            .iter_mut()
            .find(|c| c.name == change.container())
        else {
            continue;
        };
        match change {
            SpecChange::SetImage { image, .. } => container.image = image.trim().to_string(),
            SpecChange::SetEnv { key, value, .. } => {
                container.environment.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(draft)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
