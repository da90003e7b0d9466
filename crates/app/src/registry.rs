use std::{collections::HashSet, fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use sns_trigger_core::TriggerDescriptor;
use thiserror::Error;
use tokio::sync::Mutex;

/// Activation state of a configured trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Inactive,
    Active,
}

/// A trigger together with its lifecycle.
///
/// The lifecycle lock also serializes storage access of transitions and drains.
pub struct TriggerEntry {
    descriptor: TriggerDescriptor,
    enabled: bool,
    lifecycle: Mutex<Lifecycle>,
}

impl TriggerEntry {
    pub fn new(descriptor: TriggerDescriptor, enabled: bool) -> Self {
        Self {
            descriptor,
            enabled,
            lifecycle: Mutex::new(Lifecycle::Inactive),
        }
    }

    pub fn descriptor(&self) -> &TriggerDescriptor {
        &self.descriptor
    }

    /// Whether the trigger should be activated on startup.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }

    pub async fn current(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }
}

/// Failure to resolve a webhook path to a trigger.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Couldn't find the project with id: {0}")]
    UnknownProject(String),
    #[error("Couldn't find build type with id: {0}")]
    UnknownBuildType(String),
    #[error("There are no suitable trigger in the build: {0}")]
    UnknownTrigger(String),
}

/// Errors raised while loading trigger definitions.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read trigger definitions from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse trigger definitions: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("trigger uuid '{0}' is defined more than once")]
    DuplicateUuid(String),
}

#[derive(Debug, Deserialize)]
struct TriggerDefinition {
    #[serde(flatten)]
    descriptor: TriggerDescriptor,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// The triggers served by this process.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    entries: Arc<Vec<Arc<TriggerEntry>>>,
}

impl TriggerRegistry {
    pub fn new(entries: Vec<TriggerEntry>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.descriptor.trigger_uuid.clone()) {
                return Err(RegistryError::DuplicateUuid(
                    entry.descriptor.trigger_uuid.clone(),
                ));
            }
        }
        Ok(Self {
            entries: Arc::new(entries.into_iter().map(Arc::new).collect()),
        })
    }

    /// Reads a JSON array of trigger definitions.
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        let definitions: Vec<TriggerDefinition> = serde_json::from_str(raw)?;
        Self::new(
            definitions
                .into_iter()
                .map(|definition| TriggerEntry::new(definition.descriptor, definition.enabled))
                .collect(),
        )
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<TriggerEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolves the trigger addressed by a webhook path.
    pub fn resolve(
        &self,
        project_id: &str,
        build_type_id: &str,
        trigger_uuid: &str,
    ) -> Result<Arc<TriggerEntry>, LookupError> {
        let in_project: Vec<_> = self
            .entries()
            .filter(|entry| entry.descriptor.project_id == project_id)
            .collect();
        if in_project.is_empty() {
            return Err(LookupError::UnknownProject(project_id.to_string()));
        }

        let in_build_type: Vec<_> = in_project
            .into_iter()
            .filter(|entry| entry.descriptor.build_type_id == build_type_id)
            .collect();
        if in_build_type.is_empty() {
            return Err(LookupError::UnknownBuildType(build_type_id.to_string()));
        }

        in_build_type
            .into_iter()
            .find(|entry| entry.descriptor.trigger_uuid == trigger_uuid)
            .cloned()
            .ok_or_else(|| LookupError::UnknownTrigger(build_type_id.to_string()))
    }

    pub fn find_by_uuid(&self, trigger_uuid: &str) -> Option<Arc<TriggerEntry>> {
        self.entries()
            .find(|entry| entry.descriptor.trigger_uuid == trigger_uuid)
            .cloned()
    }
}
