use std::collections::BTreeMap;

use crate::definition::MigrationDefinition;
use crate::{RegistrationError, TransitionStatus};

/// Ordered, validated set of migration definitions.
///
/// Definitions are kept sorted by `(timestamp, description)`; two versions may not
/// share a timestamp because the ordering between them would be undefined.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    definitions: Vec<MigrationDefinition>,
}

impl MigrationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns the first [`RegistrationError`] raised while registering.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = MigrationDefinition>,
    ) -> Result<Self, RegistrationError> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// # Errors
    /// Returns [`RegistrationError::DuplicateVersion`] when the version id or the
    /// timestamp is already registered.
    pub fn register(&mut self, definition: MigrationDefinition) -> Result<(), RegistrationError> {
        let version_id = definition.version_id();
        if let Some(existing) = self.definitions.iter().find(|candidate| {
            candidate.version_id() == version_id
                || candidate.version.timestamp() == definition.version.timestamp()
        }) {
            return Err(RegistrationError::DuplicateVersion {
                version_id,
                existing: existing.version_id(),
            });
        }

        let position = self
            .definitions
            .partition_point(|candidate| candidate.version < definition.version);
        self.definitions.insert(position, definition);
        Ok(())
    }

    #[must_use]
    pub fn list(&self) -> &[MigrationDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    #[must_use]
    pub fn get(&self, version_id: &str) -> Option<&MigrationDefinition> {
        self.definitions
            .iter()
            .find(|definition| definition.version_id() == version_id)
    }

    fn position(&self, version_id: &str) -> Option<usize> {
        self.definitions
            .iter()
            .position(|definition| definition.version_id() == version_id)
    }

    /// Versions ordered strictly before `version_id`; empty for unknown ids.
    #[must_use]
    pub fn predecessors(&self, version_id: &str) -> &[MigrationDefinition] {
        match self.position(version_id) {
            Some(index) => &self.definitions[..index],
            None => &[],
        }
    }

    /// Versions ordered strictly after `version_id`; empty for unknown ids.
    #[must_use]
    pub fn successors(&self, version_id: &str) -> &[MigrationDefinition] {
        match self.position(version_id) {
            Some(index) => &self.definitions[index + 1..],
            None => &[],
        }
    }

    /// First version in order whose state is not `MIGRATED`.
    #[must_use]
    pub fn next_pending(
        &self,
        states: &BTreeMap<String, TransitionStatus>,
    ) -> Option<&MigrationDefinition> {
        self.definitions.iter().find(|definition| {
            states.get(&definition.version_id()).copied().unwrap_or_default()
                != TransitionStatus::Migrated
        })
    }
}
