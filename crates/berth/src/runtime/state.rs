//! Container state persistence.

use berth_common::{BerthError, BerthPaths, BerthResult};

use super::container::ContainerRecord;

/// Manages `state.json` of each container.
#[derive(Debug, Clone)]
pub struct StateManager {
    paths: BerthPaths,
}

impl StateManager {
    /// Create a new state manager.
    #[must_use]
    pub const fn new(paths: BerthPaths) -> Self {
        Self { paths }
    }

    /// Save container state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, record: &ContainerRecord) -> BerthResult<()> {
        let path = self.paths.container_state(record.id.as_str());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Replaced atomically: readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(
            container_id = %record.id,
            status = %record.status,
            "Saved container state"
        );

        Ok(())
    }

    /// Load container state.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ContainerNotFound`] if there is no state file.
    pub fn load(&self, container_id: &str) -> BerthResult<ContainerRecord> {
        let path = self.paths.container_state(container_id);

        if !path.exists() {
            return Err(BerthError::ContainerNotFound {
                id: container_id.to_string(),
            });
        }

        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Delete the container directory with its state and log.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn delete(&self, container_id: &str) -> BerthResult<()> {
        let container_dir = self.paths.container(container_id);

        if container_dir.exists() {
            std::fs::remove_dir_all(&container_dir)?;
            tracing::debug!(container_id = %container_id, "Deleted container state");
        }

        Ok(())
    }

    /// Load every persisted container, skipping unreadable entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory cannot be read.
    pub fn list(&self) -> BerthResult<Vec<ContainerRecord>> {
        let dir = self.paths.containers();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&name) {
                Ok(record) => records.push(record),
                Err(BerthError::ContainerNotFound { .. }) => {}
                Err(e) => tracing::warn!(container_id = %name, error = %e, "Skipping unreadable state"),
            }
        }

        records.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(records)
    }

    /// Resolve a full id or unique prefix among persisted containers.
    ///
    /// # Errors
    ///
    /// Returns not-found or ambiguous-prefix errors.
    pub fn resolve(&self, id_or_prefix: &str) -> BerthResult<ContainerRecord> {
        let mut matches: Vec<ContainerRecord> = self
            .list()?
            .into_iter()
            .filter(|r| !id_or_prefix.is_empty() && r.id.as_str().starts_with(id_or_prefix))
            .collect();

        match matches.len() {
            0 => Err(BerthError::ContainerNotFound {
                id: id_or_prefix.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            n => Err(BerthError::AmbiguousId {
                prefix: id_or_prefix.to_string(),
                matches: n,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use berth_common::ContainerId;
    use tempfile::tempdir;

    use super::*;
    use crate::runtime::container::ContainerConfig;

    fn record(id: &str) -> ContainerRecord {
        ContainerRecord::new(
            ContainerId::new(id.repeat(64 / id.len())).unwrap(),
            ContainerConfig::new("base", vec!["true".into()]),
        )
    }

    #[test]
    fn save_and_load_state() {
        let temp = tempdir().unwrap();
        let manager = StateManager::new(BerthPaths::with_root(temp.path()));

        let state = record("ab");
        manager.save(&state).unwrap();

        let loaded = manager.load(state.id.as_str()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn list_and_resolve_prefixes() {
        let temp = tempdir().unwrap();
        let manager = StateManager::new(BerthPaths::with_root(temp.path()));

        manager.save(&record("ab")).unwrap();
        manager.save(&record("ac")).unwrap();

        assert_eq!(manager.list().unwrap().len(), 2);
        assert!(manager.resolve("aba").is_ok());
        assert!(matches!(
            manager.resolve("a"),
            Err(BerthError::AmbiguousId { matches: 2, .. })
        ));
        assert!(matches!(
            manager.resolve("ff"),
            Err(BerthError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn delete_state() {
        let temp = tempdir().unwrap();
        let manager = StateManager::new(BerthPaths::with_root(temp.path()));

        let state = record("cd");
        manager.save(&state).unwrap();
        manager.delete(state.id.as_str()).unwrap();
        assert!(manager.load(state.id.as_str()).is_err());
    }
}
