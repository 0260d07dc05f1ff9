//! Keeps the station's descriptor registry in step with the roster table.

use anyhow::Result;
use headcount_attendance::SqliteStore;
use headcount_core::{DescriptorRegistry, EnrolledStudent};
use std::sync::Arc;

/// Load active students into `registry`. Returns the indexed count.
pub async fn load_into(store: &SqliteStore, registry: &DescriptorRegistry) -> Result<usize> {
    let roster: Vec<EnrolledStudent> = store
        .active_students()
        .await?
        .into_iter()
        .map(EnrolledStudent::from)
        .collect();
    Ok(registry.load(&roster))
}

/// Reloads the registry when another process enrolls or removes a student.
pub struct RosterWatch {
    store: SqliteStore,
    registry: Arc<DescriptorRegistry>,
    revision: i64,
}

impl RosterWatch {
    /// Load the registry and remember the revision it reflects.
    pub async fn start(store: SqliteStore, registry: Arc<DescriptorRegistry>) -> Result<Self> {
        // Read the revision first: a change racing the load is picked up
        // by the next refresh.
        let revision = store.roster_revision().await?;
        load_into(&store, &registry).await?;
        Ok(Self {
            store,
            registry,
            revision,
        })
    }

    /// Reload if the roster moved since the last load. Returns whether it did.
    pub async fn refresh(&mut self) -> Result<bool> {
        let revision = self.store.roster_revision().await?;
        if revision == self.revision {
            return Ok(false);
        }
        let indexed = load_into(&self.store, &self.registry).await?;
        tracing::info!(
            from = self.revision,
            to = revision,
            indexed,
            "roster changed; registry reloaded"
        );
        self.revision = revision;
        Ok(true)
    }
}
