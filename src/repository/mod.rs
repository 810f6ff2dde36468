//! Remisión persistence boundary.
//!
//! [`RemisionRepository`] is the contract the engines rely on: reads, atomic
//! partial updates guarded by an optimistic `version` check, an append-only
//! audit log and a live change feed. [`InMemoryRepository`] keeps everything
//! in process; [`FileRepository`] persists one remisión as a JSON document
//! next to its audit journal and is what the CLI uses.

mod file;

use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};

use crate::error::RepositoryError;
use crate::state_machine::{AuditEntry, Remision, RemisionPatch};
use crate::validation::validate_remision;

pub use file::FileRepository;

const EVENT_CAPACITY: usize = 256;

/// Change notification delivered to subscribers after a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum RemisionEvent {
    Created(Remision),
    Updated(Remision),
}

pub trait RemisionRepository: Send + Sync {
    /// Store a new remisión. There is no delete counterpart.
    fn insert(
        &self,
        remision: Remision,
    ) -> impl Future<Output = Result<Remision, RepositoryError>> + Send;

    fn read(&self, id: &str) -> impl Future<Output = Result<Remision, RepositoryError>> + Send;

    /// Apply `patch` if the stored version still equals `expected_version`.
    fn write(
        &self,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
    ) -> impl Future<Output = Result<Remision, RepositoryError>> + Send;

    fn append_audit(
        &self,
        entry: AuditEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply `patch` and append `audit` as one unit: either both land or neither does.
    fn commit(
        &self,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
        audit: AuditEntry,
    ) -> impl Future<Output = Result<Remision, RepositoryError>> + Send;

    fn audit_log(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Vec<AuditEntry>, RepositoryError>> + Send;

    fn subscribe(&self) -> broadcast::Receiver<RemisionEvent>;
}

#[derive(Default)]
struct Tables {
    remisiones: HashMap<String, Remision>,
    audit: Vec<AuditEntry>,
}

/// Process-local repository backed by a lock-guarded map.
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
    events: broadcast::Sender<RemisionEvent>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            events,
        }
    }

    fn publish(&self, event: RemisionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn apply_guarded(
        tables: &mut Tables,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
    ) -> Result<Remision, RepositoryError> {
        let current = tables
            .remisiones
            .get(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        let updated = guarded_update(current, expected_version, patch)?;
        tables.remisiones.insert(id.to_string(), updated.clone());
        Ok(updated)
    }
}

/// Version check, patch, validation and version bump shared by every backend.
/// Returns the new state; `current` is left untouched.
pub(crate) fn guarded_update(
    current: &Remision,
    expected_version: u64,
    patch: &RemisionPatch,
) -> Result<Remision, RepositoryError> {
    if current.version != expected_version {
        tracing::debug!(
            remision = %current.id,
            expected_version,
            actual_version = current.version,
            "Rejected stale write"
        );
        return Err(RepositoryError::ConcurrentModification {
            id: current.id.clone(),
            expected_version,
        });
    }

    let mut updated = current.clone();
    patch.apply(&mut updated);
    validate_remision(&updated)?;
    updated.version += 1;
    updated.updated_at = Utc::now();
    Ok(updated)
}

impl RemisionRepository for InMemoryRepository {
    async fn insert(&self, remision: Remision) -> Result<Remision, RepositoryError> {
        validate_remision(&remision)?;
        let mut tables = self.tables.write().await;
        if tables.remisiones.contains_key(&remision.id) {
            return Err(RepositoryError::AlreadyExists(remision.id));
        }
        tables
            .remisiones
            .insert(remision.id.clone(), remision.clone());
        drop(tables);
        self.publish(RemisionEvent::Created(remision.clone()));
        Ok(remision)
    }

    async fn read(&self, id: &str) -> Result<Remision, RepositoryError> {
        self.tables
            .read()
            .await
            .remisiones
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn write(
        &self,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
    ) -> Result<Remision, RepositoryError> {
        let mut tables = self.tables.write().await;
        let updated = Self::apply_guarded(&mut tables, id, expected_version, patch)?;
        drop(tables);
        self.publish(RemisionEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.remisiones.contains_key(&entry.remision_id) {
            return Err(RepositoryError::NotFound(entry.remision_id));
        }
        tables.audit.push(entry);
        Ok(())
    }

    async fn commit(
        &self,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
        audit: AuditEntry,
    ) -> Result<Remision, RepositoryError> {
        let mut tables = self.tables.write().await;
        let updated = Self::apply_guarded(&mut tables, id, expected_version, patch)?;
        tables.audit.push(audit);
        drop(tables);

        tracing::debug!(
            remision = id,
            version = updated.version,
            estado = %updated.estado,
            "Committed remision update"
        );
        self.publish(RemisionEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn audit_log(&self, id: &str) -> Result<Vec<AuditEntry>, RepositoryError> {
        let tables = self.tables.read().await;
        if !tables.remisiones.contains_key(id) {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(tables
            .audit
            .iter()
            .filter(|entry| entry.remision_id == id)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemisionEvent> {
        self.events.subscribe()
    }
}
