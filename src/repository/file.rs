//! Single-remisión repository on the local filesystem.
//!
//! The entity lives in its JSON file and audit entries go to
//! `<file>.audit.jsonl`, one JSON object per line. Writers serialize through
//! `<file>.lock`, created exclusively, and every update re-reads the stored
//! `version` under that lock before anything is written. New contents are
//! staged in temp files and renamed into place.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::broadcast;

use super::{EVENT_CAPACITY, RemisionEvent, RemisionRepository, guarded_update};
use crate::error::RepositoryError;
use crate::state_machine::{AuditEntry, Remision, RemisionPatch};
use crate::validation::validate_remision;

/// Held while a writer owns `<file>.lock`. Dropping it releases the lock.
struct WriteLock {
    path: PathBuf,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not release lock");
        }
    }
}

pub struct FileRepository {
    path: PathBuf,
    audit_path: PathBuf,
    lock_path: PathBuf,
    events: broadcast::Sender<RemisionEvent>,
}

impl FileRepository {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            audit_path: with_suffix(&path, ".audit.jsonl"),
            lock_path: with_suffix(&path, ".lock"),
            path,
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    /// The stored remisión, whatever its id.
    pub async fn load(&self) -> Result<Remision, RepositoryError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| RepositoryError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    async fn load_id(&self, id: &str) -> Result<Remision, RepositoryError> {
        match self.load().await {
            Ok(remision) if remision.id == id => Ok(remision),
            Ok(_) | Err(RepositoryError::NotFound(_)) => {
                Err(RepositoryError::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn lock(&self) -> Result<WriteLock, RepositoryError> {
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await;
        match created {
            Ok(_) => Ok(WriteLock {
                path: self.lock_path.clone(),
            }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(RepositoryError::Busy(self.path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A writer that finds the lock taken has lost the race for `expected_version`.
    async fn lock_for_update(
        &self,
        id: &str,
        expected_version: u64,
    ) -> Result<WriteLock, RepositoryError> {
        match self.lock().await {
            Err(RepositoryError::Busy(_)) => {
                tracing::debug!(remision = id, expected_version, "Lock held by another writer");
                Err(RepositoryError::ConcurrentModification {
                    id: id.to_string(),
                    expected_version,
                })
            }
            other => other,
        }
    }

    async fn read_journal(&self) -> Result<Vec<u8>, RepositoryError> {
        match fs::read(&self.audit_path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage the new entity and/or the journal with `entry` appended, then
    /// rename both into place. Must be called with the write lock held.
    async fn persist(
        &self,
        remision: Option<&Remision>,
        entry: Option<&AuditEntry>,
    ) -> Result<(), RepositoryError> {
        let mut staged = Vec::with_capacity(2);
        if let Some(remision) = remision {
            let json = serde_json::to_vec_pretty(remision)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
            let tmp = with_suffix(&self.path, ".tmp");
            fs::write(&tmp, json).await?;
            staged.push((tmp, self.path.clone()));
        }
        if let Some(entry) = entry {
            let mut journal = self.read_journal().await?;
            if !journal.is_empty() && !journal.ends_with(b"\n") {
                journal.push(b'\n');
            }
            serde_json::to_writer(&mut journal, entry)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
            journal.push(b'\n');
            let tmp = with_suffix(&self.audit_path, ".tmp");
            fs::write(&tmp, journal).await?;
            staged.push((tmp, self.audit_path.clone()));
        }
        for (from, to) in staged {
            fs::rename(&from, &to).await?;
        }
        Ok(())
    }

    fn publish(&self, event: RemisionEvent) {
        let _ = self.events.send(event);
    }
}

impl RemisionRepository for FileRepository {
    async fn insert(&self, remision: Remision) -> Result<Remision, RepositoryError> {
        validate_remision(&remision)?;
        let _lock = self.lock().await?;
        if fs::try_exists(&self.path).await? {
            return Err(RepositoryError::AlreadyExists(remision.id));
        }
        self.persist(Some(&remision), None).await?;
        self.publish(RemisionEvent::Created(remision.clone()));
        Ok(remision)
    }

    async fn read(&self, id: &str) -> Result<Remision, RepositoryError> {
        self.load_id(id).await
    }

    async fn write(
        &self,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
    ) -> Result<Remision, RepositoryError> {
        let _lock = self.lock_for_update(id, expected_version).await?;
        let current = self.load_id(id).await?;
        let updated = guarded_update(&current, expected_version, patch)?;
        self.persist(Some(&updated), None).await?;
        self.publish(RemisionEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        let _lock = self.lock().await?;
        self.load_id(&entry.remision_id).await?;
        self.persist(None, Some(&entry)).await
    }

    async fn commit(
        &self,
        id: &str,
        expected_version: u64,
        patch: &RemisionPatch,
        audit: AuditEntry,
    ) -> Result<Remision, RepositoryError> {
        let _lock = self.lock_for_update(id, expected_version).await?;
        let current = self.load_id(id).await?;
        let updated = guarded_update(&current, expected_version, patch)?;
        self.persist(Some(&updated), Some(&audit)).await?;

        tracing::debug!(
            remision = id,
            version = updated.version,
            estado = %updated.estado,
            path = %self.path.display(),
            "Committed remision update"
        );
        self.publish(RemisionEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn audit_log(&self, id: &str) -> Result<Vec<AuditEntry>, RepositoryError> {
        self.load_id(id).await?;
        let journal = self.read_journal().await?;
        let mut entries = Vec::new();
        for line in journal.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: AuditEntry = serde_json::from_slice(line).map_err(|e| {
                RepositoryError::Corrupt(format!("{}: {e}", self.audit_path.display()))
            })?;
            if entry.remision_id == id {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn subscribe(&self) -> broadcast::Receiver<RemisionEvent> {
        self.events.subscribe()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::document::testing::MockStore;
    use crate::document::{AssemblerConfig, DocumentAssembler};
    use crate::error::TransitionError;
    use crate::orchestrator::RemisionOrchestrator;
    use crate::state_machine::{AuditAction, Estado, testing::remision_in};

    async fn seeded(dir: &TempDir) -> (FileRepository, Remision) {
        let repo = FileRepository::open(dir.path().join("rm.json"));
        let r = repo.insert(remision_in(Estado::Generado)).await.unwrap();
        (repo, r)
    }

    fn audit_for(r: &Remision) -> AuditEntry {
        AuditEntry::new(&r.id, "ana", AuditAction::StateChange, "test", Utc::now())
    }

    fn to_pendiente() -> RemisionPatch {
        RemisionPatch {
            estado: Some(Estado::Pendiente),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn commit_persists_entity_and_journal_together() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, r) = seeded(&dir).await;
        repo.commit(&r.id, 0, &to_pendiente(), audit_for(&r))
            .await
            .unwrap();

        let reopened = FileRepository::open(dir.path().join("rm.json"));
        let stored = reopened.read(&r.id).await.unwrap();
        assert_eq!(stored.estado, Estado::Pendiente);
        assert_eq!(stored.version, 1);
        assert_eq!(reopened.audit_log(&r.id).await.unwrap().len(), 1);

        let journal = std::fs::read_to_string(reopened.audit_path()).unwrap();
        assert_eq!(journal.lines().count(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".lock") || name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn writer_holding_an_old_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (first, r) = seeded(&dir).await;
        // A second handle stands in for another process on the same file.
        let second = FileRepository::open(dir.path().join("rm.json"));
        let seen_by_second = second.read(&r.id).await.unwrap();
        assert_eq!(seen_by_second.version, 0);

        first
            .commit(&r.id, 0, &to_pendiente(), audit_for(&r))
            .await
            .unwrap();

        let cancel = RemisionPatch {
            estado: Some(Estado::Cancelado),
            justificacion_estado: Some("duplicada".into()),
            ..Default::default()
        };
        let err = second
            .commit(&r.id, seen_by_second.version, &cancel, audit_for(&r))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::ConcurrentModification { expected_version: 0, .. }
        ));

        let stored = first.read(&r.id).await.unwrap();
        assert_eq!(stored.estado, Estado::Pendiente);
        assert_eq!(first.audit_log(&r.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn held_lock_is_a_lost_race() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, r) = seeded(&dir).await;
        let lock = dir.path().join("rm.json.lock");
        std::fs::write(&lock, b"").unwrap();

        let err = repo
            .commit(&r.id, 0, &to_pendiente(), audit_for(&r))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ConcurrentModification { .. }));
        assert!(repo.audit_log(&r.id).await.unwrap().is_empty());

        std::fs::remove_file(&lock).unwrap();
        repo.commit(&r.id, 0, &to_pendiente(), audit_for(&r))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = seeded(&dir).await;
        assert!(matches!(
            repo.insert(remision_in(Estado::Generado)).await,
            Err(RepositoryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn unknown_id_and_missing_file_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = seeded(&dir).await;
        assert!(matches!(
            repo.read("otro").await,
            Err(RepositoryError::NotFound(_))
        ));

        let missing = FileRepository::open(dir.path().join("nada.json"));
        assert!(matches!(
            missing.load().await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rm.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            FileRepository::open(&path).load().await,
            Err(RepositoryError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn orchestrated_transition_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, r) = seeded(&dir).await;
        let orch = RemisionOrchestrator::new(
            repo,
            DocumentAssembler::new(MockStore::new(), AssemblerConfig::default()),
        );

        orch.transition_with_retry(&r.id, Estado::Cancelado, Some("cliente desistió"), "ana")
            .await
            .unwrap();
        let err = orch
            .transition(&r.id, Estado::Facturado, None, "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));

        let reopened = FileRepository::open(dir.path().join("rm.json"));
        let stored = reopened.read(&r.id).await.unwrap();
        assert_eq!(stored.estado, Estado::Cancelado);
        assert_eq!(stored.justificacion_estado.as_deref(), Some("cliente desistió"));
        let log = reopened.audit_log(&r.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(
            log[0].details,
            "Estado cambiado de GENERADO a CANCELADO - Justificación: cliente desistió"
        );
    }
}
