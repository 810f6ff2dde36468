use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::document::{
    AssembleOptions, AssemblyError, CancelSignal, ConsolidationResult, DocumentAssembler,
};
use crate::error::{TransitionError, ValidationError};
use crate::repository::RemisionRepository;
use crate::state_machine::{
    AttachmentChange, AttachmentKind, AttachmentReference, AuditAction, AuditEntry, Estado,
    Remision, RemisionPatch, StateMachine,
};
use crate::store::AttachmentStore;
use crate::validation::validate_upload;

pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Retry policy for writes that lose an optimistic-concurrency race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// A committed transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub remision: Remision,
    pub audit: AuditEntry,
    pub advisories: Vec<String>,
}

/// Metadata of a file already stored in the attachment store.
#[derive(Debug, Clone)]
pub struct Upload {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    pub media_type: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub remision: Remision,
    pub reference: AttachmentReference,
    /// Advisory only; never applied automatically.
    pub suggestion: Option<Estado>,
}

/// Runs remisión operations against a repository and an attachment store.
pub struct RemisionOrchestrator<R, S> {
    repository: R,
    assembler: DocumentAssembler<S>,
    retry: RetryConfig,
    max_attachment_bytes: u64,
}

impl<R: RemisionRepository, S: AttachmentStore> RemisionOrchestrator<R, S> {
    pub fn new(repository: R, assembler: DocumentAssembler<S>) -> Self {
        Self {
            repository,
            assembler,
            retry: RetryConfig::default(),
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attachment_bytes(mut self, max_attachment_bytes: u64) -> Self {
        self.max_attachment_bytes = max_attachment_bytes;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Move a remisión to `to`. State write and audit entry commit together;
    /// a concurrent writer makes this fail with `ConcurrentModification`.
    pub async fn transition(
        &self,
        id: &str,
        to: Estado,
        justification: Option<&str>,
        actor: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let current = self.repository.read(id).await?;
        let planned = StateMachine::plan(&current, to, justification, actor, Utc::now())?;
        for advisory in &planned.advisories {
            tracing::info!(remision = %current.remision, %advisory, "Transition advisory");
        }

        let audit = planned.audit.clone();
        let remision = self
            .repository
            .commit(id, current.version, &planned.patch, planned.audit)
            .await?;

        tracing::info!(
            remision = %remision.remision,
            from = %planned.from,
            to = %planned.to,
            %actor,
            "Transition committed"
        );
        Ok(TransitionOutcome {
            remision,
            audit,
            advisories: planned.advisories,
        })
    }

    /// [`transition`](Self::transition), re-reading and retrying after lost races.
    /// Rules are re-checked against the fresh state on every attempt.
    pub async fn transition_with_retry(
        &self,
        id: &str,
        to: Estado,
        justification: Option<&str>,
        actor: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        self.retrying(|| self.transition(id, to, justification, actor))
            .await
    }

    /// Record an uploaded file on the remisión, replacing any previous
    /// attachment of the same kind. Returns the suggested next state.
    pub async fn attach(
        &self,
        id: &str,
        upload: Upload,
        actor: &str,
    ) -> Result<AttachOutcome, TransitionError> {
        validate_upload(
            upload.kind,
            &upload.media_type,
            &upload.name,
            upload.size,
            self.max_attachment_bytes,
        )?;

        let current = self.repository.read(id).await?;
        let mut reference = AttachmentReference::new(
            upload.kind,
            upload.url,
            upload.name,
            upload.media_type,
            upload.size,
            actor,
        );
        reference.supersedes = current
            .adjuntos
            .get(&upload.kind)
            .map(|previous| previous.id.clone());

        let patch = RemisionPatch {
            adjunto: Some(AttachmentChange::Set(reference.clone())),
            ..Default::default()
        };
        let details = format!("{} subido: {}", capitalize(upload.kind.label()), reference.name);
        let audit = AuditEntry::new(
            id,
            actor,
            AuditAction::AttachmentUploaded,
            details,
            reference.uploaded_at,
        );
        let remision = self
            .repository
            .commit(id, current.version, &patch, audit)
            .await?;

        let suggestion = StateMachine::suggest(&remision);
        tracing::info!(
            remision = %remision.remision,
            kind = %upload.kind,
            replaced = reference.supersedes.is_some(),
            ?suggestion,
            "Attachment recorded"
        );
        Ok(AttachOutcome {
            remision,
            reference,
            suggestion,
        })
    }

    pub async fn detach(
        &self,
        id: &str,
        kind: AttachmentKind,
        actor: &str,
    ) -> Result<Remision, TransitionError> {
        let current = self.repository.read(id).await?;
        let Some(previous) = current.adjuntos.get(&kind) else {
            return Err(ValidationError::Invalid(format!("{kind} is not attached")).into());
        };

        let patch = RemisionPatch {
            adjunto: Some(AttachmentChange::Clear(kind)),
            ..Default::default()
        };
        let details = format!("{} eliminado: {}", capitalize(kind.label()), previous.name);
        let audit = AuditEntry::new(id, actor, AuditAction::AttachmentRemoved, details, Utc::now());
        let remision = self
            .repository
            .commit(id, current.version, &patch, audit)
            .await?;
        tracing::info!(remision = %remision.remision, %kind, "Attachment removed");
        Ok(remision)
    }

    /// Assemble the remisión's current attachments. Does not write anything;
    /// see [`record_consolidation`](Self::record_consolidation).
    pub async fn consolidate(
        &self,
        remision: &Remision,
        options: AssembleOptions,
    ) -> Result<ConsolidationResult, AssemblyError> {
        self.assembler
            .assemble(remision, &remision.adjuntos, options)
            .await
    }

    pub async fn consolidate_cancellable(
        &self,
        remision: &Remision,
        options: AssembleOptions,
        cancel: CancelSignal,
    ) -> Result<ConsolidationResult, AssemblyError> {
        self.assembler
            .assemble_cancellable(remision, &remision.adjuntos, options, cancel)
            .await
    }

    /// Append the audit entry for a consolidated PDF the caller has delivered.
    pub async fn record_consolidation(
        &self,
        id: &str,
        result: &ConsolidationResult,
        actor: &str,
    ) -> Result<AuditEntry, TransitionError> {
        let details = format!(
            "PDF consolidado generado con {} páginas: {}",
            result.page_count, result.filename
        );
        let entry = AuditEntry::new(id, actor, AuditAction::Consolidated, details, Utc::now());
        self.repository.append_audit(entry.clone()).await?;
        Ok(entry)
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, TransitionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransitionError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay_ms = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms,
                        error = %e,
                        "Retrying after concurrent modification"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                other => return other,
            }
        }
    }
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::document::testing::{MockStore, sample_pdf};
    use crate::document::{AssemblerConfig, PageLayout};
    use crate::error::RepositoryError;
    use crate::repository::{InMemoryRepository, RemisionEvent};
    use crate::state_machine::testing::remision_in;
    use tokio::sync::broadcast;

    fn orchestrator(store: MockStore) -> RemisionOrchestrator<InMemoryRepository, MockStore> {
        let assembler = DocumentAssembler::new(
            store,
            AssemblerConfig {
                fetch_timeout: Duration::from_secs(5),
                max_concurrent_fetches: 3,
                layout: PageLayout::default(),
            },
        );
        RemisionOrchestrator::new(InMemoryRepository::new(), assembler)
    }

    async fn seeded(
        orch: &RemisionOrchestrator<InMemoryRepository, MockStore>,
        estado: Estado,
    ) -> Remision {
        orch.repository().insert(remision_in(estado)).await.unwrap()
    }

    fn pdf_upload(kind: AttachmentKind, url: &str) -> Upload {
        Upload {
            kind,
            url: url.into(),
            name: "soporte.pdf".into(),
            media_type: "application/pdf".into(),
            size: 2048,
        }
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 50,
        };
        assert_eq!(config.delay_for_attempt(1), 50);
        assert_eq!(config.delay_for_attempt(2), 100);
        assert_eq!(config.delay_for_attempt(3), 200);
    }

    #[tokio::test]
    async fn transition_commits_state_and_audit() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Pendiente).await;

        let outcome = orch
            .transition(&r.id, Estado::Radicado, None, "ana")
            .await
            .unwrap();
        assert_eq!(outcome.remision.estado, Estado::Radicado);
        assert!(outcome.remision.fecha_radicacion.is_some());
        assert_eq!(outcome.remision.version, 1);
        assert_eq!(outcome.advisories.len(), 1);

        let log = orch.repository().audit_log(&r.id).await.unwrap();
        assert_eq!(log, vec![outcome.audit]);
        assert_eq!(log[0].details, "Estado cambiado de PENDIENTE a RADICADO");
    }

    #[tokio::test]
    async fn missing_justification_leaves_no_trace() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Pendiente).await;

        let err = orch
            .transition(&r.id, Estado::Cancelado, Some(""), "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::MissingJustification(Estado::Cancelado)));
        assert_eq!(orch.repository().read(&r.id).await.unwrap().estado, Estado::Pendiente);
        assert!(orch.repository().audit_log(&r.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn facturado_is_terminal() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Radicado).await;
        orch.transition(&r.id, Estado::Facturado, None, "ana")
            .await
            .unwrap();

        for target in Estado::ALL {
            let err = orch
                .transition(&r.id, target, Some("reabrir"), "ana")
                .await
                .unwrap_err();
            assert!(matches!(err, TransitionError::InvalidTransition { .. }));
        }
    }

    #[tokio::test]
    async fn unknown_remision_is_not_found() {
        let orch = orchestrator(MockStore::new());
        let err = orch
            .transition("missing", Estado::Pendiente, None, "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound(_)));
    }

    /// Lets another writer slip in before the first `commit` calls.
    struct RacingRepository {
        inner: InMemoryRepository,
        races_left: AtomicU32,
    }

    impl RacingRepository {
        fn new(races: u32) -> Self {
            Self {
                inner: InMemoryRepository::new(),
                races_left: AtomicU32::new(races),
            }
        }
    }

    impl RemisionRepository for RacingRepository {
        async fn insert(&self, remision: Remision) -> Result<Remision, RepositoryError> {
            self.inner.insert(remision).await
        }

        async fn read(&self, id: &str) -> Result<Remision, RepositoryError> {
            self.inner.read(id).await
        }

        async fn write(
            &self,
            id: &str,
            expected_version: u64,
            patch: &RemisionPatch,
        ) -> Result<Remision, RepositoryError> {
            self.inner.write(id, expected_version, patch).await
        }

        async fn append_audit(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
            self.inner.append_audit(entry).await
        }

        async fn commit(
            &self,
            id: &str,
            expected_version: u64,
            patch: &RemisionPatch,
            audit: AuditEntry,
        ) -> Result<Remision, RepositoryError> {
            let race = self
                .races_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                let current = self.inner.read(id).await?;
                self.inner
                    .write(id, current.version, &RemisionPatch::default())
                    .await?;
            }
            self.inner.commit(id, expected_version, patch, audit).await
        }

        async fn audit_log(&self, id: &str) -> Result<Vec<AuditEntry>, RepositoryError> {
            self.inner.audit_log(id).await
        }

        fn subscribe(&self) -> broadcast::Receiver<RemisionEvent> {
            self.inner.subscribe()
        }
    }

    fn racing(races: u32) -> RemisionOrchestrator<RacingRepository, MockStore> {
        let assembler = DocumentAssembler::new(MockStore::new(), AssemblerConfig::default());
        RemisionOrchestrator::new(RacingRepository::new(races), assembler).with_retry(RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
        })
    }

    #[tokio::test]
    async fn losing_writer_gets_concurrent_modification() {
        let orch = racing(1);
        let r = orch.repository().insert(remision_in(Estado::Generado)).await.unwrap();

        let err = orch
            .transition(&r.id, Estado::Pendiente, None, "ana")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::ConcurrentModification { expected_version: 0, .. }
        ));
        assert!(orch.repository().audit_log(&r.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_recovers_from_a_lost_race() {
        let orch = racing(2);
        let r = orch.repository().insert(remision_in(Estado::Generado)).await.unwrap();

        let outcome = orch
            .transition_with_retry(&r.id, Estado::Pendiente, None, "ana")
            .await
            .unwrap();
        assert_eq!(outcome.remision.estado, Estado::Pendiente);
        // Two racing no-op writes plus the winning commit.
        assert_eq!(outcome.remision.version, 3);
        assert_eq!(orch.repository().audit_log(&r.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let orch = racing(10);
        let r = orch.repository().insert(remision_in(Estado::Generado)).await.unwrap();

        let err = orch
            .transition_with_retry(&r.id, Estado::Pendiente, None, "ana")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retry_does_not_repeat_rule_violations() {
        let orch = racing(0);
        let r = orch.repository().insert(remision_in(Estado::Generado)).await.unwrap();
        let err = orch
            .transition_with_retry(&r.id, Estado::Facturado, None, "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn attach_records_reference_and_suggests() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Generado).await;

        let outcome = orch
            .attach(
                &r.id,
                pdf_upload(AttachmentKind::OrdenTrabajo, "mem://ot"),
                "ana",
            )
            .await
            .unwrap();
        assert!(outcome.remision.has_attachment(AttachmentKind::OrdenTrabajo));
        assert_eq!(outcome.suggestion, Some(Estado::Pendiente));
        // Suggestions are never applied.
        assert_eq!(outcome.remision.estado, Estado::Generado);

        let log = orch.repository().audit_log(&r.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, AuditAction::AttachmentUploaded);
        assert_eq!(log[0].details, "Orden de trabajo subido: soporte.pdf");
    }

    #[tokio::test]
    async fn replacement_supersedes_previous_reference() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Pendiente).await;
        let first = orch
            .attach(&r.id, pdf_upload(AttachmentKind::InformeTecnico, "mem://v1"), "ana")
            .await
            .unwrap();
        let second = orch
            .attach(&r.id, pdf_upload(AttachmentKind::InformeTecnico, "mem://v2"), "luis")
            .await
            .unwrap();

        assert_eq!(second.reference.supersedes, Some(first.reference.id.clone()));
        let stored = &second.remision.adjuntos[&AttachmentKind::InformeTecnico];
        assert_eq!(stored.url, "mem://v2");
        assert_eq!(stored.uploaded_by, "luis");
    }

    #[tokio::test]
    async fn orden_trabajo_rejects_images() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Generado).await;
        let upload = Upload {
            kind: AttachmentKind::OrdenTrabajo,
            url: "mem://foto".into(),
            name: "foto.png".into(),
            media_type: "image/png".into(),
            size: 100,
        };
        let err = orch.attach(&r.id, upload, "ana").await.unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Validation(ValidationError::MediaType { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let orch = orchestrator(MockStore::new()).with_max_attachment_bytes(1000);
        let r = seeded(&orch, Estado::Generado).await;
        let err = orch
            .attach(&r.id, pdf_upload(AttachmentKind::InformeTecnico, "mem://big"), "ana")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Validation(ValidationError::FileTooLarge { size: 2048, limit: 1000 })
        ));
    }

    #[tokio::test]
    async fn detach_clears_kind_and_audits() {
        let orch = orchestrator(MockStore::new());
        let r = seeded(&orch, Estado::Pendiente).await;
        orch.attach(&r.id, pdf_upload(AttachmentKind::InformeTecnico, "mem://i"), "ana")
            .await
            .unwrap();

        let remision = orch
            .detach(&r.id, AttachmentKind::InformeTecnico, "ana")
            .await
            .unwrap();
        assert!(!remision.has_attachment(AttachmentKind::InformeTecnico));
        let log = orch.repository().audit_log(&r.id).await.unwrap();
        assert_eq!(log[1].action, AuditAction::AttachmentRemoved);

        assert!(orch
            .detach(&r.id, AttachmentKind::InformeTecnico, "ana")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn consolidation_is_audited_only_on_request() {
        let store = MockStore::new().with("mem://informe", sample_pdf(2, 300), 0);
        let orch = orchestrator(store);
        let r = seeded(&orch, Estado::Radicado).await;
        let outcome = orch
            .attach(
                &r.id,
                pdf_upload(AttachmentKind::InformeTecnico, "mem://informe"),
                "ana",
            )
            .await
            .unwrap();

        let result = orch
            .consolidate(&outcome.remision, AssembleOptions::default())
            .await
            .unwrap();
        assert_eq!(result.page_count, 2);
        assert_eq!(orch.repository().audit_log(&r.id).await.unwrap().len(), 1);

        let entry = orch.record_consolidation(&r.id, &result, "ana").await.unwrap();
        assert_eq!(entry.action, AuditAction::Consolidated);
        assert_eq!(
            entry.details,
            "PDF consolidado generado con 2 páginas: OT445_M-12.pdf"
        );
        assert_eq!(orch.repository().audit_log(&r.id).await.unwrap().len(), 2);
    }

    #[test]
    fn capitalize_handles_accents() {
        assert_eq!(capitalize("informe técnico"), "Informe técnico");
        assert_eq!(capitalize(""), "");
    }
}
