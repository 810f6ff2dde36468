//! Consolidation of a remisión's attachments into one PDF.
//!
//! Fetching is the only async phase: up to [`MAX_CONCURRENT_FETCHES`] downloads
//! run at once, each under its own timeout. Conversion and merging happen on
//! the blocking pool once every fetch has settled, and pages are always
//! appended in [`AttachmentKind::ORDER`], whatever order the downloads
//! finished in. Per-attachment failures degrade into warnings; only an empty
//! result is an error.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use tokio::sync::watch;

use super::converter::{DocumentConverter, Media, PageLayout};
use super::cover::cover_document;
use super::error::AssemblyError;
use super::merge::PdfMerger;
use crate::state_machine::{AttachmentKind, AttachmentReference, Remision};
use crate::store::{AttachmentStore, FetchError};

/// Upper bound on simultaneous downloads within one assembly.
pub const MAX_CONCURRENT_FETCHES: usize = 3;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssembleOptions {
    pub include_cover: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub fetch_timeout: Duration,
    /// Clamped to `1..=MAX_CONCURRENT_FETCHES`.
    pub max_concurrent_fetches: usize,
    pub layout: PageLayout,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_concurrent_fetches: MAX_CONCURRENT_FETCHES,
            layout: PageLayout::default(),
        }
    }
}

/// Why an attachment kind contributed no pages.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NotAttached,
    Fetch(String),
    Conversion(String),
    Empty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotAttached => write!(f, "no adjuntado"),
            SkipReason::Fetch(e) => write!(f, "no se pudo descargar: {e}"),
            SkipReason::Conversion(e) => write!(f, "no se pudo convertir: {e}"),
            SkipReason::Empty => write!(f, "el documento no tiene páginas"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyWarning {
    pub kind: AttachmentKind,
    pub reason: SkipReason,
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludedAttachment {
    pub kind: AttachmentKind,
    pub pages: usize,
}

/// Outcome of a successful assembly. Not persisted.
#[derive(Debug, Clone)]
pub struct ConsolidationResult {
    /// Kinds that contributed pages, in output order.
    pub included: Vec<IncludedAttachment>,
    /// Total pages in `bytes`, cover included.
    pub page_count: usize,
    pub has_cover: bool,
    pub bytes: Vec<u8>,
    pub filename: String,
    pub warnings: Vec<AssemblyWarning>,
}

impl ConsolidationResult {
    pub fn included_kinds(&self) -> Vec<AttachmentKind> {
        self.included.iter().map(|i| i.kind).collect()
    }
}

/// `{no_orden}_{movil}.pdf` with both parts reduced to filename-safe characters.
pub fn canonical_filename(no_orden: &str, movil: &str) -> String {
    let orden: String = no_orden
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let movil: String = movil
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let orden = if orden.is_empty() { "ORDEN".to_string() } else { orden };
    let movil = if movil.is_empty() { "MOVIL".to_string() } else { movil };
    format!("{orden}_{movil}.pdf")
}

/// Which kinds are present, in consolidation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationReadiness {
    pub available: Vec<AttachmentKind>,
    pub missing: Vec<AttachmentKind>,
}

impl ConsolidationReadiness {
    pub fn can_consolidate(&self) -> bool {
        !self.available.is_empty()
    }
}

pub fn consolidation_readiness(
    attachments: &BTreeMap<AttachmentKind, AttachmentReference>,
) -> ConsolidationReadiness {
    let (available, missing): (Vec<_>, Vec<_>) = AttachmentKind::ORDER
        .into_iter()
        .partition(|kind| attachments.contains_key(kind));
    ConsolidationReadiness { available, missing }
}

/// Requests cancellation of the assemblies holding the paired [`CancelSignal`].
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// Resolves once cancellation is requested. Never resolves if the
    /// [`Canceller`] is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancellation() -> (Canceller, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (Canceller(tx), CancelSignal(rx))
}

struct Fetched {
    kind: AttachmentKind,
    name: String,
    media_type: String,
    result: Result<Vec<u8>, FetchError>,
}

struct Built {
    included: Vec<IncludedAttachment>,
    has_cover: bool,
    page_count: usize,
    bytes: Vec<u8>,
    warnings: Vec<AssemblyWarning>,
}

pub struct DocumentAssembler<S> {
    store: S,
    config: AssemblerConfig,
}

impl<S: AttachmentStore> DocumentAssembler<S> {
    pub fn new(store: S, mut config: AssemblerConfig) -> Self {
        config.max_concurrent_fetches = config
            .max_concurrent_fetches
            .clamp(1, MAX_CONCURRENT_FETCHES);
        Self { store, config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Fetch, convert and merge the attachments of `remision`.
    ///
    /// Never touches the remisión itself. Dropping the returned future drops
    /// every in-flight fetch.
    pub async fn assemble(
        &self,
        remision: &Remision,
        attachments: &BTreeMap<AttachmentKind, AttachmentReference>,
        options: AssembleOptions,
    ) -> Result<ConsolidationResult, AssemblyError> {
        let mut warnings = Vec::new();
        let mut targets = Vec::new();
        for kind in AttachmentKind::ORDER {
            match attachments.get(&kind) {
                Some(reference) => targets.push(reference),
                None => {
                    tracing::debug!(remision = %remision.remision, %kind, "Attachment not present");
                    warnings.push(AssemblyWarning {
                        kind,
                        reason: SkipReason::NotAttached,
                    });
                }
            }
        }

        let limit = self.config.max_concurrent_fetches;
        let fetched: Vec<Fetched> = stream::iter(targets)
            .map(|reference| self.fetch_one(reference))
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut by_kind: BTreeMap<AttachmentKind, Fetched> =
            fetched.into_iter().map(|f| (f.kind, f)).collect();
        let mut ordered = Vec::with_capacity(by_kind.len());
        for kind in AttachmentKind::ORDER {
            if let Some(f) = by_kind.remove(&kind) {
                ordered.push(f);
            }
        }

        let cover = options
            .include_cover
            .then(|| (remision.clone(), Utc::now()));
        let layout = self.config.layout;
        let built = tokio::task::spawn_blocking(move || build(ordered, cover, layout))
            .await
            .map_err(|e| AssemblyError::Worker(e.to_string()))??;

        warnings.extend(built.warnings);
        warnings.sort_by_key(|w| w.kind);

        if built.included.is_empty() {
            tracing::warn!(
                remision = %remision.remision,
                skipped = warnings.len(),
                "No attachment produced any page"
            );
            return Err(AssemblyError::NoContentAvailable { warnings });
        }

        let filename = canonical_filename(&remision.no_orden, &remision.movil);
        tracing::info!(
            remision = %remision.remision,
            pages = built.page_count,
            included = built.included.len(),
            skipped = warnings.len(),
            %filename,
            "Consolidated PDF assembled"
        );

        Ok(ConsolidationResult {
            included: built.included,
            page_count: built.page_count,
            has_cover: built.has_cover,
            bytes: built.bytes,
            filename,
            warnings,
        })
    }

    /// [`assemble`](Self::assemble) that stops as soon as `cancel` fires.
    /// A cancelled assembly never yields a partial artifact.
    pub async fn assemble_cancellable(
        &self,
        remision: &Remision,
        attachments: &BTreeMap<AttachmentKind, AttachmentReference>,
        options: AssembleOptions,
        mut cancel: CancelSignal,
    ) -> Result<ConsolidationResult, AssemblyError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(remision = %remision.remision, "Assembly cancelled");
                Err(AssemblyError::Cancelled)
            }
            result = self.assemble(remision, attachments, options) => result,
        }
    }

    async fn fetch_one(&self, reference: &AttachmentReference) -> Fetched {
        let timeout = self.config.fetch_timeout;
        tracing::debug!(kind = %reference.kind, url = %reference.url, "Fetching attachment");
        let result = match tokio::time::timeout(timeout, self.store.fetch(&reference.url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: reference.url.clone(),
                after: timeout,
            }),
        };
        if let Err(e) = &result {
            tracing::warn!(kind = %reference.kind, error = %e, "Attachment fetch failed");
        }
        Fetched {
            kind: reference.kind,
            name: reference.name.clone(),
            media_type: reference.media_type.clone(),
            result,
        }
    }
}

fn build(
    fetched: Vec<Fetched>,
    cover: Option<(Remision, DateTime<Utc>)>,
    layout: PageLayout,
) -> Result<Built, AssemblyError> {
    let converter = DocumentConverter::new(layout);
    let mut merger = PdfMerger::new();
    let mut warnings = Vec::new();
    let mut included = Vec::new();

    let mut has_cover = false;
    if let Some((remision, generated_at)) = cover {
        match cover_document(&remision, generated_at).and_then(|doc| merger.append(doc)) {
            Ok(_) => has_cover = true,
            Err(e) => tracing::warn!(error = %e, "Cover page could not be generated"),
        }
    }

    for Fetched {
        kind,
        name,
        media_type,
        result,
    } in fetched
    {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warnings.push(AssemblyWarning {
                    kind,
                    reason: SkipReason::Fetch(e.to_string()),
                });
                continue;
            }
        };

        let doc = Media::classify(bytes, &media_type, &name).and_then(|m| converter.load(m));
        let doc = match doc {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(%kind, error = %e, "Attachment could not be converted");
                warnings.push(AssemblyWarning {
                    kind,
                    reason: SkipReason::Conversion(e.to_string()),
                });
                continue;
            }
        };
        if doc.get_pages().is_empty() {
            tracing::warn!(%kind, "Attachment has no pages");
            warnings.push(AssemblyWarning {
                kind,
                reason: SkipReason::Empty,
            });
            continue;
        }

        match merger.append(doc) {
            Ok(pages) => {
                tracing::debug!(%kind, pages, "Attachment appended");
                included.push(IncludedAttachment { kind, pages });
            }
            Err(e) => warnings.push(AssemblyWarning {
                kind,
                reason: SkipReason::Conversion(e.to_string()),
            }),
        }
    }

    if included.is_empty() {
        return Ok(Built {
            included,
            has_cover,
            page_count: 0,
            bytes: Vec::new(),
            warnings,
        });
    }

    let page_count = merger.page_count();
    let bytes = merger.finish().map_err(AssemblyError::Pdf)?;
    Ok(Built {
        included,
        has_cover,
        page_count,
        bytes,
        warnings,
    })
}
