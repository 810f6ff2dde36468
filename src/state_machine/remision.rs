use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::Estado;

/// The three evidentiary document roles, in consolidation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    OrdenTrabajo,
    RemisionEscaneada,
    InformeTecnico,
}

impl AttachmentKind {
    /// Fixed consolidation order.
    pub const ORDER: [AttachmentKind; 3] = [
        AttachmentKind::OrdenTrabajo,
        AttachmentKind::RemisionEscaneada,
        AttachmentKind::InformeTecnico,
    ];

    /// Whether raster images are accepted for this kind.
    pub fn accepts_images(self) -> bool {
        !matches!(self, AttachmentKind::OrdenTrabajo)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::OrdenTrabajo => "orden_trabajo",
            AttachmentKind::RemisionEscaneada => "remision_escaneada",
            AttachmentKind::InformeTecnico => "informe_tecnico",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AttachmentKind::OrdenTrabajo => "orden de trabajo",
            AttachmentKind::RemisionEscaneada => "remisión escaneada",
            AttachmentKind::InformeTecnico => "informe técnico",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored metadata for one uploaded attachment. Never edited in place:
/// a replacement is a new reference that names the one it supersedes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentReference {
    pub id: String,
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    pub media_type: String,
    pub size: u64,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

impl AttachmentReference {
    pub fn new(
        kind: AttachmentKind,
        url: impl Into<String>,
        name: impl Into<String>,
        media_type: impl Into<String>,
        size: u64,
        uploaded_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            url: url.into(),
            name: name.into(),
            media_type: media_type.into(),
            size,
            uploaded_by: uploaded_by.into(),
            uploaded_at: Utc::now(),
            supersedes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub descripcion: String,
    #[serde(default)]
    pub valor: Option<Decimal>,
}

/// One unit of billable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remision {
    pub id: String,
    pub remision: String,
    pub no_orden: String,
    pub movil: String,
    /// Business unit.
    #[serde(default)]
    pub une: Option<String>,
    pub estado: Estado,
    #[serde(default)]
    pub justificacion_estado: Option<String>,
    #[serde(default)]
    pub subtotal: Decimal,
    #[serde(default)]
    pub total: Decimal,
    #[serde(default)]
    pub servicios: Vec<ServiceLine>,
    #[serde(default)]
    pub tecnicos: Vec<String>,
    #[serde(default)]
    pub fecha_remision: Option<NaiveDate>,
    #[serde(default)]
    pub fecha_maximo: Option<NaiveDate>,
    #[serde(default)]
    pub fecha_radicacion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fecha_facturacion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub adjuntos: BTreeMap<AttachmentKind, AttachmentReference>,
    /// Optimistic concurrency token, bumped on every committed write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Remision {
    /// A fresh remisión in GENERADO. The id is assigned here as the store would.
    pub fn new(
        remision: impl Into<String>,
        no_orden: impl Into<String>,
        movil: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remision: remision.into(),
            no_orden: no_orden.into(),
            movil: movil.into(),
            une: None,
            estado: Estado::Generado,
            justificacion_estado: None,
            subtotal: Decimal::ZERO,
            total: Decimal::ZERO,
            servicios: Vec::new(),
            tecnicos: Vec::new(),
            fecha_remision: None,
            fecha_maximo: None,
            fecha_radicacion: None,
            fecha_facturacion: None,
            adjuntos: BTreeMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_attachment(&self, kind: AttachmentKind) -> bool {
        self.adjuntos.contains_key(&kind)
    }
}

/// Change applied to a single attachment slot.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentChange {
    Set(AttachmentReference),
    Clear(AttachmentKind),
}

/// Partial update of a remisión. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemisionPatch {
    pub estado: Option<Estado>,
    pub justificacion_estado: Option<String>,
    pub fecha_radicacion: Option<DateTime<Utc>>,
    pub fecha_facturacion: Option<DateTime<Utc>>,
    pub adjunto: Option<AttachmentChange>,
}

impl RemisionPatch {
    pub fn apply(&self, remision: &mut Remision) {
        if let Some(estado) = self.estado {
            remision.estado = estado;
        }
        if let Some(justificacion) = &self.justificacion_estado {
            remision.justificacion_estado = Some(justificacion.clone());
        }
        // Stamps are write-once.
        if let Some(at) = self.fecha_radicacion {
            remision.fecha_radicacion.get_or_insert(at);
        }
        if let Some(at) = self.fecha_facturacion {
            remision.fecha_facturacion.get_or_insert(at);
        }
        match &self.adjunto {
            Some(AttachmentChange::Set(reference)) => {
                remision.adjuntos.insert(reference.kind, reference.clone());
            }
            Some(AttachmentChange::Clear(kind)) => {
                remision.adjuntos.remove(kind);
            }
            None => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StateChange,
    AttachmentUploaded,
    AttachmentRemoved,
    Consolidated,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::StateChange => write!(f, "Cambio de estado"),
            AuditAction::AttachmentUploaded => write!(f, "Adjunto subido"),
            AuditAction::AttachmentRemoved => write!(f, "Adjunto eliminado"),
            AuditAction::Consolidated => write!(f, "PDF consolidado"),
        }
    }
}

/// Append-only history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub remision_id: String,
    pub actor: String,
    pub action: AuditAction,
    pub details: String,
    pub previous_state: Option<Estado>,
    pub new_state: Option<Estado>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        remision_id: &str,
        actor: &str,
        action: AuditAction,
        details: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remision_id: remision_id.to_string(),
            actor: actor.to_string(),
            action,
            details: details.into(),
            previous_state: None,
            new_state: None,
            timestamp,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn new_remision_starts_generado() {
        let r = Remision::new("RM-1", "OT-1", "M-1");
        assert_eq!(r.estado, Estado::Generado);
        assert_eq!(r.version, 0);
        assert!(r.adjuntos.is_empty());
        assert!(r.fecha_radicacion.is_none());
    }

    #[test]
    fn patch_never_overwrites_stamps() {
        let mut r = remision_in(Estado::Radicado);
        let first = Utc::now() - chrono::Duration::hours(5);
        r.fecha_radicacion = Some(first);

        let patch = RemisionPatch {
            fecha_radicacion: Some(Utc::now()),
            ..Default::default()
        };
        patch.apply(&mut r);
        assert_eq!(r.fecha_radicacion, Some(first));
    }

    #[test]
    fn patch_sets_and_clears_attachments() {
        let mut r = remision_in(Estado::Generado);
        let reference = reference(AttachmentKind::InformeTecnico, "image/png");
        RemisionPatch {
            adjunto: Some(AttachmentChange::Set(reference.clone())),
            ..Default::default()
        }
        .apply(&mut r);
        assert_eq!(r.adjuntos.get(&AttachmentKind::InformeTecnico), Some(&reference));

        RemisionPatch {
            adjunto: Some(AttachmentChange::Clear(AttachmentKind::InformeTecnico)),
            ..Default::default()
        }
        .apply(&mut r);
        assert!(!r.has_attachment(AttachmentKind::InformeTecnico));
    }

    #[test]
    fn remision_deserializes_from_store_document() {
        let json = r#"{
            "id": "abc",
            "remision": "RM-7",
            "no_orden": "OT-445",
            "movil": "M-12",
            "estado": "RADICADO",
            "total": 1250000,
            "adjuntos": {
                "informe_tecnico": {
                    "id": "ref-1",
                    "kind": "informe_tecnico",
                    "url": "https://store.test/informe.pdf",
                    "name": "informe.pdf",
                    "media_type": "application/pdf",
                    "size": 2048,
                    "uploaded_by": "ana@taller.co",
                    "uploaded_at": "2025-09-14T10:00:00Z"
                }
            },
            "created_at": "2025-09-01T08:00:00Z",
            "updated_at": "2025-09-14T10:00:00Z"
        }"#;
        let r: Remision = serde_json::from_str(json).unwrap();
        assert_eq!(r.estado, Estado::Radicado);
        assert_eq!(r.total, Decimal::from(1_250_000));
        assert!(r.has_attachment(AttachmentKind::InformeTecnico));
        assert!(!r.has_attachment(AttachmentKind::OrdenTrabajo));
    }

    #[test]
    fn audit_action_display() {
        assert_eq!(AuditAction::StateChange.to_string(), "Cambio de estado");
        assert_eq!(AuditAction::Consolidated.to_string(), "PDF consolidado");
    }

    #[test]
    fn kind_order_is_fixed() {
        let mut kinds = vec![
            AttachmentKind::InformeTecnico,
            AttachmentKind::OrdenTrabajo,
            AttachmentKind::RemisionEscaneada,
        ];
        kinds.sort();
        assert_eq!(kinds, AttachmentKind::ORDER.to_vec());
    }
}
