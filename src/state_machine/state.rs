use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::remision::{AttachmentKind, AuditAction, AuditEntry, Remision, RemisionPatch};
use crate::error::TransitionError;

/// The nine workflow states of a remisión.
///
/// The regular flow is GENERADO → PENDIENTE → (PROFORMA) → RADICADO → FACTURADO.
/// The four special states require a justification and may reopen the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Estado {
    Generado,
    Pendiente,
    Proforma,
    Radicado,
    Facturado,
    Cancelado,
    Cortesia,
    Garantia,
    SinVincular,
}

/// Adjacency table of legal transitions. Every other pair is rejected.
const TRANSITIONS: &[(Estado, &[Estado])] = &[
    (
        Estado::Generado,
        &[
            Estado::Pendiente,
            Estado::Cancelado,
            Estado::Cortesia,
            Estado::Garantia,
        ],
    ),
    (
        Estado::Pendiente,
        &[
            Estado::Proforma,
            Estado::Radicado,
            Estado::Cancelado,
            Estado::SinVincular,
        ],
    ),
    (
        Estado::Proforma,
        &[Estado::Radicado, Estado::Cancelado, Estado::Pendiente],
    ),
    (Estado::Radicado, &[Estado::Facturado, Estado::Cancelado]),
    (Estado::Facturado, &[]),
    (Estado::Cancelado, &[Estado::Generado, Estado::Pendiente]),
    (Estado::Cortesia, &[Estado::Generado, Estado::Pendiente]),
    (Estado::Garantia, &[Estado::Generado, Estado::Pendiente]),
    (Estado::SinVincular, &[Estado::Generado, Estado::Pendiente]),
];

impl Estado {
    pub const ALL: [Estado; 9] = [
        Estado::Generado,
        Estado::Pendiente,
        Estado::Proforma,
        Estado::Radicado,
        Estado::Facturado,
        Estado::Cancelado,
        Estado::Cortesia,
        Estado::Garantia,
        Estado::SinVincular,
    ];

    /// States reachable from `self` in a single transition.
    pub fn allowed_targets(self) -> &'static [Estado] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    /// Special states demand a justification on entry.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            Estado::Cancelado | Estado::Cortesia | Estado::Garantia | Estado::SinVincular
        )
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    pub fn description(self) -> &'static str {
        match self {
            Estado::Generado => "Remisión creada, esperando procesamiento",
            Estado::Pendiente => "En espera de documentación o aprobación",
            Estado::Proforma => "Proforma generada, esperando confirmación",
            Estado::Radicado => "Documentos radicados oficialmente",
            Estado::Facturado => "Proceso completado y facturado",
            Estado::Cancelado => "Remisión cancelada",
            Estado::Cortesia => "Servicio de cortesía sin costo",
            Estado::Garantia => "Trabajo bajo garantía",
            Estado::SinVincular => "Remisión sin vincular a proceso",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Estado::Generado => "GENERADO",
            Estado::Pendiente => "PENDIENTE",
            Estado::Proforma => "PROFORMA",
            Estado::Radicado => "RADICADO",
            Estado::Facturado => "FACTURADO",
            Estado::Cancelado => "CANCELADO",
            Estado::Cortesia => "CORTESIA",
            Estado::Garantia => "GARANTIA",
            Estado::SinVincular => "SIN_VINCULAR",
        }
    }
}

impl fmt::Display for Estado {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Estado {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace([' ', '-'], "_");
        Estado::ALL
            .into_iter()
            .find(|estado| estado.as_str() == normalized)
            .ok_or_else(|| format!("unknown estado: {s}"))
    }
}

/// A validated transition, ready to be committed to the repository.
#[derive(Debug, Clone)]
pub struct PlannedTransition {
    pub from: Estado,
    pub to: Estado,
    pub patch: RemisionPatch,
    pub audit: AuditEntry,
    /// Non-blocking recommendations surfaced to the caller.
    pub advisories: Vec<String>,
}

/// Authority for legal remisión transitions.
pub struct StateMachine;

impl StateMachine {
    pub fn can_transition(from: Estado, to: Estado) -> bool {
        if to == Estado::Facturado && from != Estado::Radicado {
            return false;
        }
        from.allowed_targets().contains(&to)
    }

    /// Check a transition against the adjacency table and the justification rule.
    ///
    /// The table is consulted first, so an illegal move into a special state
    /// reports `InvalidTransition` rather than `MissingJustification`.
    pub fn validate(
        from: Estado,
        to: Estado,
        justification: Option<&str>,
    ) -> Result<(), TransitionError> {
        if !Self::can_transition(from, to) {
            return Err(TransitionError::InvalidTransition { from, to });
        }
        let justified = justification.is_some_and(|j| !j.trim().is_empty());
        if to.is_special() && !justified {
            return Err(TransitionError::MissingJustification(to));
        }
        Ok(())
    }

    /// Validate and build the patch plus audit entry for a transition.
    ///
    /// Pure: the caller commits the result. Date stamps are only produced when
    /// the remisión does not carry them yet.
    pub fn plan(
        remision: &Remision,
        to: Estado,
        justification: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PlannedTransition, TransitionError> {
        let from = remision.estado;
        Self::validate(from, to, justification)?;

        let justification = justification
            .map(str::trim)
            .filter(|j| !j.is_empty())
            .map(str::to_string);

        let mut patch = RemisionPatch {
            estado: Some(to),
            ..Default::default()
        };
        if to.is_special() {
            patch.justificacion_estado = justification.clone();
        }
        if to == Estado::Radicado && remision.fecha_radicacion.is_none() {
            patch.fecha_radicacion = Some(now);
        }
        if to == Estado::Facturado && remision.fecha_facturacion.is_none() {
            patch.fecha_facturacion = Some(now);
        }

        let mut details = format!("Estado cambiado de {from} a {to}");
        if let Some(j) = &justification {
            details.push_str(&format!(" - Justificación: {j}"));
        }
        let mut audit = AuditEntry::new(&remision.id, actor, AuditAction::StateChange, details, now);
        audit.previous_state = Some(from);
        audit.new_state = Some(to);

        Ok(PlannedTransition {
            from,
            to,
            patch,
            audit,
            advisories: Self::advisories(remision, to),
        })
    }

    /// Suggest the next state based on the attachments present. Advisory only.
    pub fn suggest(remision: &Remision) -> Option<Estado> {
        let orden = remision.has_attachment(AttachmentKind::OrdenTrabajo);
        let escaneada = remision.has_attachment(AttachmentKind::RemisionEscaneada);
        match remision.estado {
            Estado::Generado if orden || escaneada => Some(Estado::Pendiente),
            Estado::Pendiente if orden && escaneada => Some(Estado::Radicado),
            _ => None,
        }
    }

    fn advisories(remision: &Remision, to: Estado) -> Vec<String> {
        let mut advisories = Vec::new();
        if to == Estado::Radicado
            && !remision.has_attachment(AttachmentKind::OrdenTrabajo)
            && !remision.has_attachment(AttachmentKind::RemisionEscaneada)
        {
            advisories.push("Se recomienda tener al menos un adjunto antes de radicar".to_string());
        }
        advisories
    }
}
