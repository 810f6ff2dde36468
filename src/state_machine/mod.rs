mod remision;
mod state;

pub use remision::{
    AttachmentChange, AttachmentKind, AttachmentReference, AuditAction, AuditEntry, Remision,
    RemisionPatch, ServiceLine,
};
pub use state::{Estado, PlannedTransition, StateMachine};

#[cfg(test)]
pub(crate) use remision::testing;
