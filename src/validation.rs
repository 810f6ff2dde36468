//! Entity and upload validation shared by the repository and the orchestrator.

use rust_decimal::Decimal;

use crate::error::ValidationError;
use crate::state_machine::{AttachmentKind, Remision};

pub const MAX_SERVICES: usize = 5;
pub const MAX_TECHNICIANS: usize = 3;

const PDF_TYPE: &str = "application/pdf";
const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Checks the invariants a stored remisión must always hold.
pub fn validate_remision(remision: &Remision) -> Result<(), ValidationError> {
    if remision.no_orden.trim().is_empty() {
        return Err(ValidationError::Required("no_orden"));
    }
    if remision.subtotal < Decimal::ZERO {
        return Err(ValidationError::Negative { field: "subtotal" });
    }
    if remision.total < Decimal::ZERO {
        return Err(ValidationError::Negative { field: "total" });
    }
    if remision.servicios.len() > MAX_SERVICES {
        return Err(ValidationError::TooMany {
            field: "servicios",
            count: remision.servicios.len(),
            max: MAX_SERVICES,
        });
    }
    if remision.tecnicos.len() > MAX_TECHNICIANS {
        return Err(ValidationError::TooMany {
            field: "tecnicos",
            count: remision.tecnicos.len(),
            max: MAX_TECHNICIANS,
        });
    }
    if let (Some(desde), Some(hasta)) = (remision.fecha_remision, remision.fecha_maximo)
        && hasta < desde
    {
        return Err(ValidationError::DateOrder);
    }
    Ok(())
}

/// Whether a declared media type or file name denotes a supported raster image.
pub fn is_image(media_type: &str, name: &str) -> bool {
    let media_type = media_type.trim().to_lowercase();
    if IMAGE_TYPES.contains(&media_type.as_str()) {
        return true;
    }
    extension(name).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_pdf(media_type: &str, name: &str) -> bool {
    media_type.trim().eq_ignore_ascii_case(PDF_TYPE)
        || extension(name).is_some_and(|ext| ext == "pdf")
}

/// Validates an upload against the rules of its attachment kind.
pub fn validate_upload(
    kind: AttachmentKind,
    media_type: &str,
    name: &str,
    size: u64,
    max_bytes: u64,
) -> Result<(), ValidationError> {
    let accepted = is_pdf(media_type, name) || (kind.accepts_images() && is_image(media_type, name));
    if !accepted {
        return Err(ValidationError::MediaType {
            kind,
            media_type: media_type.to_string(),
        });
    }
    if size > max_bytes {
        return Err(ValidationError::FileTooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(())
}

fn extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_lowercase())
}
