//! Tipos de error para la descarga de adjuntos.
//!
//! Define [`FetchError`] con variantes para respuestas HTTP fallidas, errores
//! de red, tiempos de espera agotados y archivos demasiado grandes. Usa
//! `thiserror` para derivar `Display` y `Error` a partir de `#[error(...)]`.

use std::time::Duration;

use thiserror::Error;

/// Errores al obtener los bytes de un adjunto desde el almacén.
///
/// Para el ensamblador todos son recuperables: el adjunto se omite y se
/// registra una advertencia.
#[derive(Debug, Error)]
pub enum FetchError {
    /// El almacén respondió con un estado no exitoso (4xx/5xx).
    #[error("store returned status {status} for {url}")]
    Status { status: u16, url: String },

    /// Falla de red subyacente (DNS, conexión rechazada, cuerpo truncado).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// La descarga no terminó dentro del plazo configurado.
    #[error("fetch of {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    /// El adjunto supera el tamaño máximo permitido.
    #[error("{url} is {size} bytes, limit is {limit}")]
    TooLarge { url: String, size: u64, limit: u64 },

    /// Lectura de un adjunto local (`file://`) fallida.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
}
