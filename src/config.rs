//! Configuración de `remisiones` cargada desde `remisiones.toml`.
//!
//! La struct [`RemisionesConfig`] reúne los parámetros ajustables del motor.
//! Los valores ausentes en el archivo usan defaults razonables.
//! La variable de entorno `REMISIONES_FETCH_TIMEOUT_SECS` tiene precedencia
//! sobre el archivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::document::assembler::MAX_CONCURRENT_FETCHES;
use crate::document::{AssemblerConfig, PageLayout};
use crate::orchestrator::RetryConfig;

pub const DEFAULT_CONFIG_FILE: &str = "remisiones.toml";
pub const FETCH_TIMEOUT_ENV: &str = "REMISIONES_FETCH_TIMEOUT_SECS";

/// Configuración de nivel superior cargada de `remisiones.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemisionesConfig {
    /// Tiempo máximo por descarga de adjunto, en segundos.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Descargas simultáneas por consolidación (1 a 3).
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Si se antepone la portada al PDF consolidado.
    #[serde(default)]
    pub include_cover: bool,

    /// Margen de página para imágenes, en milímetros.
    #[serde(default = "default_page_margin_mm")]
    pub page_margin_mm: f32,

    /// Tamaño máximo aceptado por adjunto, en bytes.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    /// Reintentos tras una modificación concurrente.
    #[serde(default = "default_conflict_max_retries")]
    pub conflict_max_retries: u32,

    /// Retraso base en milisegundos para el backoff exponencial.
    #[serde(default = "default_conflict_base_delay_ms")]
    pub conflict_base_delay_ms: u64,
}

// Valor por defecto del timeout de descarga: 30s.
fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_fetches() -> usize {
    MAX_CONCURRENT_FETCHES
}

// Valor por defecto del margen: 10mm.
fn default_page_margin_mm() -> f32 {
    10.0
}

// 10 MiB.
fn default_max_attachment_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_conflict_max_retries() -> u32 {
    3
}

fn default_conflict_base_delay_ms() -> u64 {
    50
}

impl Default for RemisionesConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            include_cover: false,
            page_margin_mm: default_page_margin_mm(),
            max_attachment_bytes: default_max_attachment_bytes(),
            conflict_max_retries: default_conflict_max_retries(),
            conflict_base_delay_ms: default_conflict_base_delay_ms(),
        }
    }
}

impl RemisionesConfig {
    /// Carga la configuración desde `path`, o desde `remisiones.toml` en el
    /// directorio actual. Usa los valores por defecto si el archivo no existe.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<RemisionesConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        // La variable de entorno tiene precedencia sobre el archivo.
        if let Ok(value) = std::env::var(FETCH_TIMEOUT_ENV)
            && !value.trim().is_empty()
        {
            config.fetch_timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("{FETCH_TIMEOUT_ENV} must be a number of seconds"))?;
        }

        Ok(config)
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_concurrent_fetches: self.max_concurrent_fetches.clamp(1, MAX_CONCURRENT_FETCHES),
            layout: PageLayout::a4(self.page_margin_mm),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.conflict_max_retries,
            base_delay_ms: self.conflict_base_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = RemisionesConfig::default();
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.max_concurrent_fetches, 3);
        assert!(!config.include_cover);
        assert_eq!(config.page_margin_mm, 10.0);
        assert_eq!(config.max_attachment_bytes, 10 * 1024 * 1024);
        assert_eq!(config.conflict_max_retries, 3);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            include_cover = true
            max_concurrent_fetches = 2
        "#;
        let config: RemisionesConfig = toml::from_str(toml_str).unwrap();
        assert!(config.include_cover);
        assert_eq!(config.max_concurrent_fetches, 2);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.conflict_base_delay_ms, 50);
    }

    #[test]
    fn load_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "page_margin_mm = 5.0\nconflict_max_retries = 7").unwrap();
        let config = RemisionesConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.page_margin_mm, 5.0);
        assert_eq!(config.conflict_max_retries, 7);
        assert_eq!(config.retry_config().max_retries, 7);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RemisionesConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.max_concurrent_fetches, 3);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fetch_timeout_secs = \"soon\"").unwrap();
        assert!(RemisionesConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn assembler_config_clamps_concurrency() {
        let config = RemisionesConfig {
            max_concurrent_fetches: 8,
            fetch_timeout_secs: 12,
            ..Default::default()
        };
        let assembler = config.assembler_config();
        assert_eq!(assembler.max_concurrent_fetches, 3);
        assert_eq!(assembler.fetch_timeout, Duration::from_secs(12));
        assert_eq!(assembler.layout, PageLayout::a4(10.0));
    }
}
