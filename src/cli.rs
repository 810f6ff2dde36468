//! Interfaz de línea de comandos de `remisiones` basada en clap.
//!
//! Define la struct [`Cli`] con los subcomandos de [`Command`] (assemble,
//! transition, suggest, states) y las flags globales (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::state_machine::Estado;

/// Motor de ciclo de vida y consolidación documental de remisiones.
#[derive(Debug, Parser)]
#[command(name = "remisiones", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Ruta del archivo de configuración (por defecto `remisiones.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita salida detallada.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consolida los adjuntos de una remisión en un único PDF.
    Assemble {
        /// Archivo JSON con la remisión.
        file: PathBuf,

        /// Antepone una portada con los datos de la remisión.
        #[arg(long)]
        cover: bool,

        /// Directorio donde escribir el PDF.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Cambia el estado de una remisión y registra la auditoría junto al archivo.
    Transition {
        /// Archivo JSON con la remisión.
        file: PathBuf,

        /// Estado destino (p. ej. RADICADO, sin-vincular).
        #[arg(long, value_parser = parse_estado)]
        to: Estado,

        /// Justificación, obligatoria para estados especiales.
        #[arg(long)]
        justification: Option<String>,

        /// Usuario que realiza el cambio.
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Muestra el siguiente estado sugerido según los adjuntos.
    Suggest {
        /// Archivo JSON con la remisión.
        file: PathBuf,
    },

    /// Lista los estados y sus transiciones permitidas.
    States,
}

fn parse_estado(value: &str) -> Result<Estado, String> {
    value.parse()
}
