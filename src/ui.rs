//! Interfaz de terminal de `remisiones`: spinners y salida con color.
//!
//! Usa `indicatif` para el spinner de consolidación y `console` para los
//! estilos. Los resúmenes se imprimen en stdout; el log va por `tracing`.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::document::{AssemblyWarning, ConsolidationResult};
use crate::orchestrator::TransitionOutcome;
use crate::state_machine::{AttachmentKind, Estado, StateMachine};

/// Indicador visual mientras se consolida una remisión.
///
/// Muestra un spinner durante las descargas y la fusión, y luego el
/// resultado en verde (incluidos), amarillo (omitidos) o rojo (fallo).
pub struct AssemblyProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl AssemblyProgress {
    /// Inicia el spinner con el código de la remisión.
    pub fn start(remision: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("Consolidando {remision}..."));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Detiene el spinner y lista qué tipos se incluyeron y cuáles se omitieron.
    pub fn complete(&self, result: &ConsolidationResult, path: &str) {
        self.pb.finish_and_clear();
        println!(
            "  {} {} ({} páginas)",
            self.green.apply_to("✓"),
            path,
            result.page_count
        );
        if result.has_cover {
            println!("    {} portada", self.green.apply_to("+"));
        }
        for included in &result.included {
            println!(
                "    {} {} ({} páginas)",
                self.green.apply_to("+"),
                included.kind,
                included.pages
            );
        }
        self.print_warnings(&result.warnings);
    }

    pub fn fail(&self, message: &str, warnings: &[AssemblyWarning]) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.red.apply_to("✗"));
        self.print_warnings(warnings);
    }

    fn print_warnings(&self, warnings: &[AssemblyWarning]) {
        for warning in warnings {
            println!(
                "    {} {}: {}",
                self.yellow.apply_to("-"),
                warning.kind,
                warning.reason
            );
        }
    }
}

/// Imprime el resultado de un cambio de estado y su entrada de auditoría.
pub fn print_transition(outcome: &TransitionOutcome) {
    let green = Style::new().green().bold();
    let yellow = Style::new().yellow();
    println!(
        "  {} {} ahora está en {}",
        green.apply_to("✓"),
        outcome.remision.remision,
        outcome.remision.estado
    );
    for advisory in &outcome.advisories {
        println!("  {} {advisory}", yellow.apply_to("!"));
    }
    println!();
    println!("{}", Style::new().dim().apply_to("─── Auditoría ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.audit).unwrap_or_default()
    );
}

pub fn print_suggestion(remision: &str, current: Estado, suggestion: Option<Estado>) {
    match suggestion {
        Some(next) => println!(
            "  {} {remision}: {current} → {} ({})",
            Style::new().cyan().apply_to("→"),
            next,
            next.description()
        ),
        None => println!("  {remision}: sin sugerencia desde {current}"),
    }
}

/// Tabla de estados con descripción y destinos permitidos.
pub fn print_states() {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for estado in Estado::ALL {
        let targets: Vec<&str> = estado
            .allowed_targets()
            .iter()
            .filter(|to| StateMachine::can_transition(estado, **to))
            .map(|to| to.as_str())
            .collect();
        let targets = if targets.is_empty() {
            "(terminal)".to_string()
        } else {
            targets.join(", ")
        };
        let marker = if estado.is_special() { " *" } else { "" };
        println!("{:<14}{marker}", bold.apply_to(estado.as_str()));
        println!("    {}", dim.apply_to(estado.description()));
        println!("    → {targets}");
    }
    println!();
    println!("{}", dim.apply_to("* requiere justificación"));
    let order: Vec<&str> = AttachmentKind::ORDER.iter().map(|k| k.as_str()).collect();
    println!(
        "{}",
        dim.apply_to(format!("Orden de consolidación: {}", order.join(", ")))
    );
}
