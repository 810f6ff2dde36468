use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use remisiones::cli::{Cli, Command};
use remisiones::config::RemisionesConfig;
use remisiones::document::{AssembleOptions, AssemblyError, DocumentAssembler, cancellation};
use remisiones::orchestrator::RemisionOrchestrator;
use remisiones::repository::{FileRepository, RemisionRepository};
use remisiones::state_machine::{Estado, Remision, StateMachine};
use remisiones::store::HttpAttachmentStore;
use remisiones::ui;

const CLI_ACTOR: &str = "cli";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = RemisionesConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Assemble { file, cover, out } => assemble(&config, &file, cover, &out).await,
        Command::Transition {
            file,
            to,
            justification,
            actor,
        } => transition(&config, &file, to, justification.as_deref(), &actor).await,
        Command::Suggest { file } => {
            let remision = load(&FileRepository::open(&file)).await?;
            ui::print_suggestion(
                &remision.remision,
                remision.estado,
                StateMachine::suggest(&remision),
            );
            Ok(())
        }
        Command::States => {
            ui::print_states();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn orchestrator<R: RemisionRepository>(
    config: &RemisionesConfig,
    repository: R,
) -> Result<RemisionOrchestrator<R, HttpAttachmentStore>> {
    let store = HttpAttachmentStore::new(config.max_attachment_bytes)?;
    let assembler = DocumentAssembler::new(store, config.assembler_config());
    Ok(RemisionOrchestrator::new(repository, assembler)
        .with_retry(config.retry_config())
        .with_max_attachment_bytes(config.max_attachment_bytes))
}

async fn load(repository: &FileRepository) -> Result<Remision> {
    repository
        .load()
        .await
        .with_context(|| format!("reading {}", repository.path().display()))
}

async fn assemble(config: &RemisionesConfig, file: &Path, cover: bool, out: &Path) -> Result<()> {
    let repository = FileRepository::open(file);
    let remision = load(&repository).await?;
    let orch = orchestrator(config, repository)?;
    let options = AssembleOptions {
        include_cover: cover || config.include_cover,
    };

    let (canceller, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let progress = ui::AssemblyProgress::start(&remision.remision);
    match orch.consolidate_cancellable(&remision, options, signal).await {
        Ok(result) => {
            std::fs::create_dir_all(out)
                .with_context(|| format!("creating {}", out.display()))?;
            let path = out.join(&result.filename);
            std::fs::write(&path, &result.bytes)
                .with_context(|| format!("writing {}", path.display()))?;
            progress.complete(&result, &path.display().to_string());
            orch.record_consolidation(&remision.id, &result, CLI_ACTOR)
                .await
                .with_context(|| format!("recording consolidation in {}", file.display()))?;
            Ok(())
        }
        Err(AssemblyError::NoContentAvailable { warnings }) => {
            progress.fail("No hay contenido para consolidar", &warnings);
            bail!("no attachment produced any page")
        }
        Err(e) => {
            progress.fail(&e.to_string(), &[]);
            Err(e.into())
        }
    }
}

async fn transition(
    config: &RemisionesConfig,
    file: &Path,
    to: Estado,
    justification: Option<&str>,
    actor: &str,
) -> Result<()> {
    let repository = FileRepository::open(file);
    let id = load(&repository).await?.id;
    let orch = orchestrator(config, repository)?;

    // The commit re-checks the stored version and appends to `<file>.audit.jsonl`.
    let outcome = orch
        .transition_with_retry(&id, to, justification, actor)
        .await?;
    ui::print_transition(&outcome);
    Ok(())
}
