use anyhow::{Context, Result, bail};
use docflow::cancellation::StateStore;
use docflow::config::EngineConfig;
use docflow::orchestrator::{
    ExtractionTemplate, Orchestrator, OrchestratorEvent, ProcessingSession, ProcessingStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::collaborators::{LineFieldExtractor, PlainTextIngestor};

const REPORTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// `path`, or the default location under the user config directory.
pub fn config_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => EngineConfig::default_path()
            .context("could not determine the user configuration directory"),
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = EngineConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    for warning in config.warnings() {
        warn!("{warning}");
    }
    Ok(config)
}

/// Read a template file. `.toml` files are parsed as TOML, anything else as JSON.
pub fn load_template(path: &Path) -> Result<ExtractionTemplate> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;

    let template: ExtractionTemplate = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("invalid TOML template {}", path.display()))?,
        _ => serde_json::from_str(&contents)
            .with_context(|| format!("invalid JSON template {}", path.display()))?,
    };
    template.validate()?;
    Ok(template)
}

fn build_orchestrator(config: EngineConfig) -> Result<Arc<Orchestrator>> {
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(PlainTextIngestor),
        Arc::new(LineFieldExtractor),
    )?;
    Ok(Arc::new(orchestrator))
}

pub async fn run(
    mut config: EngineConfig,
    template: &Path,
    files: Vec<PathBuf>,
    queue: bool,
    basic: bool,
    output: Option<&Path>,
) -> Result<()> {
    if basic {
        config.disable_enhanced_mode();
    } else if queue {
        config.intelligent_queue_enabled = true;
    }

    let template = load_template(template)?;
    let orchestrator = build_orchestrator(config)?;
    info!(
        template = %template.name,
        files = files.len(),
        features = ?orchestrator.config().active_features(),
        "Starting batch"
    );

    let events = orchestrator.subscribe();
    orchestrator.start(files, template)?;
    drive(&orchestrator, events, output).await
}

pub async fn resume(config: EngineConfig, state_file: &Path, output: Option<&Path>) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let events = orchestrator.subscribe();
    let session_id = orchestrator
        .load_and_resume(state_file)
        .await
        .with_context(|| format!("failed to resume from {}", state_file.display()))?;
    info!(%session_id, "Resumed batch");
    drive(&orchestrator, events, output).await
}

/// Report progress until the batch finishes, cancelling on Ctrl+C.
async fn drive(
    orchestrator: &Arc<Orchestrator>,
    events: broadcast::Receiver<OrchestratorEvent>,
    output: Option<&Path>,
) -> Result<()> {
    let reporter = tokio::spawn(report_events(events));

    let save_state = orchestrator.config().cancellation.save_by_default;
    let interrupt = {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current file");
                orchestrator.cancel(save_state).await;
            }
        })
    };

    let session = orchestrator.wait().await;
    interrupt.abort();
    // The completion event may have been dropped if the reporter lagged.
    let _ = tokio::time::timeout(REPORTER_DRAIN_TIMEOUT, reporter).await;

    let session = session.context("batch finished without a session")?;
    write_session(&session, output)?;

    if session.cancelled {
        let remaining = session.files.len().saturating_sub(session.results.len());
        warn!(
            session_id = %session.session_id,
            remaining,
            "Batch cancelled, use `docflow-cli states list` to find the saved state"
        );
    } else {
        info!(
            session_id = %session.session_id,
            successful = session.successful_count(),
            failed = session.failed_count(),
            "Batch complete"
        );
    }
    Ok(())
}

async fn report_events(mut events: broadcast::Receiver<OrchestratorEvent>) {
    loop {
        match events.recv().await {
            Ok(OrchestratorEvent::FileCompleted { index, result }) => match result.status {
                ProcessingStatus::Completed => info!(
                    index,
                    file = %result.source_file,
                    fields = result.extracted_data.len(),
                    warnings = result.warnings.len(),
                    "File processed"
                ),
                _ => warn!(
                    index,
                    file = %result.source_file,
                    errors = ?result.errors,
                    "File failed"
                ),
            },
            Ok(OrchestratorEvent::SessionUpdated { completed, total, .. }) => {
                debug!(completed, total, "Session updated");
            }
            Ok(OrchestratorEvent::ProcessingError(message)) => error!("{message}"),
            Ok(OrchestratorEvent::ProcessingCompleted(_)) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn write_session(session: &ProcessingSession, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(session)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Session written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn state_store(config: &EngineConfig) -> StateStore {
    StateStore::new(
        &config.cancellation.state_directory,
        config.cancellation.max_state_files,
    )
}

pub async fn list_states(config: &EngineConfig) -> Result<()> {
    let states = state_store(config).list().await?;
    if states.is_empty() {
        println!(
            "No saved states in {}",
            config.cancellation.state_directory.display()
        );
        return Ok(());
    }

    for state in states {
        let saved_at = state.saved_at.unwrap_or(state.modified);
        match &state.metadata {
            Some(meta) => println!(
                "{}  {}  session={} progress={:.1}% remaining={}",
                saved_at.format("%Y-%m-%d %H:%M:%S"),
                state.path.display(),
                meta.session_id,
                meta.progress,
                meta.remaining_files
            ),
            None => println!(
                "{}  {}  (unreadable)",
                saved_at.format("%Y-%m-%d %H:%M:%S"),
                state.path.display()
            ),
        }
    }
    Ok(())
}

pub async fn delete_state(config: &EngineConfig, state_file: &Path) -> Result<()> {
    state_store(config)
        .delete(state_file)
        .await
        .with_context(|| format!("failed to delete {}", state_file.display()))?;
    println!("Deleted {}", state_file.display());
    Ok(())
}

pub fn show_config(config: &EngineConfig) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    EngineConfig::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_template_json_and_toml() {
        let dir = tempfile::tempdir().unwrap();

        let json = dir.path().join("invoice.json");
        std::fs::write(
            &json,
            r#"{
                "name": "invoice",
                "fields": [
                    {"name": "number", "type": "text"},
                    {"name": "total", "type": "currency", "optional": true}
                ]
            }"#,
        )
        .unwrap();
        let template = load_template(&json).unwrap();
        assert_eq!(template.fields.len(), 2);

        let toml = dir.path().join("invoice.toml");
        std::fs::write(
            &toml,
            "name = \"invoice\"\n\n[[fields]]\nname = \"number\"\ntype = \"text\"\n",
        )
        .unwrap();
        assert_eq!(load_template(&toml).unwrap().name, "invoice");
    }

    #[test]
    fn test_load_template_rejects_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"{"name": "empty", "fields": []}"#).unwrap();
        assert!(load_template(&path).is_err());
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docflow").join("config.toml");

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        assert_eq!(config_path(Some(&path)).unwrap(), path);
        let config = load_config(&path).unwrap();
        assert!(config.enhanced_mode_enabled);
    }
}
