//! Command-line interface for aegis.
//!
//! Provides commands for replaying event files through the coordination
//! core, inspecting workflows recorded in the journal, validating event
//! files, and showing the resolved settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::bus::EventBus;
use crate::config::{self, Settings};
use crate::core::{Dispatcher, WorkflowJournal, WorkflowStatus, WorkflowStore};
use crate::domain::HistoryEvent;
use crate::gateway::{Gateway, HttpBackend};
use crate::ingest;
use crate::reasoning::{CommandReasoner, Reasoner};
use crate::workers::{RuleReasoner, WorkerRegistry};

/// aegis - Coordination core for autonomous e-commerce workflows
#[derive(Parser, Debug)]
#[command(name = "aegis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .aegis/config.yaml in this or a parent directory)
    #[arg(long, global = true, env = "AEGIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "AEGIS_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish events from a JSONL file and dispatch until the bus drains
    Run {
        /// JSONL file of typed events or backend notifications
        #[arg(short, long)]
        events: PathBuf,

        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show workflows recorded for a resource
    Status {
        /// Resource ID (order, product, user)
        resource_id: String,

        /// Print the full history of each workflow
        #[arg(long)]
        history: bool,
    },

    /// Validate an event file without dispatching it
    Validate {
        /// JSONL file to check
        file: PathBuf,
    },

    /// Show resolved configuration
    Config,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load(self.config.as_deref())?;

        match self.command {
            Commands::Run { events, timeout } => {
                run_events(settings, &events, Duration::from_secs(timeout)).await
            }
            Commands::Status {
                resource_id,
                history,
            } => show_status(settings, &resource_id, history).await,
            Commands::Validate { file } => validate_events(&file).await,
            Commands::Config => show_config(&settings),
        }
    }
}

/// Wire the core from settings
pub async fn assemble(settings: &Settings) -> Result<Arc<Dispatcher>> {
    let reasoner: Arc<dyn Reasoner> = match settings
        .reasoning
        .command
        .as_deref()
        .and_then(|cmd| CommandReasoner::from_command_line(cmd, settings.reasoning.timeout()))
    {
        Some(command) => Arc::new(command),
        None => Arc::new(RuleReasoner),
    };

    let backend = Arc::new(HttpBackend::new(&settings.gateway.base_url)?);
    let gateway = Arc::new(Gateway::new(backend, settings.gateway.clone()));

    let store = match &settings.store.journal_path {
        Some(path) => WorkflowStore::with_journal(WorkflowJournal::open(path).await?),
        None => WorkflowStore::new(),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        settings.dispatcher.clone(),
        settings.reasoning.clone(),
        WorkerRegistry::standard(reasoner),
        gateway,
        Arc::new(store),
    ));
    dispatcher.recover().await?;
    Ok(dispatcher)
}

/// Publish an event file and dispatch it
async fn run_events(settings: Settings, path: &Path, timeout: Duration) -> Result<()> {
    let dispatcher = assemble(&settings).await?;
    let bus = Arc::new(EventBus::new(settings.bus.clone()));

    let mut published = 0;
    for line in ingest::read_events(path).await? {
        match line.result {
            Ok(event) => {
                bus.publish(event)
                    .with_context(|| format!("Failed to publish event on line {}", line.line))?;
                published += 1;
            }
            Err(e) => eprintln!("line {}: skipped: {}", line.line, e),
        }
    }

    let drained = dispatcher.run_until_idle(Arc::clone(&bus), timeout).await;
    let metrics = dispatcher.metrics();

    println!("Published: {}", published);
    println!("Processed: {}", metrics.processed);
    println!("Deferred: {}", metrics.deferred);
    println!("Duplicates: {}", metrics.duplicates);
    println!("Unclaimed: {}", metrics.unclaimed);
    println!("Terminated: {}", metrics.terminated);
    println!("Reasoning failures: {}", metrics.reasoning_failures);
    println!("Gateway failures: {}", metrics.gateway_failures);

    let incidents = dispatcher.incidents();
    if !incidents.is_empty() {
        println!("\nIncidents:");
        for incident in &incidents {
            let workflow = incident
                .workflow_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  [{}] {} ({}): {}", incident.at, incident.resource_id, workflow, incident.reason);
        }
    }

    if !drained {
        anyhow::bail!("Bus did not drain within {}s", timeout.as_secs());
    }
    Ok(())
}

/// Show workflows for a resource from the journal
async fn show_status(mut settings: Settings, resource_id: &str, history: bool) -> Result<()> {
    if settings.store.journal_path.is_none() {
        settings.store.journal_path = Some(config::default_journal_path()?);
    }
    let dispatcher = assemble(&settings).await?;

    let statuses = dispatcher.status(resource_id);
    if statuses.is_empty() {
        println!("No workflows for {}", resource_id);
        return Ok(());
    }

    for status in &statuses {
        print_status(status);
        if history {
            let workflow = dispatcher
                .store()
                .by_resource(resource_id)
                .into_iter()
                .find(|w| w.workflow_id == status.workflow_id);
            if let Some(workflow) = workflow {
                println!("  History:");
                for entry in &workflow.history {
                    println!("    {} {}", entry.at.format("%H:%M:%S%.3f"), describe(&entry.event));
                }
            }
        }
        println!();
    }

    Ok(())
}

fn print_status(status: &WorkflowStatus) {
    println!("Workflow: {}", status.workflow_id);
    println!("  Kind: {}", status.kind);
    println!("  State: {}", status.state);
    println!("  Active: {}", status.active);
    println!("  Holds lock: {}", status.holds_lock);
    println!("  Retries: {}", status.retries);
    println!("  Created: {}", status.created_at);
    println!("  Updated: {}", status.updated_at);
    if let Some(rationale) = &status.rationale {
        println!("  Rationale: {}", rationale);
    }
}

fn describe(event: &HistoryEvent) -> String {
    match event {
        HistoryEvent::Created { event_id, category } => format!("created by {} event {}", category, event_id),
        HistoryEvent::EventReceived { event_id } => format!("received event {}", event_id),
        HistoryEvent::EventIgnored { event_id, reason } => format!("ignored event {}: {}", event_id, reason),
        HistoryEvent::Transition {
            from,
            to,
            action,
            rationale,
        } => match action {
            Some(action) => format!("{} -> {} [{}] {}", from.name(), to.name(), action, rationale),
            None => format!("{} -> {} {}", from.name(), to.name(), rationale),
        },
        HistoryEvent::ReasoningFailed { attempt, reason } => {
            format!("reasoning attempt {} failed: {}", attempt, reason)
        }
        HistoryEvent::FallbackApplied { action, reason } => format!("fallback {}: {}", action, reason),
        HistoryEvent::InvalidDecision { action, state } => {
            format!("invalid decision {} in {}", action, state)
        }
        HistoryEvent::GroundingUnavailable { operation, reason } => {
            format!("grounding {} unavailable: {}", operation, reason)
        }
        HistoryEvent::GatewayCallSucceeded {
            operation,
            idempotency_key,
        } => format!("{} ok ({})", operation, idempotency_key),
        HistoryEvent::GatewayCallFailed {
            operation,
            reason,
            transient,
        } => format!(
            "{} failed ({}): {}",
            operation,
            if *transient { "transient" } else { "permanent" },
            reason
        ),
        HistoryEvent::StepSkipped { idempotency_key } => format!("skipped applied step {}", idempotency_key),
        HistoryEvent::Cancelled { reason } => format!("cancelled: {}", reason),
        HistoryEvent::Expired { age_seconds } => format!("expired after {}s", age_seconds),
    }
}

/// Check every line of an event file
async fn validate_events(path: &Path) -> Result<()> {
    let lines = ingest::read_events(path).await?;
    let mut invalid = 0;

    for line in &lines {
        match &line.result {
            Ok(event) => println!(
                "line {}: ok {} {} ({})",
                line.line, event.category, event.resource_id, event.id
            ),
            Err(e) => {
                invalid += 1;
                println!("line {}: invalid: {}", line.line, e);
            }
        }
    }

    println!("\n{} events, {} invalid", lines.len(), invalid);
    if invalid > 0 {
        anyhow::bail!("{} invalid events in {}", invalid, path.display());
    }
    Ok(())
}

/// Print resolved settings
fn show_config(settings: &Settings) -> Result<()> {
    match &settings.source {
        Some(path) => println!("# Config file: {}", path.display()),
        None => println!("# Config file: (none found, using defaults)"),
    }
    print!("{}", settings.to_yaml()?);
    Ok(())
}
