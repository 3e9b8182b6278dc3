//! resilience-kit command line.
//!
//! # Commands
//! - `simulate`: drive a randomly failing dependency through the full
//!   pipeline, open an incident whenever the breaker trips, print stats
//! - `check-config`: load and validate a TOML config file
//! - `default-config`: print the default config as TOML
//!
//! ```text
//! request i ──▶ ResiliencePipeline ──▶ flaky dependency
//!                    │
//!                    ▼ breaker state after each outcome
//!             incident state machine (detected → ... → closed)
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinSet;

use resilience_kit::config::{load_config, ToolkitConfig};
use resilience_kit::idempotency::IdempotencyKey;
use resilience_kit::observability::{logging, metrics};
use resilience_kit::resilience::{CallOptions, CircuitState, PipelineError, ResiliencePipeline};
use resilience_kit::state_machine::{incident_lifecycle, Context, StateMachine, StateMachineInstance};

#[derive(Parser)]
#[command(name = "resilience-kit")]
#[command(about = "Idempotency, retries, circuit breaking and backpressure for flaky dependencies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated workload against a flaky dependency
    Simulate {
        /// TOML config file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short = 'n', long, default_value_t = 200)]
        requests: u32,

        /// Probability that a single attempt fails
        #[arg(short, long, default_value_t = 0.3)]
        failure_rate: f64,

        /// Latency of one dependency call
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,

        /// Delay between request arrivals
        #[arg(long, default_value_t = 5)]
        interval_ms: u64,
    },
    /// Validate a config file
    CheckConfig { path: PathBuf },
    /// Print the default config
    DefaultConfig,
}

#[derive(Debug, thiserror::Error)]
enum DependencyError {
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("429 too many requests")]
    Throttled,
    #[error("response failed schema validation")]
    BadResponse,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            requests,
            failure_rate,
            latency_ms,
            interval_ms,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => ToolkitConfig::default(),
            };
            logging::init_logging(&config.observability);
            if config.observability.metrics_enabled {
                let addr: SocketAddr = config.observability.metrics_address.parse()?;
                metrics::init_metrics(addr);
            }

            let workload = Workload {
                requests,
                failure_rate: failure_rate.clamp(0.0, 1.0),
                latency: Duration::from_millis(latency_ms),
                interval: Duration::from_millis(interval_ms),
            };
            let report = simulate(config, workload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckConfig { path } => check_config(&path),
        Commands::DefaultConfig => {
            print!("{}", toml::to_string_pretty(&ToolkitConfig::default())?);
        }
    }

    Ok(())
}

fn check_config(path: &Path) {
    match load_config(path) {
        Ok(_) => println!("{}: ok", path.display()),
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

struct Workload {
    requests: u32,
    failure_rate: f64,
    latency: Duration,
    interval: Duration,
}

/// One simulated call to the dependency.
async fn call_dependency(failure_rate: f64, latency: Duration) -> Result<String, DependencyError> {
    let roll: f64 = rand::thread_rng().gen();
    tokio::time::sleep(latency).await;
    if roll >= failure_rate {
        Ok(format!("ok-{}", uuid::Uuid::new_v4()))
    } else if roll < failure_rate * 0.1 {
        Err(DependencyError::BadResponse)
    } else if roll < failure_rate * 0.2 {
        Err(DependencyError::Throttled)
    } else {
        Err(DependencyError::ConnectionReset)
    }
}

async fn simulate(config: ToolkitConfig, workload: Workload) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let pipeline: Arc<ResiliencePipeline<String>> = Arc::new(ResiliencePipeline::from_config("dependency", &config));
    let incidents = incident_lifecycle()?;
    let mut tracker = IncidentTracker::new(incidents);
    let mut outcomes: BTreeMap<&'static str, u32> = BTreeMap::new();
    let mut tasks = JoinSet::new();

    tracing::info!(requests = workload.requests, failure_rate = workload.failure_rate, "Starting simulation");

    for i in 0..workload.requests {
        // every fifth request is a redelivery of the previous one
        let id = if i % 5 == 4 { i - 1 } else { i };
        let key = IdempotencyKey::new(format!("req-{id}"));
        let is_critical = i % 4 == 0;
        let task_pipeline = pipeline.clone();
        let (failure_rate, latency) = (workload.failure_rate, workload.latency);

        tasks.spawn(async move {
            let options = CallOptions::new().payload(json!({ "request": i, "critical": is_critical }));
            task_pipeline
                .execute(&key, is_critical, options, || call_dependency(failure_rate, latency))
                .await
        });

        while let Some(joined) = tasks.try_join_next() {
            *outcomes.entry(outcome_label(&joined?)).or_default() += 1;
            tracker.observe(pipeline.breaker().state());
        }
        tokio::time::sleep(workload.interval).await;
    }

    while let Some(joined) = tasks.join_next().await {
        *outcomes.entry(outcome_label(&joined?)).or_default() += 1;
        tracker.observe(pipeline.breaker().state());
    }

    Ok(json!({
        "outcomes": outcomes,
        "pipeline": pipeline.stats(),
        "poison_messages": pipeline.poison_messages(),
        "incidents": tracker.incidents,
    }))
}

fn outcome_label(result: &Result<Arc<String>, PipelineError<DependencyError>>) -> &'static str {
    match result {
        Ok(_) => "succeeded",
        Err(PipelineError::Rejected(rejection)) => rejection.reason(),
        Err(PipelineError::CircuitOpen(_)) => "circuit_open",
        Err(PipelineError::Failed(_)) => "failed",
    }
}

/// Opens an incident when the breaker trips and walks it to closed once
/// the breaker recovers.
struct IncidentTracker {
    machine: StateMachine,
    active: Option<StateMachineInstance>,
    incidents: Vec<StateMachineInstance>,
}

impl IncidentTracker {
    fn new(machine: StateMachine) -> Self {
        Self {
            machine,
            active: None,
            incidents: Vec::new(),
        }
    }

    fn observe(&mut self, breaker: CircuitState) {
        if let Some(incident) = self.active.as_mut() {
            if let Some(event) = self.machine.check_timeout(incident) {
                self.machine.transition(incident, &event, None);
            }
        }

        match (breaker, self.active.take()) {
            (CircuitState::Open, None) => {
                let mut incident = self
                    .machine
                    .create_instance(format!("incident-{}", self.incidents.len() + 1), None);
                self.machine.transition(&mut incident, "triage", None);
                self.machine.transition(&mut incident, "mitigate", None);
                self.active = Some(incident);
            }
            (CircuitState::Closed, Some(mut incident)) => {
                let mut data = Context::new();
                data.insert("root_cause".into(), json!("dependency error rate above breaker threshold"));
                if incident.current_state() == "escalated" {
                    self.machine.transition(&mut incident, "mitigate", None);
                }
                self.machine.transition(&mut incident, "resolve", None);
                self.machine.transition(&mut incident, "close", Some(data));
                self.incidents.push(incident);
            }
            (_, active) => self.active = active,
        }
    }
}
