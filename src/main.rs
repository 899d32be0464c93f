use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use capability_orchestrator::{
    app_context::AppContext,
    config::OrchestratorConfig,
    core::Capability,
    observability::{init_logging, parse_level, LoggingConfig},
    workflow::{ErrorDetail, ExecutionPlan, ExplicitStep, PlanningMode, RequestConfig},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "capability-orchestrator")]
#[command(about = "Plan and execute capability workflows across inference services")]
struct Cli {
    /// Orchestrator configuration (YAML or JSON)
    #[arg(long, short, global = true, default_value = "orchestrator.yaml")]
    config: PathBuf,

    #[arg(long, global = true, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// Also write daily-rotated log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a request and print the result as JSON
    Run {
        #[command(flatten)]
        request: RequestArgs,

        /// Explicit step list (JSON array) to run instead of planning
        #[arg(long)]
        workflow_file: Option<PathBuf>,

        /// Overall run deadline
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        step_timeout_ms: Option<u64>,

        #[arg(long)]
        max_concurrency: Option<usize>,

        #[arg(long, value_enum)]
        planning_mode: Option<PlanningModeArg>,
    },
    /// Print the execution plan without executing it
    Plan {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// List registered services
    Services {
        #[arg(long)]
        capability: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Caller input as key=value; values that parse as JSON are taken as JSON
    #[arg(long = "input", value_parser = parse_key_value)]
    inputs: Vec<(String, Value)>,

    /// JSON object of caller inputs, merged under --input
    #[arg(long)]
    inputs_file: Option<PathBuf>,

    /// Desired output name
    #[arg(long = "output")]
    outputs: Vec<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PlanningModeArg {
    BestEffort,
    AllOrNothing,
}

impl From<PlanningModeArg> for PlanningMode {
    fn from(mode: PlanningModeArg) -> Self {
        match mode {
            PlanningModeArg::BestEffort => PlanningMode::BestEffort,
            PlanningModeArg::AllOrNothing => PlanningMode::AllOrNothing,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

impl RequestArgs {
    fn collect_inputs(&self) -> Result<Map<String, Value>> {
        let mut inputs = match &self.inputs_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                match serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?
                {
                    Value::Object(map) => map,
                    _ => bail!("{} must contain a JSON object", path.display()),
                }
            }
            None => Map::new(),
        };
        for (key, value) in &self.inputs {
            inputs.insert(key.clone(), value.clone());
        }
        Ok(inputs)
    }
}

#[derive(Serialize)]
struct PlanReport<'a> {
    plan: ExecutionPlan,
    errors: BTreeMap<&'a str, ErrorDetail>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(LoggingConfig {
        level: parse_level(&cli.log_level).unwrap_or(tracing::Level::INFO),
        json_format: cli.log_json,
        log_dir: cli.log_dir.clone(),
        ..Default::default()
    });

    let config = OrchestratorConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let ctx = AppContext::from_config(config).await?;

    match cli.command {
        Commands::Run {
            request,
            workflow_file,
            timeout_ms,
            step_timeout_ms,
            max_concurrency,
            planning_mode,
        } => {
            let inputs = request.collect_inputs()?;
            let overrides = RequestConfig {
                timeout_ms,
                max_concurrency,
                retry_policy: None,
                step_timeout_ms,
                planning_mode: planning_mode.map(Into::into),
            };

            let probe = ctx.start_health_probe();
            let result = match workflow_file {
                Some(path) => {
                    let contents = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    let steps: Vec<ExplicitStep> = serde_json::from_str(&contents)
                        .with_context(|| format!("failed to parse {}", path.display()))?;
                    ctx.engine.run_explicit(inputs, &steps, Some(&overrides)).await
                }
                None => {
                    if request.outputs.is_empty() {
                        bail!("at least one --output is required");
                    }
                    ctx.engine
                        .run(inputs, &request.outputs, Some(&overrides))
                        .await
                }
            };
            if let Some(probe) = probe {
                probe.shutdown().await;
            }

            info!(run_id = %result.run_id, status = ?result.status, "Request completed");
            print_json(&result)?;
        }
        Commands::Plan { request } => {
            let inputs = request.collect_inputs()?;
            let available: HashSet<String> = inputs.keys().cloned().collect();
            let outcome = ctx.planner.plan_best_effort(&available, &request.outputs);
            let report = PlanReport {
                errors: outcome
                    .errors
                    .iter()
                    .map(|(output, err)| (output.as_str(), err.detail()))
                    .collect(),
                plan: outcome.plan,
            };
            print_json(&report)?;
        }
        Commands::Services { capability } => {
            let capability = capability.map(|c| Capability::new(c.as_str()));
            print_json(&ctx.registry.query(capability.as_ref()))?;
        }
    }

    Ok(())
}
