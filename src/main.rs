//! tomopipe - Main Entry Point
//!
//! Runs operator pipelines over volume files, and doubles as the runner that
//! external and container executors launch with `execute-state`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tomopipe::{
    buffer::VolumeBuffer,
    config::{settings_path, ExecutionMode, PipelineSettings, ProgressChannelKind},
    operator::{factory::parse_operator_list, OperatorFactory},
    pipeline::{drain, Pipeline, PipelineNotification},
    runner::{execute_state, RunnerArgs},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Operator pipeline execution for tomographic volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file, instead of the default location
    #[arg(long, global = true, env = "TOMOPIPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply an operator list to a volume
    Run {
        /// Input volume (.tvb)
        input: PathBuf,

        /// JSON operator list
        operators: PathBuf,

        /// Where to write the pipeline output
        #[arg(short, long)]
        output: PathBuf,

        /// Override the configured execution mode
        #[arg(long)]
        mode: Option<ExecutionMode>,

        /// Also write every child data source into this directory
        #[arg(long)]
        children: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },

    /// Execute a serialized pipeline state (runner side)
    ExecuteState {
        #[arg(short = 's', long)]
        state: PathBuf,

        #[arg(short = 'i', long, default_value_t = 0)]
        start: usize,

        #[arg(short = 'o', long)]
        output: PathBuf,

        #[arg(short = 'p', long, default_value = "files")]
        progress: ProgressChannelKind,

        #[arg(short = 'u', long)]
        progress_path: Option<PathBuf>,
    },

    /// Inspect or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print the effective settings
    Show,
    /// Set a value by dotted key, e.g. `docker.image`
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => PipelineSettings::load_from(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => PipelineSettings::load_or_default(),
    };

    // Keep the guard alive so buffered log lines are flushed on exit
    let _guard = init_logging(&settings);

    match cli.command {
        Command::Run {
            input,
            operators,
            output,
            mode,
            children,
            timeout,
        } => {
            let mut settings = settings;
            if let Some(mode) = mode {
                settings.execution_mode = mode;
            }
            run(
                settings,
                &input,
                &operators,
                &output,
                children.as_deref(),
                Duration::from_secs(timeout),
            )
        }
        Command::ExecuteState {
            state,
            start,
            output,
            progress,
            progress_path,
        } => {
            let args = RunnerArgs {
                state,
                start,
                output,
                progress,
                progress_path,
            };
            execute_state(&args, &OperatorFactory::default())?;
            Ok(())
        }
        Command::Settings { action } => match action {
            SettingsAction::Show => {
                print!("{}", toml::to_string_pretty(&settings)?);
                Ok(())
            }
            SettingsAction::Set { key, value } => {
                let mut settings = settings;
                settings.set_value(&key, &value).map_err(anyhow::Error::msg)?;
                let path = match cli.config.or_else(settings_path) {
                    Some(path) => path,
                    None => bail!("could not determine settings path"),
                };
                settings.save_to(&path)?;
                tracing::info!("saved {} to {}", key, path.display());
                Ok(())
            }
        },
    }
}

fn init_logging(settings: &PipelineSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tomopipe=debug"));
    // The runner's stdout and stderr are captured by the host
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tomopipe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn run(
    settings: PipelineSettings,
    input: &Path,
    operators: &Path,
    output: &Path,
    children: Option<&Path>,
    timeout: Duration,
) -> Result<()> {
    let buffer = VolumeBuffer::read_from(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let content = std::fs::read_to_string(operators)
        .with_context(|| format!("reading {}", operators.display()))?;
    let configs = parse_operator_list(&content)?;
    let ops = OperatorFactory::default().from_json_list(&configs)?;

    let label = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    tracing::info!(
        mode = %settings.execution_mode,
        operators = ops.len(),
        "running pipeline on {}",
        label
    );

    let mut pipeline = Pipeline::new(label, buffer, settings)?;
    let notifications = pipeline.notifications();
    let root = pipeline.root();

    // Queue the whole chain before the first run
    pipeline.pause();
    for op in ops {
        pipeline.add_operator(root, op)?;
    }
    pipeline.resume()?;

    if !pipeline.wait_for_idle(timeout) {
        pipeline.cancel(None);
        bail!("pipeline did not finish within {:?}", timeout);
    }

    let mut errors = Vec::new();
    for notification in drain(&notifications) {
        match notification {
            PipelineNotification::Error(report) => {
                errors.push(format!("{}: {}", report.title, report.message))
            }
            PipelineNotification::OperatorFinished { operator, result } => {
                tracing::debug!(%operator, ?result, "operator finished")
            }
            _ => {}
        }
    }
    if !errors.is_empty() {
        bail!(errors.join("\n"));
    }

    let result = match pipeline.last_result() {
        Some(result) => result,
        None => bail!("pipeline produced no output"),
    };
    result.write_to(output)?;
    tracing::info!("wrote {}", output.display());

    if let Some(dir) = children {
        std::fs::create_dir_all(dir)?;
        for id in pipeline.tree().data_source_ids() {
            if id == root {
                continue;
            }
            if let Some(ds) = pipeline.data_source(id) {
                let path = dir.join(format!("{}-{}.tvb", id, ds.label.replace('/', "_")));
                ds.buffer.write_to(&path)?;
            }
        }
    }
    Ok(())
}
