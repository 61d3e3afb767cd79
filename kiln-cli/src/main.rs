//! Kiln CLI - execute declarative AI workflows

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kiln_core::error::KilnError;
use kiln_core::prelude::*;
use kiln_core::session::structure_hash;
use kiln_core::target;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Declarative AI workflow execution engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Execute {
        /// Path to the workflow document
        workflow: PathBuf,

        /// Target resource (positional form)
        target_arg: Option<String>,

        /// Redirect the final output to a file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Concise mode (sets workflow.concise)
        #[arg(short, long)]
        concise: bool,

        /// Verbose mode: stream per-step output
        #[arg(short, long)]
        verbose: bool,

        /// Resume a session: [session_id:]step_name
        #[arg(short, long)]
        replay: Option<String>,

        /// Target override
        #[arg(short = 't', long = "target")]
        target: Option<String>,
    },
    /// Version information
    Version,
}

/// Prints step progress and, in verbose mode, streams step output.
struct ConsoleSink {
    verbose: bool,
}

impl EventSink for ConsoleSink {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::StepStarted { name, .. } => {
                eprintln!("→ {}", name);
            }
            ExecutionEvent::StepFinished { name, output, .. } => {
                if self.verbose && !output.is_empty() {
                    eprintln!("── {} ──", name);
                    eprintln!("{}", output.trim_end());
                }
            }
            ExecutionEvent::StepFailed { name, error } => {
                eprintln!("✗ {}: {}", name, error);
            }
            ExecutionEvent::StepTimeout { name, timeout_ms } => {
                eprintln!("✗ {} timed out after {}ms", name, timeout_ms);
            }
            ExecutionEvent::RepeatExhausted { name, iterations } => {
                eprintln!("! {} exhausted after {} iterations", name, iterations);
            }
            ExecutionEvent::ParallelOutputConflict { key } => {
                eprintln!("! parallel steps both wrote '{}'", key);
            }
            ExecutionEvent::ToolDispatched { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {}", error);
            match &error {
                KilnError::Config(_) => ExitCode::from(2),
                e if e.is_cancellation() => ExitCode::from(130),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            println!("kiln {}", env!("CARGO_PKG_VERSION"));
            println!("kiln-core {}", kiln_core::VERSION);
            Ok(())
        }
        Commands::Execute {
            workflow,
            target_arg,
            output,
            concise,
            verbose,
            replay,
            target,
        } => {
            execute(
                workflow, target_arg, output, concise, verbose, replay, target,
            )
            .await
        }
    }
}

async fn execute(
    workflow_path: PathBuf,
    target_arg: Option<String>,
    output: Option<PathBuf>,
    concise: bool,
    verbose: bool,
    replay: Option<String>,
    target_flag: Option<String>,
) -> Result<()> {
    let config = WorkflowConfig::from_file(&workflow_path)?;

    // Prompt directories resolve relative to the workflow file.
    let prompt_root = workflow_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    // Cancellation on ctrl-c.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // The target override wins over the positional form, which wins over
    // the document.
    let target_spec = target_flag
        .or(target_arg)
        .map(TargetSpec::Text)
        .or_else(|| config.target.clone());

    let run_targets: Vec<Option<String>> = match &target_spec {
        Some(spec) => {
            let mut resolver = MapResolver::new();
            for (key, value) in config.workflow_vars() {
                resolver.insert(key, value);
            }
            target::resolve(spec, &resolver)
                .await?
                .runs()
                .into_iter()
                .map(Some)
                .collect()
        }
        None => vec![None],
    };

    if replay.is_some() && run_targets.len() > 1 {
        return Err(KilnError::Config(
            "replay requires a single-run target".to_string(),
        ));
    }

    let mut final_output = String::new();
    for run_target in run_targets {
        // Replay state must be located before the new session directory
        // appears.
        let replay_state = match &replay {
            Some(spec) => {
                let (session_id, step_name) = match spec.split_once(':') {
                    Some((id, step)) => (Some(id), step),
                    None => (None, spec.as_str()),
                };
                let names: Vec<String> = config
                    .compiled_steps()?
                    .iter()
                    .map(|s| s.display_name().to_string())
                    .collect();
                let replayer = SessionReplayer::new(SESSION_ROOT);
                Some(replayer.prepare(
                    &config.name,
                    session_id,
                    step_name,
                    &names,
                    &structure_hash(&names),
                )?)
            }
            None => None,
        };

        let executor = Executor::builder(config.clone())
            .step_registry(StepRegistry::new().with_prompt_root(&prompt_root))
            .session_root(SESSION_ROOT)
            .cancellation_token(cancel.clone())
            .target(run_target)
            .verbose(verbose)
            .concise(concise)
            .event_sink(Arc::new(ConsoleSink { verbose }))
            .build()
            .await?;

        let outcome = executor.run_from(replay_state).await?;
        final_output = outcome.final_output.raw_response;
    }

    match output {
        Some(path) => std::fs::write(path, final_output)?,
        None => {
            if !final_output.is_empty() {
                println!("{}", final_output.trim_end());
            }
        }
    }

    Ok(())
}
