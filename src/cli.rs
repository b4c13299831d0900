use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport, Tuning};
use crate::logging;
use crate::summarize::prompts::SummaryLevel;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Parser)]
#[command(name = "condense")]
#[command(about = "Summarize long texts in token-bounded, rate-limited chunks")]
#[command(version)]
struct Cli {
    /// Debug-level logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print the command report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize a text file into an output file
    Summarize {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
        /// Provider override (openai, anthropic, gemini, openai-compatible, local)
        #[arg(long)]
        provider: Option<String>,
        /// File holding the summary instruction; replaces the built-in prompt
        #[arg(long = "prompt-file")]
        prompt_file: Option<PathBuf>,
        #[arg(long, default_value_t = SummaryLevel::Concise)]
        level: SummaryLevel,
        #[arg(long = "no-postprocess")]
        no_postprocess: bool,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Show how a file would be chunked and grouped without calling a provider
    Plan {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Inspect or remove the checkpoint kept next to a summary file
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand)]
enum CheckpointAction {
    Show {
        #[arg(long)]
        output: PathBuf,
    },
    Clear {
        #[arg(long)]
        output: PathBuf,
    },
}

async fn dispatch(command: Command) -> Result<CommandReport> {
    match command {
        Command::Summarize {
            input,
            output,
            model,
            provider,
            prompt_file,
            level,
            no_postprocess,
            tuning,
        } => {
            commands::summarize::run(commands::summarize::SummarizeOptions {
                input,
                output,
                model,
                provider,
                prompt_file,
                level,
                no_postprocess,
                tuning,
            })
            .await
        }
        Command::Plan {
            input,
            model,
            tuning,
        } => commands::plan::run(commands::plan::PlanOptions {
            input,
            model,
            tuning,
        }),
        Command::Checkpoint { action } => match action {
            CheckpointAction::Show { output } => commands::checkpoint::show(&output).await,
            CheckpointAction::Clear { output } => commands::checkpoint::clear(&output).await,
        },
        Command::Config => commands::config_show::run(),
    }
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(dispatch(cli.command))?;
    print_report(&report, cli.json)?;

    if !report.ok {
        return Err(anyhow!("{} reported {} issue(s)", report.command, report.issues.len()));
    }
    Ok(())
}
