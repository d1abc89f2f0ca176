mod config;
mod error;

use anyhow::Result;
use clap::Parser;
use cliclack::{input, spinner};
use console::style;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use skiff::agent::{Agent, RunOutcome};
use skiff::errors::AgentResult;
use skiff::process_store::ProcessRegistry;
use skiff::providers::anthropic::AnthropicProvider;
use skiff::run_log::RunLogger;
use skiff::tools::{
    load_mcp_tools, BashKillTool, BashOutputTool, BashTool, EditFileTool, NoteStore,
    ReadFileTool, RecallNotesTool, RecordNoteTool, WriteFileTool,
};

use crate::config::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file (defaults to ~/.config/skiff/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace directory the agent works in, overriding the config file
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Run a single task and exit instead of starting a session
    #[arg(short, long)]
    task: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let settings = Settings::load(cli.config.as_deref())?;
    let workspace = cli
        .workspace
        .clone()
        .unwrap_or_else(|| settings.agent.workspace_dir.clone());

    let registry = ProcessRegistry::new();
    let mut agent = build_agent(&settings, &workspace, registry.clone()).await?;

    let result = match cli.task {
        Some(task) => run_task(&mut agent, &task).await,
        None => session(&mut agent).await,
    };

    let killed = registry.kill_all().await;
    if !killed.is_empty() {
        tracing::info!(count = killed.len(), "terminated background processes");
    }
    result
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skiff=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn build_agent(
    settings: &Settings,
    workspace: &Path,
    registry: ProcessRegistry,
) -> Result<Agent> {
    let retry = settings
        .llm
        .retry
        .to_retry_config()
        .with_on_retry(|attempt, err| {
            eprintln!(
                "{}",
                style(format!("retrying ({}) after: {}", attempt, err)).dim()
            );
        });
    let provider =
        AnthropicProvider::new(settings.llm.provider_config()?)?.with_retry_config(retry);

    let mut agent = Agent::new(Box::new(provider), &settings.agent.system_prompt, workspace)?
        .with_max_steps(settings.agent.max_steps);
    if settings.logging.enabled {
        agent = agent.with_run_logger(RunLogger::new(&settings.logging.log_dir));
    }
    let workspace_dir = agent.workspace_dir().to_path_buf();

    if settings.tools.enable_bash {
        agent.add_tool(Box::new(BashTool::new(registry.clone(), &workspace_dir)));
        agent.add_tool(Box::new(BashOutputTool::new(registry.clone())));
        agent.add_tool(Box::new(BashKillTool::new(registry)));
    }
    if settings.tools.enable_file_tools {
        agent.add_tool(Box::new(ReadFileTool::new(&workspace_dir)));
        agent.add_tool(Box::new(WriteFileTool::new(&workspace_dir)));
        agent.add_tool(Box::new(EditFileTool::new(&workspace_dir)));
    }
    if settings.tools.enable_note {
        let store = NoteStore::new(workspace_dir.join(&settings.tools.note_file));
        agent.add_tool(Box::new(RecordNoteTool::new(store.clone())));
        agent.add_tool(Box::new(RecallNotesTool::new(store)));
    }
    if settings.tools.enable_mcp {
        match load_mcp_tools(&settings.tools.mcp_config).await {
            Ok(tools) => {
                for tool in tools {
                    agent.add_tool(tool);
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping MCP tools"),
        }
    }

    tracing::info!(
        workspace = %workspace_dir.display(),
        tools = ?agent.tool_names(),
        "agent ready"
    );
    Ok(agent)
}

/// Run the agent until it finishes, or until Ctrl-C cancels the turn
async fn run_with_interrupt(agent: &mut Agent) -> AgentResult<RunOutcome> {
    let token = agent.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let outcome = agent.run().await;
    watcher.abort();
    outcome
}

async fn run_task(agent: &mut Agent, task: &str) -> Result<()> {
    agent.add_user_message(task)?;
    let outcome = run_with_interrupt(agent).await?;
    render(&outcome);
    Ok(())
}

async fn session(agent: &mut Agent) -> Result<()> {
    println!(
        "skiff {}",
        style("- type \"exit\" to end the session, /clear to reset, /history for the message count")
            .dim()
    );
    println!(
        "{}\n",
        style(format!("workspace: {}", agent.workspace_dir().display())).dim()
    );

    loop {
        let message_text: String = input("Message:").placeholder("").multiline().interact()?;
        let message_text = message_text.trim();

        match message_text {
            "" => continue,
            text if text.eq_ignore_ascii_case("exit") => break,
            "/clear" => {
                agent.reset();
                println!("{}\n", style("history cleared").dim());
                continue;
            }
            "/history" => {
                println!(
                    "{}\n",
                    style(format!("{} messages in history", agent.messages().len())).dim()
                );
                continue;
            }
            _ => {}
        }

        agent.add_user_message(message_text)?;

        let spin = spinner();
        spin.start("awaiting reply");
        let outcome = run_with_interrupt(agent).await;
        spin.stop("");

        match outcome {
            Ok(outcome) => render(&outcome),
            Err(e) => eprintln!("{}", style(format!("error: {}", e)).red()),
        }
        println!();
    }
    Ok(())
}

fn render(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(text) => println!("{}", text),
        RunOutcome::StepLimitExceeded { steps, last_text } => {
            if !last_text.is_empty() {
                println!("{}", last_text);
            }
            println!(
                "{}",
                style(format!("stopped after {} steps without a final answer", steps)).yellow()
            );
        }
        RunOutcome::Cancelled { .. } => println!("{}", style("cancelled").yellow()),
    }
}
