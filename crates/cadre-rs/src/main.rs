//! Run a prompt through a small agent team and stream what happens.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable unless
//! `--demo` is given, in which case a scripted offline team is used.
//!
//! # Examples
//!
//! ```sh
//! # Offline walkthrough: delegation, a gated shell call, a final answer
//! cadre --demo
//!
//! # Real model, confirmation prompts for shell commands
//! cadre --prompt "How much disk space is free?"
//!
//! # Skip confirmations and load runtime settings from a file
//! cadre --prompt "List the repo" --yolo --config runtime.json
//!
//! # Add tools served over HTTP
//! cadre --prompt "Search the docs for 'lease'" --remote http://localhost:8080
//! ```

use cadre_rs::prelude::*;
use cadre_rs::tools::{HttpTransport, RemoteToolset};
use clap::Parser;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run a prompt through a small agent team.
#[derive(Parser)]
#[command(name = "cadre")]
struct Cli {
    /// User message to send
    #[arg(long)]
    prompt: Option<String>,

    /// Model for every agent
    #[arg(long, default_value = cadre_rs::DEFAULT_MODEL)]
    model: String,

    /// Use a scripted offline team instead of OpenRouter
    #[arg(long)]
    demo: bool,

    /// Approve every tool call without asking
    #[arg(long)]
    yolo: bool,

    /// Model turns per agent (0 = unlimited)
    #[arg(long, default_value_t = 10)]
    max_iterations: u32,

    /// Run independent tool calls concurrently
    #[arg(long)]
    parallel: bool,

    /// JSON file with runtime settings
    #[arg(long)]
    config: Option<String>,

    /// Base URL of a remote tool server to attach to the root agent
    #[arg(long)]
    remote: Option<String>,
}

// ── Tools ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct AddArgs {
    /// First addend.
    a: i64,
    /// Second addend.
    b: i64,
}

fn add_tool() -> FnTool {
    FnTool::new(
        ToolDefinition::new("add", "Add two integers.", json_schema_for::<AddArgs>())
            .with_category("math")
            .read_only(),
        |args: AddArgs| async move {
            args.a
                .checked_add(args.b)
                .map(|sum| sum.to_string())
                .ok_or_else(|| "integer overflow".to_string())
        },
    )
}

#[derive(Deserialize, JsonSchema)]
struct ShellArgs {
    /// Command line passed to `sh -c`.
    cmd: String,
}

fn shell_tool() -> FnTool {
    FnTool::new(
        ToolDefinition::new(
            "shell",
            "Run a shell command and return its output.",
            json_schema_for::<ShellArgs>(),
        )
        .with_category("shell")
        .requiring_confirmation(),
        |args: ShellArgs| async move {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&args.cmd)
                .output()
                .await
                .map_err(|e| format!("failed to run '{}': {e}", args.cmd))?;
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !output.status.success() {
                Err(format!(
                    "exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                    output.status
                ))
            } else if stderr.is_empty() {
                Ok(stdout)
            } else {
                Ok(format!("{stdout}\n\n[stderr]\n{stderr}"))
            }
        },
    )
}

// ── Teams ──────────────────────────────────────────────────────────

const DEMO_PROMPT: &str = "What is 1 + 2? Then say hello from the shell.";

fn build_team(
    root_model: Arc<dyn ModelProvider>,
    calc_model: Arc<dyn ModelProvider>,
    root_tools: ToolSet,
    max_iterations: u32,
) -> Result<Team, String> {
    let calculator = Agent::new("calculator", calc_model)
        .with_description("Does arithmetic with the add tool.")
        .with_instruction("You are a careful calculator. Use the add tool for every sum.")
        .with_tools(ToolSet::new().with(add_tool()))
        .with_max_iterations(max_iterations);

    let root = Agent::new("root", root_model)
        .with_instruction(
            "You are a helpful assistant. Delegate arithmetic to the calculator. \
             Use the shell only when the user asks for it.",
        )
        .with_tools(root_tools)
        .with_sub_agents(["calculator"])
        .with_max_iterations(max_iterations)
        .with_date(true);

    Team::new("root", vec![root, calculator]).map_err(|e| e.to_string())
}

/// Scripted models for `--demo`: the root delegates a sum, runs a gated
/// shell command, then answers.
fn demo_models() -> (Arc<ScriptedProvider>, Arc<ScriptedProvider>) {
    let root = ScriptedProvider::new("demo/root")
        .then_calls(vec![ToolCall::new(
            "call_transfer",
            cadre_rs::tools::TRANSFER_TASK,
            json!({"agent": "calculator", "task": "Add 1 and 2", "expected_output": "The sum"})
                .to_string(),
        )])
        .then_calls(vec![ToolCall::new(
            "call_shell",
            "shell",
            json!({"cmd": "echo hello"}).to_string(),
        )])
        .then_text("1 + 2 = 3, and the shell says hello.");
    let calculator = ScriptedProvider::new("demo/calculator")
        .then_calls(vec![ToolCall::new(
            "call_add",
            "add",
            json!({"a": 1, "b": 2}).to_string(),
        )])
        .then_text("3");
    (Arc::new(root), Arc::new(calculator))
}

// ── Helpers ────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<RuntimeConfig, String> {
    let config = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read config '{path}': {e}"))?;
            serde_json::from_str(&content)
                .map_err(|e| format!("failed to parse config '{path}': {e}"))?
        }
        None => RuntimeConfig::default(),
    };
    Ok(if cli.parallel {
        config.with_parallel_tool_calls(true)
    } else {
        config
    })
}

/// Ask on stdin whether a gated call may run.
async fn ask_confirmation(call: &ToolCall) -> Result<ResumeDecision, String> {
    eprint!(
        "\n  Allow {}({})? [y]es / [a]lways / [n]o [reason]: ",
        call.name(),
        call.arguments()
    );
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    let line = line.trim();
    let (answer, reason) = line.split_once(' ').unwrap_or((line, ""));
    Ok(match answer.to_ascii_lowercase().as_str() {
        "y" | "yes" => ResumeDecision::ApproveOnce,
        "a" | "always" => ResumeDecision::ApproveSession,
        _ if reason.trim().is_empty() => ResumeDecision::Deny { reason: None },
        _ => ResumeDecision::deny(reason.trim()),
    })
}

fn preview(text: &str, max: usize) -> String {
    let mut out: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        out.push('…');
    }
    out.replace('\n', " ")
}

async fn run(cli: Cli) -> Result<(), String> {
    let (root_model, calc_model, prompt): (Arc<dyn ModelProvider>, Arc<dyn ModelProvider>, String) =
        if cli.demo {
            let (root, calc) = demo_models();
            let (root, calc): (Arc<dyn ModelProvider>, Arc<dyn ModelProvider>) = (root, calc);
            let prompt = cli.prompt.clone().unwrap_or_else(|| DEMO_PROMPT.to_string());
            (root, calc, prompt)
        } else {
            let api_key = std::env::var("OPENROUTER_KEY")
                .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
            let prompt = cli
                .prompt
                .clone()
                .ok_or_else(|| "provide --prompt, or --demo for an offline run".to_string())?;
            let model = OpenRouterProvider::new(api_key, &cli.model).map_err(|e| e.to_string())?;
            let model: Arc<dyn ModelProvider> = Arc::new(model);
            (Arc::clone(&model), model, prompt)
        };

    let mut root_tools = ToolSet::new().with(ThinkTool).with(shell_tool());
    if let Some(url) = &cli.remote {
        let transport = HttpTransport::new(url.as_str()).map_err(|e| e.to_string())?;
        let remote = RemoteToolset::discover(Arc::new(transport))
            .await
            .map_err(|e| format!("failed to list remote tools at {url}: {e}"))?;
        eprintln!("  Loaded {} remote tool(s) from {url}", remote.catalog().len());
        root_tools = root_tools.with_remote(remote);
    }

    let team = build_team(root_model, calc_model, root_tools, cli.max_iterations)?;
    let runtime = Runtime::new(team)
        .with_config(load_config(&cli)?)
        .with_event_handler(LoggingHandler);

    let session = Session::new();
    session.set_tools_approved(cli.yolo);
    session.append(Message::user(prompt));

    let mut events = runtime.run_stream(&session).map_err(|e| e.to_string())?;
    let mut failed = None;
    while let Some(event) = events.recv().await {
        match event {
            Event::StreamStarted { .. } => {}
            Event::AgentChoice { delta, .. } => print!("{delta}"),
            Event::ToolCall { agent_name, call } => {
                eprintln!("  [{agent_name}] [tool] {}({})", call.name(), call.arguments());
            }
            Event::ToolCallResponse {
                agent_name,
                call,
                result,
            } => {
                let marker = if result.is_error { "error" } else { "ok" };
                eprintln!(
                    "  [{agent_name}] [{marker}] {} -> {}",
                    call.name(),
                    preview(&result.output, 120)
                );
            }
            Event::ToolCallConfirmation { call, .. } => {
                let decision = ask_confirmation(&call).await?;
                runtime.resume(decision).map_err(|e| e.to_string())?;
            }
            Event::Error { error, .. } => failed = Some(error),
            Event::StreamStopped { .. } => break,
        }
    }
    println!();

    eprintln!("  {}", session.usage().summary());
    match failed {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
