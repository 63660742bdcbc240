mod actions;
mod actuator;
mod config;
mod dispatcher;
mod model;
mod patch;
mod runtime;
mod security;
mod session;
mod settings;
mod types;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::actuator::Actuator;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::model::OpenAiCompatibleBackend;
use crate::runtime::AgentRuntime;
use crate::security::{AuthorizationGate, PermissionStore, TerminalChooser};
use crate::settings::JsonSettingsStore;
use crate::types::OutputStream;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Terminal agent that lets a language model read, edit and run things in your project, with your permission"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "SHELLMATE_RS_CONFIG",
        default_value = "shellmate-rs.toml"
    )]
    config: PathBuf,

    /// Log level filter, e.g. warn,info,debug.
    #[arg(long, global = true, env = "SHELLMATE_RS_LOG", default_value = "warn")]
    log: String,

    /// Override the workspace root actions run in.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Override the model id.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Start an interactive session (default).
    Chat,
    /// Send one message, run its actions and print the reply.
    Ask(AskArgs),
    /// Inspect or reset stored permission levels.
    Permissions(PermissionsArgs),
    /// Manage the approved command list.
    Commands(CommandsArgs),
    /// Check config, credentials and settings.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct AskArgs {
    /// Message to send to the model.
    #[arg(long, short)]
    message: String,
}

#[derive(Debug, Clone, Args)]
struct PermissionsArgs {
    #[command(subcommand)]
    command: Option<PermissionsSubcommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum PermissionsSubcommand {
    /// Print the stored level for each action type.
    Show,
    /// Clear every grant and restore the default approved commands.
    Reset,
}

#[derive(Debug, Clone, Args)]
struct CommandsArgs {
    #[command(subcommand)]
    command: Option<CommandsSubcommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CommandsSubcommand {
    /// Print the approved command list.
    List,
    /// Approve a command.
    Add { command: String },
    /// Remove an approved command.
    Remove { command: String },
    /// Restore the default approved commands.
    Reset,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Chat);
    match command {
        CliCommand::Chat => run_chat(&cli).await,
        CliCommand::Ask(args) => run_ask(&cli, args).await,
        CliCommand::Permissions(args) => run_permissions(&cli, args),
        CliCommand::Commands(args) => run_commands(&cli, args),
        CliCommand::Doctor(args) => run_doctor(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.workspace.as_deref(), cli.model.as_deref());
    cfg.validate()?;
    Ok(cfg)
}

fn open_permission_store(cfg: &Config) -> Result<PermissionStore> {
    let settings = JsonSettingsStore::load(cfg.settings_file())?;
    Ok(PermissionStore::new(Box::new(settings)))
}

fn build_runtime(cfg: &Config) -> Result<AgentRuntime> {
    let workspace_root = cfg
        .runtime
        .workspace_root
        .canonicalize()
        .with_context(|| {
            format!(
                "workspace root {} is not accessible",
                cfg.runtime.workspace_root.display()
            )
        })?;
    let backend = OpenAiCompatibleBackend::new(
        &cfg.model.base_url,
        &cfg.model.api_key_env,
        Duration::from_millis(cfg.model.timeout_ms),
    )?;
    info!(
        "workspace {} using {} at {}",
        workspace_root.display(),
        cfg.model.model_id,
        backend.endpoint()
    );
    let gate = AuthorizationGate::new(open_permission_store(cfg)?, Box::new(TerminalChooser));
    let dispatcher = Dispatcher::new(Actuator::new(workspace_root, gate))
        .with_stream_sink(Box::new(print_stream_chunk));
    Ok(AgentRuntime::new(
        Box::new(backend),
        dispatcher,
        cfg.generation_params(),
        cfg.runtime.history_limit,
    ))
}

fn print_stream_chunk(stream: OutputStream, chunk: &str) {
    match stream {
        OutputStream::Stdout => {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
        OutputStream::Stderr => {
            eprint!("{chunk}");
        }
    }
}

async fn run_chat(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let mut runtime = build_runtime(&cfg)?;
    runtime.run_repl(BufReader::new(tokio::io::stdin())).await
}

async fn run_ask(cli: &Cli, args: AskArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let mut runtime = build_runtime(&cfg)?;
    let reply = runtime
        .handle_turn(&args.message)
        .await
        .map_err(|err| anyhow!("model call failed: {err}"))?;
    println!("{reply}");
    Ok(())
}

fn run_permissions(cli: &Cli, args: PermissionsArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let mut store = open_permission_store(&cfg)?;
    match args.command.unwrap_or(PermissionsSubcommand::Show) {
        PermissionsSubcommand::Show => println!("{}", store.render_levels()),
        PermissionsSubcommand::Reset => {
            store.reset_all()?;
            store.reset_commands()?;
            println!("permissions reset; approved commands restored to defaults");
        }
    }
    Ok(())
}

fn run_commands(cli: &Cli, args: CommandsArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let mut store = open_permission_store(&cfg)?;
    match args.command.unwrap_or(CommandsSubcommand::List) {
        CommandsSubcommand::List => println!("{}", store.render_commands()),
        CommandsSubcommand::Add { command } => {
            if store.add_command(&command)? {
                println!("approved: {}", command.trim());
            } else {
                println!("already approved: {}", command.trim());
            }
        }
        CommandsSubcommand::Remove { command } => {
            if store.remove_command(&command)? {
                println!("removed: {}", command.trim());
            } else {
                println!("not approved: {}", command.trim());
            }
        }
        CommandsSubcommand::Reset => {
            store.reset_commands()?;
            println!("approved commands restored to defaults");
        }
    }
    Ok(())
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(
        config_result,
        &cli.config,
        |name| std::env::var(name).ok(),
        command_available("sh"),
    );
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    env_lookup: impl Fn(&str) -> Option<String>,
    shell_available: bool,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            let message = if config_path.exists() {
                format!("loaded {}", config_path.display())
            } else {
                format!("{} not found, using defaults", config_path.display())
            };
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message,
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        checks.push(DoctorCheck {
            id: "model.endpoint".to_owned(),
            status: "pass".to_owned(),
            message: format!("{} via {}", cfg.model.model_id, cfg.model.base_url),
            detail: None,
        });

        let credential_set = env_lookup(&cfg.model.api_key_env)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        checks.push(DoctorCheck {
            id: "model.credential".to_owned(),
            status: if credential_set { "pass" } else { "fail" }.to_owned(),
            message: if credential_set {
                format!("{} is set", cfg.model.api_key_env)
            } else {
                format!("{} is not set", cfg.model.api_key_env)
            },
            detail: None,
        });

        let workspace_ok = cfg.runtime.workspace_root.is_dir();
        checks.push(DoctorCheck {
            id: "runtime.workspace_root".to_owned(),
            status: if workspace_ok { "pass" } else { "fail" }.to_owned(),
            message: cfg.runtime.workspace_root.display().to_string(),
            detail: (!workspace_ok).then(|| "directory does not exist".to_owned()),
        });

        let settings_path = cfg.settings_file();
        let (status, detail) = match JsonSettingsStore::load(settings_path.clone()) {
            Ok(_) if settings_path.exists() => ("pass", None),
            Ok(_) => ("pass", Some("will be created on first change".to_owned())),
            Err(err) => ("fail", Some(format!("{err:#}"))),
        };
        checks.push(DoctorCheck {
            id: "runtime.settings".to_owned(),
            status: status.to_owned(),
            message: settings_path.display().to_string(),
            detail,
        });
    }

    checks.push(DoctorCheck {
        id: "shell.binary".to_owned(),
        status: if shell_available { "pass" } else { "warn" }.to_owned(),
        message: if shell_available {
            "sh is available".to_owned()
        } else {
            "sh is not available".to_owned()
        },
        detail: Some("required for EXEC_COMMAND actions".to_owned()),
    });

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn command_available(name: &str) -> bool {
    Command::new(name)
        .arg("-c")
        .arg("exit 0")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}
