//! # jinject CLI
//!
//! Injects the jinject agent into a running JVM process and hands it a Java
//! archive and entry point to run.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jinject_config::logging::LogLevel;
use jinject_config::{log_cli_debug, log_cli_info, Config, PROJECT_CONFIG_PATH};
use jinject_injector::{InjectionRequest, InjectorSettings, ProcessInfo};
use jinject_ipc::ErrorRecord;

mod select;

/// jinject - run Java code inside a live JVM process
#[derive(Parser)]
#[command(name = "jinject")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the agent into a process and run an entry point from ARTIFACT
    Inject(InjectArgs),

    /// Stop the agent and unload it from a process
    Eject {
        #[arg(long)]
        pid: u32,

        /// Agent library path as it was injected
        #[arg(long)]
        agent: Option<PathBuf>,
    },

    /// List processes with the given image name
    Ps {
        /// Image name (defaults to the configured target process)
        #[arg(value_name = "NAME")]
        name: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Args)]
struct InjectArgs {
    /// Java archive to load
    #[arg(value_name = "ARTIFACT")]
    artifact: PathBuf,

    /// Fully qualified class containing the entry point
    #[arg(value_name = "CLASS", default_value = "Main")]
    class: String,

    #[arg(value_name = "METHOD", default_value = "main")]
    method: String,

    /// Watch the archive and re-run the entry point when it changes
    #[arg(
        value_name = "HOT_RELOAD",
        action = clap::ArgAction::Set,
        default_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    hot_reload: bool,

    /// Target process id (skips lookup by name)
    #[arg(long)]
    pid: Option<u32>,

    /// Image name to look up when no pid is given
    #[arg(long)]
    process: Option<String>,

    /// Agent library to load (defaults to the one beside this executable)
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Bound on each remote-thread wait
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        jinject_config::config()
            .log
            .level
            .parse()
            .unwrap_or(LogLevel::Warn)
    };
    jinject_config::logging::init_logging(level);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(record) = e.downcast_ref::<ErrorRecord>() {
                eprintln!("Code: {} ({})", record.code().as_i32(), record.code().name());
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Inject(args) => cmd_inject(args),
        Commands::Eject { pid, agent } => cmd_eject(pid, agent),
        Commands::Ps { name, json } => cmd_ps(name, json),
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd_config_show(),
            ConfigCommands::Path => cmd_config_path(),
        },
    }
}

fn agent_library(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => jinject_config::config()
            .injector
            .agent_library_path()
            .context("locate agent library"),
    }
}

fn cmd_inject(args: InjectArgs) -> Result<()> {
    let (mut settings, target_process) = {
        let config = jinject_config::config();
        (
            InjectorSettings::from(&config.injector),
            config.injector.target_process.clone(),
        )
    };
    if let Some(ms) = args.timeout_ms {
        settings.remote_timeout = Duration::from_millis(ms);
    }
    let agent = agent_library(args.agent)?;
    let injector = jinject_injector::native(settings);

    let pid = match args.pid {
        Some(pid) => pid,
        None => {
            let name = args.process.unwrap_or(target_process);
            let candidates: Vec<ProcessInfo> = injector
                .find_by_name(&name)?
                .into_iter()
                .map(|pid| injector.describe(pid))
                .collect();
            let stdin = io::stdin();
            select::choose(&name, &candidates, stdin.lock(), io::stdout())?
        }
    };

    let request = InjectionRequest {
        pid,
        artifact_path: absolute(&args.artifact),
        class_name: args.class,
        method_name: args.method,
        hot_reload: args.hot_reload,
    };
    log_cli_debug!("Injecting", pid = pid, agent = agent.display().to_string());
    injector
        .inject_request(&request, &agent)
        .with_context(|| format!("inject into process {pid}"))?;

    log_cli_info!("Injection complete", pid = pid);
    println!(
        "Injected {} into process {pid}, running {}.{}",
        request.artifact_path.display(),
        request.class_name,
        request.method_name
    );

    if request.hot_reload {
        println!("Hot reload is on. Rebuild the archive to re-run it; press Enter to exit.");
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
    }
    Ok(())
}

/// The target resolves relative paths against its own working directory, so
/// hand it an absolute one.
fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn cmd_eject(pid: u32, agent: Option<PathBuf>) -> Result<()> {
    let agent = agent_library(agent)?;
    let settings = InjectorSettings::from(&jinject_config::config().injector);
    let injector = jinject_injector::native(settings);
    injector
        .eject(pid, &agent)
        .with_context(|| format!("eject from process {pid}"))?;
    println!("Agent unloaded from process {pid}");
    Ok(())
}

fn cmd_ps(name: Option<String>, json: bool) -> Result<()> {
    let (settings, default_name) = {
        let config = jinject_config::config();
        (
            InjectorSettings::from(&config.injector),
            config.injector.target_process.clone(),
        )
    };
    let name = name.unwrap_or(default_name);
    let injector = jinject_injector::native(settings);
    let infos: Vec<ProcessInfo> = injector
        .find_by_name(&name)?
        .into_iter()
        .map(|pid| injector.describe(pid))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    if infos.is_empty() {
        println!("No processes named {name}");
        return Ok(());
    }
    println!("{:>8}  {:<28}  ELEVATED", "PID", "NAME");
    for info in &infos {
        let elevated = match info.elevated {
            Some(true) => "yes",
            Some(false) => "no",
            None => "?",
        };
        println!(
            "{:>8}  {:<28}  {}",
            info.pid,
            info.name.as_deref().unwrap_or("-"),
            elevated
        );
    }
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config = jinject_config::config().clone();
    print!("{}", toml::to_string_pretty(&config).context("serialize config")?);
    Ok(())
}

fn cmd_config_path() -> Result<()> {
    match Config::global_config_path() {
        Some(path) => println!("Global:  {}", path.display()),
        None => println!("Global:  (no home directory)"),
    }
    let project = std::env::current_dir()
        .map(|dir| dir.join(PROJECT_CONFIG_PATH))
        .unwrap_or_else(|_| PathBuf::from(PROJECT_CONFIG_PATH));
    println!("Project: {}", project.display());
    Ok(())
}
