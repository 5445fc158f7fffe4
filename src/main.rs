//! Looper Remote - command-line front end
//!
//! Connects to (or launches) a looping engine and drives it from a REPL.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use crate::cli::ReplCommand;
use looper_remote::config::AppConfig;
use looper_remote::{
    subscriber, ChangeKind, CommandLauncher, EngineMirror, EngineSession, EngineUpdate,
    SessionConfig, Topic,
};

/// Looper Remote - control a MIDI looping engine over OSC
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "looper.yaml")]
    config: String,

    /// Engine host (overrides config)
    #[arg(long, env = "LOOPER_HOST")]
    host: Option<String>,

    /// Engine port (overrides config)
    #[arg(short, long, env = "LOOPER_PORT")]
    port: Option<u16>,

    /// Fail instead of launching a local engine when none answers
    #[arg(long)]
    no_spawn: bool,

    /// Ask the engine to quit on exit
    #[arg(long)]
    quit_engine: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Starting Looper Remote...");
    info!("Configuration file: {}", args.config);

    let mut config = AppConfig::load_or_default(&args.config).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let launcher = CommandLauncher::from_config(&config.launcher);
    let session = EngineSession::connect(SessionConfig::from_app_config(&config), &launcher)
        .await
        .context("Could not establish an engine session")?;

    println!(
        "{} engine {} at {} ({} loops)",
        "Connected to".green().bold(),
        session.ack().version.cyan(),
        session.engine(),
        session.ack().loop_count
    );

    let mirror = EngineMirror::new();
    mirror.attach(&session.bus());

    let printer = subscriber(|update: &EngineUpdate| print_update(update));
    for topic in Topic::ALL {
        session.subscribe(topic, printer.clone());
    }

    session.initialize_subscribers().await?;

    let result = run_repl_loop(&session, &mirror).await;

    info!("Shutting down...");
    mirror.detach(&session.bus());
    if let Err(e) = session.cleanup().await {
        warn!("Cleanup incomplete: {}", e);
    }
    info!("Looper Remote shutdown complete");
    result
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.engine.host = host.clone();
    }
    if let Some(port) = args.port {
        config.engine.port = port;
    }
    if args.no_spawn {
        config.engine.fail_on_not_found = true;
    }
    if args.quit_engine {
        config.engine.quit_on_exit = true;
    }
}

async fn run_repl_loop(session: &EngineSession, mirror: &EngineMirror) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    // rustyline blocks; keep it off the runtime threads
    let repl = std::thread::spawn(move || cli::run_repl(tx));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ReplCommand::Exit) | None => break,
                Some(command) => {
                    if let Err(e) = execute(session, mirror, command).await {
                        println!("{} {}", "error:".red().bold(), e);
                    }
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if repl.is_finished() {
        if let Ok(Err(e)) = repl.join() {
            return Err(e);
        }
    }
    Ok(())
}

async fn execute(session: &EngineSession, mirror: &EngineMirror, command: ReplCommand) -> Result<()> {
    match command {
        ReplCommand::Loops => {
            for name in mirror.loops() {
                println!("  {}", name);
            }
        }
        ReplCommand::Mappings => {
            for mapping in mirror.mappings() {
                println!("  {}", mapping);
            }
        }
        ReplCommand::AddLoop(name) => session.new_loop(&name).await?,
        ReplCommand::RemoveLoops(names) => {
            let outcome = session.remove_loops(&names).await;
            for (name, e) in &outcome.failed {
                println!("{} {}: {}", "not removed:".yellow(), name, e);
            }
        }
        ReplCommand::Map(mapping) => session.new_mapping(&mapping).await?,
        ReplCommand::Unmap(mapping) => {
            let outcome = session.remove_mappings(std::slice::from_ref(&mapping)).await;
            for (mapping, e) in &outcome.failed {
                println!("{} {}: {}", "not removed:".yellow(), mapping, e);
            }
        }
        ReplCommand::Help => println!("{}", cli::HELP),
        ReplCommand::Exit => {}
    }
    Ok(())
}

fn print_update(update: &EngineUpdate) {
    let sign = match update.change() {
        ChangeKind::Add => "+".green().bold(),
        ChangeKind::Remove => "-".red().bold(),
    };
    match update {
        EngineUpdate::Loop { name, .. } => println!("{} loop {}", sign, name.bold()),
        EngineUpdate::Mapping { mapping, .. } => println!("{} mapping {}", sign, mapping),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}
