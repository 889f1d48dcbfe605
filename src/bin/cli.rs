//! Grid Agent - vision-model driven Android automation
//!
//! Command-line entry point: runs one task on one device.
//! Run with: cargo run --bin grid-agent -- "Open Settings and turn on Wi-Fi"

use anyhow::Context;
use clap::Parser;
use grid_agent::adb::remote_address;
use grid_agent::agent::FailureReason;
use grid_agent::{
    AdbChannel, AdbConnection, Annotator, DeviceChannel, GridAgent, ModelClient, SessionLogger,
    SessionState, Settings,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_SETUP: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "grid-agent", version, about = "Drive an Android device toward a goal with a vision model")]
struct Cli {
    /// Task description, e.g. "Open Settings and turn on Wi-Fi".
    #[arg(required_unless_present = "list_devices")]
    task: Vec<String>,

    /// Maximum number of steps.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Timeout in seconds for each model request and device command.
    #[arg(long)]
    timeout: Option<u64>,

    /// ADB serial of the device to drive.
    #[arg(long)]
    device: Option<String>,

    /// Connect to a device over TCP/IP first (host or host:port). It is
    /// driven unless --device names another one.
    #[arg(long, value_name = "ADDR")]
    connect: Option<String>,

    /// Settings file (defaults to the platform config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for session logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// List connected devices and exit.
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grid_agent=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ Setup failed: {:#}", e);
            ExitCode::from(EXIT_SETUP)
        }
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    settings
        .apply_env()
        .context("Invalid environment override")?;

    if let Some(max_steps) = cli.max_steps {
        settings.agent.max_steps = max_steps;
    }
    if let Some(timeout) = cli.timeout {
        settings.model.timeout_secs = timeout;
        settings.adb.command_timeout_secs = timeout;
    }
    if let Some(device) = &cli.device {
        settings.adb.device_id = Some(device.clone());
    } else if let Some(address) = &cli.connect {
        settings.adb.device_id = Some(remote_address(address));
    }
    if let Some(log_dir) = &cli.log_dir {
        settings.log_dir = Some(log_dir.clone());
    }

    settings.validate()?;
    Ok(settings)
}

fn task_text(words: &[String]) -> anyhow::Result<String> {
    let task = words.join(" ");
    if task.trim().is_empty() {
        anyhow::bail!("Task must not be empty");
    }
    Ok(task)
}

/// Returns the process exit code. Errors are setup failures.
async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = load_settings(&cli)?;
    let task = if cli.list_devices {
        String::new()
    } else {
        task_text(&cli.task)?
    };
    let command_timeout = Duration::from_secs(settings.adb.command_timeout_secs);

    let connection = AdbConnection::with_path(&settings.adb.adb_path).with_timeout(command_timeout);
    let version = connection.verify().await?;
    tracing::debug!("Using {}", version.lines().next().unwrap_or_default());

    if let Some(address) = &cli.connect {
        let address = connection
            .connect(address)
            .await
            .with_context(|| format!("Failed to connect to {}", address))?;
        println!("🔗 Connected to {}", address);
    }

    if cli.list_devices {
        let devices = connection.list_devices().await?;
        if devices.is_empty() {
            println!("No devices connected");
        }
        for device in devices {
            println!(
                "{}\t{}\t{:?}\t{}",
                device.device_id,
                device.status,
                device.connection_type,
                device.model.as_deref().unwrap_or("-")
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let device_id = connection
        .resolve_device(settings.adb.device_id.as_deref())
        .await
        .context("No usable device")?;
    let device_name = match connection.device_name(&device_id).await {
        Ok(name) if !name.is_empty() => name,
        Ok(_) => device_id.clone(),
        Err(e) => {
            tracing::warn!("Could not read device model: {}", e);
            device_id.clone()
        }
    };

    let channel = Arc::new(
        AdbChannel::new(Some(device_id.clone()))
            .with_adb_path(&settings.adb.adb_path)
            .with_timeout(command_timeout),
    );
    let (width, height) = channel
        .screen_size()
        .await
        .context("Failed to read screen size")?;
    let grid = settings.resolve_grid(width, height)?;
    let annotator = Annotator::new(settings.grid.style.clone())?;

    let logs_dir = settings
        .logs_dir()
        .context("Cannot determine the log directory; pass --log-dir")?;
    let logger = SessionLogger::create(&logs_dir)?;

    if settings.model.api_key.is_empty() {
        tracing::warn!("MODEL_API_KEY is not set; requests are sent without authorization");
    }

    println!("🤖 Grid Agent - Vision-model Android Automation");
    println!("================================================");
    println!("Task: {}", task);
    println!("Model: {} @ {}", settings.model.model_name, settings.model.base_url);
    println!("Device: {} ({})", device_name, device_id);
    println!(
        "Screen: {}x{}, grid {}x{} (A-{}, 1-{})",
        width,
        height,
        grid.columns(),
        grid.rows(),
        grid.last_column_letter(),
        grid.rows()
    );
    println!("Max steps: {}", settings.agent.max_steps);
    println!("Log: {}", logger.log_file().display());
    println!("================================================\n");

    let model = Arc::new(ModelClient::new(settings.model.clone()));
    let agent = GridAgent::new(settings.agent.clone(), grid, channel, model)
        .with_annotator(annotator)
        .with_logger(logger);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⏹️  Stopping after the current step...");
            let _ = cancel_tx.send(true);
        }
    });

    let session = agent.run(&task, cancel_rx).await?;
    print_summary(&session);
    Ok(exit_code(&session))
}

fn print_summary(session: &SessionState) {
    println!("\n{}", "=".repeat(50));
    match session.terminal().and_then(|t| t.failure()) {
        None => println!("✅ Task completed"),
        Some(reason) => println!("❌ Task failed: {}", reason),
    }
    println!("Steps: {}", session.step);
    println!("Time: {:.1}s", session.elapsed.as_secs_f64());
    println!(
        "Tokens: {} ({} in, {} out)",
        session.usage.total(),
        session.usage.prompt_tokens,
        session.usage.completion_tokens
    );
    println!("Cost: ${:.4}", session.cost);
    println!("{}", "=".repeat(50));
}

fn exit_code(session: &SessionState) -> ExitCode {
    if session.is_success() {
        return ExitCode::SUCCESS;
    }
    match session.terminal().and_then(|t| t.failure()) {
        Some(FailureReason::Cancelled) => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::from(EXIT_FAILURE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_text() {
        let words = |w: &[&str]| w.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(task_text(&words(&["Open", "Settings"])).unwrap(), "Open Settings");
        assert!(task_text(&words(&["  ", "\t"])).is_err());
        assert!(task_text(&[]).is_err());
    }

    #[test]
    fn test_connect_selects_device() {
        let cli = Cli::parse_from(["grid-agent", "--connect", "192.168.1.20", "Open", "Settings"]);
        assert_eq!(cli.connect.as_deref(), Some("192.168.1.20"));
        assert_eq!(remote_address(cli.connect.as_deref().unwrap()), "192.168.1.20:5555");
    }
}
