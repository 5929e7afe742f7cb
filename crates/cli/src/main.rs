use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "smsgw")]
#[command(about = "SMS gateway CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json (never overwrites).
    Init {
        /// Config file path (default: SMSGW_CONFIG_PATH or ~/.smsgw/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Load and validate the config, then print the channels and rules it defines.
    Check {
        /// Config file path (default: SMSGW_CONFIG_PATH or ~/.smsgw/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway until Ctrl+C or SIGTERM; queued jobs are drained before exit.
    Run {
        /// Config file path (default: SMSGW_CONFIG_PATH or ~/.smsgw/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Status server port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print modem identification, SIM and network status.
    #[cfg(feature = "serial")]
    ModemInfo {
        /// Serial device (e.g. /dev/ttyUSB0)
        port: String,

        #[arg(long, short, default_value_t = 115200)]
        baud: u32,
    },

    /// Print and delete every SMS stored on the modem and the SIM.
    #[cfg(feature = "serial")]
    ClearSms {
        /// Serial device (e.g. /dev/ttyUSB0)
        port: String,

        #[arg(long, short, default_value_t = 9600)]
        baud: u32,
    },
}

/// RUST_LOG wins over `filter`. Only the first call takes effect.
fn init_logger(filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .try_init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("smsgw {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => {
            init_logger("info");
            run_init(config).map_err(|e| ("init", e))
        }
        Some(Commands::Check { config }) => {
            init_logger("warn");
            run_check(config).map_err(|e| ("check", e))
        }
        Some(Commands::Run { config, port }) => run(config, port).await.map_err(|e| ("gateway", e)),
        #[cfg(feature = "serial")]
        Some(Commands::ModemInfo { port, baud }) => {
            init_logger("warn");
            run_modem_info(&port, baud).map_err(|e| ("modem-info", e))
        }
        #[cfg(feature = "serial")]
        Some(Commands::ClearSms { port, baud }) => {
            init_logger("info");
            run_clear_sms(&port, baud).map_err(|e| ("clear-sms", e))
        }
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err((what, e)) = result {
        init_logger("error");
        log::error!("{} failed: {:#}", what, e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(smsgw::config::default_config_path);
    let dir = smsgw::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn run_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = smsgw::config::load_config(config_path)?;
    println!("config: {}", path.display());
    for modem in &config.modems {
        let state = modem.check().map(|_| "ok".to_string()).unwrap_or_else(|e| e.to_string());
        println!("  modem {} ({} @ {}): {}", modem.name, modem.port, modem.baudrate, state);
    }
    for email in &config.email_providers {
        let state = email.check().map(|_| "ok".to_string()).unwrap_or_else(|e| e.to_string());
        println!("  email {} ({}:{}): {}", email.name, email.server, email.port, state);
    }
    for api in &config.api_providers {
        let state = api.check().map(|_| "ok".to_string()).unwrap_or_else(|e| e.to_string());
        println!("  api {} ({} {}): {}", api.name, api.method, api.endpoint, state);
    }
    let channels: Vec<&str> = config.channel_names().collect();
    for rule in &config.rules {
        let action = rule.action.as_deref().unwrap_or("reply");
        let targets = rule.queue.clone().unwrap_or_default();
        let unknown: Vec<&String> = targets
            .iter()
            .filter(|t| !channels.contains(&t.as_str()))
            .collect();
        if unknown.is_empty() {
            println!("  rule {}: {} -> {:?}", rule.name, action, targets);
        } else {
            println!(
                "  rule {}: {} -> {:?} (unknown channels: {:?})",
                rule.name, action, targets, unknown
            );
        }
    }
    Ok(())
}

async fn run(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = smsgw::config::load_config(config_path)?;
    init_logger(&smsgw::config::resolve_log_filter(&config));
    if let Some(p) = port {
        config.status.port = p;
    }
    smsgw::gateway::run_gateway(config, path).await
}

#[cfg(feature = "serial")]
fn run_modem_info(port: &str, baud: u32) -> anyhow::Result<()> {
    println!("connecting to modem on {}...", port);
    let info = smsgw::modem::modem_info(port, baud)?;
    println!("\nModem and SIM information:");
    println!("{}", "-".repeat(50));
    for (label, value) in info {
        println!("{}: {}", label, value);
    }
    Ok(())
}

#[cfg(feature = "serial")]
fn run_clear_sms(port: &str, baud: u32) -> anyhow::Result<()> {
    let removed = smsgw::modem::clear_messages(port, baud)?;
    for sms in &removed {
        println!(
            "[{} #{}] {}: {}",
            sms.storage,
            sms.index,
            sms.sender.as_deref().unwrap_or("?"),
            sms.text.as_deref().unwrap_or(&sms.pdu)
        );
    }
    println!("deleted {} message(s)", removed.len());
    Ok(())
}
