//! SkyLink CLI - privacy VPN client
//!
//! One-shot commands drive the client directly; `daemon` serves the REST
//! API and keeps the tunnel status reconciled in the background.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use skylink::directory::DirectoryRow;
use skylink::settings::{self, ClientSettings};
use skylink::{DaemonService, SkyLinkError, StaticEntitlement, VpnService};

/// SkyLink - privacy VPN client
#[derive(Parser, Debug)]
#[command(name = "skylink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path of the persisted client state
    #[arg(long, env = "SKYLINK_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    /// URL of the server directory document
    #[arg(long, env = "SKYLINK_DIRECTORY_URL", default_value = settings::DEFAULT_DIRECTORY_URL, global = true)]
    directory_url: String,

    /// URL of the signaling endpoint
    #[arg(long, env = "SKYLINK_SIGNALING_URL", default_value = settings::DEFAULT_SIGNALING_URL, global = true)]
    signaling_url: String,

    /// Tunnel interface name
    #[arg(long, env = "SKYLINK_TUNNEL_NAME", default_value = settings::DEFAULT_TUNNEL_NAME, global = true)]
    tunnel_name: String,

    /// Directory for the tunnel config file
    #[arg(long, env = "SKYLINK_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Treat the account as subscribed (unlocks premium servers)
    #[arg(long, env = "SKYLINK_SUBSCRIBED", global = true)]
    subscribed: bool,

    /// Do not touch the OS tunnel; use an in-process host
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as a daemon service (REST API for a UI)
    Daemon {
        /// HTTP port for the REST API
        #[arg(long, default_value_t = settings::DEFAULT_HTTP_PORT)]
        http_port: u16,
    },
    /// Connect to the selected (or a random) server
    Connect,
    /// Disconnect the tunnel
    Disconnect,
    /// Show connection status
    Status,
    /// List servers, optionally filtered
    Servers {
        /// Case-insensitive search over name, city, state and country
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Select a server by name
    Select { name: String },
    /// Re-download the server directory
    Refresh,
}

impl Args {
    fn settings(&self) -> ClientSettings {
        let defaults = ClientSettings::default();
        ClientSettings {
            directory_url: self.directory_url.clone(),
            signaling_url: self.signaling_url.clone(),
            state_file: self.state_file.clone().unwrap_or(defaults.state_file),
            tunnel_name: self.tunnel_name.clone(),
            config_dir: self.config_dir.clone().unwrap_or(defaults.config_dir),
            dry_run: self.dry_run,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> Result<(), SkyLinkError> {
    let entitlement = Arc::new(StaticEntitlement(args.subscribed));
    let service = VpnService::from_settings(args.settings(), entitlement)?;

    match args.command {
        Command::Daemon { http_port } => {
            tracing::info!("SkyLink daemon starting (REST API mode)...");
            DaemonService::new(service).run_http(http_port).await
        }
        Command::Connect => {
            let outcome = service.connect().await?;
            tracing::debug!("Connect outcome: {:?}", outcome);
            print_status(&service).await;
            Ok(())
        }
        Command::Disconnect => {
            service.disconnect().await?;
            print_status(&service).await;
            Ok(())
        }
        Command::Status => {
            print_status(&service).await;
            Ok(())
        }
        Command::Servers { query } => {
            let rows = service.servers(query.as_deref()).await?;
            print_rows(&rows);
            Ok(())
        }
        Command::Select { name } => {
            let server = service.select_server(&name).await?;
            println!("Selected {} ({}, {})", server.name, server.city, server.country);
            Ok(())
        }
        Command::Refresh => {
            let count = service.refresh().await?;
            println!("Server list updated: {} servers", count);
            Ok(())
        }
    }
}

async fn print_status(service: &VpnService) {
    let status = service.status().await;
    println!("State:    {}", status.state);
    match status.server {
        Some(server) => println!("Server:   {} ({}, {})", server.name, server.city, server.country),
        None => println!("Server:   none selected"),
    }
    println!("Elapsed:  {}", status.elapsed);
}

fn print_rows(rows: &[DirectoryRow]) {
    let mut section = None;
    for row in rows {
        if section != Some(row.section()) {
            section = Some(row.section());
            if let Some(title) = skylink::directory::section_title(row.section()) {
                println!("\n{}", title);
            }
        }

        let bars = (row.signal_strength() * 4.0).round() as usize;
        let signal = format!("{}{}", "#".repeat(bars), ".".repeat(4 - bars.min(4)));
        match row {
            DirectoryRow::Country { country, .. } => {
                let crown = if row.is_premium() { " *" } else { "" };
                println!("  {}{}  [{}]", country.name, crown, signal);
            }
            DirectoryRow::Server { server, .. } => {
                println!("    {:<16} {:<20} [{}]", server.name, server.city, signal);
            }
        }
    }
}
