use clap::Parser;
use tracing::error;

use bore::cli::{Cli, Command};
use bore::control::ControlClient;
use bore::daemon::{process, Daemon};
use bore::error::Result;
use bore::paths::Paths;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let paths = match Paths::new() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    // The daemon child logs to the file; everything else to stderr.
    let _log_guard = if matches!(cli.command, Command::Start { .. }) && process::is_daemon_child() {
        Some(bore::logging::init_daemon(&paths, &cli.log_level))
    } else {
        bore::logging::init_foreground(&cli.log_level);
        None
    };

    if let Err(e) = run(cli, paths).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, paths: Paths) -> Result<()> {
    match cli.command {
        Command::Start { foreground } => {
            if foreground || process::is_daemon_child() {
                let daemon = Daemon::new(paths)?;
                return daemon.run().await;
            }

            let client = ControlClient::new(paths.socket());
            if client.is_daemon_running().await {
                println!("daemon is already running");
                return Ok(());
            }

            process::fork(&paths)?;
            println!("daemon started");
            Ok(())
        }
        Command::Stop => {
            process::stop_daemon(&paths).await?;
            println!("daemon stopped");
            Ok(())
        }
        Command::Status => {
            let client = ControlClient::new(paths.socket());
            let status = client.status().await?;
            print_status(&status);
            Ok(())
        }
    }
}

fn print_status(status: &bore::control::StatusResponse) {
    println!(
        "daemon: pid {}, up {}, network {}",
        status.pid, status.uptime, status.network.status
    );

    if status.tunnels.is_empty() {
        println!("no tunnels running");
    } else {
        println!("tunnels:");
        for t in &status.tunnels {
            let error = t
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default();
            println!(
                "  {:<16} {:<7} {}:{} -> {}:{}  {}  sent {} recv {} conns {} reconnects {}{}",
                t.name,
                t.kind,
                t.host,
                t.local_port,
                t.remote_host,
                t.remote_port,
                t.status,
                t.bytes_sent,
                t.bytes_received,
                t.connections,
                t.reconnect_count,
                error,
            );
        }
    }

    if !status.groups.is_empty() {
        println!("groups:");
        for g in &status.groups {
            println!(
                "  {:<16} {}  [{}]",
                g.name,
                if g.enabled { "enabled" } else { "disabled" },
                g.tunnels.join(", "),
            );
        }
    }
}
