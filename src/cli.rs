use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bore", version, about = "Keep a fleet of SSH port forwards alive")]
pub struct Cli {
    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the daemon
    Start {
        /// Stay in the foreground instead of forking into the background
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon, tunnel and group status
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_foreground() {
        let cli = Cli::parse_from(["bore", "start", "--foreground"]);
        match cli.command {
            Command::Start { foreground } => assert!(foreground),
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn default_log_level_is_info() {
        let cli = Cli::parse_from(["bore", "status"]);
        assert_eq!(cli.log_level, "info");
    }
}
