use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "knive")]
#[command(author, version, about = "Live MPEG-TS pipeline engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every configured channel and the admin API
    Serve,

    /// Push stdin to a channel feed
    Send {
        /// Feed host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Feed port
        #[arg(short, long, default_value_t = knive::feed::DEFAULT_PORT)]
        port: u16,

        /// Shared feed secret
        #[arg(short, long, env = "KNIVE_SECRET")]
        secret: String,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_takes_its_target() {
        let cli = Cli::parse_from(["knive", "--verbose", "send", "--host", "feeds.example", "-p", "4000", "-s", "abc"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Send { host, port, secret } => {
                assert_eq!(host, "feeds.example");
                assert_eq!(port, 4000);
                assert_eq!(secret, "abc");
            }
            _ => panic!("expected send"),
        }
    }
}
