//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OIDC-aware reverse proxy - policy enforcement point
#[derive(Parser, Debug)]
#[command(name = "oidc-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OIDC_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OIDC_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OIDC_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OIDC_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OIDC_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway (default)
    Serve,

    /// Validate the configured access-control policy directories and exit
    CheckAc,

    /// Add a pre-registered provider credential to the credential store
    AddProvider {
        /// Provider name as used in the configuration file
        #[arg(required = true)]
        name: String,

        /// Client id issued by the provider
        #[arg(long, required = true)]
        client_id: String,

        /// Client secret issued by the provider
        #[arg(long, required = true)]
        client_secret: String,
    },

    /// Print a sample configuration file and exit
    PrintSampleConfig,

    /// Print a sample access-control policy document and exit
    PrintSampleAc,
}
