//! OIDC Gateway - OIDC-aware reverse proxy and policy enforcement point

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use oidc_gateway::{
    ac::PolicyStore,
    cli::{Cli, Command},
    config::Config,
    credentials::{ClientCredential, CredentialStore},
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    run(cli).await
}

/// Dispatch the parsed command line.
async fn run(mut cli: Cli) -> ExitCode {
    // Take the subcommand out first so `cli` stays whole for the handlers.
    match cli.command.take() {
        Some(Command::CheckAc) => run_check_ac(&cli),
        Some(Command::AddProvider {
            name,
            client_id,
            client_secret,
        }) => run_add_provider(&cli, &name, client_id, client_secret),
        Some(Command::PrintSampleConfig) => print_sample_config(),
        Some(Command::PrintSampleAc) => print_sample_ac(),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Validate the configured policy directories without starting the server.
fn run_check_ac(cli: &Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.access_control.json_dirs.is_empty() {
        eprintln!("No policy directories configured");
        return ExitCode::FAILURE;
    }

    let store = PolicyStore::new();
    match store.load_dirs(&config.access_control.json_dirs) {
        Ok(rules) => {
            println!("Access-control policies OK ({rules} rules)");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Policy check failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Store a pre-registered client credential for a provider.
fn run_add_provider(
    cli: &Cli,
    name: &str,
    client_id: String,
    client_secret: String,
) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let redirect_uris = config
        .providers
        .get(name)
        .map(|p| config.redirect_uris_for(p))
        .unwrap_or_default();
    if !config.providers.contains_key(name) {
        eprintln!("Warning: provider '{name}' is not in the configuration");
    }

    let store = CredentialStore::new(config.credentials.path.clone());
    let result = store.harden().and_then(|()| {
        let mut credentials = store.load()?;
        credentials.insert(
            name.to_string(),
            ClientCredential {
                client_id,
                client_secret,
                redirect_uris,
            },
        );
        store.save(&credentials)
    });

    match result {
        Ok(()) => {
            println!("Stored credential for provider '{name}'");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to store credential: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_sample_config() -> ExitCode {
    match serde_yaml::to_string(&Config::sample()) {
        Ok(yaml) => {
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render sample config: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_sample_ac() -> ExitCode {
    match serde_json::to_string_pretty(&PolicyStore::sample_document()) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render sample policy: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        providers = config.providers.len(),
        services = config.services.len(),
        "Starting OIDC Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
