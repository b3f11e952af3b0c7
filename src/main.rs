//! coord-testkit - CLI entry point
//!
//! Runs a standalone embedded coordination server, for poking at it by hand
//! or pointing out-of-process tests at it, and validates configuration files.

use clap::{Parser, Subcommand};
use coord_testkit::config::{default_port, Config, ConfigLoader};
use coord_testkit::{logging, EmbeddedServerFactory, Port, ServerFactory, ServerHandle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, Signal, SignalKind};

/// Embedded coordination server for tests
#[derive(Parser)]
#[command(name = "coord-testkit")]
#[command(version, about = "Embedded coordination server for tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the coord-testkit CLI
#[derive(Subcommand)]
enum Commands {
    /// Run a server in the foreground until SIGINT or SIGTERM
    Serve {
        /// Port to listen on; 0 picks a free one (default: COORD_TEST_PORT or 9500)
        #[arg(long)]
        port: Option<u16>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Delete data and snapshot directories on exit
        #[arg(long)]
        cleanup: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Actions for the config subcommand
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default configuration as TOML
    Default,
    /// Validate a configuration file
    Validate {
        /// TOML configuration file
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            config,
            cleanup,
        } => {
            logging::init();
            run_serve(port.map(Port::from), config.as_deref(), cleanup)
        }
        Commands::Config { action } => match action {
            ConfigAction::Default => match toml::to_string_pretty(&Config::default()) {
                Ok(text) => {
                    print!("{text}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Config error: {e}");
                    ExitCode::FAILURE
                }
            },
            ConfigAction::Validate { path } => {
                match ConfigLoader::load_from_path(&path)
                    .and_then(|config| config.server.settings().map(|_| config))
                {
                    Ok(config) => {
                        println!("Configuration is valid");
                        println!("{config:#?}");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Config error: {e}");
                        ExitCode::FAILURE
                    }
                }
            }
        },
    }
}

fn run_serve(port: Option<Port>, config_path: Option<&Path>, cleanup: bool) -> ExitCode {
    let config = match ConfigLoader::load_optional(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut settings = match config.server.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };
    settings.cleanup_on_exit |= cleanup;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    // Register before announcing the address so an early SIGTERM is not lost.
    let sigterm = {
        let _guard = runtime.enter();
        register_sigterm()
    };

    let port = port.or(config.fixture.port).unwrap_or_else(default_port);
    let factory = EmbeddedServerFactory::new(settings);
    let server = match factory.start_server(port) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Serving on {}", server.local_addr());
    println!("  Data directory: {}", server.data_dir().display());
    println!("  Snapshot directory: {}", server.snapshot_dir().display());

    runtime.block_on(wait_for_shutdown(sigterm));

    let result = server.shutdown();
    factory.cleanup();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn register_sigterm() -> Option<Signal> {
    match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            tracing::warn!("Could not register SIGTERM handler, using SIGINT only: {}", e);
            None
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown(sigterm: Option<Signal>) {
    match sigterm {
        Some(mut sigterm) => {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("Received SIGINT (Ctrl+C), shutting down");
                },
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                },
            }
        }
        None => {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("Failed waiting for SIGINT: {}", e);
            } else {
                tracing::info!("Received SIGINT (Ctrl+C), shutting down");
            }
        }
    }
}
