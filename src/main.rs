//! Straylight CLI entry point.
//!
//! `serve` runs the gateway; `check-config` validates configuration and
//! exits. Startup failures map to distinct exit codes so supervisors can
//! tell them apart: 2 = config parse, 3 = bind, 4 = provider init.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use straylight::config::GatewayConfig;
use straylight::context::GatewayContext;
use straylight::heal::{HealAuditLog, HealWorker, HealWorkerConfig};
use straylight::providers::registry::ProviderRegistry;
use straylight::reload::store::VersionStore;
use straylight::reload::{ReloadConfig, ReloadManager};
use straylight::server::{self, AppState, ServerError};

/// Exit code for configuration parse or validation failure.
const EXIT_CONFIG: i32 = 2;
/// Exit code for listen-address bind failure.
const EXIT_BIND: i32 = 3;
/// Exit code for provider initialization failure.
const EXIT_PROVIDER_INIT: i32 = 4;

/// Straylight — self-healing LLM gateway.
#[derive(Parser)]
#[command(name = "straylight", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the gateway server.
    Serve {
        /// Config file path (default: ./straylight.toml or
        /// $STRAYLIGHT_CONFIG_PATH).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration and exit.
    CheckConfig {
        /// Config file path.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Serve { config } => handle_serve(config).await,
        Command::CheckConfig { config } => handle_check_config(config),
    };

    if code != 0 {
        std::process::exit(code);
    }
}

/// Validate configuration and report.
fn handle_check_config(path: Option<PathBuf>) -> i32 {
    straylight::logging::init_cli();
    match GatewayConfig::load_from(path) {
        Ok(config) => {
            let providers: Vec<String> = config
                .enabled_providers()
                .map(|(name, settings)| format!("{name} ({})", settings.default_model))
                .collect();
            info!(providers = ?providers, "configuration is valid");
            0
        }
        Err(e) => {
            error!(error = %e, "configuration is invalid");
            EXIT_CONFIG
        }
    }
}

/// Assemble the gateway and serve until shutdown.
async fn handle_serve(path: Option<PathBuf>) -> i32 {
    let config = match GatewayConfig::load_from(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("straylight: invalid configuration: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let _logging_guard = match straylight::logging::init_serve(std::path::Path::new(
        &config.paths.logs_dir,
    )) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("straylight: failed to initialise logging: {e:#}");
            return EXIT_CONFIG;
        }
    };

    info!("straylight starting");

    // Providers. A missing credential or unknown family is fatal.
    let registry = match ProviderRegistry::from_config(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "provider initialization failed");
            return EXIT_PROVIDER_INIT;
        }
    };

    let ctx = Arc::new(GatewayContext::new(&config, registry));

    // Version store and reload manager.
    let store = match VersionStore::open(&config.paths.state_dir, config.healing.max_versions) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open version store");
            return EXIT_PROVIDER_INIT;
        }
    };
    let reload = Arc::new(ReloadManager::new(
        Arc::clone(&ctx),
        store,
        ReloadConfig {
            auto_apply: config.healing.auto_apply,
            auto_apply_threshold: config.healing.auto_apply_threshold,
            verification_timeout: std::time::Duration::from_secs(
                config.healing.verification_timeout_seconds,
            ),
            pending_expiry: chrono::Duration::days(
                i64::try_from(config.healing.pending_expiry_days).unwrap_or(7),
            ),
        },
    ));
    if let Err(e) = reload.bootstrap() {
        error!(error = %e, "failed to bootstrap adapter versions");
        return EXIT_PROVIDER_INIT;
    }

    // Heal worker, consuming the monitor's dispatch channel.
    let audit_path = PathBuf::from(&config.paths.state_dir).join("heal_audit.jsonl");
    let audit = match HealAuditLog::open(&audit_path) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(error = %e, path = %audit_path.display(), "failed to open heal audit log");
            return EXIT_PROVIDER_INIT;
        }
    };
    let (heal_tx, heal_rx) = tokio::sync::mpsc::channel(16);
    ctx.health.set_heal_channel(heal_tx);
    let worker = Arc::new(HealWorker::new(
        Arc::clone(&ctx),
        Arc::clone(&reload),
        HealWorkerConfig {
            heal_model: config.healing.heal_model.clone(),
            research_preference: config.healing.research_preference.clone(),
            max_research_queries: config.healing.max_research_queries,
            research_timeout: std::time::Duration::from_secs(
                config.healing.research_timeout_seconds,
            ),
            ..HealWorkerConfig::default()
        },
        audit,
    ));
    tokio::spawn(Arc::clone(&worker).run(heal_rx));

    // HTTP surface.
    let state = AppState::new(Arc::clone(&ctx), reload);
    match server::run(&config.server.host, config.server.port, state).await {
        Ok(()) => {
            info!("straylight stopped");
            0
        }
        Err(ServerError::Bind { addr, source }) => {
            error!(addr = %addr, error = %source, "failed to bind listen address");
            EXIT_BIND
        }
        Err(e) => {
            error!(error = %e, "server failed");
            1
        }
    }
}
