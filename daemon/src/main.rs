mod config;
mod dispatcher;
mod error;
mod event;
mod hook;
mod logging;
mod paths;
mod redact;
mod rpc;
mod service;
#[cfg(test)]
mod testing;
mod token_store;

use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser};

use crate::config::Config;
use crate::error::NotifyError;
use crate::hook::{HookCommand, Hooks, ProcessHookRunner};
use crate::redact::{Redactor, ServiceLog};
use crate::rpc::{ProcessTransport, RpcGateway};
use crate::service::{NotificationService, ServiceSettings};
use crate::token_store::TokenStore;

/// Runs the pre/post vMotion hooks of one application around every live
/// migration announced by the hypervisor.
#[derive(Debug, Parser)]
#[command(name = "vmnotificationd", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the configuration summary and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = match cli.config {
        Some(path) if path.is_file() => path,
        other => {
            match other {
                Some(path) => eprintln!("Config file not found: {}", path.display()),
                None => eprintln!("No config file given"),
            }
            eprintln!("{}", Cli::command().render_usage());
            std::process::exit(1);
        }
    };
    let config = config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("[config] Error: {e:#}");
        std::process::exit(1);
    });

    println!("vmnotificationd v{}", env!("CARGO_PKG_VERSION"));
    print!("{config}");
    if cli.print_config {
        return;
    }

    // ── Directories ───────────────────────────────────────────────────────────
    for file in config.output_files() {
        if let Err(e) = paths::ensure_parent_dir(file) {
            eprintln!("Failed to create directory for {}: {e}", file.display());
            std::process::exit(1);
        }
    }

    // ── Logging ───────────────────────────────────────────────────────────────
    let log_guard = logging::init(&config.logging).unwrap_or_else(|e| {
        eprintln!("[logging] Error: {e:#}");
        std::process::exit(1);
    });
    let redactor = Redactor::new(config.token.token_obfuscate_logfile);
    let log = ServiceLog::new("service", redactor);

    let mut service = match build_service(&config, &log) {
        Ok(service) => service,
        Err(e) => {
            log.error(format!("startup: {e}"));
            eprintln!("[startup] Error: {e}");
            drop(log_guard);
            std::process::exit(1);
        }
    };
    log.info(format!(
        "vmnotificationd v{} starting for '{}'",
        env!("CARGO_PKG_VERSION"),
        config.service.app_name
    ));

    // ── Run ───────────────────────────────────────────────────────────────────
    service.run_until_signalled().await;

    log.info("vmnotificationd stopped");
}

fn build_service(config: &Config, log: &ServiceLog) -> Result<NotificationService, NotifyError> {
    let transport = ProcessTransport::from_command_line(&config.service.rpc_command)?;
    let gateway = RpcGateway::new(Box::new(transport), log.child("rpc"));
    let hooks = Hooks {
        pre: HookCommand::parse(&config.service.pre_vmotion_cmd)?,
        post: HookCommand::parse(&config.service.post_vmotion_cmd)?,
        runner: Box::new(ProcessHookRunner::new(log.child("hook"))),
    };
    let store = TokenStore::new(config.token.token_file.clone(), log.child("token"));
    let settings = ServiceSettings {
        app_name: config.service.app_name.clone(),
        poll_interval: Duration::from_secs(config.service.check_interval_seconds),
        persist_token: config.token.token_file_create,
    };
    Ok(NotificationService::new(settings, gateway, store, hooks, log.clone()))
}
