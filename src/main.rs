use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use jabber_gateway::{start_session, GatewayEvent, SessionConfig, SessionHandle, TransferEvent};

/// Print startup diagnostics to stderr for debugging.
fn print_startup_diagnostics(config: &SessionConfig) {
    eprintln!(
        "{} v{} (build {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GATEWAY_BUILD")
    );
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("Account: {}", config.jid);
    eprintln!(
        "Server: {}",
        config.server.as_deref().unwrap_or("(from JID domain)")
    );
    eprintln!("TLS: {:?}, verify certificates: {}", config.tls, config.tls_verify);
    eprintln!("Transfer proxies: {}", config.transfer_proxies);
    eprintln!("---");
}

fn print_help() {
    eprintln!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: jabber-gateway --config=PATH [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --config=PATH     Session configuration (JSON)");
    eprintln!("      --accept-dir=DIR  Accept offered files into DIR (default: refuse them)");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform data dir)");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Transfer events are printed to stdout as JSON lines.");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

fn log_dir(log_file_path: Option<&str>) -> PathBuf {
    match log_file_path {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jabber-gateway")
            .join("logs"),
    }
}

/// File log always; stderr only when asked for.
fn init_tracing(log_dir: &Path, verbose_level: Option<&str>, log_file_given: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("jabber_gateway=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(log_dir, "jabber-gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || log_file_given || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("jabber_gateway=debug,jabber_gateway::session=trace,info")
        } else {
            EnvFilter::new("jabber_gateway=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(guard);
    eprintln!("Log file: {}", log_dir.display());
}

async fn on_offer(handle: &SessionHandle, accept_dir: Option<&Path>, event: &TransferEvent) {
    let TransferEvent::Offered { id, from, name, .. } = event else {
        return;
    };
    let Some(dir) = accept_dir else {
        if let Err(e) = handle.cancel_file(*id, "not accepting files").await {
            tracing::warn!(transfer = %id, error = %e, "could not refuse offer");
        }
        return;
    };
    // Peers choose the name; keep only its last component.
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| format!("transfer-{}", id.0).into());
    let path = dir.join(file_name);
    match tokio::fs::File::create(&path).await {
        Ok(file) => {
            tracing::info!(transfer = %id, from = %from, path = %path.display(), "accepting file");
            if let Err(e) = handle.accept_file(*id, Box::new(file)).await {
                tracing::warn!(transfer = %id, error = %e, "could not accept offer");
            }
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "could not create file");
            let _ = handle.cancel_file(*id, "could not store the file").await;
        }
    }
}

#[tokio::main]
async fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }
    let dangerous_insecure_tls = args.iter().any(|arg| arg == "--dangerous-insecure-tls");
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let log_file_path = args.iter().find_map(|arg| arg.strip_prefix("--log-file="));
    let config_path = args.iter().find_map(|arg| arg.strip_prefix("--config="));
    let accept_dir = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--accept-dir="))
        .map(PathBuf::from);

    let Some(config_path) = config_path else {
        eprintln!("Missing --config=PATH (see --help)");
        std::process::exit(2);
    };
    let mut config = match SessionConfig::load(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load '{}': {}", config_path, e);
            std::process::exit(2);
        }
    };
    if dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
        config.tls_verify = false;
    }

    init_tracing(&log_dir(log_file_path), verbose_level, log_file_path.is_some());
    if verbose_level.is_some() || log_file_path.is_some() {
        print_startup_diagnostics(&config);
    }

    let (handle, mut events) = match start_session(config) {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "could not start the session");
            std::process::exit(1);
        }
    };

    let mut exit_code = 0;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    GatewayEvent::Log(line) => tracing::info!("{}", line),
                    GatewayEvent::Ready { jid } => tracing::info!(jid = %jid, "session ready"),
                    GatewayEvent::FatalError { message, retryable } => {
                        tracing::error!(retryable, "{}", message);
                        exit_code = if retryable { 75 } else { 1 };
                    }
                    GatewayEvent::Stanza(stanza) => {
                        tracing::debug!(name = stanza.name(), "unhandled stanza");
                    }
                    GatewayEvent::Transfer(event) => {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => tracing::warn!(error = %e, "could not encode transfer event"),
                        }
                        on_offer(&handle, accept_dir.as_deref(), &event).await;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, logging out");
                handle.close();
            }
        }
    }
    std::process::exit(exit_code);
}
