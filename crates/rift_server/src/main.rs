mod commands;
mod config;
mod host;
mod net;
mod player;
mod server;
mod world;

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::ServerConfig;

fn main() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();

    let mut config_path: Option<PathBuf> = None;
    let mut port: Option<u16> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let Some(value) = args.next() else {
                    eprintln!("--config expects a path argument");
                    std::process::exit(2);
                };
                config_path = Some(PathBuf::from(value));
            }
            "--port" => {
                let Some(value) = args.next() else {
                    eprintln!("--port expects a numeric argument");
                    std::process::exit(2);
                };
                match value.parse::<u16>() {
                    Ok(parsed) => port = Some(parsed),
                    Err(err) => {
                        eprintln!("invalid port '{value}': {err}");
                        std::process::exit(2);
                    }
                }
            }
            "--help" | "-h" => {
                println!("Usage: rift_server [--config <path>] [--port <u16>]");
                return;
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }

    let mut config = match ServerConfig::load_or_default(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid server config: {err}");
            std::process::exit(2);
        }
    };
    if let Some(port) = port {
        config.port = port;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("\nShutdown signal received, stopping server...");
        r.store(false, Ordering::SeqCst);
    }) {
        eprintln!("failed to set Ctrl+C handler: {err}");
        std::process::exit(1);
    }

    if let Err(err) = server::run(config, running) {
        eprintln!("server failed: {err}");
        std::process::exit(1);
    }
}
