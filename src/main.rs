mod config;
mod error;
mod heuristics;
mod http_api;
mod http_server;
mod protocol;
mod pty;
mod recording;
mod registry;
mod session;
mod special_keys;
mod terminal;

use std::path::PathBuf;

use anyhow::anyhow;
use argument_parser::Parser;
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use registry::SessionRegistry;

/// Exit codes: `0` clean shutdown, `2` bind failure, `3` invalid
/// configuration.
fn main() {
    let config = match parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("termrelay: invalid configuration: {err}");
            std::process::exit(3);
        }
    };

    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = SessionRegistry::new(config.control_path.clone());
    if let Err(err) = http_api::serve(std::sync::Arc::new(config), registry) {
        eprintln!("termrelay: {err}");
        std::process::exit(2);
    }
}

fn parse_args() -> Result<ServerConfig, anyhow::Error> {
    let mut parser = Parser::from_env();
    let mut config = ServerConfig::default();

    while let Some(param) = parser.param()? {
        match param {
            p if p.is_long("port") => {
                let value: String = parser.value()?;
                config.port = value
                    .parse()
                    .map_err(|_| anyhow!("Invalid port number: {}", value))?;
            }
            p if p.is_long("host") => {
                config.host = parser.value()?;
            }
            p if p.is_long("control-path") => {
                let value: PathBuf = parser.value()?;
                config.control_path = value;
            }
            p if p.is_long("password") => {
                config.password = Some(parser.value()?);
            }
            p if p.is_long("static-path") => {
                let value: PathBuf = parser.value()?;
                config.static_path = Some(value);
            }
            p if p.is_long("debug") => {
                config.debug = true;
            }
            p if p.is_long("help") => {
                println!("Usage: termrelay [options]");
                println!("Options:");
                println!("  --port <n>            Port to listen on (default 4020)");
                println!("  --host <addr>         Address to bind to (default 127.0.0.1)");
                println!("  --control-path <dir>  Where session control directories live");
                println!("  --password <string>   Require HTTP Basic auth on /api/* (health excluded)");
                println!("  --static-path <dir>   Directory of dashboard assets to serve");
                println!("  --debug               Enable debug logging");
                println!("  --help                Show this help message");
                std::process::exit(0);
            }
            _ => return Err(parser.unexpected().into()),
        }
    }

    Ok(config)
}
