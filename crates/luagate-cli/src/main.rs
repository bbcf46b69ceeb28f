//! # luagate CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve ./scripts on port 8080 with the default admission limits
//! luagate serve -d ./scripts -b 0.0.0.0:8080
//!
//! # Looser rate limit and a 5 second execution budget
//! luagate serve -d ./scripts --rate-limit-rps 20 --rate-limit-burst 40 --max-execution-time-ms 5000
//! ```
//!
//! `LUAGATE_SCRIPTS_DIR` and `LUAGATE_BIND` are used when `-d` / `-b` are not
//! given.

use anyhow::Result;
use argh::FromArgs;
use luagate_common::rate_limit::RateLimitConfig;
use luagate_server::{Gateway, GatewayConfig, HttpServer, ResourceLimits};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_SCRIPTS_DIR: &str = "./scripts";

#[derive(FromArgs)]
/// luagate - run Lua scripts over HTTP
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
}

/// Arguments for starting the script server.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start the script server
struct ServeArgs {
    /// address to bind the HTTP server to
    ///
    /// Falls back to LUAGATE_BIND, then 0.0.0.0:8080.
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// directory holding the .lua scripts
    ///
    /// Falls back to LUAGATE_SCRIPTS_DIR, then ./scripts.
    #[argh(option, short = 'd', long = "scripts-dir")]
    scripts_dir: Option<String>,

    /// sustained requests per second allowed per client (default 1)
    #[argh(option, long = "rate-limit-rps", default = "1.0")]
    rate_limit_rps: f64,

    /// requests a client may make in a burst (default 3)
    #[argh(option, long = "rate-limit-burst", default = "3")]
    rate_limit_burst: u32,

    /// turn admission control off
    #[argh(switch, long = "no-rate-limit")]
    no_rate_limit: bool,

    /// wall-clock budget for one script run in milliseconds (default 30000)
    #[argh(option, long = "max-execution-time-ms", default = "30000")]
    max_execution_time_ms: u64,

    /// largest accepted request body in bytes (default 1 MiB)
    #[argh(option, long = "max-payload-bytes", default = "1024 * 1024")]
    max_payload_bytes: usize,

    /// timeout for one outbound script HTTP call in milliseconds (default 30000)
    #[argh(option, long = "http-timeout-ms", default = "30000")]
    http_timeout_ms: u64,
}

impl ServeArgs {
    fn bind_addr(&self) -> Result<SocketAddr> {
        let bind = resolve(self.bind.clone(), "LUAGATE_BIND", DEFAULT_BIND);
        bind.parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", bind, e))
    }

    fn gateway_config(&self) -> Result<GatewayConfig> {
        let scripts_dir = PathBuf::from(resolve(
            self.scripts_dir.clone(),
            "LUAGATE_SCRIPTS_DIR",
            DEFAULT_SCRIPTS_DIR,
        ));

        let limits = ResourceLimits::new()
            .with_execution_timeout(Duration::from_millis(self.max_execution_time_ms))
            .with_max_payload_bytes(self.max_payload_bytes)
            .with_http_timeout(Duration::from_millis(self.http_timeout_ms));

        let rate_limit = if self.no_rate_limit {
            RateLimitConfig::disabled()
        } else {
            RateLimitConfig::new(self.rate_limit_rps, self.rate_limit_burst)
        };

        let config = GatewayConfig::new(scripts_dir)
            .with_limits(limits)
            .with_rate_limit(rate_limit);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

/// Flag value, else the environment variable, else the default.
fn resolve(flag: Option<String>, env_var: &str, default: &str) -> String {
    flag.or_else(|| std::env::var(env_var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve(args) => {
            let addr = args.bind_addr()?;
            let config = args.gateway_config()?;

            tracing::info!("Serving scripts from {}", config.scripts_dir.display());
            tracing::info!("Maximum execution time: {}ms", args.max_execution_time_ms);
            if config.rate_limit.is_enabled() {
                tracing::info!(
                    "Rate limiting enabled: {} requests per second, burst {}",
                    config.rate_limit.requests_per_second,
                    config.rate_limit.burst_size
                );
            } else {
                tracing::info!("Rate limiting disabled");
            }

            let gateway = Arc::new(Gateway::new(config)?);
            HttpServer::new(gateway).run(addr).await?;
            Ok(())
        }
    }
}
