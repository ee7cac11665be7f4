use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub config_path: String,
    pub server_url: String,
    pub caddy_admin_url: String,
    pub lb_domain: Option<String>,
    pub lb_port: String,
    pub mc_binary: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Control plane for a federation of object-storage deployments")]
pub struct Args {
    /// Host to bind to (overrides FADO_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FADO_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FADO_DATABASE)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bootstrap file applied to an empty database (overrides FADO_CONFIG)
    #[arg(long)]
    pub config: Option<String>,

    /// Public URL of this server; backends post events to `{url}/api/notify`
    #[arg(long)]
    pub server_url: Option<String>,

    /// Reverse-proxy admin API (overrides FADO_CADDY_ADMIN_URL)
    #[arg(long)]
    pub caddy_admin_url: Option<String>,

    /// Virtual host the load balancer serves; unset means match by port
    #[arg(long)]
    pub lb_domain: Option<String>,

    /// Port the load balancer listens on (overrides FADO_LB_PORT)
    #[arg(long)]
    pub lb_port: Option<String>,

    /// Storage admin client binary (overrides FADO_MC_BINARY)
    #[arg(long)]
    pub mc_binary: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_port = match env::var("FADO_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing FADO_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 9090,
            Err(err) => return Err(err).context("reading FADO_PORT"),
        };
        let env_lb_domain = env::var("FADO_LB_DOMAIN").ok().filter(|d| !d.is_empty());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or_else(|| env_or("FADO_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            database_url: args
                .database_url
                .unwrap_or_else(|| env_or("FADO_DATABASE", "sqlite://./data/fado.db")),
            config_path: args
                .config
                .unwrap_or_else(|| env_or("FADO_CONFIG", "./config.json")),
            server_url: args
                .server_url
                .unwrap_or_else(|| env_or("FADO_SERVER_URL", "https://server.fado")),
            caddy_admin_url: args
                .caddy_admin_url
                .unwrap_or_else(|| env_or("FADO_CADDY_ADMIN_URL", "http://caddy-admin.fado")),
            lb_domain: args.lb_domain.or(env_lb_domain),
            lb_port: args
                .lb_port
                .unwrap_or_else(|| env_or("FADO_LB_PORT", "443")),
            mc_binary: args
                .mc_binary
                .unwrap_or_else(|| env_or("FADO_MC_BINARY", "mc")),
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    /// Reject settings that would only fail later, on every reconfiguration.
    pub fn validate(&self) -> Result<()> {
        self.lb_port
            .parse::<u16>()
            .with_context(|| format!("load balancer port `{}` is not a port number", self.lb_port))?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Where backends deliver bucket events.
    pub fn webhook_url(&self) -> String {
        format!("{}/api/notify", self.server_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            host: "0.0.0.0".into(),
            port: 9090,
            database_url: "sqlite::memory:".into(),
            config_path: "./config.json".into(),
            server_url: "https://server.fado/".into(),
            caddy_admin_url: "http://caddy-admin.fado".into(),
            lb_domain: None,
            lb_port: "443".into(),
            mc_binary: "mc".into(),
        }
    }

    #[test]
    fn webhook_url_ignores_trailing_slash() {
        let cfg = sample();
        assert_eq!(cfg.webhook_url(), "https://server.fado/api/notify");
        assert_eq!(cfg.addr(), "0.0.0.0:9090");
    }

    #[test]
    fn load_balancer_port_must_be_numeric() {
        let mut cfg = sample();
        assert!(cfg.validate().is_ok());

        cfg.lb_port = String::new();
        assert!(cfg.validate().is_err());
        cfg.lb_port = "https".into();
        assert!(cfg.validate().is_err());
    }
}
