//! Process configuration, read from the command line with environment fallbacks.
use crate::error::{Error, Result};
use crate::layers::LayerRegistry;

use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

#[derive(Parser, Debug, Clone)]
#[command(name = "crop-tiles")]
#[command(about = "Mapbox vector tile server for crop plots and regions")]
pub struct Config {
    /// Database host
    #[arg(long, env = "HOSTDEV", default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Database user
    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "PASSDEV", default_value = "", hide_env_values = true)]
    pub db_password: String,

    /// Database name
    #[arg(long, env = "DBNAMEDEV", default_value = "postgres")]
    pub db_name: String,

    /// Maximum pooled database connections
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// API key handed out to tile clients. Accepted in tile paths but not enforced.
    #[arg(long, env = "API_KEY_VT", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Listen address
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Upper bound for a single tile query, in seconds
    #[arg(long, env = "QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// YAML layer definitions replacing the bundled ones
    #[arg(long, env = "LAYERS_FILE")]
    pub layers_file: Option<PathBuf>,

    /// Log filter (e.g. `info`, `crop_tiles=debug`)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Server side `statement_timeout`, so a query abandoned by the client stops
    /// running on the database too.
    pub fn statement_timeout(&self) -> String {
        format!("{}ms", self.query_timeout().as_millis())
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_user)
            .password(&self.db_password)
            .database(&self.db_name)
            .options([("statement_timeout", self.statement_timeout())])
    }

    /// Opens the connection pool shared by every request.
    pub async fn connect(&self) -> std::result::Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.query_timeout())
            .connect_with(self.connect_options())
            .await
    }

    /// The bundled layers, or the ones in `--layers-file` when given.
    pub fn load_layers(&self) -> Result<LayerRegistry> {
        match &self.layers_file {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("unable to read {}: {}", path.display(), e))
                })?;
                LayerRegistry::from_yaml(&data)
            }
            None => LayerRegistry::builtin(),
        }
    }
}
