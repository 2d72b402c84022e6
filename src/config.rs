// src/config.rs

use std::env;
use dotenvy::dotenv;

/// Maximum connections held by the Postgres pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// How many times startup retries connecting to Postgres before giving up.
pub const DB_CONNECT_RETRIES: u32 = 5;

/// Optimistic-concurrency retries for an enrollment recompute.
pub const DEFAULT_ENROLLMENT_UPDATE_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub rust_log: String,
    pub bind_addr: String,
    pub enrollment_update_retries: u32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let enrollment_update_retries = env::var("ENROLLMENT_UPDATE_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ENROLLMENT_UPDATE_RETRIES);

        Self {
            database_url,
            jwt_secret,
            rust_log,
            bind_addr,
            enrollment_update_retries,
        }
    }

    /// Configuration used by tests and tooling: in-memory storage, quiet logs.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: None,
            jwt_secret: jwt_secret.to_string(),
            rust_log: "error".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            enrollment_update_retries: DEFAULT_ENROLLMENT_UPDATE_RETRIES,
        }
    }
}
