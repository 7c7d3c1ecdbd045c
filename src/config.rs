use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};

fn default_req_per_sec() -> u32 {
    10
}

fn default_ms_between_req() -> u64 {
    50
}

/// The env vars needed to reach one portal account.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalEnv {
    pub portal_host: String,
    pub portal_login: String,
    pub portal_password: String,
    /// Pre-encoded school selector, e.g. `cid=2&sid=1&pid=-1&cn=3&sft=2&scid=23`.
    pub portal_selector: String,
    #[serde(default = "default_req_per_sec")]
    pub req_per_sec: u32,
    #[serde(default = "default_ms_between_req")]
    pub ms_between_req: u64,
    #[serde(default)]
    pub report_timeout_secs: Option<u64>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Knobs for the outbound HTTP side of a session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub req_per_sec: u32,
    pub min_gap: Duration,
    /// Deadline for a report job once the task has been started. `None` waits
    /// for as long as the portal keeps the channel open.
    pub report_timeout: Option<Duration>,
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            req_per_sec: default_req_per_sec(),
            min_gap: Duration::from_millis(default_ms_between_req()),
            report_timeout: None,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    pub selector: String,
}

pub struct PortalConfig {
    pub host: String,
    pub credentials: Credentials,
    pub client: ClientConfig,
}

impl PortalConfig {
    pub fn new() -> anyhow::Result<Self> {
        let env = PortalEnv::load_from_env()?;
        Ok(Self::from(env))
    }
}

impl From<PortalEnv> for PortalConfig {
    fn from(env: PortalEnv) -> Self {
        Self {
            host: env.portal_host,
            credentials: Credentials {
                login: env.portal_login,
                password: env.portal_password,
                selector: env.portal_selector,
            },
            client: ClientConfig {
                req_per_sec: env.req_per_sec,
                min_gap: Duration::from_millis(env.ms_between_req),
                report_timeout: env.report_timeout_secs.map(Duration::from_secs),
                accept_invalid_certs: env.accept_invalid_certs,
            },
        }
    }
}

// Extension trait.
pub trait LoadFromEnv: DeserializeOwned {
    fn load_from_env() -> anyhow::Result<Self> {
        // Don't throw an error if .env file doesn't exist.
        let _ = dotenv::dotenv();
        let config =
            envy::from_env::<Self>().context("failed to load env variables into config struct")?;
        Ok(config)
    }
}

impl<T: DeserializeOwned> LoadFromEnv for T {}
