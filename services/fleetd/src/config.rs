//! Configuration for fleetd.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use flotilla_id::MachineId;
use flotilla_reconcile::{DEFAULT_ENGINE_RECONCILE_INTERVAL, DEFAULT_REQUEST_TIMEOUT};
use flotilla_registry::{DEFAULT_KEY_PREFIX, DEFAULT_PAGE_LIMIT};

const MIN_AGENT_TTL: Duration = Duration::from_secs(5);

/// Backend the agent drives units through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorBackend {
    /// In-process supervisor that tracks units without running them.
    Mock,
}

impl SupervisorBackend {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            other => bail!("FLEET_SUPERVISOR {other:?} is not built into this daemon (supported: mock)"),
        }
    }
}

/// fleetd configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// KV endpoints; logged only, the daemon runs the embedded store.
    pub etcd_endpoints: Vec<String>,

    /// Root of every registry key.
    pub key_prefix: String,

    /// TTL of this machine's record.
    pub agent_ttl: Duration,

    pub engine_reconcile_interval: Duration,

    /// Deadline of a single KV call.
    pub request_timeout: Duration,

    /// Page size of listings.
    pub token_limit: u16,

    pub machine_id: MachineId,

    pub public_ip: String,

    pub metadata: BTreeMap<String, String>,

    pub capabilities: BTreeSet<String>,

    /// Run only the agent on this machine.
    pub disable_engine: bool,

    pub supervisor: SupervisorBackend,

    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let etcd_endpoints: Vec<String> = var("FLEET_ETCD_ENDPOINTS")
            .unwrap_or_else(|| "http://127.0.0.1:2379".to_string())
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        if etcd_endpoints.is_empty() {
            bail!("FLEET_ETCD_ENDPOINTS names no endpoint");
        }

        let key_prefix = var("FLEET_ETCD_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        if !key_prefix.starts_with('/') {
            bail!("FLEET_ETCD_KEY_PREFIX must start with '/', got {key_prefix:?}");
        }

        let agent_ttl = duration_var(&var, "FLEET_AGENT_TTL", Duration::from_secs(30))?;
        if agent_ttl < MIN_AGENT_TTL {
            bail!("FLEET_AGENT_TTL must be at least {}s", MIN_AGENT_TTL.as_secs());
        }
        let engine_reconcile_interval = duration_var(
            &var,
            "FLEET_ENGINE_RECONCILE_INTERVAL",
            DEFAULT_ENGINE_RECONCILE_INTERVAL,
        )?;
        let request_timeout = duration_var(&var, "FLEET_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT)?;
        for (name, value) in [
            ("FLEET_ENGINE_RECONCILE_INTERVAL", engine_reconcile_interval),
            ("FLEET_REQUEST_TIMEOUT", request_timeout),
        ] {
            if value.is_zero() {
                bail!("{name} must be positive");
            }
        }

        let token_limit = match var("FLEET_TOKEN_LIMIT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("FLEET_TOKEN_LIMIT is not a number: {raw:?}"))?,
            None => DEFAULT_PAGE_LIMIT,
        };
        if token_limit != DEFAULT_PAGE_LIMIT {
            bail!("FLEET_TOKEN_LIMIT must be {DEFAULT_PAGE_LIMIT}");
        }

        // Generated when not provided.
        let machine_id = match var("FLEET_MACHINE_ID") {
            Some(raw) => MachineId::parse(&raw).with_context(|| format!("invalid FLEET_MACHINE_ID {raw:?}"))?,
            None => MachineId::generate(),
        };

        let supervisor = match var("FLEET_SUPERVISOR") {
            Some(raw) => SupervisorBackend::parse(&raw)?,
            None => SupervisorBackend::Mock,
        };

        Ok(Self {
            etcd_endpoints,
            key_prefix,
            agent_ttl,
            engine_reconcile_interval,
            request_timeout,
            token_limit,
            machine_id,
            public_ip: var("FLEET_PUBLIC_IP").unwrap_or_default(),
            metadata: var("FLEET_METADATA").map(|m| parse_metadata(&m)).unwrap_or_default(),
            capabilities: var("FLEET_CAPABILITIES")
                .map(|c| {
                    c.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            disable_engine: var("FLEET_DISABLE_ENGINE").is_some_and(|v| parse_bool(&v)),
            supervisor,
            log_level: var("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn duration_var(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match var(key) {
        Some(raw) => parse_duration(&raw).with_context(|| format!("invalid {key} {raw:?}")),
        None => Ok(default),
    }
}

/// `500ms`, `5s`, `2m` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (number, scale) = if let Some(n) = raw.strip_suffix("ms") {
        (n, Duration::from_millis(1))
    } else if let Some(n) = raw.strip_suffix('s') {
        (n, Duration::from_secs(1))
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, Duration::from_secs(60))
    } else {
        (raw, Duration::from_secs(1))
    };
    let n: u32 = number.trim().parse().context("expected a whole number")?;
    Ok(scale * n)
}

/// `k=v,k2=v2`; malformed pairs are skipped.
pub fn parse_metadata(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let (key, value) = (key.trim(), value.trim());
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
