use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use glimpse_contracts::GatePolicy;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub ledger_mode: LedgerMode,
    pub db_url: Option<String>,
    pub ledger_write_timeout_ms: u64,
    pub producer_url: String,
    pub producer_timeout_ms: u64,
    pub face_search: GatePolicy,
    pub query_gen: GatePolicy,
    pub rate_limit_window_secs: u64,
    pub rate_limit_per_window: u32,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("GLIMPSE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = match kv.get("GLIMPSE_BIND_ADDR") {
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            Some(raw) => raw.parse::<SocketAddr>().map_err(|_| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "GLIMPSE_BIND_ADDR must be a valid host:port socket address".to_string(),
            })?,
        };

        let ledger_mode = parse_ledger_mode(kv.get("GLIMPSE_LEDGER_MODE"))?;

        let db_url = optional_nonempty(kv, "GLIMPSE_DB_URL");
        if ledger_mode == LedgerMode::Postgres && db_url.is_none() {
            return Err(StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "postgres ledger mode requires GLIMPSE_DB_URL".to_string(),
            });
        }

        let ledger_write_timeout_ms = parse_num(
            kv.get("GLIMPSE_LEDGER_WRITE_TIMEOUT_MS"),
            2000,
            "GLIMPSE_LEDGER_WRITE_TIMEOUT_MS",
        )?;

        let producer_url = require_nonempty(kv, "GLIMPSE_PRODUCER_URL")?;
        let producer_timeout_ms = parse_num(
            kv.get("GLIMPSE_PRODUCER_TIMEOUT_MS"),
            5000,
            "GLIMPSE_PRODUCER_TIMEOUT_MS",
        )?;

        let face_search = parse_gate_policy(kv, "GLIMPSE_FACE_SEARCH", 5, 0.4)?;
        let query_gen = parse_gate_policy(kv, "GLIMPSE_QUERY_GEN", 10, 0.25)?;

        let rate_limit_window_secs = parse_num(
            kv.get("GLIMPSE_RATE_LIMIT_WINDOW_SECS"),
            60,
            "GLIMPSE_RATE_LIMIT_WINDOW_SECS",
        )?;
        let rate_limit_per_window = parse_num(
            kv.get("GLIMPSE_RATE_LIMIT_PER_WINDOW"),
            120,
            "GLIMPSE_RATE_LIMIT_PER_WINDOW",
        )?;

        let admin_token = optional_nonempty(kv, "GLIMPSE_ADMIN_TOKEN");

        Ok(Self {
            bind_addr,
            ledger_mode,
            db_url,
            ledger_write_timeout_ms,
            producer_url,
            producer_timeout_ms,
            face_search,
            query_gen,
            rate_limit_window_secs,
            rate_limit_per_window,
            admin_token,
        })
    }

    pub fn policy_for(&self, resource: glimpse_contracts::ResourceKind) -> GatePolicy {
        match resource {
            glimpse_contracts::ResourceKind::FaceSearch => self.face_search,
            glimpse_contracts::ResourceKind::QueryGen => self.query_gen,
        }
    }
}

fn parse_gate_policy(
    kv: &HashMap<String, String>,
    key_prefix: &str,
    default_limit: u32,
    default_ratio: f64,
) -> Result<GatePolicy, StartupError> {
    let limit_key = format!("{}_FREE_LIMIT", key_prefix);
    let ratio_key = format!("{}_HIDE_RATIO", key_prefix);

    let daily_free_limit = parse_num(kv.get(&limit_key), default_limit, &limit_key)?;
    let hide_ratio = parse_num(kv.get(&ratio_key), default_ratio, &ratio_key)?;

    let policy = GatePolicy {
        daily_free_limit,
        hide_ratio,
    };
    policy.validate().map_err(|reason| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{}: {}", key_prefix, reason),
    })?;

    Ok(policy)
}

fn parse_ledger_mode(value: Option<&String>) -> Result<LedgerMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("postgres");

    match mode {
        "postgres" => Ok(LedgerMode::Postgres),
        "memory" => Ok(LedgerMode::Memory),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "GLIMPSE_LEDGER_MODE must be postgres or memory".to_string(),
        }),
    }
}

fn parse_num<T: FromStr>(value: Option<&String>, default: T, key: &str) -> Result<T, StartupError> {
    match value.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a number", key),
        }),
    }
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}
