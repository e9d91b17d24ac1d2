use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::export::CleanupPolicy;
use crate::search::SearchConfig;
use crate::sso::HelixConfig;

pub const DEFAULT_MEMBER_ORGANIZATION: &str = "IAFC";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub require_login: bool,
    pub export_dir: PathBuf,
    pub export_cleanup: CleanupPolicy,
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    pub stations_per_page: usize,
    pub featured_departments: usize,
    pub search: SearchConfig,
    pub helix: Option<HelixConfig>,
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

impl AppConfig {
    /// Reads the process environment, layered over the optional
    /// `KEY=VALUE` file named by `FIRECARES_CONFIG_PATH`.
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("FIRECARES_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("FIRECARES_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000),
            "FIRECARES_BIND_ADDR",
        )?;
        let database_url = require_nonempty(kv, "DATABASE_URL")?;
        let require_login = parse_bool(kv.get("FIRECARES_REQUIRE_LOGIN")).unwrap_or(true);

        let export_dir = kv
            .get("FIRECARES_EXPORT_DIR")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let retention = parse_u64(
            kv.get("FIRECARES_EXPORT_RETENTION_SECS"),
            600,
            "FIRECARES_EXPORT_RETENTION_SECS",
        )?;
        let export_cleanup = if parse_bool(kv.get("FIRECARES_EXPORT_CLEANUP")).unwrap_or(true) {
            CleanupPolicy::Deferred {
                retention: Duration::from_secs(retention),
            }
        } else {
            CleanupPolicy::Skip
        };

        let session_ttl = Duration::from_secs(parse_u64(
            kv.get("FIRECARES_SESSION_TTL_SECS"),
            14 * 24 * 60 * 60,
            "FIRECARES_SESSION_TTL_SECS",
        )?);
        let session_sweep_interval = Duration::from_secs(
            parse_usize(
                kv.get("FIRECARES_SESSION_SWEEP_SECS"),
                3600,
                "FIRECARES_SESSION_SWEEP_SECS",
            )? as u64,
        );

        let stations_per_page = parse_usize(
            kv.get("FIRECARES_STATIONS_PER_PAGE"),
            10,
            "FIRECARES_STATIONS_PER_PAGE",
        )?;
        let featured_departments = parse_usize(
            kv.get("FIRECARES_FEATURED_DEPARTMENTS"),
            5,
            "FIRECARES_FEATURED_DEPARTMENTS",
        )?;

        let mut search = SearchConfig::default();
        search.default_page_size = parse_usize(
            kv.get("FIRECARES_PAGE_SIZE"),
            search.default_page_size,
            "FIRECARES_PAGE_SIZE",
        )?;

        let helix = parse_helix_config(kv)?;

        Ok(Self {
            bind_addr,
            database_url,
            require_login,
            export_dir,
            export_cleanup,
            session_ttl,
            session_sweep_interval,
            stations_per_page,
            featured_departments,
            search,
            helix,
        })
    }

    /// The web server cannot run without an identity provider.
    pub fn require_helix(&self) -> Result<HelixConfig, StartupError> {
        self.helix.clone().ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: "HELIX_CLIENT_ID and the HELIX_* endpoints are required to serve".to_string(),
        })
    }
}

fn parse_helix_config(kv: &HashMap<String, String>) -> Result<Option<HelixConfig>, StartupError> {
    let client_id = kv
        .get("HELIX_CLIENT_ID")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());
    let Some(client_id) = client_id else {
        return Ok(None);
    };

    let member_organization = kv
        .get("HELIX_MEMBER_ORGANIZATION")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_MEMBER_ORGANIZATION)
        .to_string();
    let timeout_ms = parse_u64(kv.get("HELIX_TIMEOUT_MS"), 10_000, "HELIX_TIMEOUT_MS")?;

    Ok(Some(HelixConfig {
        authorize_url: require_url(kv, "HELIX_AUTHORIZE_URL")?,
        token_url: require_url(kv, "HELIX_TOKEN_URL")?,
        whoami_url: require_url(kv, "HELIX_WHOAMI_URL")?,
        logout_url: require_url(kv, "HELIX_LOGOUT_URL")?,
        client_id: client_id.to_string(),
        client_secret: require_nonempty(kv, "HELIX_CLIENT_SECRET")?,
        redirect_uri: require_url(kv, "HELIX_REDIRECT_URI")?,
        member_organization,
        timeout: Duration::from_millis(timeout_ms),
    }))
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
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|rest| rest.strip_suffix(quote)) {
            return inner.to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(kv: &HashMap<String, String>, key: &'static str) -> Result<String, StartupError> {
    kv.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn require_url(kv: &HashMap<String, String>, key: &'static str) -> Result<String, StartupError> {
    let value = require_nonempty(kv, key)?;
    reqwest::Url::parse(&value).map_err(|_| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{} must be an absolute url", key),
    })?;
    Ok(value)
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    let parsed = parse_u64(value, default as u64, key)?;
    if parsed == 0 {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be greater than zero", key),
        });
    }
    usize::try_from(parsed).map_err(|_| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{} is out of range", key),
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" => Some(false),
        _ => None,
    }
}
