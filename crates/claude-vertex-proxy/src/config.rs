//! Configuration from defaults, an optional YAML file, and environment variables.
//!
//! Precedence (lowest to highest): built-in defaults, the YAML file, the
//! environment. The result is validated once at start-up and never re-read.
//!
//! ```yaml
//! vertex:
//!   project_id: my-gcp-project
//!   region: us-east5
//!   sonnet_model: claude-sonnet-4@20250514
//! routes:
//!   opus: claude-opus-4@20250514
//! server:
//!   port: 3456
//!   request_timeout_ms: 600000
//! logging:
//!   level: debug
//! ```
//!
//! **Environment variables:**
//! - `PORT` / `HOST`: listen address (default: 127.0.0.1:3456)
//! - `PROJECT_ID` / `LOCATION`: Vertex project and region (default region: us-east5)
//! - `CLAUDE_MODEL` / `CLAUDE_HAIKU_MODEL`: targets of the built-in sonnet/haiku aliases
//! - `MODEL_ALIASES`: extra routes, `alias=vertex-id,alias=vertex-id`
//! - `REQUEST_TIMEOUT_MS`: default per-request deadline (default: 600000)
//! - `STREAM_BUFFER`: frames buffered between upstream and client (default: 32)
//! - `VERTEX_BASE_URL`: replaces the regional `aiplatform.googleapis.com` host
//! - `VERTEX_ACCESS_TOKEN`, `SERVICE_ACCOUNT_FILE` / `GOOGLE_APPLICATION_CREDENTIALS`
//! - `LOG_LEVEL`, `LOG_JSON`, `LOG_BODIES`

use claude_vertex_auth::{CredentialSettings, SecretString, ServiceAccountKey};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProxyError;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3456;
const DEFAULT_REGION: &str = "us-east5";
const DEFAULT_SONNET_MODEL: &str = "claude-3-7-sonnet@20250219";
const DEFAULT_HAIKU_MODEL: &str = "claude-3-5-haiku@20241022";
const DEFAULT_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_STREAM_BUFFER: usize = 32;
const DEFAULT_SERVICE_ACCOUNT_FILE: &str = "./service-account.json";

/// Client model names routed to the sonnet target out of the box.
const SONNET_ALIASES: &[&str] = &[
    "sonnet",
    "claude-3-sonnet-20240229",
    "claude-3-7-sonnet-20250219",
];

/// Client model names routed to the haiku target out of the box.
const HAIKU_ALIASES: &[&str] = &["haiku", "claude-3-haiku-20240307", "claude-3-5-haiku-20241022"];

const CONFIG_CANDIDATES: &[&str] = &["claude-vertex-proxy.yml", "claude-vertex-proxy.yaml"];

/// Alias → Vertex model routing plus the project/region every call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    project_id: String,
    region: String,
    aliases: BTreeMap<String, String>,
}

impl RouteConfig {
    pub fn new<I, A, M>(
        project_id: impl Into<String>,
        region: impl Into<String>,
        aliases: I,
    ) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = (A, M)>,
        A: Into<String>,
        M: Into<String>,
    {
        let routes = Self {
            project_id: project_id.into().trim().to_string(),
            region: region.into().trim().to_string(),
            aliases: aliases
                .into_iter()
                .map(|(a, m)| (a.into().trim().to_string(), m.into().trim().to_string()))
                .collect(),
        };
        routes.validate()?;
        Ok(routes)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.project_id.is_empty() {
            return Err(ProxyError::Configuration(
                "PROJECT_ID is required (or a service account key with project_id)".to_string(),
            ));
        }
        if self.region.is_empty() {
            return Err(ProxyError::Configuration("region must not be empty".to_string()));
        }
        if self.aliases.is_empty() {
            return Err(ProxyError::Configuration("no model routes configured".to_string()));
        }
        for (alias, model) in &self.aliases {
            if alias.is_empty() || model.is_empty() {
                return Err(ProxyError::Configuration(format!(
                    "invalid route '{alias}' -> '{model}'"
                )));
            }
        }
        Ok(())
    }

    /// Look up the Vertex model identifier for a client-facing alias.
    pub fn resolve_model(&self, alias: &str) -> Result<&str, ProxyError> {
        self.aliases
            .get(alias)
            .map(String::as_str)
            .ok_or_else(|| ProxyError::UnknownModel {
                alias: alias.to_string(),
                known: self.aliases.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Log full request bodies at debug level.
    pub log_bodies: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_bodies: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub routes: RouteConfig,
    /// Replaces `https://{region}-aiplatform.googleapis.com`.
    pub vertex_base_url: Option<String>,
    pub credentials: CredentialSettings,
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Defaults for everything but the routes.
    pub fn new(routes: RouteConfig) -> Self {
        Self {
            server: ServerConfig::default(),
            routes,
            vertex_base_url: None,
            credentials: CredentialSettings {
                access_token: None,
                service_account_file: Some(PathBuf::from(DEFAULT_SERVICE_ACCOUNT_FILE)),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Load from the discovered config file and the process environment.
    pub fn load() -> Result<Self, ProxyError> {
        let path = std::env::var("PROXY_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(find_config_file);

        let file = match path {
            Some(path) => Some(FileConfig::from_path(&path)?),
            None => None,
        };

        Self::from_sources(file, &|key| std::env::var(key).ok())
    }

    /// Layer `env` over `file` over the defaults and validate the result.
    pub fn from_sources(
        file: Option<FileConfig>,
        vars: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ProxyError> {
        let file = file.unwrap_or_default();
        let env = |key: &str| vars(key).filter(|v| !v.trim().is_empty());

        let mut server = ServerConfig::default();
        if let Some(host) = file.server.host {
            server.host = host;
        }
        if let Some(port) = file.server.port {
            server.port = port;
        }
        if let Some(ms) = file.server.request_timeout_ms {
            server.request_timeout = Duration::from_millis(ms);
        }
        if let Some(buffer) = file.server.stream_buffer {
            server.stream_buffer = buffer;
        }
        if let Some(host) = env("HOST") {
            server.host = host;
        }
        if let Some(port) = env("PORT") {
            server.port = parse_env("PORT", &port)?;
        }
        if let Some(ms) = env("REQUEST_TIMEOUT_MS") {
            server.request_timeout = Duration::from_millis(parse_env("REQUEST_TIMEOUT_MS", &ms)?);
        }
        if let Some(buffer) = env("STREAM_BUFFER") {
            server.stream_buffer = parse_env("STREAM_BUFFER", &buffer)?;
        }
        if server.request_timeout.is_zero() {
            return Err(ProxyError::Configuration(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        if server.stream_buffer == 0 {
            return Err(ProxyError::Configuration(
                "stream buffer must be greater than zero".to_string(),
            ));
        }

        let mut credentials = CredentialSettings {
            access_token: file.credentials.access_token.map(SecretString::from),
            service_account_file: Some(
                file.credentials
                    .service_account_file
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_ACCOUNT_FILE)),
            ),
        };
        if let Some(token) = env("VERTEX_ACCESS_TOKEN") {
            credentials.access_token = Some(SecretString::from(token));
        }
        if let Some(path) =
            env("SERVICE_ACCOUNT_FILE").or_else(|| env("GOOGLE_APPLICATION_CREDENTIALS"))
        {
            credentials.service_account_file = Some(PathBuf::from(path));
        }

        let mut logging = LoggingConfig::default();
        if let Some(level) = file.logging.level {
            logging.level = level;
        }
        logging.json = file.logging.json.unwrap_or(logging.json);
        logging.log_bodies = file.logging.log_bodies.unwrap_or(logging.log_bodies);
        if let Some(level) = env("LOG_LEVEL") {
            logging.level = level;
        }
        if let Some(json) = env("LOG_JSON") {
            logging.json = parse_flag(&json);
        }
        if let Some(bodies) = env("LOG_BODIES") {
            logging.log_bodies = parse_flag(&bodies);
        }

        let vertex_base_url = env("VERTEX_BASE_URL")
            .or(file.vertex.base_url)
            .map(|u| u.trim_end_matches('/').to_string());
        if let Some(base) = &vertex_base_url {
            let parsed = url::Url::parse(base).map_err(|e| {
                ProxyError::Configuration(format!("invalid VERTEX_BASE_URL '{base}': {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ProxyError::Configuration(format!(
                    "VERTEX_BASE_URL must be http(s): {base}"
                )));
            }
        }

        let project_id = env("PROJECT_ID")
            .or(file.vertex.project_id)
            .or_else(|| project_from_key_file(credentials.service_account_file.as_deref()))
            .unwrap_or_default();
        let region = env("LOCATION")
            .or(file.vertex.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let sonnet = env("CLAUDE_MODEL")
            .or(file.vertex.sonnet_model)
            .unwrap_or_else(|| DEFAULT_SONNET_MODEL.to_string());
        let haiku = env("CLAUDE_HAIKU_MODEL")
            .or(file.vertex.haiku_model)
            .unwrap_or_else(|| DEFAULT_HAIKU_MODEL.to_string());

        let mut aliases = default_aliases(&sonnet, &haiku);
        aliases.extend(file.routes);
        if let Some(spec) = env("MODEL_ALIASES") {
            aliases.extend(parse_alias_list(&spec)?);
        }

        Ok(Self {
            server,
            routes: RouteConfig::new(project_id, region, aliases)?,
            vertex_base_url,
            credentials,
            logging,
        })
    }
}

/// On-disk configuration; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    vertex: FileVertex,
    #[serde(default)]
    routes: BTreeMap<String, String>,
    #[serde(default)]
    credentials: FileCredentials,
    #[serde(default)]
    logging: FileLogging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    host: Option<String>,
    port: Option<u16>,
    request_timeout_ms: Option<u64>,
    stream_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileVertex {
    project_id: Option<String>,
    region: Option<String>,
    base_url: Option<String>,
    sonnet_model: Option<String>,
    haiku_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCredentials {
    service_account_file: Option<PathBuf>,
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    json: Option<bool>,
    log_bodies: Option<bool>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ProxyError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ProxyError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            ProxyError::Configuration(msg) => {
                ProxyError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ProxyError> {
        serde_yaml_ng::from_str(content)
            .map_err(|e| ProxyError::Configuration(format!("failed to parse config: {e}")))
    }
}

fn default_aliases(sonnet: &str, haiku: &str) -> BTreeMap<String, String> {
    SONNET_ALIASES
        .iter()
        .map(|a| (a.to_string(), sonnet.to_string()))
        .chain(HAIKU_ALIASES.iter().map(|a| (a.to_string(), haiku.to_string())))
        .collect()
}

/// Parse `alias=model,alias=model`.
fn parse_alias_list(spec: &str) -> Result<Vec<(String, String)>, ProxyError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(a, m)| (a.trim().to_string(), m.trim().to_string()))
                .filter(|(a, m)| !a.is_empty() && !m.is_empty())
                .ok_or_else(|| {
                    ProxyError::Configuration(format!(
                        "invalid MODEL_ALIASES entry '{entry}', expected alias=model"
                    ))
                })
        })
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ProxyError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Configuration(format!("invalid {key}: '{value}'")))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn project_from_key_file(path: Option<&Path>) -> Option<String> {
    let path = path.filter(|p| p.exists())?;
    ServiceAccountKey::from_file(path).ok()?.project_id
}

fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_CANDIDATES.iter().map(PathBuf::from);
    let user = dirs::config_dir()
        .map(|dir| {
            CONFIG_CANDIDATES
                .iter()
                .map(|c| dir.join("claude-vertex-proxy").join(c))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    local.chain(user).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_project_only() {
        let config =
            ProxyConfig::from_sources(None, &env_from(&[("PROJECT_ID", "my-proj")])).unwrap();

        assert_eq!(config.server.port, 3456);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.request_timeout, Duration::from_millis(600_000));
        assert_eq!(config.routes.project_id(), "my-proj");
        assert_eq!(config.routes.region(), "us-east5");
        assert_eq!(
            config.routes.resolve_model("haiku").unwrap(),
            "claude-3-5-haiku@20241022"
        );
        assert_eq!(
            config.routes.resolve_model("claude-3-7-sonnet-20250219").unwrap(),
            "claude-3-7-sonnet@20250219"
        );
    }

    #[test]
    fn test_missing_project_is_fatal() {
        let err = ProxyConfig::from_sources(
            None,
            &env_from(&[("SERVICE_ACCOUNT_FILE", "/nonexistent/key.json")]),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[test]
    fn test_model_overrides_and_extra_aliases() {
        let config = ProxyConfig::from_sources(
            None,
            &env_from(&[
                ("PROJECT_ID", "p"),
                ("CLAUDE_MODEL", "claude-sonnet-4@20250514"),
                ("MODEL_ALIASES", "opus=claude-opus-4@20250514, haiku = claude-3-haiku@20240307"),
            ]),
        )
        .unwrap();

        assert_eq!(config.routes.resolve_model("sonnet").unwrap(), "claude-sonnet-4@20250514");
        assert_eq!(config.routes.resolve_model("opus").unwrap(), "claude-opus-4@20250514");
        assert_eq!(config.routes.resolve_model("haiku").unwrap(), "claude-3-haiku@20240307");
    }

    #[test]
    fn test_malformed_alias_list_is_rejected() {
        let err = ProxyConfig::from_sources(
            None,
            &env_from(&[("PROJECT_ID", "p"), ("MODEL_ALIASES", "opus")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("MODEL_ALIASES"));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        for (key, value) in [("PORT", "http"), ("REQUEST_TIMEOUT_MS", "0"), ("STREAM_BUFFER", "0")] {
            let result = ProxyConfig::from_sources(None, &env_from(&[("PROJECT_ID", "p"), (key, value)]));
            assert!(
                matches!(result, Err(ProxyError::Configuration(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_base_url_must_be_http() {
        let err = ProxyConfig::from_sources(
            None,
            &env_from(&[("PROJECT_ID", "p"), ("VERTEX_BASE_URL", "ftp://example.com")]),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));

        let config = ProxyConfig::from_sources(
            None,
            &env_from(&[("PROJECT_ID", "p"), ("VERTEX_BASE_URL", "http://localhost:9000/")]),
        )
        .unwrap();
        assert_eq!(config.vertex_base_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = FileConfig::from_yaml(
            r#"
vertex:
  project_id: file-project
  region: europe-west1
routes:
  opus: claude-opus-4@20250514
server:
  port: 9000
logging:
  json: true
"#,
        )
        .unwrap();

        let config = ProxyConfig::from_sources(
            Some(file),
            &env_from(&[("LOCATION", "us-central1"), ("LOG_BODIES", "yes")]),
        )
        .unwrap();

        assert_eq!(config.routes.project_id(), "file-project");
        assert_eq!(config.routes.region(), "us-central1");
        assert_eq!(config.server.port, 9000);
        assert!(config.logging.json);
        assert!(config.logging.log_bodies);
        assert_eq!(config.routes.resolve_model("opus").unwrap(), "claude-opus-4@20250514");
    }

    #[test]
    fn test_unknown_file_keys_are_rejected() {
        let err = FileConfig::from_yaml("vertex:\n  projectid: typo\n").unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[test]
    fn test_project_falls_back_to_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("service-account.json");
        fs::write(
            &key,
            r#"{"type":"service_account","project_id":"key-project","client_email":"proxy@key-project.iam.gserviceaccount.com","private_key":"unused"}"#,
        )
        .unwrap();

        let config = ProxyConfig::from_sources(
            None,
            &env_from(&[("SERVICE_ACCOUNT_FILE", key.to_str().unwrap())]),
        )
        .unwrap();

        assert_eq!(config.routes.project_id(), "key-project");
        assert_eq!(config.credentials.service_account_file.as_deref(), Some(key.as_path()));
    }

    #[test]
    fn test_file_config_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claude-vertex-proxy.yml");
        fs::write(
            &path,
            "vertex:\n  project_id: yaml-project\n  haiku_model: claude-3-5-haiku@20241022\nserver:\n  stream_buffer: 8\n",
        )
        .unwrap();

        let file = FileConfig::from_path(&path).unwrap();
        let config = ProxyConfig::from_sources(Some(file), &env_from(&[])).unwrap();
        assert_eq!(config.routes.project_id(), "yaml-project");
        assert_eq!(config.server.stream_buffer, 8);

        let err = FileConfig::from_path(&dir.path().join("missing.yml")).unwrap_err();
        assert!(err.to_string().contains("missing.yml"));
    }

    #[test]
    fn test_route_config_rejects_empty_entries() {
        assert!(RouteConfig::new("p", "r", [("sonnet", "")]).is_err());
        assert!(RouteConfig::new("p", "", [("sonnet", "m")]).is_err());
        assert!(RouteConfig::new("p", "r", Vec::<(String, String)>::new()).is_err());
    }

    #[test]
    fn test_unknown_alias_lists_known_routes() {
        let routes = RouteConfig::new("p", "r", [("haiku", "claude-3-5-haiku@20241022")]).unwrap();
        let err = routes.resolve_model("gpt-4o").unwrap_err();
        match err {
            ProxyError::UnknownModel { alias, known } => {
                assert_eq!(alias, "gpt-4o");
                assert_eq!(known, "haiku");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
