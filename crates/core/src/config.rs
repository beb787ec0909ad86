use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub llm: LlmConfig,
    pub scheduling: SchedulingConfig,
    pub whatsapp: WhatsappConfig,
    pub policy: PolicyConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tool_rounds: u32,
}

#[derive(Clone, Debug)]
pub struct SchedulingConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WhatsappConfig {
    pub access_token: SecretString,
    pub phone_number_id: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub rules_path: Option<PathBuf>,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "logging.format must be one of compact|pretty|json, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file not found at {0}")]
    MissingConfigFile(PathBuf),
    #[error("unterminated ${{...}} interpolation in config file")]
    UnterminatedInterpolation,
    #[error("config interpolation references undefined env var {var}")]
    MissingEnvInterpolation { var: String },
    #[error("invalid value for {key}: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Last-wins programmatic overrides, applied after file and env layers.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub scheduling_base_url: Option<String>,
    pub whatsapp_access_token: Option<String>,
    pub whatsapp_phone_number_id: Option<String>,
    pub policy_rules_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

impl AppConfig {
    pub fn default_values() -> Self {
        Self {
            session: SessionConfig {
                database_url: "sqlite://reservo.db?mode=rwc".to_owned(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_owned(),
                model: "gpt-4o-mini".to_owned(),
                timeout_secs: 60,
                max_tool_rounds: 4,
            },
            scheduling: SchedulingConfig {
                base_url: "http://localhost:8090".to_owned(),
                api_key: None,
                timeout_secs: 15,
            },
            whatsapp: WhatsappConfig {
                access_token: secret_value(String::new()),
                phone_number_id: String::new(),
                base_url: "https://graph.facebook.com/v19.0".to_owned(),
                timeout_secs: 15,
            },
            policy: PolicyConfig { rules_path: None, timeout_ms: 2_000 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_owned(),
                health_check_port: 8091,
                queue_capacity: 256,
            },
            logging: LoggingConfig { level: "info".to_owned(), format: LogFormat::Compact },
        }
    }

    /// Layered load: defaults, then the optional TOML file (with `${ENV}`
    /// interpolation), then `RESERVO_*` env vars, then programmatic
    /// overrides, then validation.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default_values();

        if let Some(path) = resolve_config_path(options.config_path.as_deref()) {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("reservo.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(session) = patch.session {
            if let Some(database_url) = session.database_url {
                self.session.database_url = database_url;
            }
            if let Some(max_connections) = session.max_connections {
                self.session.max_connections = max_connections;
            }
            if let Some(timeout_secs) = session.timeout_secs {
                self.session.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_tool_rounds) = llm.max_tool_rounds {
                self.llm.max_tool_rounds = max_tool_rounds;
            }
        }

        if let Some(scheduling) = patch.scheduling {
            if let Some(base_url) = scheduling.base_url {
                self.scheduling.base_url = base_url;
            }
            if let Some(scheduling_api_key_value) = scheduling.api_key {
                self.scheduling.api_key = Some(secret_value(scheduling_api_key_value));
            }
            if let Some(timeout_secs) = scheduling.timeout_secs {
                self.scheduling.timeout_secs = timeout_secs;
            }
        }

        if let Some(whatsapp) = patch.whatsapp {
            if let Some(whatsapp_access_token_value) = whatsapp.access_token {
                self.whatsapp.access_token = secret_value(whatsapp_access_token_value);
            }
            if let Some(phone_number_id) = whatsapp.phone_number_id {
                self.whatsapp.phone_number_id = phone_number_id;
            }
            if let Some(base_url) = whatsapp.base_url {
                self.whatsapp.base_url = base_url;
            }
            if let Some(timeout_secs) = whatsapp.timeout_secs {
                self.whatsapp.timeout_secs = timeout_secs;
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(rules_path) = policy.rules_path {
                self.policy.rules_path = Some(rules_path);
            }
            if let Some(timeout_ms) = policy.timeout_ms {
                self.policy.timeout_ms = timeout_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(queue_capacity) = server.queue_capacity {
                self.server.queue_capacity = queue_capacity;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RESERVO_DATABASE_URL") {
            self.session.database_url = value;
        }
        if let Some(value) = read_env("RESERVO_DATABASE_MAX_CONNECTIONS") {
            self.session.max_connections = parse_u32("RESERVO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RESERVO_DATABASE_TIMEOUT_SECS") {
            self.session.timeout_secs = parse_u64("RESERVO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RESERVO_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("RESERVO_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("RESERVO_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("RESERVO_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("RESERVO_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RESERVO_LLM_MAX_TOOL_ROUNDS") {
            self.llm.max_tool_rounds = parse_u32("RESERVO_LLM_MAX_TOOL_ROUNDS", &value)?;
        }

        if let Some(value) = read_env("RESERVO_SCHEDULING_BASE_URL") {
            self.scheduling.base_url = value;
        }
        if let Some(value) = read_env("RESERVO_SCHEDULING_API_KEY") {
            self.scheduling.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("RESERVO_SCHEDULING_TIMEOUT_SECS") {
            self.scheduling.timeout_secs = parse_u64("RESERVO_SCHEDULING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RESERVO_WHATSAPP_ACCESS_TOKEN") {
            self.whatsapp.access_token = secret_value(value);
        }
        if let Some(value) = read_env("RESERVO_WHATSAPP_PHONE_NUMBER_ID") {
            self.whatsapp.phone_number_id = value;
        }
        if let Some(value) = read_env("RESERVO_WHATSAPP_BASE_URL") {
            self.whatsapp.base_url = value;
        }
        if let Some(value) = read_env("RESERVO_WHATSAPP_TIMEOUT_SECS") {
            self.whatsapp.timeout_secs = parse_u64("RESERVO_WHATSAPP_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RESERVO_POLICY_RULES_PATH") {
            self.policy.rules_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("RESERVO_POLICY_TIMEOUT_MS") {
            self.policy.timeout_ms = parse_u64("RESERVO_POLICY_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("RESERVO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RESERVO_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("RESERVO_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("RESERVO_SERVER_QUEUE_CAPACITY") {
            self.server.queue_capacity =
                parse_u32("RESERVO_SERVER_QUEUE_CAPACITY", &value)? as usize;
        }

        let log_level = read_env("RESERVO_LOGGING_LEVEL").or_else(|| read_env("RESERVO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RESERVO_LOGGING_FORMAT").or_else(|| read_env("RESERVO_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.session.database_url = database_url;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = llm_base_url;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(scheduling_base_url) = overrides.scheduling_base_url {
            self.scheduling.base_url = scheduling_base_url;
        }
        if let Some(whatsapp_access_token) = overrides.whatsapp_access_token {
            self.whatsapp.access_token = secret_value(whatsapp_access_token);
        }
        if let Some(whatsapp_phone_number_id) = overrides.whatsapp_phone_number_id {
            self.whatsapp.phone_number_id = whatsapp_phone_number_id;
        }
        if let Some(policy_rules_path) = overrides.policy_rules_path {
            self.policy.rules_path = Some(policy_rules_path);
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_session(&self.session)?;
        validate_llm(&self.llm)?;
        validate_scheduling(&self.scheduling)?;
        validate_whatsapp(&self.whatsapp)?;
        validate_policy(&self.policy)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("reservo.toml"), PathBuf::from("config/reservo.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    let url = session.database_url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "session.database_url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_owned(),
        ));
    }

    if session.max_connections == 0 {
        return Err(ConfigError::Validation(
            "session.max_connections must be greater than zero".to_owned(),
        ));
    }

    if session.timeout_secs == 0 || session.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "session.timeout_secs must be in range 1..=300".to_owned(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let missing_key =
        llm.api_key.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true);
    if missing_key {
        return Err(ConfigError::Validation("llm.api_key is required".to_owned()));
    }

    if !llm.base_url.starts_with("http://") && !llm.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_owned(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation("llm.timeout_secs must be in range 1..=300".to_owned()));
    }

    if llm.max_tool_rounds == 0 || llm.max_tool_rounds > 8 {
        return Err(ConfigError::Validation(
            "llm.max_tool_rounds must be in range 1..=8".to_owned(),
        ));
    }

    Ok(())
}

fn validate_scheduling(scheduling: &SchedulingConfig) -> Result<(), ConfigError> {
    if !scheduling.base_url.starts_with("http://") && !scheduling.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "scheduling.base_url must start with http:// or https://".to_owned(),
        ));
    }

    if scheduling.timeout_secs == 0 || scheduling.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "scheduling.timeout_secs must be in range 1..=120".to_owned(),
        ));
    }

    Ok(())
}

fn validate_whatsapp(whatsapp: &WhatsappConfig) -> Result<(), ConfigError> {
    if whatsapp.access_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "whatsapp.access_token is required. Get it from the Meta developer dashboard"
                .to_owned(),
        ));
    }

    if whatsapp.phone_number_id.trim().is_empty() {
        return Err(ConfigError::Validation("whatsapp.phone_number_id is required".to_owned()));
    }

    if !whatsapp.base_url.starts_with("http://") && !whatsapp.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "whatsapp.base_url must start with http:// or https://".to_owned(),
        ));
    }

    if whatsapp.timeout_secs == 0 || whatsapp.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "whatsapp.timeout_secs must be in range 1..=120".to_owned(),
        ));
    }

    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<(), ConfigError> {
    if policy.timeout_ms == 0 || policy.timeout_ms > 30_000 {
        return Err(ConfigError::Validation(
            "policy.timeout_ms must be in range 1..=30000".to_owned(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_owned(),
        ));
    }

    if server.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "server.queue_capacity must be greater than zero".to_owned(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_owned(),
        )),
    }
}

fn secret_value(value: String) -> SecretString {
    SecretString::from(value)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    session: Option<SessionPatch>,
    llm: Option<LlmPatch>,
    scheduling: Option<SchedulingPatch>,
    whatsapp: Option<WhatsappPatch>,
    policy: Option<PolicyPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    database_url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_tool_rounds: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulingPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WhatsappPatch {
    access_token: Option<String>,
    phone_number_id: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    rules_path: Option<PathBuf>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
