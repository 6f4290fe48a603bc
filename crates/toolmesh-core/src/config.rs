//! Configuration types for toolmesh
//!
//! Supports project-level (`toolmesh.json`) and user-level
//! (`~/.config/toolmesh/config.json`) configuration files with merge support.
//! Every duration is written in milliseconds (`...Ms` keys).

use crate::balancer::LoadBalancingPolicy;
use crate::error::MeshError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
///
/// # Example
///
/// ```json
/// {
///   "servers": {
///     "search-a": {
///       "transport": "http",
///       "url": "http://10.0.0.5:8080/mcp",
///       "capabilities": ["web_search"],
///       "tags": ["eu"]
///     },
///     "files": {
///       "transport": "stdio",
///       "command": "npx",
///       "args": ["-y", "@modelcontextprotocol/server-filesystem", "/workspace"],
///       "pool": { "min": 1, "max": 2 }
///     }
///   },
///   "router": { "policy": "least-busy", "maxRetries": 1 },
///   "circuitBreaker": { "cooldownMs": 10000 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    /// Statically registered servers, keyed by server id
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Default pool sizing, overridable per server
    #[serde(default)]
    pub pool: PoolConfig,

    /// Retry budget for opening pool connections
    #[serde(default)]
    pub connect_retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// One backend tool server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Human-readable name, defaults to the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// How to reach the server
    #[serde(flatten)]
    pub address: ServerAddress,

    /// Capabilities declared up front (discovery may add more)
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Per-server pool override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,
}

impl ServerConfig {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            name: None,
            address,
            capabilities: Vec::new(),
            tags: Vec::new(),
            pool: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Server address
///
/// Supports multiple transport types: stdio, HTTP and in-process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServerAddress {
    /// Stdio transport (one child process per pooled connection)
    Stdio {
        /// Command to execute
        command: String,

        /// Command arguments
        #[serde(default)]
        args: Vec<String>,

        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,

        /// Working directory (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },

    /// HTTP transport (JSON-RPC over POST)
    Http {
        /// Server URL
        url: String,

        /// HTTP headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// In-process server registered with a memory connector
    Memory,
}

impl ServerAddress {
    pub fn http(url: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn stdio<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stdio {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Short human-readable form for logs and tables
    pub fn describe(&self) -> String {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => format!("stdio:{command}"),
            Self::Stdio { command, args, .. } => format!("stdio:{command} {}", args.join(" ")),
            Self::Http { url, .. } => url.clone(),
            Self::Memory => "memory".to_string(),
        }
    }
}

/// Connection pool sizing and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly and kept alive
    #[serde(rename = "min")]
    pub min_connections: usize,

    /// Hard cap on live connections
    #[serde(rename = "max")]
    pub max_connections: usize,

    #[serde(rename = "connectTimeoutMs", with = "millis")]
    pub connect_timeout: Duration,

    /// Ready connections idle longer than this are evicted (down to `min`)
    #[serde(rename = "idleTimeoutMs", with = "millis")]
    pub idle_timeout: Duration,

    /// How long `acquire` waits when every connection is busy
    #[serde(rename = "waitTimeoutMs", with = "millis")]
    pub wait_timeout: Duration,

    #[serde(rename = "healthCheckIntervalMs", with = "millis")]
    pub health_check_interval: Duration,

    #[serde(rename = "pingTimeoutMs", with = "millis")]
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            wait_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn sized(min: usize, max: usize) -> Self {
        Self {
            min_connections: min,
            max_connections: max,
            ..Self::default()
        }
    }
}

/// Exponential backoff for opening connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde(rename = "initialBackoffMs", with = "millis")]
    pub initial_backoff: Duration,

    #[serde(rename = "maxBackoffMs", with = "millis")]
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,

    /// Fraction of the backoff randomised either way (0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Most recent outcomes considered
    pub window_size: usize,

    /// Outcomes older than this leave the window
    #[serde(rename = "windowMs", with = "millis")]
    pub window_duration: Duration,

    /// Failure rate above which the circuit opens (0.0 - 1.0)
    pub failure_rate_threshold: f64,

    /// Outcomes required in the window before the rate is trusted
    pub minimum_requests: usize,

    /// First cooldown; doubles on every consecutive re-open
    #[serde(rename = "cooldownMs", with = "millis")]
    pub cooldown: Duration,

    #[serde(rename = "maxCooldownMs", with = "millis")]
    pub max_cooldown: Duration,

    pub backoff_multiplier: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            window_duration: Duration::from_secs(60),
            failure_rate_threshold: 0.5,
            minimum_requests: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

/// Request routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterConfig {
    pub policy: LoadBalancingPolicy,

    /// Extra attempts on other candidates after the first failure
    pub max_retries: u32,

    /// Per-attempt timeout
    #[serde(rename = "requestTimeoutMs", with = "millis")]
    pub request_timeout: Duration,

    /// Global bound for fanout calls
    #[serde(rename = "fanoutTimeoutMs", with = "millis")]
    pub fanout_timeout: Duration,

    /// Fixed seed for the routing random source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: LoadBalancingPolicy::default(),
            max_retries: 2,
            request_timeout: Duration::from_secs(30),
            fanout_timeout: Duration::from_secs(30),
            rng_seed: None,
        }
    }
}

/// Registry metric tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Weight of the newest latency sample in the moving average
    pub ema_alpha: f64,

    /// Consecutive sweeps a discovered server may be missing before removal
    pub missed_sweeps_before_removal: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            missed_sweeps_before_removal: 2,
        }
    }
}

/// Periodic discovery and self-describe probing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(rename = "intervalMs", with = "millis")]
    pub interval: Duration,

    /// Per-server timeout for `tools/list` probes
    #[serde(rename = "describeTimeoutMs", with = "millis")]
    pub describe_timeout: Duration,

    /// JSON file listing discoverable servers, re-read on every sweep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            describe_timeout: Duration::from_secs(5),
            file: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl MeshConfig {
    /// Load configuration from a file
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use toolmesh_core::config::MeshConfig;
    /// let config = MeshConfig::from_file("toolmesh.json")?;
    /// # Ok::<(), toolmesh_core::error::MeshError>(())
    /// ```
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, MeshError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MeshError::Config(format!("Failed to read config file: {e}")))?;

        let mut config: MeshConfig = serde_json::from_str(&content)
            .map_err(|e| MeshError::Config(format!("Failed to parse config file: {e}")))?;

        config.resolve_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load merged configuration (user + project)
    ///
    /// Loads `~/.config/toolmesh/config.json` and merges `./toolmesh.json`
    /// over it. Project-level settings take precedence.
    pub fn load_merged() -> Result<Self, MeshError> {
        let mut config = Self::load_user_config().unwrap_or_default();

        if let Ok(project_config) = Self::load_project_config() {
            config.merge(project_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load user-level config from `~/.config/toolmesh/config.json`
    pub fn load_user_config() -> Result<Self, MeshError> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| MeshError::Config("HOME or USERPROFILE not set".to_string()))?;

        let path = PathBuf::from(home)
            .join(".config")
            .join("toolmesh")
            .join("config.json");

        Self::from_file(path)
    }

    /// Load project-level config from `toolmesh.json`
    pub fn load_project_config() -> Result<Self, MeshError> {
        Self::from_file("toolmesh.json")
    }

    /// Merge another config into this one
    ///
    /// Servers are merged by id; every other section of `other` replaces
    /// this config's section.
    pub fn merge(&mut self, other: MeshConfig) {
        self.servers.extend(other.servers);
        self.pool = other.pool;
        self.connect_retry = other.connect_retry;
        self.circuit_breaker = other.circuit_breaker;
        self.router = other.router;
        self.registry = other.registry;
        self.discovery = other.discovery;
    }

    /// Effective pool configuration for one server
    pub fn pool_for(&self, server_id: &str) -> PoolConfig {
        self.servers
            .get(server_id)
            .and_then(|s| s.pool.clone())
            .unwrap_or_else(|| self.pool.clone())
    }

    /// Reject values the runtime cannot honour
    pub fn validate(&self) -> Result<(), MeshError> {
        validate_pool("pool", &self.pool)?;

        for (id, server) in &self.servers {
            if let Some(pool) = &server.pool {
                validate_pool(&format!("servers.{id}.pool"), pool)?;
            }
            validate_address(id, &server.address)?;
        }

        let breaker = &self.circuit_breaker;
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return Err(MeshError::Config(format!(
                "circuitBreaker.failureRateThreshold must be in (0, 1], got {}",
                breaker.failure_rate_threshold
            )));
        }
        if breaker.window_size == 0 {
            return Err(MeshError::Config(
                "circuitBreaker.windowSize must be greater than 0".to_string(),
            ));
        }

        let alpha = self.registry.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(MeshError::Config(format!(
                "registry.emaAlpha must be in (0, 1], got {alpha}"
            )));
        }

        if self.discovery.interval.is_zero() {
            return Err(MeshError::Config(
                "discovery.intervalMs must be greater than 0".to_string(),
            ));
        }

        if self.connect_retry.max_attempts == 0 {
            return Err(MeshError::Config(
                "connectRetry.maxAttempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve environment variables in configuration
    ///
    /// Supports `${VAR}` and `$VAR` syntax for environment variable expansion.
    pub fn resolve_env_vars(&mut self) -> Result<(), MeshError> {
        for server_config in self.servers.values_mut() {
            match &mut server_config.address {
                ServerAddress::Stdio {
                    command,
                    args,
                    env,
                    cwd,
                } => {
                    *command = resolve_env_string(command)?;

                    for arg in args.iter_mut() {
                        *arg = resolve_env_string(arg)?;
                    }

                    for value in env.values_mut() {
                        *value = resolve_env_string(value)?;
                    }

                    if let Some(path) = cwd {
                        let path_str = path.to_string_lossy().to_string();
                        let resolved = resolve_env_string(&path_str)?;
                        *path = PathBuf::from(resolved);
                    }
                }
                ServerAddress::Http { url, headers } => {
                    *url = resolve_env_string(url)?;

                    for value in headers.values_mut() {
                        *value = resolve_env_string(value)?;
                    }
                }
                ServerAddress::Memory => {}
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), MeshError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), json)
            .map_err(|e| MeshError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }
}

fn validate_pool(section: &str, pool: &PoolConfig) -> Result<(), MeshError> {
    if pool.max_connections == 0 {
        return Err(MeshError::Config(format!(
            "{section}.max must be greater than 0"
        )));
    }
    if pool.min_connections > pool.max_connections {
        return Err(MeshError::Config(format!(
            "{section}.min ({}) exceeds max ({})",
            pool.min_connections, pool.max_connections
        )));
    }
    if pool.health_check_interval.is_zero() {
        return Err(MeshError::Config(format!(
            "{section}.healthCheckIntervalMs must be greater than 0"
        )));
    }
    Ok(())
}

fn validate_address(server_id: &str, address: &ServerAddress) -> Result<(), MeshError> {
    match address {
        ServerAddress::Http { url, .. } => {
            let parsed = url::Url::parse(url).map_err(|e| {
                MeshError::Config(format!("servers.{server_id}.url is invalid: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(MeshError::Config(format!(
                    "servers.{server_id}.url must be http(s), got {}",
                    parsed.scheme()
                )));
            }
            Ok(())
        }
        ServerAddress::Stdio { command, .. } if command.trim().is_empty() => Err(
            MeshError::Config(format!("servers.{server_id}.command is empty")),
        ),
        _ => Ok(()),
    }
}

/// Resolve environment variable references in strings
///
/// Supports `${VAR}` and `$VAR` syntax.
///
/// # Example
///
/// ```
/// # use toolmesh_core::config::resolve_env_string;
/// unsafe { std::env::set_var("TOOLMESH_DOC_VAR", "value") };
/// let result = resolve_env_string("prefix_${TOOLMESH_DOC_VAR}_suffix")?;
/// assert_eq!(result, "prefix_value_suffix");
/// # Ok::<(), toolmesh_core::error::MeshError>(())
/// ```
pub fn resolve_env_string(s: &str) -> Result<String, MeshError> {
    let mut result = s.to_string();

    // Pattern for ${VAR} syntax
    let re_braces = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| MeshError::InvalidPattern(e.to_string()))?;

    for cap in re_braces.captures_iter(s) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| MeshError::EnvVarNotFound(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    // Pattern for $VAR syntax (without braces)
    let re_simple = regex::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)")
        .map_err(|e| MeshError::InvalidPattern(e.to_string()))?;

    for cap in re_simple.captures_iter(&result.clone()) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| MeshError::EnvVarNotFound(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
