// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gateway Configuration Types
//
// Defines the configuration schema for an MCP gateway node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Network bind settings
// - Session, coordination and resilience tuning
// - Downstream collaborator endpoints and the tool catalogue
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::failure::ErrorCategory;

pub const API_VERSION: &str = "mcp-gateway/v1";
pub const KIND: &str = "GatewayConfig";

/// Top-level Kubernetes-style gateway configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigManifest {
    /// API version (must be "mcp-gateway/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GatewayConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: GatewayConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Gateway settings (content under `spec:`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfigSpec {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Endpoints of the services that execute approved operations
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    /// Downstream tool catalogue
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Undelivered notifications kept per session; the oldest is dropped on overflow
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            notification_queue_capacity: default_notification_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// How long an approval request stays open
    #[serde(with = "humantime_serde", default = "default_approval_timeout")]
    pub approval_timeout: Duration,

    /// Period of the expiry/purge sweep
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// How long finished operations are kept before being purged
    #[serde(with = "humantime_serde", default = "default_operation_retention")]
    pub operation_retention: Duration,

    /// Lock timeout applied when a lock request does not name one
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub default_lock_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            approval_timeout: default_approval_timeout(),
            sweep_interval: default_sweep_interval(),
            operation_retention: default_operation_retention(),
            default_lock_timeout: default_lock_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Number of recent classified failures kept for inspection
    #[serde(default = "default_error_history_capacity")]
    pub error_history_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            error_history_capacity: default_error_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Symmetric jitter as a fraction of the computed delay (0.25 = ±25%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Per-category attempt limits that replace `max_attempts`
    #[serde(default = "default_category_overrides")]
    pub category_overrides: HashMap<ErrorCategory, u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            category_overrides: default_category_overrides(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(with = "humantime_serde", default = "default_cool_down")]
    pub cool_down: Duration,

    /// Timeout enforced on every call routed through a breaker
    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            cool_down: default_cool_down(),
            call_timeout: default_call_timeout(),
        }
    }
}

/// Base URLs of the operation collaborators. Unset means "not configured".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_orchestrator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_manager: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON schema for the tool arguments
    #[serde(default = "default_input_schema")]
    pub input_schema: serde_json::Value,

    /// URL the gateway POSTs invocations to
    pub endpoint: String,

    /// Circuit breaker key; defaults to the tool name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
}

impl ToolConfig {
    pub fn dependency_key(&self) -> &str {
        self.dependency.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Serve Prometheus text exposition at /metrics/prometheus
    #[serde(default = "default_true")]
    pub prometheus: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            prometheus: true,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_notification_queue_capacity() -> usize {
    256
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_operation_retention() -> Duration {
    Duration::from_secs(3600)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_error_history_capacity() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.25
}

fn default_category_overrides() -> HashMap<ErrorCategory, u32> {
    HashMap::from([(ErrorCategory::RateLimit, 5)])
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down() -> Duration {
    Duration::from_secs(60)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "mcp-gateway".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: GatewayConfigSpec::default(),
        }
    }
}

impl GatewayConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Starter manifest with one downstream tool and every collaborator on localhost.
    pub fn sample() -> Self {
        let mut manifest = Self::default();
        manifest.metadata.name = "mcp-gateway".to_string();
        manifest.spec.collaborators = CollaboratorsConfig {
            update_orchestrator: Some("http://127.0.0.1:9101/updates".to_string()),
            generation_service: Some("http://127.0.0.1:9102/generate".to_string()),
            rollback_manager: Some("http://127.0.0.1:9103/rollbacks".to_string()),
        };
        manifest.spec.tools = vec![ToolConfig {
            name: "git_status".to_string(),
            description: "Show the working tree status of a repository".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "repository": { "type": "string" } },
                "required": ["repository"]
            }),
            endpoint: "http://127.0.0.1:9200/tools".to_string(),
            dependency: Some("git".to_string()),
        }];
        manifest
    }

    /// Discover configuration file using precedence order
    /// 1. MCP_GATEWAY_CONFIG_PATH environment variable
    /// 2. ./gateway-config.yaml (working directory)
    /// 3. ~/.mcp-gateway/config.yaml (user home)
    /// 4. /etc/mcp-gateway/config.yaml (system, Unix) or C:\ProgramData\McpGateway\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MCP_GATEWAY_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./gateway-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mcp-gateway").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/mcp-gateway/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\McpGateway\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!(path = ?path, "Loading configuration from explicit path");
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!(path = ?config_path, "Loading configuration from discovered path");
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MCP_GATEWAY_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!(port, "Environment override: MCP_GATEWAY_PORT");
                    self.spec.network.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for MCP_GATEWAY_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("MCP_GATEWAY_BIND_ADDRESS") {
            if !val.trim().is_empty() {
                tracing::info!(bind_address = %val, "Environment override: MCP_GATEWAY_BIND_ADDRESS");
                self.spec.network.bind_address = val;
            }
        }

        if let Ok(val) = std::env::var("MCP_GATEWAY_CIRCUIT_BREAKER_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: MCP_GATEWAY_CIRCUIT_BREAKER_ENABLED=true");
                    self.spec.resilience.circuit_breaker.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: MCP_GATEWAY_CIRCUIT_BREAKER_ENABLED=false");
                    self.spec.resilience.circuit_breaker.enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for MCP_GATEWAY_CIRCUIT_BREAKER_ENABLED: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.sessions.notification_queue_capacity == 0 {
            anyhow::bail!("spec.sessions.notification_queue_capacity must be at least 1");
        }

        if self.spec.coordination.sweep_interval.is_zero() {
            anyhow::bail!("spec.coordination.sweep_interval must be greater than zero");
        }

        let retry = &self.spec.resilience.retry;
        if retry.max_attempts == 0 {
            anyhow::bail!("spec.resilience.retry.max_attempts must be at least 1");
        }
        if let Some((category, _)) = retry.category_overrides.iter().find(|(_, n)| **n == 0) {
            anyhow::bail!(
                "spec.resilience.retry.category_overrides.{} must be at least 1",
                category
            );
        }
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            anyhow::bail!("spec.resilience.retry.multiplier must be >= 1.0");
        }
        if !(0.0..1.0).contains(&retry.jitter) {
            anyhow::bail!("spec.resilience.retry.jitter must be in [0, 1)");
        }
        if retry.max_delay < retry.base_delay {
            anyhow::bail!("spec.resilience.retry.max_delay cannot be shorter than base_delay");
        }

        if self.spec.resilience.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("spec.resilience.circuit_breaker.failure_threshold must be at least 1");
        }

        let mut names = HashSet::new();
        for tool in &self.spec.tools {
            if tool.name.trim().is_empty() {
                anyhow::bail!("Tool name cannot be empty");
            }
            if tool.name.starts_with("coordination_") {
                anyhow::bail!("Tool name '{}' uses the reserved 'coordination_' prefix", tool.name);
            }
            if !names.insert(tool.name.as_str()) {
                anyhow::bail!("Duplicate tool name: {}", tool.name);
            }
            if tool.endpoint.trim().is_empty() {
                anyhow::bail!("Tool endpoint cannot be empty for: {}", tool.name);
            }
            if !tool.input_schema.is_object() {
                anyhow::bail!("Tool input_schema must be a JSON object for: {}", tool.name);
            }
        }

        Ok(())
    }
}
