//! Configuration types and loading.
//!
//! YAML with a fallback chain (explicit path, `.agentd.yml`, user config
//! dir), then environment-variable overrides on top. Every section has
//! serde defaults so partial configs work.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Context storage and compression
    #[serde(rename = "context-storage")]
    pub context_storage: ContextStorageConfig,

    /// Cross-run summary inheritance
    #[serde(rename = "context-inheritance")]
    pub context_inheritance: InheritanceConfig,

    /// Task database location
    pub database: DatabaseConfig,

    /// GitHub tracker settings
    pub github: TrackerConfig,

    /// GitLab tracker settings
    pub gitlab: TrackerConfig,

    /// Sandboxed execution environment
    pub executor: ExecutorConfig,

    /// Planning loop settings
    pub planning: PlanningConfig,

    /// Pre-planning settings
    #[serde(rename = "pre-planning")]
    pub pre_planning: PrePlanningConfig,

    /// Replanning budgets and thresholds
    pub replanning: ReplanningConfig,

    /// Repository-carried agent rules
    #[serde(rename = "project-rules")]
    pub project_rules: ProjectRulesConfig,

    /// Broker connection settings for a durable queue deployment
    pub broker: BrokerConfig,

    /// Pause/resume control plane
    #[serde(rename = "pause-resume")]
    pub pause_resume: PauseResumeConfig,

    /// Assignee-based stop control plane
    #[serde(rename = "task-stop")]
    pub task_stop: TaskStopConfig,

    /// Logging
    pub logging: LoggingConfig,

    /// Which tracker the producer polls: "github" or "gitlab"
    #[serde(rename = "task-source")]
    pub task_source: String,
}

impl Config {
    /// Load configuration with fallback chain, then apply env overrides.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".agentd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentd").join("agentd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply recognized environment variables over the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Ok(v) = std::env::var("FUNCTION_CALLING") {
            self.llm.function_calling = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            self.llm.openai.base_url = v;
        }
        if let Ok(v) = std::env::var("OPENAI_MODEL") {
            self.llm.openai.model = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OLLAMA_ENDPOINT") {
            self.llm.ollama.base_url = v;
        }
        if let Ok(v) = std::env::var("OLLAMA_MODEL") {
            self.llm.ollama.model = v;
        }
        if let Ok(v) = std::env::var("LMSTUDIO_BASE_URL") {
            self.llm.lmstudio.base_url = v;
        }
        if let Ok(v) = std::env::var("LMSTUDIO_MODEL") {
            self.llm.lmstudio.model = v;
        }
        if let Ok(v) = std::env::var("GITHUB_MCP_COMMAND") {
            self.github.mcp_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(v) = std::env::var("GITHUB_BOT_NAME") {
            self.github.bot_name = Some(v);
        }
        if let Ok(v) = std::env::var("GITLAB_BOT_NAME") {
            self.gitlab.bot_name = Some(v);
        }
        if let Ok(v) = std::env::var("TASK_SOURCE") {
            self.task_source = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LOGS") {
            self.logging.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DEBUG")
            && v.to_lowercase() == "true"
        {
            self.logging.level = "DEBUG".to_string();
        }
        if let Ok(v) = std::env::var("COMMAND_EXECUTOR_ENABLED") {
            self.executor.enabled = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("TEXT_EDITOR_MCP_ENABLED") {
            self.executor.text_editor_mcp_enabled = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("PROJECT_AGENT_RULES_ENABLED") {
            self.project_rules.enabled = v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("PROJECT_AGENT_RULES_MAX_FILE_SIZE")
            && let Ok(size) = v.parse()
        {
            self.project_rules.max_file_size = size;
        }
        if let Ok(v) = std::env::var("PROJECT_AGENT_RULES_MAX_TOTAL_SIZE")
            && let Ok(size) = v.parse()
        {
            self.project_rules.max_total_size = size;
        }
        if let Ok(v) = std::env::var("RABBITMQ_HOST") {
            self.broker.host = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_PORT")
            && let Ok(port) = v.parse()
        {
            self.broker.port = port;
        }
        if let Ok(v) = std::env::var("RABBITMQ_USER") {
            self.broker.user = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_PASSWORD") {
            self.broker.password = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_QUEUE") {
            self.broker.queue = v;
        }
    }

    /// Provider settings for the configured provider name.
    pub fn active_provider(&self) -> &ProviderConfig {
        match self.llm.provider.as_str() {
            "ollama" => &self.llm.ollama,
            "lmstudio" => &self.llm.lmstudio,
            _ => &self.llm.openai,
        }
    }

    /// Tracker section for a task-source name.
    pub fn tracker(&self, source: &str) -> &TrackerConfig {
        if source == "gitlab" { &self.gitlab } else { &self.github }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "openai", "ollama" or "lmstudio"
    pub provider: String,

    /// Expose tool catalogs through function calling
    #[serde(rename = "function-calling")]
    pub function_calling: bool,

    /// Request timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    pub openai: ProviderConfig,
    pub ollama: ProviderConfig,
    pub lmstudio: ProviderConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            function_calling: true,
            timeout_secs: 3600,
            openai: ProviderConfig {
                base_url: "https://api.openai.com".to_string(),
                model: "gpt-4o".to_string(),
                api_key: None,
                context_length: 128_000,
            },
            ollama: ProviderConfig {
                base_url: "http://localhost:11434".to_string(),
                model: "qwen2.5-coder:32b".to_string(),
                api_key: None,
                context_length: 32_768,
            },
            lmstudio: ProviderConfig {
                base_url: "http://localhost:1234".to_string(),
                model: "local-model".to_string(),
                api_key: None,
                context_length: 32_768,
            },
        }
    }
}

/// Per-provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "base-url")]
    pub base_url: String,

    pub model: String,

    /// API key; usually injected via environment
    #[serde(rename = "api-key")]
    pub api_key: Option<String>,

    /// Context window used for compression thresholds
    #[serde(rename = "context-length")]
    pub context_length: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: String::new(),
            api_key: None,
            context_length: 128_000,
        }
    }
}

/// Context storage and compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextStorageConfig {
    /// Root of the running/paused/completed tree
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,

    /// Compress when the window exceeds this share of the context length
    #[serde(rename = "compression-threshold")]
    pub compression_threshold: f64,

    /// Recent messages preserved verbatim through a compression
    #[serde(rename = "keep-recent-messages")]
    pub keep_recent_messages: usize,

    /// Override for the rolling summary prompt ({messages} placeholder)
    #[serde(rename = "summary-prompt")]
    pub summary_prompt: Option<String>,

    /// Override for the final summary prompt ({messages} placeholder)
    #[serde(rename = "final-summary-prompt")]
    pub final_summary_prompt: Option<String>,
}

impl Default for ContextStorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("contexts"),
            compression_threshold: 0.7,
            keep_recent_messages: 5,
            summary_prompt: None,
            final_summary_prompt: None,
        }
    }
}

/// Cross-run summary inheritance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InheritanceConfig {
    pub enabled: bool,

    /// Summaries older than this are not inherited
    #[serde(rename = "context-expiry-days")]
    pub context_expiry_days: i64,

    /// Inherited summary budget, measured in 4-char units
    #[serde(rename = "max-inherited-tokens")]
    pub max_inherited_tokens: usize,
}

impl Default for InheritanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_expiry_days: 90,
            max_inherited_tokens: 8000,
        }
    }
}

/// Task database location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("contexts/tasks.db"),
        }
    }
}

/// Labels and identity for one tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Label that activates processing
    #[serde(rename = "bot-label")]
    pub bot_label: String,

    #[serde(rename = "processing-label")]
    pub processing_label: String,

    #[serde(rename = "done-label")]
    pub done_label: String,

    #[serde(rename = "paused-label")]
    pub paused_label: String,

    #[serde(rename = "stopped-label")]
    pub stopped_label: String,

    /// Bot account whose assignment keeps a task alive
    #[serde(rename = "bot-name")]
    pub bot_name: Option<String>,

    /// Token injected into clone URLs; absent clones unauthenticated
    pub token: Option<String>,

    /// Command spawning the tracker's MCP server
    #[serde(rename = "mcp-command")]
    pub mcp_command: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bot_label: "coding agent".to_string(),
            processing_label: "coding agent processing".to_string(),
            done_label: "coding agent done".to_string(),
            paused_label: "coding agent paused".to_string(),
            stopped_label: "coding agent stopped".to_string(),
            bot_name: None,
            token: None,
            mcp_command: Vec::new(),
        }
    }
}

/// Sandboxed execution environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub enabled: bool,

    /// Environment name to container image tag
    pub environments: BTreeMap<String, String>,

    #[serde(rename = "default-environment")]
    pub default_environment: String,

    /// Fallback image when no environment matches
    #[serde(rename = "base-image")]
    pub base_image: String,

    #[serde(rename = "cpu-limit")]
    pub cpu_limit: String,

    #[serde(rename = "memory-limit")]
    pub memory_limit: String,

    /// Shared docker network joined by every task container
    pub network: Option<String>,

    #[serde(rename = "command-timeout-secs")]
    pub command_timeout_secs: u64,

    /// Per-stream output cap in bytes
    #[serde(rename = "max-output-size")]
    pub max_output_size: usize,

    #[serde(rename = "stale-threshold-hours")]
    pub stale_threshold_hours: i64,

    #[serde(rename = "text-editor-mcp-enabled")]
    pub text_editor_mcp_enabled: bool,

    /// Server command started inside the container via `docker exec -i`
    #[serde(rename = "text-editor-command")]
    pub text_editor_command: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let mut environments = BTreeMap::new();
        environments.insert("python".to_string(), "coding-agent-env/python:latest".to_string());
        environments.insert("node".to_string(), "coding-agent-env/node:latest".to_string());
        environments.insert("miniforge".to_string(), "coding-agent-env/miniforge:latest".to_string());
        environments.insert(
            "python-playwright".to_string(),
            "coding-agent-env/python-playwright:latest".to_string(),
        );

        Self {
            enabled: true,
            environments,
            default_environment: "python".to_string(),
            base_image: "debian:bookworm-slim".to_string(),
            cpu_limit: "2".to_string(),
            memory_limit: "4g".to_string(),
            network: None,
            command_timeout_secs: 1800,
            max_output_size: 1024 * 1024,
            stale_threshold_hours: 24,
            text_editor_mcp_enabled: false,
            text_editor_command: vec!["text-editor-mcp".to_string()],
        }
    }
}

/// Repository-carried agent rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectRulesConfig {
    pub enabled: bool,

    /// Candidate rule files, workspace-relative
    pub files: Vec<String>,

    /// Per-file byte cap
    #[serde(rename = "max-file-size")]
    pub max_file_size: usize,

    /// Total byte cap across files
    #[serde(rename = "max-total-size")]
    pub max_total_size: usize,
}

impl Default for ProjectRulesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            files: vec!["AGENTS.md".to_string(), ".agent/rules.md".to_string()],
            max_file_size: 32 * 1024,
            max_total_size: 64 * 1024,
        }
    }
}

/// Broker connection settings for a durable queue deployment.
///
/// Only consumed by broker-backed implementations of the queue seam; the
/// in-process FIFO ignores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub queue: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            queue: "mcp_tasks".to_string(),
        }
    }
}

/// Planning loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Hard cap on executed actions per run
    #[serde(rename = "max-actions")]
    pub max_actions: usize,

    /// Reflect every N actions (0 disables interval reflection)
    #[serde(rename = "reflection-interval")]
    pub reflection_interval: usize,

    #[serde(rename = "max-revisions")]
    pub max_revisions: u32,

    /// Extra verification rounds allowed to append follow-up actions
    #[serde(rename = "max-verification-rounds")]
    pub max_verification_rounds: u32,

    /// Consecutive failures of one tool that abort to reflection
    #[serde(rename = "max-consecutive-tool-errors")]
    pub max_consecutive_tool_errors: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_actions: 100,
            reflection_interval: 3,
            max_revisions: 3,
            max_verification_rounds: 2,
            max_consecutive_tool_errors: 3,
        }
    }
}

/// Pre-planning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrePlanningConfig {
    pub enabled: bool,

    #[serde(rename = "max-retries-per-tool")]
    pub max_retries_per_tool: u32,

    /// Assumptions below this confidence become information gaps
    #[serde(rename = "confidence-threshold")]
    pub confidence_threshold: f64,
}

impl Default for PrePlanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries_per_tool: 2,
            confidence_threshold: 0.5,
        }
    }
}

/// Replanning budgets and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanningConfig {
    pub enabled: bool,

    /// Decisions below this confidence are not executed
    #[serde(rename = "min-confidence")]
    pub min_confidence: f64,

    /// Decisions below this confidence are overridden outright
    #[serde(rename = "user-confirmation-threshold")]
    pub user_confirmation_threshold: f64,

    #[serde(rename = "max-clarification-requests")]
    pub max_clarification_requests: u32,

    #[serde(rename = "max-redecomposition-attempts")]
    pub max_redecomposition_attempts: u32,

    #[serde(rename = "max-regeneration-attempts")]
    pub max_regeneration_attempts: u32,

    #[serde(rename = "max-action-retries")]
    pub max_action_retries: u32,

    #[serde(rename = "max-partial-replans")]
    pub max_partial_replans: u32,

    #[serde(rename = "max-plan-revisions")]
    pub max_plan_revisions: u32,

    #[serde(rename = "max-total-replans")]
    pub max_total_replans: u32,

    /// Identical (phase, type) triggers tolerated before loop detection
    #[serde(rename = "same-trigger-max-count")]
    pub same_trigger_max_count: u32,
}

impl Default for ReplanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.5,
            user_confirmation_threshold: 0.3,
            max_clarification_requests: 2,
            max_redecomposition_attempts: 3,
            max_regeneration_attempts: 3,
            max_action_retries: 3,
            max_partial_replans: 2,
            max_plan_revisions: 2,
            max_total_replans: 10,
            same_trigger_max_count: 2,
        }
    }
}

/// Pause/resume control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseResumeConfig {
    pub enabled: bool,

    /// Presence of this file pauses consumers
    #[serde(rename = "signal-file")]
    pub signal_file: PathBuf,
}

impl Default for PauseResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signal_file: PathBuf::from("contexts/pause_signal"),
        }
    }
}

/// Assignee-based stop control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStopConfig {
    pub enabled: bool,

    /// Check assignees every N consumer iterations
    #[serde(rename = "check-interval")]
    pub check_interval: u32,

    /// But no more often than this many seconds
    #[serde(rename = "min-check-interval-seconds")]
    pub min_check_interval_seconds: u64,
}

impl Default for TaskStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: 1,
            min_check_interval_seconds: 30,
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "INFO".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.context_storage.compression_threshold, 0.7);
        assert_eq!(config.context_storage.keep_recent_messages, 5);
        assert_eq!(config.context_inheritance.context_expiry_days, 90);
        assert_eq!(config.replanning.max_total_replans, 10);
        assert_eq!(config.task_stop.min_check_interval_seconds, 30);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
llm:
  provider: ollama
  function-calling: false
  ollama:
    base-url: http://ollama:11434
    model: llama3.1:70b
    context-length: 65536

context-storage:
  base-dir: /var/lib/agentd/contexts
  compression-threshold: 0.6
  keep-recent-messages: 8

executor:
  default-environment: node
  command-timeout-secs: 600

task-source: gitlab
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.provider, "ollama");
        assert!(!config.llm.function_calling);
        assert_eq!(config.llm.ollama.model, "llama3.1:70b");
        assert_eq!(config.active_provider().context_length, 65536);
        assert_eq!(config.context_storage.compression_threshold, 0.6);
        assert_eq!(config.context_storage.keep_recent_messages, 8);
        assert_eq!(config.executor.default_environment, "node");
        assert_eq!(config.task_source, "gitlab");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
llm:
  openai:
    model: gpt-4o-mini
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.openai.model, "gpt-4o-mini");
        // Defaults for unspecified
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.planning.reflection_interval, 3);
        assert_eq!(config.replanning.min_confidence, 0.5);
    }

    #[test]
    fn test_active_provider_selection() {
        let mut config = Config::default();
        config.llm.provider = "lmstudio".to_string();
        assert_eq!(config.active_provider().base_url, "http://localhost:1234");

        config.llm.provider = "unknown-provider".to_string();
        // Unknown names fall back to openai
        assert_eq!(config.active_provider().model, "gpt-4o");
    }

    #[test]
    fn test_tracker_selection() {
        let mut config = Config::default();
        config.gitlab.processing_label = "gl processing".to_string();
        assert_eq!(config.tracker("gitlab").processing_label, "gl processing");
        assert_eq!(config.tracker("github").processing_label, "coding agent processing");
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides_win_over_config() {
        unsafe {
            std::env::set_var("LLM_PROVIDER", "ollama");
            std::env::set_var("OLLAMA_MODEL", "llama3.1:8b");
            std::env::set_var("TASK_SOURCE", "gitlab");
            std::env::set_var("GITHUB_MCP_COMMAND", "docker run -i github-mcp");
            std::env::set_var("PROJECT_AGENT_RULES_MAX_FILE_SIZE", "4096");
            std::env::set_var("RABBITMQ_HOST", "mq.internal");
            std::env::set_var("RABBITMQ_PORT", "5673");
        }

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.llm.provider, "ollama");
        assert_eq!(config.llm.ollama.model, "llama3.1:8b");
        assert_eq!(config.task_source, "gitlab");
        assert_eq!(config.github.mcp_command, vec!["docker", "run", "-i", "github-mcp"]);
        assert_eq!(config.project_rules.max_file_size, 4096);
        assert_eq!(config.broker.host, "mq.internal");
        assert_eq!(config.broker.port, 5673);

        unsafe {
            std::env::remove_var("LLM_PROVIDER");
            std::env::remove_var("OLLAMA_MODEL");
            std::env::remove_var("TASK_SOURCE");
            std::env::remove_var("GITHUB_MCP_COMMAND");
            std::env::remove_var("PROJECT_AGENT_RULES_MAX_FILE_SIZE");
            std::env::remove_var("RABBITMQ_HOST");
            std::env::remove_var("RABBITMQ_PORT");
        }
    }
}
