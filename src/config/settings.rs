//! Application settings management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::StageKind;
use crate::queue::QueueBackend;
use crate::storage::StorageBackend;

/// Headroom left between the end of recognition and the delivery deadline
const MIN_DEADLINE_MARGIN: Duration = Duration::from_millis(500);
const MAX_DEADLINE_MARGIN: Duration = Duration::from_secs(30);

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// General settings
    #[serde(default)]
    pub general: GeneralSettings,

    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Request document storage
    #[serde(default)]
    pub storage: StorageSettings,

    /// Task queue backend and delivery policy
    #[serde(default)]
    pub queue: QueueSettings,

    /// Service name to base URL
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, String>,

    /// Stage name to routing triple
    #[serde(default = "default_stages")]
    pub stages: BTreeMap<String, StageRoute>,

    /// Speech recognition settings
    #[serde(default)]
    pub recognition: RecognitionSettings,

    /// Sensitive-information tagging settings
    #[serde(default)]
    pub tagging: TaggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Data directory for the request database and queue spool
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deployed mode rejects records without a request id
    #[serde(default)]
    pub deployed: bool,

    /// Cloud project hosting the tagging service
    #[serde(default)]
    pub project_id: String,

    /// Cloud region of the tagging service
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port used when neither the CLI nor the stage route names one
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Storage backend (sqlite, memory)
    #[serde(default)]
    pub backend: StorageBackend,

    /// Collection (table) holding request documents
    #[serde(default = "default_collection")]
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue backend (durable, filesystem, null)
    #[serde(default)]
    pub backend: QueueBackend,

    /// Spool directory for the filesystem backend (empty = <data_dir>/spool)
    #[serde(default)]
    pub spool_dir: PathBuf,

    /// How often the deliverer looks for due tasks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tasks leased per delivery round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Time a stage has to answer a delivery
    #[serde(default = "default_dispatch_deadline_secs")]
    pub dispatch_deadline_secs: u64,

    /// Attempts before a task is buried
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Routing triple of a stage: who it is, where it writes, who handles next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRoute {
    /// This stage's service name
    pub svc: String,

    /// Queue the stage enqueues to (none for the terminal stage)
    #[serde(default)]
    pub write_to_q: Option<String>,

    /// Service that handles tasks from `write_to_q`
    #[serde(default)]
    pub next_svc: Option<String>,

    /// Listen port override
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionSettings {
    /// Recognition provider (google)
    #[serde(default = "default_recognition_provider")]
    pub provider: String,

    /// API endpoint (empty = provider default)
    #[serde(default)]
    pub endpoint: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Interval between operation status checks
    #[serde(default = "default_operation_poll_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggingSettings {
    /// Classifier provider (dlp, none)
    #[serde(default = "default_tagging_provider")]
    pub provider: String,

    /// API endpoint (empty = provider default)
    #[serde(default)]
    pub endpoint: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Info types to look for
    #[serde(default = "default_info_types")]
    pub info_types: Vec<String>,

    /// Findings below this likelihood are dropped
    #[serde(default = "default_min_likelihood")]
    pub min_likelihood: String,
}

// Default value functions

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "callscribe", "callscribe")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.local/share/callscribe"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_region() -> String {
    "global".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_collection() -> String {
    "requests".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    16
}

fn default_dispatch_deadline_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    10
}

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_recognition_provider() -> String {
    "google".to_string()
}

fn default_operation_poll_ms() -> u64 {
    2_000
}

fn default_tagging_provider() -> String {
    "dlp".to_string()
}

fn default_info_types() -> Vec<String> {
    [
        "PERSON_NAME",
        "PHONE_NUMBER",
        "EMAIL_ADDRESS",
        "STREET_ADDRESS",
        "CREDIT_CARD_NUMBER",
        "US_SOCIAL_SECURITY_NUMBER",
        "DATE_OF_BIRTH",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_likelihood() -> String {
    "POSSIBLE".to_string()
}

fn default_services() -> BTreeMap<String, String> {
    StageKind::ALL
        .iter()
        .enumerate()
        .map(|(offset, kind)| {
            (
                kind.as_str().to_string(),
                format!("http://127.0.0.1:{}", default_port() + offset as u16),
            )
        })
        .collect()
}

fn default_stages() -> BTreeMap<String, StageRoute> {
    let mut stages = BTreeMap::new();
    for pair in StageKind::ALL.windows(2) {
        let (kind, next) = (pair[0], pair[1]);
        stages.insert(
            kind.as_str().to_string(),
            StageRoute {
                svc: kind.as_str().to_string(),
                write_to_q: Some(format!("{}-queue", next.as_str())),
                next_svc: Some(next.as_str().to_string()),
                port: None,
            },
        );
    }
    stages.insert(
        StageKind::Completion.as_str().to_string(),
        StageRoute {
            svc: StageKind::Completion.as_str().to_string(),
            write_to_q: None,
            next_svc: None,
            port: None,
        },
    );
    stages
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            deployed: false,
            project_id: String::new(),
            region: default_region(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            collection: default_collection(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            spool_dir: PathBuf::new(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            dispatch_deadline_secs: default_dispatch_deadline_secs(),
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl QueueSettings {
    /// Time a stage has to answer one delivered task
    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_secs(self.dispatch_deadline_secs.max(1))
    }
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            provider: default_recognition_provider(),
            endpoint: String::new(),
            api_key: String::new(),
            poll_interval_ms: default_operation_poll_ms(),
        }
    }
}

impl Default for TaggingSettings {
    fn default() -> Self {
        Self {
            provider: default_tagging_provider(),
            endpoint: String::new(),
            api_key: String::new(),
            info_types: default_info_types(),
            min_likelihood: default_min_likelihood(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            general: GeneralSettings::default(),
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            queue: QueueSettings::default(),
            services: default_services(),
            stages: default_stages(),
            recognition: RecognitionSettings::default(),
            tagging: TaggingSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::debug!("No config file found, using defaults");
            let mut settings = Self::default();
            settings.apply_env_overrides();
            return Ok(settings);
        }

        let mut settings = Self::load_from(&config_path)?;
        settings.apply_env_overrides();

        Ok(settings)
    }

    /// Parse a specific configuration file without environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(project) = var("CALLSCRIBE_PROJECT_ID") {
            self.general.project_id = project;
        }
        if let Some(region) = var("CALLSCRIBE_REGION") {
            self.general.region = region;
        }
        if let Some(deployed) = var("CALLSCRIBE_DEPLOYED") {
            self.general.deployed = matches!(deployed.trim(), "1" | "true" | "yes");
        }
        if self.recognition.api_key.trim().is_empty() {
            if let Some(key) = var("CALLSCRIBE_SPEECH_API_KEY") {
                self.recognition.api_key = key;
            }
        }
        if self.tagging.api_key.trim().is_empty() {
            if let Some(key) = var("CALLSCRIBE_DLP_API_KEY") {
                self.tagging.api_key = key;
            }
        }

        for kind in StageKind::ALL {
            let prefix = kind.env_prefix();
            let route = self
                .stages
                .entry(kind.as_str().to_string())
                .or_insert_with(|| StageRoute {
                    svc: kind.as_str().to_string(),
                    write_to_q: None,
                    next_svc: None,
                    port: None,
                });

            if let Some(port) = var(&format!("{}_PORT", prefix)) {
                match port.trim().parse() {
                    Ok(port) => route.port = Some(port),
                    Err(_) => tracing::warn!("Ignoring invalid {}_PORT value: {}", prefix, port),
                }
            }
            if let Some(svc) = var(&format!("{}_SVC", prefix)) {
                route.svc = svc;
            }
            if let Some(queue) = var(&format!("{}_WRITE_TO_Q", prefix)) {
                route.write_to_q = Some(queue);
            }
            if let Some(next) = var(&format!("{}_NEXT_SVC_TO_HANDLE_REQ", prefix)) {
                route.next_svc = Some(next);
            }
        }
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("com", "callscribe", "callscribe")
            .context("Could not determine config directory")?;

        let config_dir = dirs.config_dir();
        Ok(config_dir.join("config.toml"))
    }

    /// Write default configuration to a file
    pub fn write_default(path: &PathBuf) -> Result<()> {
        let settings = Self::default();
        let content = toml::to_string_pretty(&settings)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the request database path
    pub fn database_path(&self) -> PathBuf {
        self.general.data_dir.join("callscribe.db")
    }

    /// Get the durable task queue database path
    pub fn queue_database_path(&self) -> PathBuf {
        self.general.data_dir.join("queue.db")
    }

    /// Get the filesystem queue spool directory
    pub fn spool_dir(&self) -> PathBuf {
        if self.queue.spool_dir.as_os_str().is_empty() {
            self.general.data_dir.join("spool")
        } else {
            self.queue.spool_dir.clone()
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.general.data_dir)?;
        if self.queue.backend == QueueBackend::Filesystem {
            std::fs::create_dir_all(self.spool_dir())?;
        }
        Ok(())
    }

    /// Routing triple for a stage
    pub fn route(&self, kind: StageKind) -> Result<&StageRoute> {
        self.stages
            .get(kind.as_str())
            .with_context(|| format!("No route configured for stage '{}'", kind))
    }

    /// Task handler URL of a service
    pub fn handler_url(&self, service: &str) -> Result<String> {
        let base = self
            .services
            .get(service)
            .with_context(|| format!("No base URL configured for service '{}'", service))?;
        Ok(format!("{}/task_handler", base.trim_end_matches('/')))
    }

    /// Upper bound on one long-running recognition. Always ends before the
    /// delivery deadline so the worker answers before the task is redelivered.
    pub fn recognition_deadline(&self) -> Duration {
        let dispatch = self.queue.dispatch_deadline();
        let margin = (dispatch / 10).clamp(MIN_DEADLINE_MARGIN, MAX_DEADLINE_MARGIN);
        dispatch.saturating_sub(margin)
    }

    /// Port a stage listens on: CLI flag, then route override, then the
    /// port of its service URL, then the server default.
    pub fn stage_port(&self, kind: StageKind, cli_port: Option<u16>) -> u16 {
        if let Some(port) = cli_port {
            return port;
        }
        let route = self.stages.get(kind.as_str());
        if let Some(port) = route.and_then(|r| r.port) {
            return port;
        }
        route
            .and_then(|r| self.services.get(&r.svc))
            .and_then(|url| reqwest::Url::parse(url).ok())
            .and_then(|url| url.port_or_known_default())
            .unwrap_or(self.server.port)
    }
}
