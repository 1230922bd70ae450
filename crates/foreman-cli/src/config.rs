//! Configuration file management for foreman.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub tickets: TicketsSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Root for per-project checkpoint files and sandboxes.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TicketsSection {
    pub api_url: String,
    /// Empty disables the ticket system; blockers then resolve only through
    /// the control API.
    pub api_key: String,
    pub team_id: String,
    /// Hex-encoded shared secret for webhook signature verification.
    pub webhook_secret: String,
}

impl Default for TicketsSection {
    fn default() -> Self {
        Self {
            api_url: "https://api.linear.app/graphql".to_string(),
            api_key: String::new(),
            team_id: String::new(),
            webhook_secret: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Path to the agent binary.
    pub binary: String,
    /// Per-stage turn budget.
    pub max_turns: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            max_turns: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerSection {
    pub max_concurrent_leads: usize,
    pub retry_count: u32,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_concurrent_leads: 4,
            retry_count: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    /// Port for the local control/webhook server.
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: 8787 }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or `~/.config/foreman`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the path to the foreman config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("foreman")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns the defaults if it does not
/// exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random webhook secret: 32 random bytes, hex-encoded.
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub data_dir: PathBuf,
    pub ticket_api_url: String,
    pub ticket_api_key: String,
    pub ticket_team_id: String,
    pub webhook_secret: String,
    pub agent_binary: String,
    pub max_turns: u32,
    pub max_concurrent_leads: usize,
    pub retry_count: u32,
    pub port: u16,
}

impl ForemanConfig {
    /// Whether the ticket system is configured.
    pub fn tickets_enabled(&self) -> bool {
        !self.ticket_api_key.is_empty() && !self.ticket_team_id.is_empty()
    }

    /// Resolve configuration: env var > config file > default.
    pub fn resolve() -> Result<Self> {
        let file = load_config()?;
        Ok(Self {
            data_dir: env_path("FOREMAN_DATA_DIR")
                .or(file.storage.data_dir)
                .unwrap_or_else(default_data_dir),
            ticket_api_url: env_str("FOREMAN_TICKET_API_URL").unwrap_or(file.tickets.api_url),
            ticket_api_key: env_str("FOREMAN_TICKET_API_KEY").unwrap_or(file.tickets.api_key),
            ticket_team_id: env_str("FOREMAN_TICKET_TEAM_ID").unwrap_or(file.tickets.team_id),
            webhook_secret: env_str("FOREMAN_WEBHOOK_SECRET")
                .unwrap_or(file.tickets.webhook_secret),
            agent_binary: env_str("FOREMAN_AGENT_BINARY").unwrap_or(file.agent.binary),
            max_turns: file.agent.max_turns,
            max_concurrent_leads: file.worker.max_concurrent_leads,
            retry_count: file.worker.retry_count,
            port: file.server.port,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_str(key).map(PathBuf::from)
}
