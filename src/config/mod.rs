use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "SHUFFLER_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub player: PlayerConfig,
    pub emulator: EmulatorConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "shuffler-server.test".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub port: u16,
    pub app_key: String,
    pub bearer_token: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            app_key: String::new(),
            bearer_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PlayerConfig {
    pub name: String,
    pub session: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub ipc_port: u16,
    pub rom_dir: String,
    pub save_dir: String,
    pub script_dir: String,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            ipc_port: 55355,
            rom_dir: "roms".to_string(),
            save_dir: "saves".to_string(),
            script_dir: "scripts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    pub snapshot_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "runtime_state.json".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_config) = toml::from_str::<Config>(&raw) {
                config = file_config;
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Base URL of the coordinating server, no trailing slash.
    pub fn server_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.server.scheme, self.server.host, self.server.port
        )
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SERVER_SCHEME", ENV_PREFIX)) {
            self.server.scheme = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var(format!("{}REALTIME_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.realtime.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}APP_KEY", ENV_PREFIX)) {
            self.realtime.app_key = val;
        }
        if let Ok(val) = env::var(format!("{}BEARER_TOKEN", ENV_PREFIX)) {
            self.realtime.bearer_token = val;
        }

        if let Ok(val) = env::var(format!("{}PLAYER_NAME", ENV_PREFIX)) {
            self.player.name = val;
        }
        if let Ok(val) = env::var(format!("{}SESSION_NAME", ENV_PREFIX)) {
            self.player.session = val;
        }

        if let Ok(val) = env::var(format!("{}IPC_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.emulator.ipc_port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}ROM_DIR", ENV_PREFIX)) {
            self.emulator.rom_dir = val;
        }
        if let Ok(val) = env::var(format!("{}SAVE_DIR", ENV_PREFIX)) {
            self.emulator.save_dir = val;
        }
        if let Ok(val) = env::var(format!("{}SCRIPT_DIR", ENV_PREFIX)) {
            self.emulator.script_dir = val;
        }

        if let Ok(val) = env::var(format!("{}SNAPSHOT_PATH", ENV_PREFIX)) {
            self.state.snapshot_path = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.scheme != "http" && self.server.scheme != "https" {
            return Err("server.scheme must be http or https".into());
        }
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.realtime.port == 0 {
            return Err("realtime.port must be non-zero".into());
        }
        if self.emulator.ipc_port == 0 {
            return Err("emulator.ipc_port must be non-zero".into());
        }
        if self.player.name.trim().is_empty() {
            return Err("player.name must be set".into());
        }
        if self.player.session.trim().is_empty() {
            return Err("player.session must be set".into());
        }
        if self.state.snapshot_path.trim().is_empty() {
            return Err("state.snapshot_path must be set".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }
}

pub(crate) fn active_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    PathBuf::from(CONFIG_FILE)
}
