//! Driver configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::ServerConfig;
use crate::error::{Error, Result};

/// Environment variable consulted for the server password.
pub const PASSWORD_ENV: &str = "DOCSQL_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Mysql,
    Postgres,
}

impl Backend {
    pub fn default_port(&self) -> u16 {
        match self {
            Backend::Sqlite => 0,
            Backend::Mysql => 3306,
            Backend::Postgres => 5432,
        }
    }

    /// Database selected when the configuration names none.
    pub fn default_database(&self) -> &'static str {
        match self {
            Backend::Sqlite => "main",
            Backend::Mysql => "docsql",
            Backend::Postgres => "public",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    /// Idle connections older than this are closed.
    pub idle_timeout_secs: u64,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout_secs: u64,
    /// Verify a connection before handing it out.
    pub ping: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            idle_timeout_secs: 300,
            acquire_timeout_secs: 30,
            ping: true,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    /// File of the `main` database; in-memory when unset.
    pub path: Option<PathBuf>,
    /// Directory holding one file per attached database.
    pub attach_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub backend: Backend,
    /// Database selected at startup.
    pub database: Option<String>,
    /// Attach SQL text and parameters to execution errors.
    pub debug: bool,
    pub pool: PoolSettings,
    pub sqlite: SqliteSettings,
    pub server: ServerConfig,
}

impl DriverConfig {
    /// In-memory SQLite, mostly for tests.
    pub fn sqlite_memory() -> Self {
        Self::default()
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docsql")
            .join("config.toml")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read a config file. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };
        if !path.exists() {
            if explicit {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("failed to create {}: {}", parent.display(), e)))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    pub fn database(&self) -> &str {
        self.database
            .as_deref()
            .unwrap_or_else(|| self.backend.default_database())
    }

    pub fn port(&self) -> u16 {
        if self.server.port == 0 {
            self.backend.default_port()
        } else {
            self.server.port
        }
    }

    /// Fill in the server password from `DOCSQL_PASSWORD`, or prompt for it
    /// when `interactive` is set. SQLite needs none.
    pub fn resolve_password(&mut self, interactive: bool) -> Result<()> {
        if self.backend == Backend::Sqlite || !self.server.password.is_empty() {
            return Ok(());
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.server.password = password;
            return Ok(());
        }
        if interactive {
            let prompt = format!("Password for {}: ", self.server.display_string(self.database()));
            self.server.password = rpassword::read_password_from_tty(Some(&prompt))
                .map_err(|e| Error::Config(format!("failed to read password: {}", e)))?;
        }
        Ok(())
    }
}
