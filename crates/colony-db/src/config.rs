use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `COLONY_DATABASE_URL` environment variable, falling back to
/// a per-user data directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full sqlite connection URL (e.g. `sqlite:///home/me/.local/share/colony/colony.db`).
    pub database_url: String,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `COLONY_DATABASE_URL` env var, then the per-user default.
    pub fn from_env() -> Self {
        let database_url =
            env::var("COLONY_DATABASE_URL").unwrap_or_else(|_| Self::default_url());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// The default connection URL: a database file under the platform data
    /// directory (`~/.local/share/colony/colony.db` on Linux).
    pub fn default_url() -> String {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colony");
        format!("sqlite://{}", dir.join("colony.db").display())
    }

    /// Extract the filesystem path of the database file from the URL.
    ///
    /// Returns `None` for in-memory databases (`sqlite::memory:`).
    pub fn database_path(&self) -> Option<PathBuf> {
        let rest = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))?;
        if rest.is_empty() || rest.starts_with(":memory:") {
            return None;
        }
        Some(PathBuf::from(rest))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("sqlite:///tmp/colony-test/colony.db");
        assert_eq!(cfg.database_url, "sqlite:///tmp/colony-test/colony.db");
        assert_eq!(
            cfg.database_path(),
            Some(PathBuf::from("/tmp/colony-test/colony.db"))
        );
    }

    #[test]
    fn memory_url_has_no_path() {
        let cfg = DbConfig::new("sqlite::memory:");
        assert_eq!(cfg.database_path(), None);
    }

    #[test]
    fn default_url_points_at_colony_db() {
        let url = DbConfig::default_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("colony.db"));
    }
}
