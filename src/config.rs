use serde::{Deserialize, Serialize};

/// The configuration surface consumed by the external signing service.
///
/// Mirrors the four knobs the signing service is expected to provide; this
/// crate only understands `db_url` as a filesystem path to a SQLite file
/// (optionally prefixed with `sqlite://`), since the engine's Store is a
/// single-writer embedded database rather than a networked one.
/// `db_username`/`db_password` are accepted and stored so the configuration
/// round-trips unmodified, but are unused by the embedded engine; they are
/// reserved for a future networked Store implementation satisfying the same
/// transactional contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub db_url: String,
    #[serde(default)]
    pub db_username: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    pub slashing_protection_enabled: bool,
}

impl Config {
    /// The filesystem path `db_url` refers to, stripping an optional
    /// `sqlite://` scheme prefix.
    pub fn db_path(&self) -> &str {
        self.db_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.db_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "slashing_protection.sqlite".to_string(),
            db_username: None,
            db_password: None,
            slashing_protection_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sqlite_scheme() {
        let config = Config {
            db_url: "sqlite:///var/lib/signer/slashing.sqlite".to_string(),
            ..Config::default()
        };
        assert_eq!(config.db_path(), "/var/lib/signer/slashing.sqlite");
    }

    #[test]
    fn bare_path_is_unchanged() {
        let config = Config {
            db_url: "slashing.sqlite".to_string(),
            ..Config::default()
        };
        assert_eq!(config.db_path(), "slashing.sqlite");
    }
}
