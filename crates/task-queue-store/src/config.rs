use serde::{Deserialize, Serialize};

/// Connection settings for the backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl StoreConfig {
    /// Reads `REDIS_IP`, `REDIS_PORT`, `REDIS_PASSWORD` and `REDIS_DB`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from a variable lookup. Unset, empty or unparsable
    /// values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = StoreConfig::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        StoreConfig {
            host: non_empty("REDIS_IP").unwrap_or(defaults.host),
            port: non_empty("REDIS_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            password: non_empty("REDIS_PASSWORD"),
            db: non_empty("REDIS_DB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db),
        }
    }

    /// Connection URL in `redis://[:password@]host:port/db` form
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}
