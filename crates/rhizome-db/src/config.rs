//! Database configuration.

/// Environment variable toggling the query cache (`0` or `false` disables).
pub const QUERY_CACHE_ENV: &str = "RHIZOMEDB_QUERY_CACHE";

/// Environment variable overriding the cache capacity.
pub const CACHE_CAPACITY_ENV: &str = "RHIZOMEDB_CACHE_CAPACITY";

/// Settings carried by every snapshot derived from a root `Db`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DbConfig {
    /// Whether query results are memoized per snapshot.
    pub query_cache: bool,
    /// Maximum number of cached results per snapshot.
    pub cache_capacity: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            query_cache: true,
            cache_capacity: 4096,
        }
    }
}

impl DbConfig {
    /// Defaults overridden by the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let query_cache = lookup(QUERY_CACHE_ENV)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(defaults.query_cache);
        let cache_capacity = lookup(CACHE_CAPACITY_ENV)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.cache_capacity);
        Self {
            query_cache,
            cache_capacity,
        }
    }

    #[must_use]
    pub const fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache = enabled;
        self
    }

    #[must_use]
    pub const fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}
