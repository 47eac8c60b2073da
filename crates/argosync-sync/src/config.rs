use std::path::PathBuf;
use std::time::Duration;

use argosync_storage::catalog::CATALOG_FILE_NAME;
use argosync_storage::ledger::LEDGER_FILE_NAME;
use argosync_storage::{HttpClientConfig, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://data-argo.ifremer.fr/dac";
pub const DEFAULT_DAC: &str = "incois";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the remote archive. `http(s)://` URLs are fetched over HTTP,
    /// anything else is read as a local mirror directory.
    pub base_url: String,
    pub dac: String,
    pub contact_email: Option<String>,
    pub raw_root: PathBuf,
    pub out_root: PathBuf,
    pub concurrency: usize,
    pub max_connections: usize,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub retry_budget_secs: u64,
    pub postgres_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            text(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            base_url: text("ARGOSYNC_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            dac: text("ARGOSYNC_DAC").unwrap_or_else(|| DEFAULT_DAC.to_string()),
            contact_email: text("EMAIL"),
            raw_root: text("RAW_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/raw")),
            out_root: text("OUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/processed")),
            concurrency: number("ARGOSYNC_CONCURRENCY", 4).max(1) as usize,
            max_connections: number("ARGOSYNC_MAX_CONNECTIONS", 4).max(1) as usize,
            http_timeout_secs: number("ARGOSYNC_HTTP_TIMEOUT_SECS", 60),
            max_attempts: number("ARGOSYNC_MAX_ATTEMPTS", 4).max(1) as usize,
            retry_budget_secs: number("ARGOSYNC_RETRY_BUDGET_SECS", 300),
            postgres_url: text("POSTGRES_URL"),
        }
    }

    pub fn user_agent(&self) -> String {
        let version = env!("CARGO_PKG_VERSION");
        match &self.contact_email {
            Some(email) => format!("argosync/{version} (+mailto:{email})"),
            None => format!("argosync/{version}"),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent()),
            max_connections: self.max_connections,
        }
    }

    /// Over HTTP the client's own timeout bounds each request, so time spent
    /// queued for a connection slot never counts against an attempt.
    pub fn retry_policy(&self) -> RetryPolicy {
        let timeout = Duration::from_secs(self.http_timeout_secs);
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: (!self.is_http()).then_some(timeout),
            total_budget: Duration::from_secs(self.retry_budget_secs),
            ..Default::default()
        }
    }

    /// Pipelines in flight. Over HTTP this never exceeds the connection cap,
    /// otherwise the surplus tasks would only wait for a slot.
    pub fn fetch_concurrency(&self) -> usize {
        let concurrency = self.concurrency.max(1);
        if self.is_http() {
            concurrency.min(self.max_connections.max(1))
        } else {
            concurrency
        }
    }

    pub fn is_http(&self) -> bool {
        self.base_url.starts_with("http://") || self.base_url.starts_with("https://")
    }

    /// Local directory for a non-HTTP base URL.
    pub fn mirror_root(&self) -> PathBuf {
        PathBuf::from(
            self.base_url
                .strip_prefix("file://")
                .unwrap_or(&self.base_url),
        )
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.out_root.join(LEDGER_FILE_NAME)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.out_root.join(CATALOG_FILE_NAME)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.out_root.join("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_point_at_the_public_incois_tree() {
        let config = SyncConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.dac, "incois");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 4);
        assert!(config.is_http());
        assert!(config.postgres_url.is_none());
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("./data/processed/processed_hash.parquet")
        );
    }

    #[test]
    fn environment_values_override_defaults() {
        let vars = HashMap::from([
            ("ARGOSYNC_BASE_URL", "file:///srv/gdac/dac"),
            ("ARGOSYNC_DAC", "coriolis"),
            ("EMAIL", "ops@example.org"),
            ("OUT_ROOT", "/tmp/argo"),
            ("ARGOSYNC_CONCURRENCY", "0"),
            ("ARGOSYNC_MAX_ATTEMPTS", "not-a-number"),
            ("ARGOSYNC_RETRY_BUDGET_SECS", " 30 "),
            ("POSTGRES_URL", ""),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert!(!config.is_http());
        assert_eq!(config.mirror_root(), PathBuf::from("/srv/gdac/dac"));
        assert_eq!(config.dac, "coriolis");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.retry_policy().total_budget, Duration::from_secs(30));
        assert_eq!(config.catalog_path(), PathBuf::from("/tmp/argo/argo_meta.parquet"));
        assert!(config.postgres_url.is_none());
        assert!(config.user_agent().ends_with("(+mailto:ops@example.org)"));
    }

    #[test]
    fn http_concurrency_is_capped_by_connection_limit() {
        let vars = HashMap::from([
            ("ARGOSYNC_CONCURRENCY", "16"),
            ("ARGOSYNC_MAX_CONNECTIONS", "2"),
            ("ARGOSYNC_HTTP_TIMEOUT_SECS", "45"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert!(config.is_http());
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.fetch_concurrency(), 2);
        assert_eq!(config.http_config().timeout, Duration::from_secs(45));
        assert_eq!(config.retry_policy().attempt_timeout, None);

        let mirror = SyncConfig {
            base_url: "/srv/gdac/dac".to_string(),
            ..config
        };
        assert_eq!(mirror.fetch_concurrency(), 16);
        assert_eq!(
            mirror.retry_policy().attempt_timeout,
            Some(Duration::from_secs(45))
        );
    }
}
