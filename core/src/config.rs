use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything the search core needs, passed in at construction.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SearchConfig {
    pub index: IndexConfig,
    pub query: QueryConfig,
    pub ranking: RankingConfig,
    pub highlight: HighlightConfig,
    pub sync: SyncConfig,
    pub analytics: AnalyticsConfig,
    pub suggest: SuggestConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub path: PathBuf,
    /// Documents per in-memory segment before a new one is started.
    pub segment_max_docs: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("./data/index"), segment_max_docs: 1024 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    /// Maximum query length in bytes.
    pub max_length: usize,
    pub implicit_prefix: bool,
    pub overfetch_factor: usize,
    pub max_candidates: usize,
    pub deadline_ms: u64,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_length: 200,
            implicit_prefix: true,
            overfetch_factor: 3,
            max_candidates: 1000,
            deadline_ms: 2000,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl QueryConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RankingConfig {
    pub k1: f64,
    pub b: f64,
    pub weights: FieldWeights,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75, weights: FieldWeights::default() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FieldWeights {
    pub name: f64,
    pub description: f64,
    pub tags: f64,
    pub category: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self { name: 10.0, description: 5.0, tags: 3.0, category: 2.0 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HighlightConfig {
    pub open: String,
    pub close: String,
    pub ellipsis: String,
    pub name_tokens: usize,
    pub description_tokens: usize,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            open: "<mark>".to_string(),
            close: "</mark>".to_string(),
            ellipsis: "...".to_string(),
            name_tokens: 32,
            description_tokens: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub queue_capacity: usize,
    /// Batch size above which queued events for one product are coalesced.
    pub high_water_mark: usize,
    pub rebuild_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            backoff_base_ms: 50,
            backoff_max_ms: 2000,
            queue_capacity: 1024,
            high_water_mark: 64,
            rebuild_batch_size: 500,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub path: Option<PathBuf>,
    pub retention_days: i64,
    pub popular_window_days: i64,
    pub zero_results_window_days: i64,
    pub click_window_secs: i64,
    pub max_user_agent_len: usize,
    pub max_ip_len: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: 30,
            popular_window_days: 7,
            zero_results_window_days: 30,
            click_window_secs: 1800,
            max_user_agent_len: 256,
            max_ip_len: 45,
        }
    }
}

impl AnalyticsConfig {
    pub fn retention(&self) -> time::Duration {
        time::Duration::days(self.retention_days)
    }

    pub fn popular_window(&self) -> time::Duration {
        time::Duration::days(self.popular_window_days)
    }

    pub fn zero_results_window(&self) -> time::Duration {
        time::Duration::days(self.zero_results_window_days)
    }

    pub fn click_window(&self) -> time::Duration {
        time::Duration::seconds(self.click_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SuggestConfig {
    /// Top products whose names feed the did-you-mean vocabulary.
    pub candidate_pool: usize,
    pub min_confidence: f64,
    pub max_categories: usize,
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self { candidate_pool: 200, min_confidence: 0.7, max_categories: 5 }
    }
}

impl SearchConfig {
    /// Read and validate a TOML config file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SearchConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.overfetch_factor == 0 {
            bail!("query.overfetch_factor must be >= 1");
        }
        if self.query.deadline_ms == 0 {
            bail!("query.deadline_ms must be > 0");
        }
        if self.query.max_length == 0 {
            bail!("query.max_length must be > 0");
        }
        if self.query.max_page_size == 0 || self.query.default_page_size == 0 {
            bail!("query page sizes must be > 0");
        }
        if !(0.0..=1.0).contains(&self.ranking.b) {
            bail!("ranking.b must be in [0.0, 1.0]");
        }
        if self.ranking.k1 < 0.0 {
            bail!("ranking.k1 must be >= 0");
        }
        let w = &self.ranking.weights;
        if [w.name, w.description, w.tags, w.category].iter().any(|v| *v < 0.0) {
            bail!("ranking.weights must be non-negative");
        }
        if self.highlight.open.is_empty() || self.highlight.close.is_empty() {
            bail!("highlight markers must not be empty");
        }
        if self.index.segment_max_docs == 0 {
            bail!("index.segment_max_docs must be > 0");
        }
        if self.sync.retry_attempts == 0 {
            bail!("sync.retry_attempts must be >= 1");
        }
        if self.analytics.retention_days <= 0 {
            bail!("analytics.retention_days must be > 0");
        }
        Ok(())
    }

    /// Where query records live unless configured explicitly.
    pub fn analytics_path(&self) -> PathBuf {
        self.analytics
            .path
            .clone()
            .unwrap_or_else(|| self.index.path.with_file_name("analytics"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: SearchConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.query.overfetch_factor, 3);
        assert_eq!(config.highlight.open, "<mark>");
        assert_eq!(config.sync.retry_attempts, 5);
        assert_eq!(config.analytics.retention_days, 30);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: SearchConfig = toml::from_str(
            r#"
            [query]
            overfetch_factor = 5

            [ranking.weights]
            name = 4.0
            "#,
        )
        .unwrap();
        assert_eq!(config.query.overfetch_factor, 5);
        assert_eq!(config.query.max_length, 200);
        assert_eq!(config.ranking.weights.name, 4.0);
        assert_eq!(config.ranking.weights.description, 5.0);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = SearchConfig::default();
        config.ranking.b = 1.5;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::default();
        config.query.overfetch_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let sync = SyncConfig::default();
        assert_eq!(sync.backoff(1), Duration::from_millis(50));
        assert_eq!(sync.backoff(3), Duration::from_millis(200));
        assert_eq!(sync.backoff(10), Duration::from_millis(2000));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search.toml");
        std::fs::write(&path, "[index]\npath = \"/tmp/idx\"\n").unwrap();
        let config = SearchConfig::load(&path).unwrap();
        assert_eq!(config.index.path, PathBuf::from("/tmp/idx"));
        assert_eq!(config.analytics_path(), PathBuf::from("/tmp/analytics"));
    }
}
