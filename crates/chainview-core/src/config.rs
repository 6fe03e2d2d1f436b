use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

pub const DEFAULT_REGION: &str = "general";
pub const DEFAULT_SOURCE: &str = "pipeline";
pub const DEFAULT_DEDUP_CAPACITY: usize = 1_000;
pub const DEFAULT_REASONING_OPEN: &str = "<think>";
pub const DEFAULT_REASONING_CLOSE: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("dedup capacity must be > 0")]
    ZeroDedupCapacity,
    #[error("dedup edge width must be > 0")]
    ZeroEdgeWidth,
    #[error("dedup time bucket must be > 0 ms, got {0}")]
    InvalidTimeBucket(i64),
    #[error("reasoning delimiters must be non-empty and distinct")]
    InvalidDelimiters,
    #[error("default region cannot be empty")]
    EmptyDefaultRegion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub dedup_capacity: usize,
    pub dedup_edge_chars: usize,
    pub dedup_min_len: usize,
    pub dedup_time_bucket_ms: i64,
    pub narrative_regions: BTreeSet<String>,
    /// Regions whose fragments skip the containment re-check on merge.
    pub reasoning_regions: BTreeSet<String>,
    pub known_regions: BTreeSet<String>,
    pub default_region: String,
    pub default_source: String,
    pub placeholders: Vec<String>,
    pub reasoning_open: String,
    pub reasoning_close: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let narrative_regions = ["analysis", "explanation", "process"]
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let known_regions = [
            "analysis",
            "sql",
            "explanation",
            "data",
            "visualization",
            "process",
            DEFAULT_REGION,
        ]
        .into_iter()
        .map(ToString::to_string)
        .collect();
        let placeholders = [
            "...",
            "…",
            "Thinking...",
            "Loading...",
            "Waiting for response...",
        ]
        .into_iter()
        .map(ToString::to_string)
        .collect();

        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_edge_chars: 32,
            dedup_min_len: 8,
            dedup_time_bucket_ms: 2_000,
            narrative_regions,
            reasoning_regions: BTreeSet::new(),
            known_regions,
            default_region: DEFAULT_REGION.to_string(),
            default_source: DEFAULT_SOURCE.to_string(),
            placeholders,
            reasoning_open: DEFAULT_REASONING_OPEN.to_string(),
            reasoning_close: DEFAULT_REASONING_CLOSE.to_string(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_capacity == 0 {
            return Err(ConfigError::ZeroDedupCapacity);
        }
        if self.dedup_edge_chars == 0 {
            return Err(ConfigError::ZeroEdgeWidth);
        }
        if self.dedup_time_bucket_ms <= 0 {
            return Err(ConfigError::InvalidTimeBucket(self.dedup_time_bucket_ms));
        }
        if self.reasoning_open.is_empty()
            || self.reasoning_close.is_empty()
            || self.reasoning_open == self.reasoning_close
        {
            return Err(ConfigError::InvalidDelimiters);
        }
        if self.default_region.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultRegion);
        }
        Ok(())
    }

    pub fn is_narrative_region(&self, region: &str) -> bool {
        self.narrative_regions.contains(region)
    }
}
