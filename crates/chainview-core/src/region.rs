use crate::config::AggregatorConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

/// Source label used by [`RegionAggregator::merge`] when no producer is known.
pub const ANONYMOUS_SOURCE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    #[error("{producer}/{region} already sent a final record")]
    DuplicateFinality { producer: String, region: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionState {
    pub region: String,
    pub merged_text: String,
    pub has_content: bool,
    pub streaming: bool,
    pub contributors: Vec<String>,
    pub open_sources: BTreeSet<String>,
    pub merges: u64,
    pub duplicates_skipped: u64,
}

impl RegionState {
    fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            merged_text: String::new(),
            has_content: false,
            streaming: false,
            contributors: Vec::new(),
            open_sources: BTreeSet::new(),
            merges: 0,
            duplicates_skipped: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Replaced,
    Appended,
    /// Text was already contained in the buffer; only the streaming flag moved.
    Duplicate,
    /// Empty text; only the streaming flag moved.
    Unchanged,
}

/// One accumulation buffer per region, merged in arrival order.
pub struct RegionAggregator {
    regions: HashMap<String, RegionState>,
    order: Vec<String>,
    finalized: HashSet<(String, String)>,
    reasoning_regions: BTreeSet<String>,
    placeholders: Vec<String>,
}

impl RegionAggregator {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            regions: HashMap::new(),
            order: Vec::new(),
            finalized: HashSet::new(),
            reasoning_regions: config.reasoning_regions.clone(),
            placeholders: config.placeholders.clone(),
        }
    }

    pub fn merge(
        &mut self,
        region: &str,
        text: &str,
        is_final: bool,
    ) -> Result<MergeOutcome, AggregatorError> {
        self.merge_from(region, ANONYMOUS_SOURCE, text, is_final)
    }

    /// Merges one fragment, re-checking containment unless `region` is a
    /// reasoning region.
    pub fn merge_from(
        &mut self,
        region: &str,
        source: &str,
        text: &str,
        is_final: bool,
    ) -> Result<MergeOutcome, AggregatorError> {
        let recheck = !self.reasoning_regions.contains(region);
        self.merge_checked(region, source, text, is_final, recheck)
    }

    /// Merges a fragment whose producer id already passed the exact replay
    /// check, so repeated tokens such as `" the"` are appended.
    pub fn merge_identified(
        &mut self,
        region: &str,
        source: &str,
        text: &str,
        is_final: bool,
    ) -> Result<MergeOutcome, AggregatorError> {
        self.merge_checked(region, source, text, is_final, false)
    }

    fn merge_checked(
        &mut self,
        region: &str,
        source: &str,
        text: &str,
        is_final: bool,
        recheck: bool,
    ) -> Result<MergeOutcome, AggregatorError> {
        let pair = (source.to_string(), region.to_string());
        if self.finalized.contains(&pair) {
            warn!(source = %source, region = %region, "region_duplicate_finality");
            return Err(AggregatorError::DuplicateFinality {
                producer: pair.0,
                region: pair.1,
            });
        }

        let placeholder_text = self.is_placeholder(text);
        let buffer_is_placeholder = self
            .regions
            .get(region)
            .map(|state| self.is_placeholder(&state.merged_text))
            .unwrap_or(true);

        if !self.regions.contains_key(region) {
            self.order.push(region.to_string());
        }
        let state = self
            .regions
            .entry(region.to_string())
            .or_insert_with(|| RegionState::new(region));

        if !state.contributors.iter().any(|known| known == source) {
            state.contributors.push(source.to_string());
        }

        let outcome = if text.is_empty() {
            MergeOutcome::Unchanged
        } else if buffer_is_placeholder {
            state.merged_text = text.to_string();
            state.merges += 1;
            MergeOutcome::Replaced
        } else if recheck && state.merged_text.contains(text) {
            state.duplicates_skipped += 1;
            MergeOutcome::Duplicate
        } else {
            state.merged_text.push_str(text);
            state.merges += 1;
            MergeOutcome::Appended
        };

        if !text.trim().is_empty() && !placeholder_text {
            state.has_content = true;
        }

        if is_final {
            state.open_sources.remove(source);
            state.streaming = !state.open_sources.is_empty();
            self.finalized.insert(pair);
        } else {
            state.open_sources.insert(source.to_string());
            state.streaming = true;
        }

        Ok(outcome)
    }

    pub fn snapshot(&self, region: &str) -> Option<&RegionState> {
        self.regions.get(region)
    }

    /// Every region in first-seen order.
    pub fn snapshots(&self) -> Vec<RegionState> {
        self.order
            .iter()
            .filter_map(|region| self.regions.get(region))
            .cloned()
            .collect()
    }

    pub fn is_finalized(&self, source: &str, region: &str) -> bool {
        self.finalized
            .contains(&(source.to_string(), region.to_string()))
    }

    pub fn content_regions(&self) -> impl Iterator<Item = &RegionState> {
        self.order
            .iter()
            .filter_map(|region| self.regions.get(region))
            .filter(|state| state.has_content)
    }

    /// True when at least one region has content and none of those is still streaming.
    pub fn all_settled(&self) -> bool {
        let mut any = false;
        for state in self.content_regions() {
            if state.streaming {
                return false;
            }
            any = true;
        }
        any
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn reset(&mut self) {
        self.regions.clear();
        self.order.clear();
        self.finalized.clear();
    }

    /// Empty text or an explicit marker. Whitespace alone is real content.
    fn is_placeholder(&self, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }
        let trimmed = text.trim();
        !trimmed.is_empty() && self.placeholders.iter().any(|marker| marker == trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> RegionAggregator {
        RegionAggregator::new(&AggregatorConfig::default())
    }

    #[test]
    fn sql_fragments_concatenate_and_finalize() {
        let mut regions = aggregator();
        assert_eq!(
            regions.merge("sql", "SELECT 1", false),
            Ok(MergeOutcome::Replaced)
        );
        assert_eq!(
            regions.merge("sql", " + 1", true),
            Ok(MergeOutcome::Appended)
        );

        let state = regions.snapshot("sql").expect("sql region");
        assert_eq!(state.merged_text, "SELECT 1 + 1");
        assert!(!state.streaming);
        assert!(state.has_content);
    }

    #[test]
    fn placeholder_buffer_is_replaced_not_appended() {
        let mut regions = aggregator();
        regions.merge("analysis", "Thinking...", false).expect("merge");
        let state = regions.snapshot("analysis").expect("region");
        assert!(!state.has_content);
        assert!(state.streaming);

        assert_eq!(
            regions.merge("analysis", "Revenue rose 4%.", false),
            Ok(MergeOutcome::Replaced)
        );
        assert_eq!(
            regions.snapshot("analysis").expect("region").merged_text,
            "Revenue rose 4%."
        );
    }

    #[test]
    fn fragments_are_appended_without_separators() {
        let mut regions = aggregator();
        regions.merge("analysis", "Hel", false).expect("merge");
        regions.merge("analysis", "lo", false).expect("merge");
        assert_eq!(
            regions.snapshot("analysis").expect("region").merged_text,
            "Hello"
        );
    }

    #[test]
    fn contained_text_in_structured_region_only_touches_streaming() {
        let mut regions = aggregator();
        regions
            .merge("sql", "SELECT id FROM users", false)
            .expect("merge");
        assert_eq!(
            regions.merge("sql", "FROM users", true),
            Ok(MergeOutcome::Duplicate)
        );

        let state = regions.snapshot("sql").expect("region");
        assert_eq!(state.merged_text, "SELECT id FROM users");
        assert!(!state.streaming);
        assert_eq!(state.duplicates_skipped, 1);
    }

    #[test]
    fn replayed_narrative_fragments_are_contained() {
        let mut regions = aggregator();
        for text in ["Revenue", " grew", " 4%"] {
            regions.merge("analysis", text, false).expect("merge");
        }
        for text in ["Revenue", " grew", " 4%"] {
            assert_eq!(
                regions.merge("analysis", text, false),
                Ok(MergeOutcome::Duplicate)
            );
        }
        let state = regions.snapshot("analysis").expect("region");
        assert_eq!(state.merged_text, "Revenue grew 4%");
        assert_eq!(state.duplicates_skipped, 3);
    }

    #[test]
    fn identified_fragments_append_repeated_tokens() {
        let mut regions = aggregator();
        regions
            .merge_identified("analysis", "agent", "ha", false)
            .expect("merge");
        assert_eq!(
            regions.merge_identified("analysis", "agent", "ha", false),
            Ok(MergeOutcome::Appended)
        );
        assert_eq!(
            regions.snapshot("analysis").expect("region").merged_text,
            "haha"
        );
    }

    #[test]
    fn reasoning_regions_skip_containment() {
        let config = AggregatorConfig {
            reasoning_regions: ["thoughts".to_string()].into_iter().collect(),
            ..AggregatorConfig::default()
        };
        let mut regions = RegionAggregator::new(&config);
        regions.merge("thoughts", "step", false).expect("merge");
        assert_eq!(
            regions.merge("thoughts", "step", false),
            Ok(MergeOutcome::Appended)
        );
        assert_eq!(
            regions.snapshot("thoughts").expect("region").merged_text,
            "stepstep"
        );
    }

    #[test]
    fn leading_whitespace_token_is_kept() {
        let mut regions = aggregator();
        assert_eq!(
            regions.merge("analysis", " ", false),
            Ok(MergeOutcome::Replaced)
        );
        assert_eq!(
            regions.merge("analysis", "Hello", false),
            Ok(MergeOutcome::Appended)
        );
        let state = regions.snapshot("analysis").expect("region");
        assert_eq!(state.merged_text, " Hello");
        assert!(state.has_content);
    }

    #[test]
    fn regions_merge_independently() {
        let mut regions = aggregator();
        regions.merge("sql", "SELECT 1", true).expect("merge");
        regions.merge("analysis", "text", false).expect("merge");

        assert!(!regions.snapshot("sql").expect("sql").streaming);
        assert!(regions.snapshot("analysis").expect("analysis").streaming);
        let order = regions
            .snapshots()
            .into_iter()
            .map(|state| state.region)
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["sql".to_string(), "analysis".to_string()]);
    }

    #[test]
    fn streaming_stays_on_until_every_source_is_final() {
        let mut regions = aggregator();
        regions
            .merge_from("data", "loader", "rows: 3", false)
            .expect("merge");
        regions
            .merge_from("data", "profiler", " nulls: 0", false)
            .expect("merge");
        regions.merge_from("data", "loader", "", true).expect("merge");
        assert!(regions.snapshot("data").expect("data").streaming);

        regions
            .merge_from("data", "profiler", "", true)
            .expect("merge");
        let state = regions.snapshot("data").expect("data");
        assert!(!state.streaming);
        assert_eq!(state.contributors, vec!["loader", "profiler"]);
    }

    #[test]
    fn merges_after_finality_are_rejected() {
        let mut regions = aggregator();
        regions
            .merge_from("sql", "writer", "SELECT 1", true)
            .expect("merge");
        let rejected = regions.merge_from("sql", "writer", " LIMIT 5", false);

        assert_eq!(
            rejected,
            Err(AggregatorError::DuplicateFinality {
                producer: "writer".to_string(),
                region: "sql".to_string(),
            })
        );
        let state = regions.snapshot("sql").expect("sql");
        assert_eq!(state.merged_text, "SELECT 1");
        assert!(!state.streaming);
    }

    #[test]
    fn settled_requires_content_and_no_streaming_regions() {
        let mut regions = aggregator();
        assert!(!regions.all_settled());

        regions.merge_from("sql", "a", "SELECT 1", false).expect("merge");
        regions.merge_from("analysis", "b", "...", false).expect("merge");
        assert!(!regions.all_settled());

        regions.merge_from("sql", "a", "", true).expect("merge");
        // The placeholder-only region never had content and does not block.
        assert!(regions.all_settled());
    }

    #[test]
    fn reset_clears_regions_and_finality() {
        let mut regions = aggregator();
        regions.merge_from("sql", "a", "SELECT 1", true).expect("merge");
        regions.reset();

        assert!(regions.is_empty());
        assert!(!regions.is_finalized("a", "sql"));
        assert!(regions.merge_from("sql", "a", "SELECT 2", false).is_ok());
    }
}
