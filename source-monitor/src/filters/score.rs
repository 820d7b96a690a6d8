use super::{boxed, parse_params, FilterError, ItemFilter, Params, Simple};
use crate::traits::Transform;
use crate::types::Item;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Item option carrying the score adjustment collected by `score` steps.
pub const SCORE_OPT: &str = "score";

/// Per-source score adjustment for items matching any of a set of patterns.
///
/// With `match_many` every matching pattern adds `score_change`; otherwise a
/// match adds it once. Title and content are both searched.
pub struct Score {
    patterns: Vec<Regex>,
    score_change: i64,
    match_many: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ScoreParams {
    /// `;`-separated expressions
    patterns: String,
    #[serde(default = "default_score_change")]
    score_change: i64,
    #[serde(default = "default_match_many")]
    match_many: bool,
}

fn default_score_change() -> i64 {
    5
}

fn default_match_many() -> bool {
    true
}

impl Score {
    pub fn build(params: &Params) -> std::result::Result<Arc<dyn Transform>, FilterError> {
        let params: ScoreParams = parse_params(params)?;
        let patterns = params
            .patterns
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .multi_line(true)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|e| FilterError::Invalid(format!("bad pattern {:?}: {}", p, e)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err(FilterError::Invalid("patterns is empty".to_string()));
        }
        boxed(Simple(Self {
            patterns,
            score_change: params.score_change,
            match_many: params.match_many,
        }))
    }

    fn adjustment(&self, item: &Item) -> i64 {
        let hits = |re: &Regex| item.title.as_deref().is_some_and(|t| re.is_match(t)) || re.is_match(&item.content);
        if self.match_many {
            let matched = self.patterns.iter().filter(|&re| hits(re)).count() as i64;
            matched.saturating_mul(self.score_change)
        } else if self.patterns.iter().any(hits) {
            self.score_change
        } else {
            0
        }
    }
}

impl ItemFilter for Score {
    const NAME: &'static str = "score";

    fn filter_item(&self, mut item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let add = self.adjustment(&item);
        if add != 0 {
            let current = item.opts.get(SCORE_OPT).and_then(|v| v.as_i64()).unwrap_or(0);
            debug!("score: {:+} for item {:?}", add, item.title);
            item.set_opt(SCORE_OPT, current.saturating_add(add));
        }
        Ok(vec![item])
    }
}
