use super::{boxed, parse_params, FilterError, Params};
use crate::dedup::fingerprint;
use crate::traits::{FilterContext, Stateful, StatefulTransform, Transform, TransformOutput};
use crate::types::{Item, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DIFF_DEADLINE: Duration = Duration::from_secs(2);

/// Drop items this source has already produced.
pub struct RemoveVisited;

impl RemoveVisited {
    pub const NAME: &'static str = "remove_visited";

    pub fn build(params: &Params) -> std::result::Result<Arc<dyn Transform>, FilterError> {
        if let Some(key) = params.keys().next() {
            return Err(FilterError::Invalid(format!("unexpected parameter: {}", key)));
        }
        boxed(Self)
    }
}

#[async_trait]
impl Transform for RemoveVisited {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(
        &self,
        items: Vec<Item>,
        _state: Option<serde_json::Value>,
        ctx: &FilterContext<'_>,
    ) -> Result<TransformOutput> {
        let total = items.len();
        let mut fresh = Vec::with_capacity(total);
        for item in items {
            if !ctx.history.seen(ctx.source_id, &fingerprint(&item)).await? {
                fresh.push(item);
            }
        }
        debug!(
            "remove_visited kept {} of {} items for source {}",
            fresh.len(),
            total,
            ctx.source_id
        );
        Ok(TransformOutput::items(fresh))
    }
}

/// Line diff against the content seen on the previous cycle.
///
/// The first cycle emits the content unchanged. Later cycles emit the diff
/// only when enough lines changed.
pub struct NDiff {
    threshold: f64,
    min_changed: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NDiffParams {
    #[serde(default = "default_threshold")]
    threshold: f64,
    #[serde(default = "default_min_changed")]
    min_changed: usize,
}

fn default_threshold() -> f64 {
    0.1
}

fn default_min_changed() -> usize {
    1
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NDiffState {
    #[serde(default)]
    pub content: Option<String>,
}

impl NDiff {
    pub const NAME: &'static str = "ndiff";

    pub fn build(params: &Params) -> std::result::Result<Arc<dyn Transform>, FilterError> {
        let params: NDiffParams = parse_params(params)?;
        if !(0.0..=1.0).contains(&params.threshold) {
            return Err(FilterError::Invalid(format!(
                "threshold must be within 0..1, got {}",
                params.threshold
            )));
        }
        boxed(Stateful::new(Self {
            threshold: params.threshold,
            min_changed: params.min_changed,
        }))
    }

    fn enough_changes(&self, changed: usize, old_lines: usize) -> bool {
        if changed == 0 {
            return false;
        }
        if old_lines == 0 {
            return true;
        }
        if self.threshold > 0.0 && (changed as f64 / old_lines as f64) < self.threshold {
            info!("ndiff: changes below threshold ({}/{} lines)", changed, old_lines);
            return false;
        }
        if changed < self.min_changed {
            info!("ndiff: {} changed lines below minimum {}", changed, self.min_changed);
            return false;
        }
        true
    }
}

#[async_trait]
impl StatefulTransform for NDiff {
    type State = NDiffState;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply_with_state(
        &self,
        items: Vec<Item>,
        state: &mut NDiffState,
        _ctx: &FilterContext<'_>,
    ) -> Result<Vec<Item>> {
        let Some(item) = items.into_iter().next() else {
            return Ok(Vec::new());
        };
        if item.content.is_empty() {
            return Ok(Vec::new());
        }

        let previous = state.content.replace(item.content.clone());
        let Some(previous) = previous.filter(|p| !p.is_empty()) else {
            let mut first = item;
            first.set_opt("preformatted", true);
            first.set_opt("content-type", "plain");
            return Ok(vec![first]);
        };

        let old_lines: Vec<&str> = previous.split('\n').collect();
        let new_lines: Vec<&str> = item.content.split('\n').collect();
        let diff = line_diff(&old_lines, &new_lines);
        let changed = diff.iter().filter(|line| !line.starts_with("  ")).count();

        if !self.enough_changes(changed, old_lines.len()) {
            return Ok(Vec::new());
        }

        let mut out = item.derive(diff.join("\n"));
        out.set_opt("content-type", "preformatted");
        out.set_opt("ndiff_changed_lines", changed);
        out.set_opt("ndiff_old_lines", old_lines.len());
        Ok(vec![out])
    }
}

/// Line diff prefixing each line with `"  "`, `"- "` or `"+ "`.
///
/// Myers in linear space; past the deadline the remaining section degrades to
/// a plain remove/add block.
pub fn line_diff(old: &[&str], new: &[&str]) -> Vec<String> {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_DEADLINE)
        .diff_slices(old, new);

    diff.iter_all_changes()
        .map(|change| {
            let marker = match change.tag() {
                ChangeTag::Equal => "  ",
                ChangeTag::Delete => "- ",
                ChangeTag::Insert => "+ ",
            };
            format!("{}{}", marker, change.value())
        })
        .collect()
}
