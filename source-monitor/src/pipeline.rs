use crate::filters::FilterRegistry;
use crate::traits::{FilterContext, Transform, TransformOutput};
use crate::types::{FilterSpec, Item, ItemMode, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

struct Step {
    spec: FilterSpec,
    state_key: String,
    transform: Arc<dyn Transform>,
}

/// A source's filter chain, resolved against the registry.
pub struct FilterChain {
    steps: Vec<Step>,
}

/// Items left after the chain plus the state each stateful step wants kept.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub items: Vec<Item>,
    pub states: BTreeMap<String, serde_json::Value>,
}

impl FilterChain {
    /// Resolve every step up front so a bad chain fails before anything runs.
    pub fn build(registry: &FilterRegistry, specs: &[FilterSpec]) -> Result<Self> {
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        let mut steps = Vec::with_capacity(specs.len());
        for spec in specs {
            let transform = registry.build(spec)?;
            let seen = occurrences.entry(spec.name.as_str()).or_insert(0);
            // The first instance of a filter keys its state by name alone
            let state_key = match *seen {
                0 => spec.name.clone(),
                n => format!("{}#{}", spec.name, n),
            };
            *seen += 1;
            steps.push(Step {
                spec: spec.clone(),
                state_key,
                transform,
            });
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain over `items`.
    ///
    /// `prior` holds the states stored on the last successful cycle. On error
    /// nothing is returned, so the caller keeps the prior states untouched.
    pub async fn run(
        &self,
        mut items: Vec<Item>,
        prior: &HashMap<String, serde_json::Value>,
        ctx: &FilterContext<'_>,
    ) -> Result<PipelineOutput> {
        let mut states = BTreeMap::new();
        for step in &self.steps {
            let state = prior.get(&step.state_key).cloned();
            let before = items.len();
            let output = match step.spec.mode {
                ItemMode::Whole => step.transform.apply(items, state, ctx).await?,
                ItemMode::Line => apply_per_line(step.transform.as_ref(), items, state, ctx).await?,
            };
            debug!(
                "Filter {} ({:?}) on source {}: {} -> {} items",
                step.spec.name,
                step.spec.mode,
                ctx.source_id,
                before,
                output.items.len()
            );
            if let Some(state) = output.state {
                states.insert(step.state_key.clone(), state);
            }
            items = output.items;
        }
        Ok(PipelineOutput { items, states })
    }
}

// Each item is split into lines, the lines go through the transform as a
// batch and whatever survives is joined back. Items left empty are dropped.
async fn apply_per_line(
    transform: &dyn Transform,
    items: Vec<Item>,
    mut state: Option<serde_json::Value>,
    ctx: &FilterContext<'_>,
) -> Result<TransformOutput> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let lines: Vec<Item> = item.content.split('\n').map(|line| item.derive(line)).collect();
        let result = transform.apply(lines, state.take(), ctx).await?;
        state = result.state;
        let content = result
            .items
            .iter()
            .map(|line| line.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            continue;
        }
        out.push(item.derive(content));
    }
    Ok(TransformOutput { items: out, state })
}
