use crate::traits::HistoryLookup;
use crate::types::{DiffMode, Item, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// FilterState name under which the previous cycle's items are kept.
pub const DIFF_SNAPSHOT: &str = "diff-snapshot";

/// Stable content identity of an item: sha256 over title, url and content.
pub fn fingerprint(item: &Item) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.title.as_deref().unwrap_or_default().as_bytes());
    hasher.update(item.url.as_deref().unwrap_or_default().as_bytes());
    hasher.update(item.content.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprinted {
    pub oid: String,
    pub item: Item,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotItem {
    key: String,
    oid: String,
    item: Item,
}

#[derive(Debug, Default)]
pub struct Classification {
    /// Items that become entries this cycle.
    pub emitted: Vec<Fingerprinted>,
    /// Every fingerprint present in the current content.
    pub current_oids: Vec<String>,
    /// Replacement for the `diff-snapshot` filter state, for modes that keep one.
    pub snapshot: Option<serde_json::Value>,
}

/// Decide which of the current items are emitted under `mode`.
///
/// `previous_snapshot` is the stored `diff-snapshot` state, if any. Duplicate
/// items within one fetch collapse to their first occurrence.
pub async fn classify(
    mode: DiffMode,
    source_id: Uuid,
    items: Vec<Item>,
    previous_snapshot: Option<serde_json::Value>,
    history: &dyn HistoryLookup,
) -> Result<Classification> {
    let mut seen = HashSet::new();
    let mut current = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let oid = fingerprint(&item);
        if !seen.insert(oid.clone()) {
            continue;
        }
        current.push(SnapshotItem {
            key: identity_key(&item, idx),
            oid,
            item,
        });
    }

    let current_oids: Vec<String> = current.iter().map(|c| c.oid.clone()).collect();

    let emitted = match mode {
        DiffMode::Added => {
            let mut emitted = Vec::new();
            for candidate in &current {
                if history.seen(source_id, &candidate.oid).await? {
                    continue;
                }
                emitted.push(Fingerprinted {
                    oid: candidate.oid.clone(),
                    item: candidate.item.clone(),
                });
            }
            emitted
        }
        DiffMode::Last => current
            .iter()
            .map(|c| Fingerprinted {
                oid: c.oid.clone(),
                item: c.item.clone(),
            })
            .collect(),
        DiffMode::Deleted => {
            let previous = decode_snapshot(previous_snapshot)?;
            previous
                .into_iter()
                .filter(|p| !seen.contains(&p.oid))
                .map(|p| Fingerprinted {
                    oid: p.oid,
                    item: p.item,
                })
                .collect()
        }
        DiffMode::Modified => {
            let previous: HashMap<String, String> = decode_snapshot(previous_snapshot)?
                .into_iter()
                .map(|p| (p.key, p.oid))
                .collect();
            current
                .iter()
                .filter(|c| previous.get(&c.key).is_some_and(|oid| oid != &c.oid))
                .map(|c| Fingerprinted {
                    oid: c.oid.clone(),
                    item: c.item.clone(),
                })
                .collect()
        }
    };

    let snapshot = match mode {
        DiffMode::Deleted | DiffMode::Modified => Some(serde_json::to_value(&current)?),
        DiffMode::Added | DiffMode::Last => None,
    };

    debug!(
        "Classified {} items for source {} in {} mode: {} emitted",
        current_oids.len(),
        source_id,
        mode,
        emitted.len()
    );

    Ok(Classification {
        emitted,
        current_oids,
        snapshot,
    })
}

// Title, then url, then position.
fn identity_key(item: &Item, idx: usize) -> String {
    if let Some(title) = item.title.as_deref().filter(|t| !t.is_empty()) {
        return format!("title:{}", title);
    }
    if let Some(url) = item.url.as_deref().filter(|u| !u.is_empty()) {
        return format!("url:{}", url);
    }
    format!("#{}", idx)
}

fn decode_snapshot(value: Option<serde_json::Value>) -> Result<Vec<SnapshotItem>> {
    match value {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_of_bare_content() {
        // sha256("1")
        assert_eq!(
            fingerprint(&Item::new("1")),
            "6b86b273ff34fce19d6b804eff5a3f5747ada4eaa22f1d49c01e52ddb7875b4b"
        );
    }

    #[test]
    fn test_fingerprint_covers_title_and_url() {
        let plain = fingerprint(&Item::new("body"));
        let titled = fingerprint(&Item::new("body").with_title("t"));
        let linked = fingerprint(&Item::new("body").with_url("http://x"));
        assert_ne!(plain, titled);
        assert_ne!(plain, linked);
        assert_ne!(titled, linked);
    }

    #[test]
    fn test_identity_key_order() {
        assert_eq!(identity_key(&Item::new("c").with_title("a").with_url("u"), 3), "title:a");
        assert_eq!(identity_key(&Item::new("c").with_url("u"), 3), "url:u");
        assert_eq!(identity_key(&Item::new("c"), 3), "#3");
    }
}
