mod common;

use common::MemoryHistory;
use source_monitor::dedup::{classify, fingerprint};
use source_monitor::{DiffMode, Item, Result};
use uuid::Uuid;

fn items(contents: &[&str]) -> Vec<Item> {
    contents.iter().map(|c| Item::new(*c)).collect()
}

fn emitted_contents(classification: &source_monitor::dedup::Classification) -> Vec<&str> {
    classification
        .emitted
        .iter()
        .map(|f| f.item.content.as_str())
        .collect()
}

#[tokio::test]
async fn test_added_skips_known_fingerprints() -> Result<()> {
    common::init_tracing();
    let source_id = Uuid::new_v4();
    let history = MemoryHistory::with(&[fingerprint(&Item::new("1"))]);

    let result = classify(DiffMode::Added, source_id, items(&["1", "2", "3"]), None, &history).await?;

    assert_eq!(emitted_contents(&result), vec!["2", "3"]);
    assert_eq!(result.current_oids.len(), 3);
    assert!(result.snapshot.is_none());
    Ok(())
}

#[tokio::test]
async fn test_added_is_idempotent_once_recorded() -> Result<()> {
    let source_id = Uuid::new_v4();
    let first = classify(
        DiffMode::Added,
        source_id,
        items(&["a", "b"]),
        None,
        &MemoryHistory::default(),
    )
    .await?;
    assert_eq!(first.emitted.len(), 2);

    let recorded = MemoryHistory::with(&first.current_oids);
    let second = classify(DiffMode::Added, source_id, items(&["a", "b"]), None, &recorded).await?;
    assert!(second.emitted.is_empty());
    assert_eq!(second.current_oids, first.current_oids);
    Ok(())
}

#[tokio::test]
async fn test_duplicates_within_a_fetch_collapse() -> Result<()> {
    let result = classify(
        DiffMode::Added,
        Uuid::new_v4(),
        items(&["x", "x", "y"]),
        None,
        &MemoryHistory::default(),
    )
    .await?;
    assert_eq!(emitted_contents(&result), vec!["x", "y"]);
    assert_eq!(result.current_oids.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_last_emits_everything() -> Result<()> {
    let history = MemoryHistory::with(&[fingerprint(&Item::new("1"))]);
    let result = classify(DiffMode::Last, Uuid::new_v4(), items(&["1", "2"]), None, &history).await?;
    assert_eq!(emitted_contents(&result), vec!["1", "2"]);
    assert!(result.snapshot.is_none());
    Ok(())
}

#[tokio::test]
async fn test_deleted_reports_vanished_items() -> Result<()> {
    let source_id = Uuid::new_v4();
    let history = MemoryHistory::default();

    let first = classify(DiffMode::Deleted, source_id, items(&["1", "2", "3"]), None, &history).await?;
    assert!(first.emitted.is_empty());
    assert!(first.snapshot.is_some());

    let second = classify(DiffMode::Deleted, source_id, items(&["1", "3"]), first.snapshot, &history).await?;
    assert_eq!(emitted_contents(&second), vec!["2"]);
    assert_eq!(second.emitted[0].oid, fingerprint(&Item::new("2")));
    Ok(())
}

#[tokio::test]
async fn test_modified_matches_by_title() -> Result<()> {
    let source_id = Uuid::new_v4();
    let history = MemoryHistory::default();
    let before = vec![Item::new("x").with_title("A"), Item::new("y").with_title("B")];
    let after = vec![
        Item::new("x2").with_title("A"),
        Item::new("y").with_title("B"),
        Item::new("z").with_title("C"),
    ];

    let first = classify(DiffMode::Modified, source_id, before, None, &history).await?;
    assert!(first.emitted.is_empty());

    let second = classify(DiffMode::Modified, source_id, after, first.snapshot, &history).await?;
    assert_eq!(emitted_contents(&second), vec!["x2"]);
    assert_eq!(second.emitted[0].item.title.as_deref(), Some("A"));
    Ok(())
}

#[test]
fn test_diff_mode_names() {
    assert_eq!(serde_json::from_str::<DiffMode>(r#""current""#).unwrap(), DiffMode::Last);
    assert_eq!(serde_json::from_str::<DiffMode>(r#""modified""#).unwrap(), DiffMode::Modified);
    assert_eq!(DiffMode::default(), DiffMode::Added);
}
