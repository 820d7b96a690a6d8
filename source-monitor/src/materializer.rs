use crate::dedup::Fingerprinted;
use crate::filters::score::SCORE_OPT;
use crate::types::{Entry, EntryStatus, ReadMark, ScoringRule, Source};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

/// Compiled scoring rules of one user, in evaluation order.
pub struct Scorer {
    rules: Vec<(Regex, i64)>,
    auto_read_threshold: Option<i64>,
}

impl Scorer {
    /// Inactive rules are ignored; a rule whose pattern does not compile is
    /// skipped with a warning rather than failing the cycle.
    pub fn new(rules: &[ScoringRule], auto_read_threshold: Option<i64>) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| rule.active)
            .filter_map(|rule| {
                match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
                    Ok(re) => Some((re, rule.score_change)),
                    Err(e) => {
                        warn!("Skipping scoring rule {} with bad pattern: {}", rule.id, e);
                        None
                    }
                }
            })
            .collect();
        Self {
            rules,
            auto_read_threshold,
        }
    }

    pub fn score(&self, default_score: i64, title: Option<&str>, content: &str) -> i64 {
        self.rules.iter().fold(default_score, |score, (re, delta)| {
            let hit = title.is_some_and(|t| re.is_match(t)) || re.is_match(content);
            if hit {
                score + delta
            } else {
                score
            }
        })
    }

    pub fn read_mark_for(&self, score: i64) -> ReadMark {
        match self.auto_read_threshold {
            Some(threshold) if score <= threshold => ReadMark::Read,
            _ => ReadMark::Unread,
        }
    }
}

/// Turn emitted items into entries of `source`, scored and timestamped `now`.
///
/// Adjustments left by `score` filter steps add to the source's default score.
pub fn materialize(source: &Source, emitted: Vec<Fingerprinted>, scorer: &Scorer, now: DateTime<Utc>) -> Vec<Entry> {
    let entries: Vec<Entry> = emitted
        .into_iter()
        .map(|Fingerprinted { oid, mut item }| {
            let filtered = item.opts.remove(SCORE_OPT).and_then(|v| v.as_i64()).unwrap_or(0);
            let base = source.default_score.saturating_add(filtered);
            let score = scorer.score(base, item.title.as_deref(), &item.content);
            Entry {
                id: Uuid::new_v4(),
                source_id: source.id,
                user_id: source.user_id,
                oid,
                title: item.title,
                url: item.url,
                content: item.content,
                opts: item.opts,
                status: EntryStatus::New,
                read_mark: scorer.read_mark_for(score),
                star_mark: false,
                score,
                created_at: now,
                updated_at: now,
            }
        })
        .collect();

    debug!(
        "Materialized {} entries for source {} ({} auto-read)",
        entries.len(),
        source.id,
        entries.iter().filter(|e| e.read_mark.is_read()).count()
    );
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, delta: i64) -> ScoringRule {
        ScoringRule::new(Uuid::nil(), pattern, delta)
    }

    #[test]
    fn test_rules_apply_to_title_or_content() {
        let scorer = Scorer::new(&[rule("rust", 5), rule("ad", -10)], None);
        assert_eq!(scorer.score(0, Some("Rust news"), "body"), 5);
        assert_eq!(scorer.score(0, None, "an AD here"), -10);
        assert_eq!(scorer.score(1, Some("rust"), "ad"), -4);
        assert_eq!(scorer.score(3, None, "nothing"), 3);
    }

    #[test]
    fn test_inactive_and_broken_rules_are_skipped() {
        let mut inactive = rule("x", 100);
        inactive.active = false;
        let scorer = Scorer::new(&[inactive, rule("(", 7), rule("x", 1)], None);
        assert_eq!(scorer.score(0, None, "x"), 1);
    }

    #[test]
    fn test_auto_read_threshold() {
        let scorer = Scorer::new(&[], Some(-5));
        assert_eq!(scorer.read_mark_for(-5), ReadMark::Read);
        assert_eq!(scorer.read_mark_for(-4), ReadMark::Unread);
        assert_eq!(Scorer::new(&[], None).read_mark_for(-100), ReadMark::Unread);
    }
}
