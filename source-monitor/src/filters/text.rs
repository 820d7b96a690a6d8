use super::{boxed, parse_params, FilterError, ItemFilter, Params, Simple};
use crate::traits::Transform;
use crate::types::Item;
use crate::utils::indent_of;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::sync::Arc;

type BuildResult = std::result::Result<Arc<dyn Transform>, FilterError>;

fn at_least_one(field: &str, value: usize) -> std::result::Result<(), FilterError> {
    if value == 0 {
        return Err(FilterError::Invalid(format!("{} must be at least 1", field)));
    }
    Ok(())
}

/// Markup to plain text.
pub struct Html2Text {
    width: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Html2TextParams {
    #[serde(default = "default_html_width")]
    width: usize,
}

fn default_html_width() -> usize {
    1000
}

impl Html2Text {
    pub fn build(params: &Params) -> BuildResult {
        let params: Html2TextParams = parse_params(params)?;
        at_least_one("width", params.width)?;
        boxed(Simple(Self { width: params.width }))
    }
}

impl ItemFilter for Html2Text {
    const NAME: &'static str = "html2text";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        if item.content.is_empty() {
            return Ok(vec![item]);
        }
        let text = html2text::from_read(item.content.as_bytes(), self.width)
            .map_err(|e| FilterError::Failed(format!("cannot render markup: {}", e)))?;
        let mut out = item.derive(text);
        out.set_opt("content-type", "plain");
        Ok(vec![out])
    }
}

/// Trim whitespace around the content.
pub struct Strip;

impl Strip {
    pub fn build(params: &Params) -> BuildResult {
        no_params(params)?;
        boxed(Simple(Self))
    }
}

impl ItemFilter for Strip {
    const NAME: &'static str = "strip";

    fn filter_item(&self, mut item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let trimmed = item.content.trim();
        if trimmed.len() != item.content.len() {
            item.content = trimmed.to_string();
        }
        Ok(vec![item])
    }
}

/// Right-trim every line and drop the empty ones.
pub struct Compact;

impl Compact {
    pub fn build(params: &Params) -> BuildResult {
        no_params(params)?;
        boxed(Simple(Self))
    }
}

impl ItemFilter for Compact {
    const NAME: &'static str = "compact";

    fn filter_item(&self, mut item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        item.content = item
            .content
            .split('\n')
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(vec![item])
    }
}

pub struct Head {
    count: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HeadParams {
    #[serde(default = "default_head_count")]
    count: usize,
}

fn default_head_count() -> usize {
    20
}

impl Head {
    pub fn build(params: &Params) -> BuildResult {
        let params: HeadParams = parse_params(params)?;
        at_least_one("count", params.count)?;
        boxed(Simple(Self { count: params.count }))
    }
}

impl ItemFilter for Head {
    const NAME: &'static str = "head";

    fn filter_item(&self, mut item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        item.content = item
            .content
            .split('\n')
            .take(self.count)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(vec![item])
    }
}

/// Order items by title, then content.
pub struct Sort;

impl Sort {
    pub fn build(params: &Params) -> BuildResult {
        no_params(params)?;
        boxed(Simple(Self))
    }
}

impl ItemFilter for Sort {
    const NAME: &'static str = "sort";

    fn filter(&self, mut items: Vec<Item>) -> std::result::Result<Vec<Item>, FilterError> {
        items.sort_by(|a, b| (&a.title, &a.content).cmp(&(&b.title, &b.content)));
        Ok(items)
    }
}

/// Keep items whose content matches a pattern (or does not, when inverted).
pub struct Grep {
    pattern: Regex,
    invert: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GrepParams {
    pattern: String,
    #[serde(default)]
    invert: bool,
}

impl Grep {
    pub fn build(params: &Params) -> BuildResult {
        let params: GrepParams = parse_params(params)?;
        let pattern = RegexBuilder::new(&params.pattern)
            .case_insensitive(true)
            .multi_line(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| FilterError::Invalid(format!("bad pattern: {}", e)))?;
        boxed(Simple(Self {
            pattern,
            invert: params.invert,
        }))
    }
}

impl ItemFilter for Grep {
    const NAME: &'static str = "grep";

    fn filter(&self, items: Vec<Item>) -> std::result::Result<Vec<Item>, FilterError> {
        Ok(items
            .into_iter()
            .filter(|item| {
                let matched = !item.content.is_empty() && self.pattern.is_match(&item.content);
                matched != self.invert
            })
            .collect())
    }
}

/// Wrap long lines, keeping each line's indent; optionally cap the line count.
pub struct Wrap {
    width: usize,
    max_lines: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WrapParams {
    #[serde(default = "default_wrap_width")]
    width: usize,
    #[serde(default)]
    max_lines: Option<usize>,
}

fn default_wrap_width() -> usize {
    76
}

impl Wrap {
    pub fn build(params: &Params) -> BuildResult {
        let params: WrapParams = parse_params(params)?;
        at_least_one("width", params.width)?;
        if let Some(max_lines) = params.max_lines {
            at_least_one("max_lines", max_lines)?;
        }
        boxed(Simple(Self {
            width: params.width,
            max_lines: params.max_lines,
        }))
    }
}

impl ItemFilter for Wrap {
    const NAME: &'static str = "wrap";

    fn filter_item(&self, mut item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let mut lines: Vec<String> = Vec::new();
        for line in item.content.split('\n') {
            let indent = indent_of(line);
            let body = line.trim_start();
            if body.is_empty() {
                lines.push(String::new());
                continue;
            }
            let options = textwrap::Options::new(self.width)
                .initial_indent(indent)
                .subsequent_indent(indent)
                .break_words(false)
                .word_splitter(textwrap::WordSplitter::NoHyphenation);
            lines.extend(textwrap::wrap(body, options).into_iter().map(|l| l.into_owned()));
        }
        if let Some(max_lines) = self.max_lines {
            lines.truncate(max_lines);
        }
        item.content = lines.join("\n");
        Ok(vec![item])
    }
}

/// One item per separator-delimited part.
pub struct Split {
    separator: String,
    max_split: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SplitParams {
    #[serde(default = "default_split_separator")]
    separator: String,
    #[serde(default)]
    max_split: Option<usize>,
}

fn default_split_separator() -> String {
    "\n".to_string()
}

impl Split {
    pub fn build(params: &Params) -> BuildResult {
        let params: SplitParams = parse_params(params)?;
        if params.separator.is_empty() {
            return Err(FilterError::Invalid("separator is empty".to_string()));
        }
        boxed(Simple(Self {
            separator: params.separator,
            max_split: params.max_split,
        }))
    }
}

impl ItemFilter for Split {
    const NAME: &'static str = "split";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let parts: Vec<&str> = match self.max_split {
            Some(max) => item.content.splitn(max.saturating_add(1), self.separator.as_str()).collect(),
            None => item.content.split(self.separator.as_str()).collect(),
        };
        Ok(parts
            .into_iter()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| item.derive(part))
            .collect())
    }
}

/// Merge all items into the first one.
pub struct Join {
    separator: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JoinParams {
    #[serde(default = "default_join_separator")]
    separator: String,
}

fn default_join_separator() -> String {
    "\n\n".to_string()
}

impl Join {
    pub fn build(params: &Params) -> BuildResult {
        let params: JoinParams = parse_params(params)?;
        boxed(Simple(Self {
            separator: params.separator,
        }))
    }
}

impl ItemFilter for Join {
    const NAME: &'static str = "join";

    fn filter(&self, items: Vec<Item>) -> std::result::Result<Vec<Item>, FilterError> {
        let mut iter = items.into_iter();
        let Some(mut first) = iter.next() else {
            return Ok(Vec::new());
        };
        for item in iter {
            first.content.push_str(&self.separator);
            first.content.push_str(&item.content);
        }
        Ok(vec![first])
    }
}

fn no_params(params: &Params) -> std::result::Result<(), FilterError> {
    match params.keys().next() {
        Some(key) => Err(FilterError::Invalid(format!("unexpected parameter: {}", key))),
        None => Ok(()),
    }
}
