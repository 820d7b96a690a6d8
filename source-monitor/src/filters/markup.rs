use super::{boxed, parse_params, FilterError, ItemFilter, Params, Simple};
use crate::traits::Transform;
use crate::types::Item;
use regex::{Captures, Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use sxd_document::dom::{ChildOfElement, Element};
use sxd_xpath::nodeset::Node;
use sxd_xpath::Value;
use tracing::warn;
use url::Url;

type BuildResult = std::result::Result<Arc<dyn Transform>, FilterError>;

fn parse_selector(sel: &str) -> std::result::Result<Selector, FilterError> {
    Selector::parse(sel).map_err(|e| FilterError::Invalid(format!("bad selector {:?}: {}", sel, e)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectorParams {
    sel: String,
}

/// One item per element matching a CSS selector, as outer HTML.
pub struct ByCss {
    selector: Selector,
}

impl ByCss {
    pub fn build(params: &Params) -> BuildResult {
        let params: SelectorParams = parse_params(params)?;
        let selector = parse_selector(&params.sel)?;
        boxed(Simple(Self { selector }))
    }
}

impl ItemFilter for ByCss {
    const NAME: &'static str = "get-elements-by-css";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let document = Html::parse_document(&item.content);
        Ok(document
            .select(&self.selector)
            .map(|element| item.derive(element.html()))
            .collect())
    }
}

/// One item per element carrying the given id.
pub struct ById {
    id: String,
    with_id: Selector,
}

impl ById {
    pub fn build(params: &Params) -> BuildResult {
        let params: SelectorParams = parse_params(params)?;
        if params.sel.trim().is_empty() {
            return Err(FilterError::Invalid("sel is empty".to_string()));
        }
        boxed(Simple(Self {
            id: params.sel.trim().to_string(),
            with_id: parse_selector("[id]")?,
        }))
    }
}

impl ItemFilter for ById {
    const NAME: &'static str = "get-elements-by-id";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let document = Html::parse_document(&item.content);
        Ok(document
            .select(&self.with_id)
            .filter(|element| element.value().id() == Some(self.id.as_str()))
            .map(|element| item.derive(element.html()))
            .collect())
    }
}

/// One item per XPath result; the content must be well-formed XML.
pub struct ByXpath {
    xpath: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct XpathParams {
    xpath: String,
}

impl ByXpath {
    pub fn build(params: &Params) -> BuildResult {
        let params: XpathParams = parse_params(params)?;
        if sxd_xpath::Factory::new().build(&params.xpath).is_err() {
            return Err(FilterError::Invalid(format!("bad xpath: {}", params.xpath)));
        }
        boxed(Simple(Self { xpath: params.xpath }))
    }
}

impl ItemFilter for ByXpath {
    const NAME: &'static str = "get-elements-by-xpath";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let package = sxd_document::parser::parse(&item.content)
            .map_err(|e| FilterError::Failed(format!("content is not XML: {:?}", e)))?;
        let document = package.as_document();
        let value = sxd_xpath::evaluate_xpath(&document, &self.xpath)
            .map_err(|e| FilterError::Failed(format!("xpath evaluation failed: {:?}", e)))?;

        let contents: Vec<String> = match value {
            Value::Nodeset(nodes) => nodes.document_order().into_iter().map(render_node).collect(),
            Value::String(text) => vec![text],
            Value::Number(number) => vec![number.to_string()],
            Value::Boolean(flag) => vec![flag.to_string()],
        };

        Ok(contents
            .into_iter()
            .filter(|content| !content.is_empty())
            .map(|content| item.derive(content))
            .collect())
    }
}

fn render_node(node: Node<'_>) -> String {
    match node {
        Node::Element(element) => {
            let mut out = String::new();
            write_element(element, &mut out);
            out
        }
        other => other.string_value(),
    }
}

fn write_element(element: Element<'_>, out: &mut String) {
    let name = element.name().local_part();
    out.push('<');
    out.push_str(name);
    for attribute in element.attributes() {
        out.push(' ');
        out.push_str(attribute.name().local_part());
        out.push_str("=\"");
        out.push_str(&escape_xml(attribute.value()));
        out.push('"');
    }
    let children = element.children();
    if children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in children {
        match child {
            ChildOfElement::Element(inner) => write_element(inner, out),
            ChildOfElement::Text(text) => out.push_str(&escape_xml(text.text())),
            ChildOfElement::Comment(_) | ChildOfElement::ProcessingInstruction(_) => {}
        }
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// One item per regex match. Named groups `title` and `content` fill those fields.
pub struct ByRegex {
    re: Regex,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RegexParams {
    re: String,
}

impl ByRegex {
    pub fn build(params: &Params) -> BuildResult {
        let params: RegexParams = parse_params(params)?;
        let re = RegexBuilder::new(&params.re)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map_err(|e| FilterError::Invalid(format!("bad expression: {}", e)))?;
        boxed(Simple(Self { re }))
    }
}

impl ItemFilter for ByRegex {
    const NAME: &'static str = "get-elements-by-re";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let named = self.re.capture_names().flatten().next().is_some();
        let mut out = Vec::new();
        for caps in self.re.captures_iter(&item.content) {
            let Some(whole) = caps.get(0) else { continue };
            if !named {
                out.push(item.derive(whole.as_str()));
                continue;
            }
            let content = caps
                .name("content")
                .or_else(|| caps.get(1))
                .map(|m| m.as_str())
                .unwrap_or_else(|| whole.as_str());
            let mut entry = item.derive(content);
            if let Some(title) = caps.name("title").filter(|m| !m.as_str().is_empty()) {
                entry.title = Some(title.as_str().to_string());
            }
            out.push(entry);
        }
        Ok(out)
    }
}

/// Rewrite relative links in markup against the item's url.
pub struct FixUrls {
    link: Regex,
}

impl FixUrls {
    pub fn build(params: &Params) -> BuildResult {
        if let Some(key) = params.keys().next() {
            return Err(FilterError::Invalid(format!("unexpected parameter: {}", key)));
        }
        let link = RegexBuilder::new(r#"(\b(?:href|src|action)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
            .case_insensitive(true)
            .build()
            .map_err(|e| FilterError::Failed(e.to_string()))?;
        boxed(Simple(Self { link }))
    }
}

impl ItemFilter for FixUrls {
    const NAME: &'static str = "fix_urls";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        if item.content.is_empty() {
            return Ok(vec![item]);
        }
        let Some(base) = item.url.as_deref() else {
            return Ok(vec![item]);
        };
        let base = match Url::parse(base) {
            Ok(base) => base,
            Err(e) => {
                warn!("fix_urls: cannot use {:?} as base: {}", base, e);
                return Ok(vec![item]);
            }
        };

        let fixed = self.link.replace_all(&item.content, |caps: &Captures| {
            let (quote, target) = match (caps.get(2), caps.get(3)) {
                (Some(m), _) => ('"', m.as_str()),
                (None, Some(m)) => ('\'', m.as_str()),
                (None, None) => return caps[0].to_string(),
            };
            match base.join(target.trim()) {
                Ok(absolute) => format!("{}{}{}{}", &caps[1], quote, absolute, quote),
                Err(_) => caps[0].to_string(),
            }
        });

        let content = fixed.into_owned();
        Ok(vec![item.derive(content)])
    }
}
