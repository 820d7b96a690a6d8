use super::{boxed, parse_params, FilterError, ItemFilter, Params, Simple};
use crate::traits::Transform;
use crate::types::Item;
use serde::Deserialize;
use std::sync::Arc;

/// Decompose delimited text into one item per record.
///
/// Columns picked as title or url move into those fields; the remaining
/// fields become the content, one per line (`header: value` when the input
/// carries a header row).
pub struct SplitCsv {
    delimiter: u8,
    has_headers: bool,
    title_column: Option<usize>,
    url_column: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SplitCsvParams {
    #[serde(default = "default_delimiter")]
    delimiter: String,
    #[serde(default)]
    has_headers: bool,
    #[serde(default)]
    title_column: Option<usize>,
    #[serde(default)]
    url_column: Option<usize>,
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl SplitCsv {
    pub fn build(params: &Params) -> std::result::Result<Arc<dyn Transform>, FilterError> {
        let params: SplitCsvParams = parse_params(params)?;
        let delimiter = match params.delimiter.as_bytes() {
            [byte] => *byte,
            _ if params.delimiter == "\\t" => b'\t',
            _ => {
                return Err(FilterError::Invalid(format!(
                    "delimiter must be a single byte, got {:?}",
                    params.delimiter
                )))
            }
        };
        boxed(Simple(Self {
            delimiter,
            has_headers: params.has_headers,
            title_column: params.title_column,
            url_column: params.url_column,
        }))
    }
}

impl ItemFilter for SplitCsv {
    const NAME: &'static str = "split-csv";

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.has_headers)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(item.content.as_bytes());

        let headers: Option<Vec<String>> = if self.has_headers {
            let record = reader
                .headers()
                .map_err(|e| FilterError::Failed(format!("cannot read header row: {}", e)))?;
            Some(record.iter().map(str::to_string).collect())
        } else {
            None
        };

        let mut out = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| FilterError::Failed(format!("malformed record: {}", e)))?;
            let mut entry = item.derive(String::new());
            let mut lines = Vec::new();

            for (idx, field) in record.iter().enumerate() {
                if Some(idx) == self.title_column {
                    if !field.is_empty() {
                        entry.title = Some(field.to_string());
                    }
                    continue;
                }
                if Some(idx) == self.url_column {
                    if !field.is_empty() {
                        entry.url = Some(field.to_string());
                    }
                    continue;
                }
                match headers.as_ref().and_then(|h| h.get(idx)) {
                    Some(name) => lines.push(format!("{}: {}", name, field)),
                    None => lines.push(field.to_string()),
                }
            }

            entry.content = lines.join("\n");
            if entry.content.is_empty() && entry.title.is_none() && entry.url.is_none() {
                continue;
            }
            out.push(entry);
        }
        Ok(out)
    }
}
