use crate::domain::model::{Cell, DispatchFailure, TableGroup, TabularSource};
use crate::domain::ports::Storage;
use crate::utils::error::{DispatchError, Result};
use crate::utils::validation::validate_file_extensions;
use serde::Deserialize;
use std::path::Path;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["csv", "tsv", "json"];

/// Workbook exported as JSON: `{"sheets": [{"name": "Sheet1", "rows": [[...], ...]}]}`.
#[derive(Debug, Deserialize)]
struct WorkbookGrid {
    sheets: Vec<SheetGrid>,
}

#[derive(Debug, Deserialize)]
struct SheetGrid {
    name: String,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

/// Reads delimited text as a single group. Every field is kept as text.
pub fn read_delimited(data: &[u8], label: &str, delimiter: u8) -> Result<TabularSource> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(data);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.trim().is_empty() {
                        Cell::Empty
                    } else {
                        Cell::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }

    Ok(TabularSource {
        groups: vec![TableGroup {
            label: label.to_string(),
            rows,
        }],
    })
}

/// Reads a JSON workbook grid; JSON numbers stay numeric so the extractor can render them.
pub fn read_grid_json(data: &[u8]) -> Result<TabularSource> {
    let workbook: WorkbookGrid = serde_json::from_slice(data)?;
    Ok(TabularSource {
        groups: workbook
            .sheets
            .into_iter()
            .map(|sheet| TableGroup {
                label: sheet.name,
                rows: sheet
                    .rows
                    .into_iter()
                    .map(|row| row.into_iter().map(cell_from_json).collect())
                    .collect(),
            })
            .collect(),
    })
}

fn cell_from_json(value: serde_json::Value) -> Cell {
    use serde_json::Value;

    match value {
        Value::Null => Cell::Empty,
        Value::String(s) if s.trim().is_empty() => Cell::Empty,
        Value::String(s) => Cell::Text(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Cell::Integer(i)
            } else if let Some(u) = n.as_u64() {
                Cell::Text(u.to_string())
            } else {
                n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty)
            }
        }
        other => Cell::Text(other.to_string()),
    }
}

/// Parses `data` according to the file extension of `path`.
pub fn parse_source(path: &str, data: &[u8]) -> Result<TabularSource> {
    validate_file_extensions("recipients", &[path.to_string()], SUPPORTED_EXTENSIONS)?;

    let file = Path::new(path);
    let label = file
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("recipients");
    let extension = file
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "csv" => read_delimited(data, label, b','),
        "tsv" => read_delimited(data, label, b'\t'),
        "json" => read_grid_json(data),
        other => Err(DispatchError::validation(format!(
            "unsupported recipient file type: {}",
            other
        ))),
    }
}

pub async fn load_source<S: Storage>(storage: &S, path: &str) -> Result<TabularSource> {
    let data = storage.read_file(path).await?;
    tracing::debug!(path, bytes = data.len(), "Read recipient file");
    parse_source(path, &data)
}

/// Failed recipients as CSV: `recipient,group,kind,attempts,error`.
pub fn write_failures_csv<'a, I>(failures: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a DispatchFailure>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["recipient", "group", "kind", "attempts", "error"])?;
    for failure in failures {
        let kind = failure.kind.to_string();
        let attempts = failure.attempts.to_string();
        writer.write_record([
            failure.recipient.as_str(),
            failure.group.as_str(),
            kind.as_str(),
            attempts.as_str(),
            failure.detail.as_str(),
        ])?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}
