use crate::domain::model::{Cell, RecipientBatch, RecipientIdentifier, TableGroup, TabularSource};
use crate::utils::error::{DispatchError, Result};
use std::collections::HashSet;

/// Header substrings that mark a phone-number column, matched case-insensitively.
pub const DEFAULT_COLUMN_PATTERNS: &[&str] = &["mobile", "phone", "cell", "tel", "contact"];

/// Longest exponent accepted when reconstituting `9.87E+09` style text.
const MAX_EXPONENT: i32 = 30;

/// Turns tabular sources into deduplicated, digits-only recipient lists.
#[derive(Debug, Clone)]
pub struct RecipientExtractor {
    patterns: Vec<String>,
}

impl Default for RecipientExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_COLUMN_PATTERNS.iter().copied())
    }
}

impl RecipientExtractor {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Groups with no matching column, or no valid values, are left out of the batch.
    pub fn extract(&self, source: &TabularSource) -> RecipientBatch {
        let mut batch = RecipientBatch::new();

        for group in &source.groups {
            let recipients = self.extract_group(group);
            tracing::debug!(
                group = %group.label,
                recipients = recipients.len(),
                "Extracted recipients from group"
            );
            batch.push_group(group.label.clone(), recipients);
        }

        tracing::info!(
            groups = batch.groups().len(),
            recipients = batch.len(),
            "Recipient extraction finished"
        );
        batch
    }

    fn extract_group(&self, group: &TableGroup) -> Vec<RecipientIdentifier> {
        let Some((header, data_rows)) = group.rows.split_first() else {
            return Vec::new();
        };
        let Some(column) = self.find_column(header) else {
            tracing::debug!(group = %group.label, "No phone column found");
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut recipients = Vec::new();
        let mut rejected = 0usize;

        for row in data_rows {
            let cell = row.get(column).unwrap_or(&Cell::Empty);
            if is_blank(cell) {
                continue;
            }
            match normalize_cell(cell).and_then(|digits| RecipientIdentifier::parse(&digits)) {
                Some(recipient) => {
                    if seen.insert(recipient.clone()) {
                        recipients.push(recipient);
                    }
                }
                None => rejected += 1,
            }
        }

        if rejected > 0 {
            tracing::warn!(group = %group.label, rejected, "Skipped values that are not phone numbers");
        }
        recipients
    }

    fn find_column(&self, header: &[Cell]) -> Option<usize> {
        header.iter().position(|cell| {
            header_text(cell)
                .map(|text| {
                    let text = text.to_lowercase();
                    self.patterns.iter().any(|p| text.contains(p.as_str()))
                })
                .unwrap_or(false)
        })
    }
}

/// Builds a one-group batch from a single typed-in number.
pub fn single_recipient(label: &str, raw: &str) -> Result<RecipientBatch> {
    let recipient = normalize_text(raw)
        .and_then(|digits| RecipientIdentifier::parse(&digits))
        .ok_or_else(|| DispatchError::validation(format!("'{}' is not a valid phone number", raw)))?;

    let mut batch = RecipientBatch::new();
    batch.push_group(label, vec![recipient]);
    Ok(batch)
}

fn header_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Empty => None,
        Cell::Text(text) => Some(text.clone()),
        Cell::Integer(value) => Some(value.to_string()),
        Cell::Number(value) => Some(value.to_string()),
    }
}

fn is_blank(cell: &Cell) -> bool {
    match cell {
        Cell::Empty => true,
        Cell::Text(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// Renders a cell as a digit string, or `None` if it cannot be a phone number.
pub fn normalize_cell(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Empty => None,
        Cell::Integer(value) if *value >= 0 => Some(value.to_string()),
        Cell::Integer(_) => None,
        Cell::Number(value) => {
            if value.is_finite() && *value >= 0.0 && value.fract() == 0.0 {
                Some(format!("{:.0}", value))
            } else {
                None
            }
        }
        Cell::Text(text) => normalize_text(text),
    }
}

pub fn normalize_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned.is_empty() {
        return None;
    }
    if unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return Some(unsigned.to_string());
    }
    expand_exponent(unsigned)
}

/// Rebuilds the plain integer behind text such as `9.87654321E+09`.
///
/// Works on the decimal digits directly so no precision is lost to floats.
/// Values with a non-zero fractional part are rejected.
fn expand_exponent(text: &str) -> Option<String> {
    let (mantissa, exponent) = text.split_once(['e', 'E'])?;
    let exponent = exponent.strip_prefix('+').unwrap_or(exponent);
    if exponent.is_empty() || exponent.len() > 3 {
        return None;
    }
    let exponent: i32 = exponent.parse().ok()?;
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }

    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (mantissa, ""),
    };
    if int_part.is_empty()
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let mut digits = format!("{}{}", int_part, frac_part);
    let point = int_part.len() as i32 + exponent;
    if point <= 0 {
        return digits.bytes().all(|b| b == b'0').then(|| "0".to_string());
    }

    let point = point as usize;
    if point >= digits.len() {
        digits.push_str(&"0".repeat(point - digits.len()));
    } else {
        if !digits[point..].bytes().all(|b| b == b'0') {
            return None;
        }
        digits.truncate(point);
    }

    let significant = digits.trim_start_matches('0');
    Some(if significant.is_empty() {
        "0".to_string()
    } else {
        significant.to_string()
    })
}
