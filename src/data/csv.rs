//! Numeric CSV tables
//!
//! Reads comma-separated files whose first line is a header and whose every
//! other line holds numbers only (the output of the dataset encoding step).
//!
//! ```text
//! age,sex,priors_count,two_year_recid
//! 25,1,0,0
//! 41,0,3,1
//! ```

use super::Record;
use crate::{FairHnError, Result};
use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0},
    combinator::{all_consuming, map, map_res},
    multi::separated_list1,
    number::complete::recognize_float,
    sequence::delimited,
    IResult,
};
use std::path::Path;

// =============================================================================
// LINE PARSERS
// =============================================================================

/// Comma with optional surrounding spaces
fn comma(input: &str) -> IResult<&str, char> {
    delimited(space0, char(','), space0)(input)
}

/// Column name: anything up to the next comma
fn column_name(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c != ','), |s: &str| s.trim().to_string())(input)
}

/// Numeric cell (integer, decimal or exponent form)
fn cell(input: &str) -> IResult<&str, f32> {
    map_res(recognize_float, |s: &str| s.parse::<f32>())(input)
}

fn header(input: &str) -> IResult<&str, Vec<String>> {
    all_consuming(separated_list1(char(','), column_name))(input)
}

fn row(input: &str) -> IResult<&str, Vec<f32>> {
    all_consuming(delimited(space0, separated_list1(comma, cell), space0))(input)
}

// =============================================================================
// TABLES
// =============================================================================

/// Parsed CSV: column names plus rows of equal width
#[derive(Debug, Clone, PartialEq)]
pub struct NumericTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f32>>,
}

/// Records plus the names of their feature columns
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub records: Vec<Record>,
}

impl NumericTable {
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| FairHnError::Data(format!("column '{}' not found", name)))
    }

    /// Split the table into records
    ///
    /// Every column except the label becomes a feature, the sensitive column
    /// included. Label and sensitive values must be 0 or 1.
    pub fn into_dataset(self, label: &str, sensitive: &str) -> Result<Dataset> {
        let label_idx = self.column_index(label)?;
        let sensitive_idx = self.column_index(sensitive)?;

        let feature_names: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != label_idx)
            .map(|(_, c)| c.clone())
            .collect();

        let binary = |value: f32, what: &str, line: usize| -> Result<f32> {
            if value == 0.0 || value == 1.0 {
                Ok(value)
            } else {
                Err(FairHnError::Data(format!(
                    "row {}: {} must be 0 or 1, got {}",
                    line, what, value
                )))
            }
        };

        let mut records = Vec::with_capacity(self.rows.len());
        for (line, row) in self.rows.into_iter().enumerate() {
            let y = binary(row[label_idx], label, line + 1)?;
            let s = binary(row[sensitive_idx], sensitive, line + 1)?;
            let features: Vec<f32> = row
                .into_iter()
                .enumerate()
                .filter(|(i, _)| *i != label_idx)
                .map(|(_, v)| v)
                .collect();
            records.push(Record::new(features, y, s));
        }

        Ok(Dataset {
            feature_names,
            records,
        })
    }
}

/// Parse CSV text into a numeric table
pub fn parse_table(text: &str) -> Result<NumericTable> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());

    let (_, header_line) = lines
        .next()
        .ok_or_else(|| FairHnError::Data("empty CSV input".into()))?;
    let (_, columns) = header(header_line)
        .map_err(|e| FairHnError::Data(format!("line 1: bad header: {}", e)))?;

    let mut rows = Vec::new();
    for (line_no, line) in lines {
        let (_, values) = row(line)
            .map_err(|e| FairHnError::Data(format!("line {}: {}", line_no, e)))?;
        if values.len() != columns.len() {
            return Err(FairHnError::Data(format!(
                "line {}: expected {} values, found {}",
                line_no,
                columns.len(),
                values.len()
            )));
        }
        rows.push(values);
    }

    Ok(NumericTable { columns, rows })
}

/// Read and parse a CSV file
pub fn read_table(path: impl AsRef<Path>) -> Result<NumericTable> {
    let text = std::fs::read_to_string(path.as_ref()).map_err(FairHnError::Io)?;
    parse_table(&text)
}
