use crate::spec::GradingSpec;
use crate::table::Cell;
use crate::GradeError;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

const MAX_REPORTED_MISMATCHES: usize = 5;

struct Mismatch {
    row: usize,
    key: Option<String>,
    got: f64,
    expected: f64,
}

impl Mismatch {
    fn to_value(&self) -> Value {
        let mut value = json!({
            "row": self.row,
            "got": self.got,
            "expected": self.expected,
        });
        if let Some(key) = &self.key {
            value["key"] = json!(key);
        }
        value
    }
}

fn numeric_values(cells: &[Cell], column: &str) -> Result<Vec<f64>, GradeError> {
    cells
        .iter()
        .enumerate()
        .map(|(row, cell)| {
            cell.as_f64().ok_or_else(|| {
                GradeError::ComparisonFailed(format!(
                    "non-numeric value in column '{}' at row {}: {}",
                    column, row, cell
                ))
            })
        })
        .collect()
}

fn row_count_mismatch(alignment: &str, submitted: usize, expected: usize) -> GradeError {
    GradeError::ValueMismatch {
        summary: format!(
            "Row counts differ: submission has {}, expected {}",
            submitted, expected
        ),
        details: json!({
            "alignment": alignment,
            "submission_rows": submitted,
            "expected_rows": expected,
        }),
    }
}

fn finish(
    alignment: &str,
    rows: usize,
    mismatches: Vec<Mismatch>,
    spec: &GradingSpec,
) -> Result<usize, GradeError> {
    let Some(first) = mismatches.first() else {
        return Ok(rows);
    };
    let summary = format!(
        "{} of {} '{}' values differ beyond rtol={}; first at row {}: got {}, expected {}",
        mismatches.len(),
        rows,
        spec.derived_column,
        spec.rtol,
        first.row,
        first.got,
        first.expected
    );
    let details = json!({
        "alignment": alignment,
        "rows_compared": rows,
        "mismatches": mismatches.len(),
        "first_mismatches": mismatches
            .iter()
            .take(MAX_REPORTED_MISMATCHES)
            .map(Mismatch::to_value)
            .collect::<Vec<_>>(),
    });
    Err(GradeError::ValueMismatch { summary, details })
}

/// Row `i` of the submission is checked against row `i` of the expectation.
pub(crate) fn positional(
    got: &[Cell],
    expected: &[f64],
    spec: &GradingSpec,
) -> Result<usize, GradeError> {
    if got.len() != expected.len() {
        return Err(row_count_mismatch("positional", got.len(), expected.len()));
    }
    let values = numeric_values(got, &spec.derived_column)?;
    let mismatches = values
        .iter()
        .zip(expected)
        .enumerate()
        .filter(|(_, (g, e))| !spec.is_close(**g, **e))
        .map(|(row, (g, e))| Mismatch {
            row,
            key: None,
            got: *g,
            expected: *e,
        })
        .collect();
    finish("positional", values.len(), mismatches, spec)
}

/// Rows are paired on `key_column`; the submission must carry every oracle key
/// exactly once.
pub(crate) fn by_key(
    key_column: &str,
    submitted_keys: &[Cell],
    got: &[Cell],
    oracle_keys: &[Cell],
    expected: &[f64],
    spec: &GradingSpec,
) -> Result<usize, GradeError> {
    let mut index = HashMap::with_capacity(oracle_keys.len());
    for (row, cell) in oracle_keys.iter().enumerate() {
        if index.insert(cell.key(), row).is_some() {
            return Err(GradeError::OracleUnreadable {
                file: spec.oracle_file.clone(),
                reason: format!("duplicate key {} in column '{}'", cell, key_column),
            });
        }
    }
    if got.len() != expected.len() {
        return Err(row_count_mismatch("key", got.len(), expected.len()));
    }
    let values = numeric_values(got, &spec.derived_column)?;

    let mut seen = HashSet::with_capacity(values.len());
    let mut unknown = Vec::new();
    let mut duplicated = Vec::new();
    let mut mismatches = Vec::new();
    for (row, (key_cell, g)) in submitted_keys.iter().zip(&values).enumerate() {
        let key = key_cell.key();
        let Some(&oracle_row) = index.get(&key) else {
            unknown.push(key);
            continue;
        };
        if !seen.insert(key.clone()) {
            duplicated.push(key);
            continue;
        }
        let e = expected[oracle_row];
        if !spec.is_close(*g, e) {
            mismatches.push(Mismatch {
                row,
                key: Some(key),
                got: *g,
                expected: e,
            });
        }
    }

    if !unknown.is_empty() || !duplicated.is_empty() {
        return Err(GradeError::ValueMismatch {
            summary: format!(
                "Submission keys in '{}' do not match the input: {} unknown, {} duplicated",
                key_column,
                unknown.len(),
                duplicated.len()
            ),
            details: json!({
                "alignment": "key",
                "unknown_keys": unknown.iter().take(MAX_REPORTED_MISMATCHES).collect::<Vec<_>>(),
                "duplicated_keys": duplicated.iter().take(MAX_REPORTED_MISMATCHES).collect::<Vec<_>>(),
            }),
        });
    }
    finish("key", values.len(), mismatches, spec)
}
