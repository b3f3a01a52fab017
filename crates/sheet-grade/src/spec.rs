use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How submission rows are matched to oracle rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Alignment {
    /// Row `i` of the submission against row `i` of the oracle.
    #[default]
    Positional,
    /// Rows matched on the value of `key_column`, present in both tables.
    Key { key_column: String },
}

impl Alignment {
    pub fn label(&self) -> &'static str {
        match self {
            Alignment::Positional => "positional",
            Alignment::Key { .. } => "key",
        }
    }
}

/// Declarative grading program stored as `grader.yaml` in a task directory:
/// `derived_column == source_column * factor`, checked against `oracle_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GradingSpec {
    pub oracle_file: String,
    pub source_column: String,
    pub derived_column: String,
    pub factor: f64,
    #[serde(default = "default_rtol")]
    pub rtol: f64,
    #[serde(default = "default_atol")]
    pub atol: f64,
    #[serde(default)]
    pub alignment: Alignment,
}

fn default_rtol() -> f64 {
    0.01
}

fn default_atol() -> f64 {
    1e-8
}

impl Default for GradingSpec {
    fn default() -> Self {
        Self {
            oracle_file: "cash_flows.csv".to_string(),
            source_column: "Amount".to_string(),
            derived_column: "Reserve".to_string(),
            factor: 0.1,
            rtol: default_rtol(),
            atol: default_atol(),
            alignment: Alignment::Positional,
        }
    }
}

impl GradingSpec {
    pub fn validate(&self) -> Result<()> {
        if self.oracle_file.trim().is_empty() {
            return Err(anyhow!("oracle_file must not be empty"));
        }
        if self.source_column.is_empty() || self.derived_column.is_empty() {
            return Err(anyhow!("source_column and derived_column are required"));
        }
        if !self.factor.is_finite() {
            return Err(anyhow!("factor must be finite"));
        }
        if !(self.rtol >= 0.0 && self.atol >= 0.0) {
            return Err(anyhow!("rtol and atol must be non-negative"));
        }
        if let Alignment::Key { key_column } = &self.alignment {
            if key_column.is_empty() {
                return Err(anyhow!("alignment.key_column must not be empty"));
            }
        }
        Ok(())
    }

    /// `math.isclose` semantics: symmetric relative tolerance with an absolute floor.
    pub fn is_close(&self, got: f64, expected: f64) -> bool {
        if got.is_nan() || expected.is_nan() {
            return got.is_nan() && expected.is_nan();
        }
        if got.is_infinite() || expected.is_infinite() {
            return got == expected;
        }
        let diff = (got - expected).abs();
        diff <= (self.rtol * got.abs().max(expected.abs())).max(self.atol)
    }
}

pub fn load_grading_spec(path: &Path) -> Result<GradingSpec> {
    let raw = fs::read_to_string(path)?;
    let spec: GradingSpec = serde_yaml::from_str(&raw)?;
    spec.validate()?;
    Ok(spec)
}
