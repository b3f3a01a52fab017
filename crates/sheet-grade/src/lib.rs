//! Grading runner: checks a submitted table against a task's oracle input.
//!
//! Outcomes are always a [`GradeVerdict`]. `fail` means the check ran and the
//! submission did not satisfy it; `error` means the check could not be run
//! (missing oracle, broken grading program, crashed grader process).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sheet_core::{sha256_file, TASK_GRADER_FILE};
use std::path::{Path, PathBuf};

mod compare;
mod runner;
mod spec;
mod table;

pub use runner::{parse_verdict, GraderLaunch, ScratchDir};
pub use spec::{load_grading_spec, Alignment, GradingSpec};
pub use table::{load_table, Cell, Table, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeStatus {
    Pass,
    Fail,
    Error,
}

impl GradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeStatus::Pass => "pass",
            GradeStatus::Fail => "fail",
            GradeStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeVerdict {
    pub status: GradeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_digest: Option<String>,
}

impl GradeVerdict {
    fn with_status(status: GradeStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            output: None,
            details: None,
            submission_digest: None,
        }
    }

    pub fn pass() -> Self {
        Self::with_status(GradeStatus::Pass, None)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::with_status(GradeStatus::Fail, Some(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(GradeStatus::Error, Some(message.into()))
    }

    pub(crate) fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_pass(&self) -> bool {
        self.status == GradeStatus::Pass
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            json!({"status": "error", "message": format!("verdict serialization failed: {}", e)})
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("Could not read submission file: {0}")]
    SubmissionUnreadable(String),
    #[error("Input file {0} not found in task dir")]
    OracleMissing(String),
    #[error("Could not read input file {file}: {reason}")]
    OracleUnreadable { file: String, reason: String },
    #[error("Input file missing '{0}' column")]
    SourceColumnMissing(String),
    #[error("Column '{0}' not found in submission")]
    ColumnMissing(String),
    #[error("Values do not match expected. {summary}")]
    ValueMismatch { summary: String, details: Value },
    #[error("Error comparing values: {0}")]
    ComparisonFailed(String),
    #[error("Grader not found: {0}")]
    GraderMissing(PathBuf),
    #[error("Invalid grading program {path}: {reason}")]
    GraderInvalid { path: PathBuf, reason: String },
    #[error("Grader crashed: {0}")]
    GraderCrashed(String),
}

impl GradeError {
    /// Submission problems are the agent's fault; everything else is ours.
    pub fn status(&self) -> GradeStatus {
        match self {
            GradeError::SubmissionUnreadable(_)
            | GradeError::ColumnMissing(_)
            | GradeError::ValueMismatch { .. }
            | GradeError::ComparisonFailed(_) => GradeStatus::Fail,
            GradeError::OracleMissing(_)
            | GradeError::OracleUnreadable { .. }
            | GradeError::SourceColumnMissing(_)
            | GradeError::GraderMissing(_)
            | GradeError::GraderInvalid { .. }
            | GradeError::GraderCrashed(_) => GradeStatus::Error,
        }
    }
}

impl From<GradeError> for GradeVerdict {
    fn from(err: GradeError) -> Self {
        let status = err.status();
        let message = err.to_string();
        let details = match err {
            GradeError::ValueMismatch { details, .. } => Some(details),
            _ => None,
        };
        GradeVerdict {
            details,
            ..GradeVerdict::with_status(status, Some(message))
        }
    }
}

/// Grades `submission` with the grading program found in `task_dir`.
pub fn grade_submission(submission: &Path, task_dir: &Path) -> GradeVerdict {
    let spec_path = task_dir.join(TASK_GRADER_FILE);
    if !spec_path.is_file() {
        return GradeError::GraderMissing(spec_path).into();
    }
    match load_grading_spec(&spec_path) {
        Ok(spec) => grade_with_spec(submission, task_dir, &spec),
        Err(err) => GradeError::GraderInvalid {
            path: spec_path,
            reason: err.to_string(),
        }
        .into(),
    }
}

pub fn grade_with_spec(submission: &Path, task_dir: &Path, spec: &GradingSpec) -> GradeVerdict {
    let mut verdict = match check_submission(submission, task_dir, spec) {
        Ok(rows) => GradeVerdict::pass().with_details(json!({
            "alignment": spec.alignment.label(),
            "rows_compared": rows,
        })),
        Err(err) => err.into(),
    };
    verdict.submission_digest = sha256_file(submission).ok();
    tracing::info!(
        submission = %submission.display(),
        task_dir = %task_dir.display(),
        status = verdict.status.as_str(),
        "submission graded"
    );
    verdict
}

fn check_submission(
    submission: &Path,
    task_dir: &Path,
    spec: &GradingSpec,
) -> Result<usize, GradeError> {
    let submitted =
        load_table(submission).map_err(|e| GradeError::SubmissionUnreadable(e.to_string()))?;

    let oracle_path = task_dir.join(&spec.oracle_file);
    if !oracle_path.is_file() {
        return Err(GradeError::OracleMissing(spec.oracle_file.clone()));
    }
    let oracle = load_table(&oracle_path).map_err(|e| GradeError::OracleUnreadable {
        file: spec.oracle_file.clone(),
        reason: e.to_string(),
    })?;

    let got = submitted
        .column(&spec.derived_column)
        .ok_or_else(|| GradeError::ColumnMissing(spec.derived_column.clone()))?;
    let source = oracle
        .column(&spec.source_column)
        .ok_or_else(|| GradeError::SourceColumnMissing(spec.source_column.clone()))?;
    let expected = source
        .iter()
        .enumerate()
        .map(|(row, cell)| {
            cell.as_f64()
                .map(|v| v * spec.factor)
                .ok_or_else(|| GradeError::OracleUnreadable {
                    file: spec.oracle_file.clone(),
                    reason: format!(
                        "non-numeric '{}' value at row {}: {}",
                        spec.source_column, row, cell
                    ),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    match &spec.alignment {
        Alignment::Positional => compare::positional(&got, &expected, spec),
        Alignment::Key { key_column } => {
            let submitted_keys = submitted
                .column(key_column)
                .ok_or_else(|| GradeError::ColumnMissing(key_column.clone()))?;
            let oracle_keys =
                oracle
                    .column(key_column)
                    .ok_or_else(|| GradeError::OracleUnreadable {
                        file: spec.oracle_file.clone(),
                        reason: format!("key column '{}' missing", key_column),
                    })?;
            compare::by_key(
                key_column,
                &submitted_keys,
                &got,
                &oracle_keys,
                &expected,
                spec,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos();
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                nanos
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    const GRADER_YAML: &str = "oracle_file: cash_flows.csv\nsource_column: Amount\nderived_column: Reserve\nfactor: 0.1\n";

    /// 100 deterministic, arbitrary-looking positive amounts.
    fn amounts() -> Vec<f64> {
        let mut state: u64 = 42;
        (0..100)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let unit = (state >> 11) as f64 / (1u64 << 53) as f64;
                ((1000.0 + unit * 49000.0) * 100.0).round() / 100.0
            })
            .collect()
    }

    fn write_task(dir: &Path, grader_yaml: &str, amounts: &[f64]) {
        fs::write(dir.join(TASK_GRADER_FILE), grader_yaml).expect("grader");
        let mut oracle = String::from("Transaction ID,Amount,Description\n");
        for (i, amount) in amounts.iter().enumerate() {
            oracle.push_str(&format!("{},{},Transaction {}\n", i + 1, amount, i + 1));
        }
        fs::write(dir.join("cash_flows.csv"), oracle).expect("oracle");
    }

    fn write_submission(path: &Path, rows: &[(usize, f64, f64)]) {
        let mut out = String::from("Transaction ID,Amount,Reserve\n");
        for (id, amount, reserve) in rows {
            out.push_str(&format!("{},{},{}\n", id, amount, reserve));
        }
        fs::write(path, out).expect("submission");
    }

    fn correct_rows(amounts: &[f64]) -> Vec<(usize, f64, f64)> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, a)| (i + 1, *a, a * 0.1))
            .collect()
    }

    #[test]
    fn correct_submission_passes() {
        let root = TempDirGuard::new("sheetbench_grade_pass");
        let amounts = amounts();
        write_task(&root.path, GRADER_YAML, &amounts);
        let submission = root.path.join("solution.csv");
        write_submission(&submission, &correct_rows(&amounts));

        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Pass, "{:?}", verdict);
        assert_eq!(verdict.details.as_ref().expect("details")["rows_compared"], 100);
        assert!(verdict
            .submission_digest
            .as_deref()
            .expect("digest")
            .starts_with("sha256:"));
    }

    #[test]
    fn values_within_one_percent_pass() {
        let root = TempDirGuard::new("sheetbench_grade_tolerance");
        let amounts = amounts();
        write_task(&root.path, GRADER_YAML, &amounts);
        let submission = root.path.join("solution.csv");
        let rows = amounts
            .iter()
            .enumerate()
            .map(|(i, a)| (i + 1, *a, a * 0.1 * 1.005))
            .collect::<Vec<_>>();
        write_submission(&submission, &rows);
        assert!(grade_submission(&submission, &root.path).is_pass());
    }

    #[test]
    fn missing_derived_column_fails_naming_it() {
        let root = TempDirGuard::new("sheetbench_grade_missing_column");
        write_task(&root.path, GRADER_YAML, &amounts());
        let submission = root.path.join("solution.csv");
        fs::write(&submission, "Transaction ID,Amount\n1,10\n").expect("submission");

        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Fail);
        assert!(verdict.message.expect("message").contains("'Reserve'"));
    }

    #[test]
    fn missing_oracle_is_an_error_not_a_failure() {
        let root = TempDirGuard::new("sheetbench_grade_missing_oracle");
        let amounts = amounts();
        write_task(&root.path, GRADER_YAML, &amounts);
        fs::remove_file(root.path.join("cash_flows.csv")).expect("remove oracle");
        let submission = root.path.join("solution.csv");
        write_submission(&submission, &correct_rows(&amounts));

        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Error);
        assert!(verdict.message.expect("message").contains("cash_flows.csv"));
    }

    #[test]
    fn one_row_off_by_half_fails() {
        let root = TempDirGuard::new("sheetbench_grade_off_by_half");
        let amounts = amounts();
        write_task(&root.path, GRADER_YAML, &amounts);
        let mut rows = correct_rows(&amounts);
        rows[37].2 *= 1.5;
        let submission = root.path.join("solution.csv");
        write_submission(&submission, &rows);

        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Fail);
        let details = verdict.details.expect("details");
        assert_eq!(details["mismatches"], 1);
        assert_eq!(details["first_mismatches"][0]["row"], 37);
    }

    #[test]
    fn reordered_reserve_fails_positionally() {
        let root = TempDirGuard::new("sheetbench_grade_reordered");
        let amounts = amounts();
        write_task(&root.path, GRADER_YAML, &amounts);
        let mut rows = correct_rows(&amounts);
        let mut reserves = rows.iter().map(|r| r.2).collect::<Vec<_>>();
        reserves.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
        for (row, reserve) in rows.iter_mut().zip(reserves) {
            row.2 = reserve;
        }
        let submission = root.path.join("solution.csv");
        write_submission(&submission, &rows);

        assert_eq!(
            grade_submission(&submission, &root.path).status,
            GradeStatus::Fail
        );
    }

    #[test]
    fn resorted_rows_pass_with_key_alignment() {
        let root = TempDirGuard::new("sheetbench_grade_key_alignment");
        let amounts = amounts();
        let grader = format!(
            "{}alignment:\n  mode: key\n  key_column: Transaction ID\n",
            GRADER_YAML
        );
        write_task(&root.path, &grader, &amounts);
        let mut rows = correct_rows(&amounts);
        rows.sort_by(|a, b| a.2.partial_cmp(&b.2).expect("finite"));
        let submission = root.path.join("solution.csv");
        write_submission(&submission, &rows);

        let verdict = grade_submission(&submission, &root.path);
        assert!(verdict.is_pass(), "{:?}", verdict);

        rows[0].2 *= 2.0;
        write_submission(&submission, &rows);
        assert_eq!(
            grade_submission(&submission, &root.path).status,
            GradeStatus::Fail
        );
    }

    #[test]
    fn key_alignment_requires_key_column_in_submission() {
        let root = TempDirGuard::new("sheetbench_grade_key_missing");
        let grader = format!("{}alignment:\n  mode: key\n  key_column: Ref\n", GRADER_YAML);
        write_task(&root.path, &grader, &amounts());
        let submission = root.path.join("solution.csv");
        write_submission(&submission, &correct_rows(&amounts()));
        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Fail);
        assert!(verdict.message.expect("message").contains("'Ref'"));
    }

    #[test]
    fn unreadable_submission_fails() {
        let root = TempDirGuard::new("sheetbench_grade_unreadable");
        write_task(&root.path, GRADER_YAML, &amounts());
        let submission = root.path.join("solution.ods");
        fs::write(&submission, "definitely not a spreadsheet").expect("submission");

        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Fail);
        assert!(verdict
            .message
            .expect("message")
            .starts_with("Could not read submission file"));
    }

    #[test]
    fn non_numeric_submission_value_fails() {
        let root = TempDirGuard::new("sheetbench_grade_non_numeric");
        write_task(&root.path, GRADER_YAML, &[100.0, 200.0]);
        let submission = root.path.join("solution.csv");
        fs::write(&submission, "Reserve\n10\nten\n").expect("submission");

        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Fail);
        assert!(verdict
            .message
            .expect("message")
            .starts_with("Error comparing values"));
    }

    #[test]
    fn row_count_difference_fails() {
        let root = TempDirGuard::new("sheetbench_grade_row_count");
        write_task(&root.path, GRADER_YAML, &[100.0, 200.0, 300.0]);
        let submission = root.path.join("solution.csv");
        fs::write(&submission, "Reserve\n10\n20\n").expect("submission");
        assert_eq!(
            grade_submission(&submission, &root.path).status,
            GradeStatus::Fail
        );
    }

    #[test]
    fn oracle_without_source_column_is_an_error() {
        let root = TempDirGuard::new("sheetbench_grade_source_column");
        fs::write(root.path.join(TASK_GRADER_FILE), GRADER_YAML).expect("grader");
        fs::write(root.path.join("cash_flows.csv"), "Value\n1\n").expect("oracle");
        let submission = root.path.join("solution.csv");
        fs::write(&submission, "Reserve\n0.1\n").expect("submission");
        assert_eq!(
            grade_submission(&submission, &root.path).status,
            GradeStatus::Error
        );
    }

    #[test]
    fn missing_or_broken_grading_program_is_an_error() {
        let root = TempDirGuard::new("sheetbench_grade_no_program");
        let submission = root.path.join("solution.csv");
        fs::write(&submission, "Reserve\n0.1\n").expect("submission");
        let verdict = grade_submission(&submission, &root.path);
        assert_eq!(verdict.status, GradeStatus::Error);
        assert!(verdict.message.expect("message").starts_with("Grader not found"));

        fs::write(root.path.join(TASK_GRADER_FILE), "factor: [").expect("grader");
        assert_eq!(
            grade_submission(&submission, &root.path).status,
            GradeStatus::Error
        );
    }

    #[test]
    fn verdict_serializes_without_empty_fields() {
        assert_eq!(
            serde_json::to_string(&GradeVerdict::pass()).expect("json"),
            r#"{"status":"pass"}"#
        );
        let verdict: GradeVerdict =
            serde_json::from_str(r#"{"status":"fail","message":"nope"}"#).expect("parse");
        assert_eq!(verdict, GradeVerdict::fail("nope"));
    }
}
