//! Residual log (`<case>.resid`) reader.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use aither_regress_error::{RegressError, Result};
use tracing::debug;

/// Leading metadata columns (iteration counters) skipped on each residual line.
pub const RESIDUAL_METADATA_COLUMNS: usize = 3;

/// Residuals read from the final line of a residual log, one per tracked metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualVector {
    values: Vec<f64>,
}

impl ResidualVector {
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<f64> {
        self.values
    }
}

/// File name of the residual log for `case_name`.
#[must_use]
pub fn residual_file_name(case_name: &str) -> String {
    format!("{case_name}.resid")
}

/// Parse `tracked` residual values from one residual-log line.
///
/// `path` is used only to label errors.
///
/// # Errors
///
/// Fails when the line has fewer than `3 + tracked` columns or when a
/// required column is not a float.
pub fn parse_residual_line(path: &Path, line: &str, tracked: usize) -> Result<ResidualVector> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let required = RESIDUAL_METADATA_COLUMNS + tracked;
    if tokens.len() < required {
        return Err(RegressError::ResidualColumnsMissing {
            path: path.to_path_buf(),
            required,
            found: tokens.len(),
        });
    }

    let values = tokens[RESIDUAL_METADATA_COLUMNS..required]
        .iter()
        .enumerate()
        .map(|(offset, token)| {
            token
                .parse::<f64>()
                .map_err(|_| RegressError::ResidualNotNumeric {
                    path: path.to_path_buf(),
                    column: RESIDUAL_METADATA_COLUMNS + offset,
                    token: (*token).to_owned(),
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ResidualVector::new(values))
}

/// Read the last residual record of `<run_dir>/<case_name>.resid`.
///
/// Only the final line of the log is inspected; earlier iterations are
/// history.
///
/// # Errors
///
/// Returns a residual-parse error when the log is missing, empty, too short,
/// or holds a non-numeric value in a tracked column.
pub fn read_last_residuals(run_dir: &Path, case_name: &str, tracked: usize) -> Result<ResidualVector> {
    let path: PathBuf = run_dir.join(residual_file_name(case_name));
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(RegressError::ResidualFileMissing { path });
        }
        Err(error) => return Err(error.into()),
    };

    let Some(last_line) = text.lines().last() else {
        return Err(RegressError::ResidualFileEmpty { path });
    };
    let residuals = parse_residual_line(&path, last_line, tracked)?;
    debug!(
        case = case_name,
        resid = %path.display(),
        values = ?residuals.values(),
        "residuals read"
    );
    Ok(residuals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_log(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("shockTube.resid"), contents).expect("write resid");
        dir
    }

    #[test]
    fn reads_only_last_line() {
        let log = "\
1 1 0 1.0 1.0
20 1 0 0.9 0.8
40 1 0 0.7 0.6
60 1 0 0.5 0.4
80 1 0 0.3 0.2
100 0.1 0.2 1.234e-2 5.6e-3
";
        let dir = scratch_log(log);
        let residuals = read_last_residuals(dir.path(), "shockTube", 2).expect("parse");
        assert_eq!(residuals.values(), &[1.234e-2, 5.6e-3]);
    }

    #[test]
    fn extra_columns_are_ignored() {
        let residuals = parse_residual_line(Path::new("x.resid"), "1 2 3 0.5 0.25 9 9 9", 2)
            .expect("parse");
        assert_eq!(residuals.into_inner(), vec![0.5, 0.25]);
    }

    #[test]
    fn zero_tracked_metrics_only_needs_metadata() {
        let residuals = parse_residual_line(Path::new("x.resid"), "1 2 3", 0).expect("parse");
        assert!(residuals.is_empty());
    }

    #[test]
    fn short_line_is_rejected() {
        let err = parse_residual_line(Path::new("x.resid"), "100 1 0 0.1", 2).expect_err("short");
        assert!(
            matches!(
                err,
                RegressError::ResidualColumnsMissing {
                    required: 5,
                    found: 4,
                    ..
                }
            ),
            "case=short_line err={err}"
        );
    }

    #[test]
    fn non_numeric_column_is_rejected() {
        let err = parse_residual_line(Path::new("x.resid"), "100 1 0 0.1 abc", 2)
            .expect_err("non-numeric");
        assert!(
            matches!(&err, RegressError::ResidualNotNumeric { column: 4, token, .. } if token == "abc"),
            "case=non_numeric err={err}"
        );
    }

    #[test]
    fn missing_file_is_distinct_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_last_residuals(dir.path(), "couette", 5).expect_err("missing");
        assert!(matches!(err, RegressError::ResidualFileMissing { .. }));
    }

    #[test]
    fn empty_file_is_distinct_error() {
        let dir = scratch_log("");
        let err = read_last_residuals(dir.path(), "shockTube", 5).expect_err("empty");
        assert!(matches!(err, RegressError::ResidualFileEmpty { .. }));
    }

    #[test]
    fn whitespace_last_line_is_too_short() {
        let dir = scratch_log("10 1 0 0.1 0.2\n   \n");
        let err = read_last_residuals(dir.path(), "shockTube", 2).expect_err("blank");
        assert!(matches!(
            err,
            RegressError::ResidualColumnsMissing { found: 0, .. }
        ));
    }
}
