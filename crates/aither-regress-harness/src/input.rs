//! Solver input-file mutation.
//!
//! Rewrites `<case>.inp` so the solver runs for the iteration budget chosen by
//! the suite. Matching is line-substring based; everything that is not an
//! iteration or output-frequency directive is copied byte-for-byte.

use std::fs;
use std::path::{Path, PathBuf};

use aither_regress_error::{RegressError, Result};
use tracing::{debug, info};

/// Directive token that sets the solver iteration count.
pub const ITERATIONS_TOKEN: &str = "iterations:";
/// Directive token that sets the solver output frequency.
pub const OUTPUT_FREQUENCY_TOKEN: &str = "outputFrequency:";
/// Suffix appended to the original input file when it is preserved.
pub const BACKUP_SUFFIX: &str = ".old";

/// Paths touched by [`rewrite_input_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRewrite {
    /// Freshly written input file.
    pub input_path: PathBuf,
    /// Untouched original, renamed.
    pub backup_path: PathBuf,
    /// Number of directive lines that were replaced.
    pub replaced_lines: usize,
}

/// File name of the input deck for `case_name`.
#[must_use]
pub fn input_file_name(case_name: &str) -> String {
    format!("{case_name}.inp")
}

/// Rewrite the directive lines of an input deck held in memory.
///
/// Returns the new bytes and the number of replaced lines. Non-directive
/// lines are copied byte-for-byte, whatever their encoding; replaced lines
/// always end in `\n`.
#[must_use]
pub fn rewrite_directives(source: &[u8], iterations: u64) -> (Vec<u8>, usize) {
    let mut rewritten = Vec::with_capacity(source.len());
    let mut replaced = 0_usize;
    for line in source.split_inclusive(|byte| *byte == b'\n') {
        if contains_token(line, ITERATIONS_TOKEN) {
            rewritten.extend_from_slice(format!("{ITERATIONS_TOKEN} {iterations}\n").as_bytes());
            replaced += 1;
        } else if contains_token(line, OUTPUT_FREQUENCY_TOKEN) {
            rewritten
                .extend_from_slice(format!("{OUTPUT_FREQUENCY_TOKEN} {iterations}\n").as_bytes());
            replaced += 1;
        } else {
            rewritten.extend_from_slice(line);
        }
    }
    (rewritten, replaced)
}

fn contains_token(line: &[u8], token: &str) -> bool {
    let token = token.as_bytes();
    line.windows(token.len()).any(|window| window == token)
}

/// Override the iteration and output-frequency directives of
/// `<run_dir>/<case_name>.inp`.
///
/// The original deck is renamed to `<case_name>.inp.old` (replacing any
/// earlier backup) and a new deck is written in its place.
///
/// # Errors
///
/// Returns [`RegressError::InputFileMissing`] when the deck does not exist and
/// [`RegressError::Io`] for any other filesystem failure.
pub fn rewrite_input_file(run_dir: &Path, case_name: &str, iterations: u64) -> Result<InputRewrite> {
    let input_path = run_dir.join(input_file_name(case_name));
    if !input_path.is_file() {
        return Err(RegressError::InputFileMissing { path: input_path });
    }
    let backup_path = run_dir.join(format!("{}{BACKUP_SUFFIX}", input_file_name(case_name)));

    fs::rename(&input_path, &backup_path)?;
    let original = fs::read(&backup_path)?;
    let (rewritten, replaced_lines) = rewrite_directives(&original, iterations);
    fs::write(&input_path, rewritten)?;

    debug!(
        backup = %backup_path.display(),
        replaced_lines,
        "input deck backed up"
    );
    info!(
        case = case_name,
        input = %input_path.display(),
        iterations,
        "input deck rewritten"
    );

    Ok(InputRewrite {
        input_path,
        backup_path,
        replaced_lines,
    })
}
