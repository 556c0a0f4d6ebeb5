//! Residual comparison against reference values.
//!
//! # Rules
//!
//! - A run whose solver exit code is nonzero (or missing) fails every
//!   tracked metric, whatever the residuals say.
//! - Otherwise a metric passes when `|actual - expected| <= tol * expected`.
//!   The expected value is the tolerance scale, so tracked references must
//!   not be zero.
//! - Ignored indices are dropped before comparison; the remaining metrics
//!   keep their order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Default relative tolerance (one percent).
pub const DEFAULT_RELATIVE_TOLERANCE: f64 = 0.01;

/// Outcome for one tracked metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    /// Position of the metric in the expected residual vector.
    pub index: usize,
    pub expected: f64,
    /// `None` when the residual log could not be read. Non-finite values are
    /// written to JSON as strings (`"NaN"`, `"inf"`, `"-inf"`).
    #[serde(with = "residual_value")]
    pub actual: Option<f64>,
    pub passed: bool,
}

mod residual_value {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(
        value: &Option<f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            None => serializer.serialize_none(),
            Some(number) if number.is_finite() => serializer.serialize_some(number),
            Some(number) => serializer.serialize_some(&number.to_string()),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Number(number)) => Ok(Some(number)),
            Some(Repr::Text(text)) => text
                .parse()
                .map(Some)
                .map_err(|error| D::Error::custom(format!("invalid residual {text:?}: {error}"))),
        }
    }
}

/// Per-metric pass/fail vector for one run, ignored metrics excluded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub metrics: Vec<MetricComparison>,
}

impl ComparisonResult {
    /// Pass flags in metric order.
    #[must_use]
    pub fn passed_flags(&self) -> Vec<bool> {
        self.metrics.iter().map(|metric| metric.passed).collect()
    }

    /// Residual values that took part in the comparison.
    #[must_use]
    pub fn compared_values(&self) -> Vec<f64> {
        self.metrics.iter().filter_map(|metric| metric.actual).collect()
    }

    /// Reference values for the compared metrics.
    #[must_use]
    pub fn expected_values(&self) -> Vec<f64> {
        self.metrics.iter().map(|metric| metric.expected).collect()
    }

    /// `true` when every tracked metric passed (vacuously true when none are tracked).
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.metrics.iter().all(|metric| metric.passed)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.metrics.iter().filter(|metric| !metric.passed).count()
    }
}

/// Relative tolerance check with `expected` as the scale.
#[must_use]
pub fn within_relative_tolerance(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance * expected
}

/// Compare solver residuals against the reference vector.
///
/// `actual` may be shorter than `expected` (or empty) when the residual log
/// was unreadable; missing metrics fail.
#[must_use]
pub fn compare_residuals(
    actual: &[f64],
    expected: &[f64],
    ignored: &BTreeSet<usize>,
    exit_code: Option<i32>,
    tolerance: f64,
) -> ComparisonResult {
    let solver_ok = exit_code == Some(0);
    let metrics = expected
        .iter()
        .enumerate()
        .filter(|(index, _)| !ignored.contains(index))
        .map(|(index, &expected)| {
            let actual = actual.get(index).copied();
            let passed = solver_ok
                && actual.is_some_and(|value| within_relative_tolerance(value, expected, tolerance));
            MetricComparison {
                index,
                expected,
                actual,
                passed,
            }
        })
        .collect();
    ComparisonResult { metrics }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn ignored(indices: &[usize]) -> BTreeSet<usize> {
        indices.iter().copied().collect()
    }

    #[test]
    fn one_percent_boundary() {
        let pass = compare_residuals(&[1.009], &[1.0], &ignored(&[]), Some(0), 0.01);
        assert_eq!(pass.passed_flags(), vec![true]);
        let fail = compare_residuals(&[1.011], &[1.0], &ignored(&[]), Some(0), 0.01);
        assert_eq!(fail.passed_flags(), vec![false]);
    }

    #[test]
    fn nonzero_exit_fails_everything() {
        let result = compare_residuals(&[0.5], &[0.5], &ignored(&[]), Some(1), 0.01);
        assert_eq!(result.passed_flags(), vec![false]);
        assert_eq!(result.compared_values(), vec![0.5]);
    }

    #[test]
    fn signal_death_fails_everything() {
        let result = compare_residuals(&[0.5, 0.7], &[0.5, 0.7], &ignored(&[]), None, 0.01);
        assert_eq!(result.failed_count(), 2);
    }

    #[test]
    fn ignored_indices_are_skipped_in_order() {
        let result = compare_residuals(
            &[1.0, 5.0, 3.0],
            &[1.0, 2.0, 3.0],
            &ignored(&[1]),
            Some(0),
            0.01,
        );
        let indices: Vec<usize> = result.metrics.iter().map(|metric| metric.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(result.passed_flags(), vec![true, true]);
        assert_eq!(result.compared_values(), vec![1.0, 3.0]);
        assert_eq!(result.expected_values(), vec![1.0, 3.0]);
    }

    #[test]
    fn all_ignored_is_vacuous_pass() {
        let result = compare_residuals(&[9.0, 9.0], &[1.0, 1.0], &ignored(&[0, 1]), Some(0), 0.01);
        assert!(result.metrics.is_empty());
        assert!(result.all_passed());
    }

    #[test]
    fn missing_actuals_fail() {
        let result = compare_residuals(&[], &[1.0, 2.0], &ignored(&[]), Some(0), 0.01);
        assert_eq!(result.passed_flags(), vec![false, false]);
        assert!(result.compared_values().is_empty());
    }

    #[test]
    fn nan_residual_fails() {
        let result = compare_residuals(&[f64::NAN], &[1.0], &ignored(&[]), Some(0), 0.01);
        assert!(!result.all_passed());
    }

    #[test]
    fn non_finite_residuals_survive_json() {
        let result = compare_residuals(
            &[f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.5],
            &[1.0, 1.0, 1.0, 0.5],
            &ignored(&[]),
            Some(0),
            0.01,
        );
        let payload = serde_json::to_string(&result).expect("serialize");
        assert!(payload.contains(r#""actual":"NaN""#), "payload={payload}");
        assert!(payload.contains(r#""actual":"inf""#), "payload={payload}");
        assert!(payload.contains(r#""actual":"-inf""#), "payload={payload}");
        assert!(payload.contains(r#""actual":0.5"#), "payload={payload}");

        let loaded: ComparisonResult = serde_json::from_str(&payload).expect("deserialize");
        let actual: Vec<Option<f64>> = loaded.metrics.iter().map(|metric| metric.actual).collect();
        assert!(actual[0].is_some_and(f64::is_nan));
        assert_eq!(actual[1], Some(f64::INFINITY));
        assert_eq!(actual[2], Some(f64::NEG_INFINITY));
        assert_eq!(actual[3], Some(0.5));
        assert_eq!(loaded.passed_flags(), result.passed_flags());
    }

    #[test]
    fn missing_residual_stays_null_in_json() {
        let result = compare_residuals(&[], &[1.0], &ignored(&[]), Some(0), 0.01);
        let value = serde_json::to_value(&result).expect("serialize");
        assert!(value["metrics"][0]["actual"].is_null());
        let loaded: ComparisonResult = serde_json::from_value(value).expect("deserialize");
        assert_eq!(loaded, result);
    }

    proptest! {
        #[test]
        fn crash_never_passes(values in proptest::collection::vec(1e-9_f64..10.0, 1..8), code in 1_i32..255) {
            let result = compare_residuals(&values, &values, &BTreeSet::new(), Some(code), DEFAULT_RELATIVE_TOLERANCE);
            prop_assert_eq!(result.metrics.len(), values.len());
            prop_assert!(result.metrics.iter().all(|metric| !metric.passed));
        }

        #[test]
        fn exact_match_always_passes(values in proptest::collection::vec(1e-9_f64..10.0, 1..8)) {
            let result = compare_residuals(&values, &values, &BTreeSet::new(), Some(0), DEFAULT_RELATIVE_TOLERANCE);
            prop_assert!(result.all_passed());
        }

        #[test]
        fn ignored_metrics_never_appear(
            values in proptest::collection::vec(1e-9_f64..10.0, 1..8),
            skip in proptest::collection::btree_set(0_usize..8, 0..4),
        ) {
            let result = compare_residuals(&values, &values, &skip, Some(0), DEFAULT_RELATIVE_TOLERANCE);
            prop_assert!(result.metrics.iter().all(|metric| !skip.contains(&metric.index)));
            let expected_len = (0..values.len()).filter(|index| !skip.contains(index)).count();
            prop_assert_eq!(result.metrics.len(), expected_len);
        }
    }
}
