//! Field-level diff between an entity's previous state and a fresh one.

use std::collections::BTreeSet;

use crate::{FieldMap, FieldValue, Patch};

/// Computes the minimal patch turning `old` into `new`.
///
/// Every key of `new` is compared with type-aware equality (see
/// [`values_equal`]); keys only in `old` are reported as removed and keys only
/// in `new` as added. With no baseline every key of `new` is an addition.
pub fn diff(old: Option<&FieldMap>, new: &FieldMap) -> Patch {
    let mut patch = Patch::new();

    let Some(old) = old else {
        for (field, value) in new {
            patch.record(field.clone(), None, Some(value.clone()));
        }
        return patch;
    };

    for (field, new_value) in new {
        match old.get(field) {
            None => patch.record(field.clone(), None, Some(new_value.clone())),
            Some(old_value) if !values_equal(old_value, new_value) => {
                patch.record(field.clone(), Some(old_value.clone()), Some(new_value.clone()))
            }
            Some(_) => {}
        }
    }

    for (field, old_value) in old {
        if !new.contains_key(field) {
            patch.record(field.clone(), Some(old_value.clone()), None);
        }
    }

    patch
}

/// Type-aware equality. Numbers compare exactly, lists compare as sets, enums
/// compare trimmed and case-folded, and values of different kinds are never
/// equal.
pub fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::String(x), FieldValue::String(y)) => x == y,
        (FieldValue::Number(x), FieldValue::Number(y)) => x == y,
        (FieldValue::Enum(x), FieldValue::Enum(y)) => normalize_enum(x) == normalize_enum(y),
        (FieldValue::StringList(x), FieldValue::StringList(y)) => {
            x.iter().collect::<BTreeSet<_>>() == y.iter().collect::<BTreeSet<_>>()
        }
        (FieldValue::DateTime(x), FieldValue::DateTime(y)) => x == y,
        _ => false,
    }
}

fn normalize_enum(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn map(entries: &[(&str, FieldValue)]) -> FieldMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn sample_state() -> FieldMap {
        map(&[
            ("name", FieldValue::String("Acme Robotics".into())),
            ("total_funding", FieldValue::Number(1_000_000.0)),
            ("funding_stage", FieldValue::Enum("Seed".into())),
            (
                "investors",
                FieldValue::StringList(vec!["A".into(), "B".into()]),
            ),
            (
                "last_funding_date",
                FieldValue::DateTime(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()),
            ),
        ])
    }

    #[test]
    fn identical_states_produce_empty_patch() {
        let state = sample_state();
        assert!(diff(Some(&state), &state).is_empty());
    }

    #[test]
    fn absent_baseline_reports_every_field_as_added() {
        let state = sample_state();
        let patch = diff(None, &state);
        assert_eq!(patch.len(), state.len());
        assert!(patch.iter().all(|(_, change)| change.is_addition()));
    }

    #[test]
    fn list_fields_ignore_order() {
        let old = map(&[(
            "investors",
            FieldValue::StringList(vec!["A".into(), "B".into()]),
        )]);
        let new = map(&[(
            "investors",
            FieldValue::StringList(vec!["B".into(), "A".into()]),
        )]);
        assert!(diff(Some(&old), &new).is_empty());
    }

    #[test]
    fn funding_round_example_reports_both_fields() {
        let old = map(&[
            ("total_funding", FieldValue::Number(1_000_000.0)),
            ("funding_stage", FieldValue::Enum("Seed".into())),
        ]);
        let new = map(&[
            ("total_funding", FieldValue::Number(2_300_000.0)),
            ("funding_stage", FieldValue::Enum("Series A".into())),
        ]);

        let patch = diff(Some(&old), &new);
        assert_eq!(
            patch.to_json(),
            serde_json::json!({
                "total_funding": [1000000, 2300000],
                "funding_stage": ["Seed", "Series A"],
            })
        );
    }

    #[test]
    fn enums_compare_case_and_whitespace_insensitively() {
        let old = map(&[("funding_stage", FieldValue::Enum("Series A".into()))]);
        let new = map(&[("funding_stage", FieldValue::Enum("  series a ".into()))]);
        assert!(diff(Some(&old), &new).is_empty());
    }

    #[test]
    fn plain_strings_are_case_sensitive() {
        let old = map(&[("name", FieldValue::String("Acme".into()))]);
        let new = map(&[("name", FieldValue::String("ACME".into()))]);
        assert_eq!(diff(Some(&old), &new).len(), 1);
    }

    #[test]
    fn numbers_have_no_epsilon() {
        let old = map(&[("total_funding", FieldValue::Number(0.1 + 0.2))]);
        let new = map(&[("total_funding", FieldValue::Number(0.3))]);
        assert_eq!(diff(Some(&old), &new).len(), 1);
    }

    #[test]
    fn removed_and_added_fields_carry_null_sides() {
        let old = map(&[("website", FieldValue::String("https://acme.io".into()))]);
        let new = map(&[("industry", FieldValue::String("Robotics".into()))]);

        let patch = diff(Some(&old), &new);
        assert!(patch.get("website").unwrap().is_removal());
        assert!(patch.get("industry").unwrap().is_addition());
        assert_eq!(
            patch.partial_update().get("website"),
            Some(&None::<FieldValue>)
        );
    }

    #[test]
    fn kind_mismatch_is_a_change_not_an_error() {
        let old = map(&[("funding_stage", FieldValue::String("Seed".into()))]);
        let new = map(&[("funding_stage", FieldValue::Enum("Seed".into()))]);
        let patch = diff(Some(&old), &new);
        assert_eq!(patch.len(), 1);
    }
}
