//! Column-name canonicalization and batch validation.

use std::collections::{BTreeMap, BTreeSet};

use gridiron_core::{is_absent, json_i32, Row};
use tracing::{debug, warn};

use crate::error::ValidationError;

/// `PassingYards`, `passing yards` and `passing-yards` all become
/// `passing_yards`. Applying it twice yields the same name.
pub fn normalize_column_name(name: &str) -> String {
    let chars: Vec<char> = name.trim().chars().collect();
    let mut spaced = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                spaced.push('_');
            }
        }
        spaced.extend(c.to_lowercase());
    }

    let mut out = String::with_capacity(spaced.len());
    for c in spaced.chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

pub fn normalize_names(rows: Vec<Row>) -> Vec<Row> {
    let mut collisions = BTreeSet::new();
    let rows = rows
        .into_iter()
        .map(|row| {
            let mut out = Row::new();
            for (name, value) in row {
                let normalized = normalize_column_name(&name);
                if out.contains_key(&normalized) {
                    collisions.insert(normalized);
                    continue;
                }
                out.insert(normalized, value);
            }
            out
        })
        .collect();
    if !collisions.is_empty() {
        warn!(?collisions, "columns collapsed onto the same normalized name; kept the first");
    }
    rows
}

/// Renames only columns present in both the row and `map`.
pub fn apply_rename_map(rows: Vec<Row>, map: &BTreeMap<String, String>) -> Vec<Row> {
    if map.is_empty() {
        return rows;
    }
    rows.into_iter()
        .map(|mut row| {
            for (from, to) in map {
                if let Some(value) = row.remove(from) {
                    row.insert(to.clone(), value);
                }
            }
            row
        })
        .collect()
}

fn collect_required(rows: &[Row], fields: &[String], report: &mut ValidationError) {
    for field in fields {
        let mut present = false;
        let mut non_null = false;
        for row in rows {
            if let Some(value) = row.get(field) {
                present = true;
                if !value.is_null() {
                    non_null = true;
                    break;
                }
            }
        }
        if !present {
            report.missing.push(field.clone());
            report.push(format!("missing required field: {field}"));
        } else if !non_null {
            report.all_null.push(field.clone());
            report.push(format!("required field entirely null: {field}"));
        }
    }
}

fn collect_key_domain(rows: &[Row], report: &mut ValidationError) {
    for column in ["season", "week"] {
        let mut negative = 0usize;
        let mut first_negative = None;
        let mut malformed = 0usize;
        let mut first_malformed = None;
        for (idx, row) in rows.iter().enumerate() {
            let value = row.get(column);
            if is_absent(value) {
                continue;
            }
            match value.and_then(json_i32) {
                Some(v) if v < 0 => {
                    negative += 1;
                    first_negative.get_or_insert(idx);
                }
                Some(_) => {}
                None => {
                    malformed += 1;
                    first_malformed.get_or_insert(idx);
                }
            }
        }
        if let Some(first) = first_negative {
            report.push(format!(
                "{column} has {negative} negative value(s), first at row {first}; negative values are reserved for absent keys"
            ));
        }
        if let Some(first) = first_malformed {
            report.push(format!(
                "{column} has {malformed} non-integer value(s), first at row {first}"
            ));
        }
    }
}

/// Fails listing every missing field and every present-but-all-null field.
pub fn validate_required(dataset: &str, rows: &[Row], fields: &[String]) -> Result<(), ValidationError> {
    let mut report = ValidationError::new(dataset);
    collect_required(rows, fields, &mut report);
    if report.is_empty() {
        Ok(())
    } else {
        Err(report)
    }
}

/// Rejects explicit season/week values that would alias the absent-key sentinel.
pub fn check_key_domain(dataset: &str, rows: &[Row]) -> Result<(), ValidationError> {
    let mut report = ValidationError::new(dataset);
    collect_key_domain(rows, &mut report);
    if report.is_empty() {
        Ok(())
    } else {
        Err(report)
    }
}

/// Runs both checks and reports everything found in one error.
pub fn validate_batch(dataset: &str, rows: &[Row], required: &[String]) -> Result<(), ValidationError> {
    let mut report = ValidationError::new(dataset);
    collect_required(rows, required, &mut report);
    collect_key_domain(rows, &mut report);
    if report.is_empty() {
        debug!(dataset, rows = rows.len(), "batch validated");
        Ok(())
    } else {
        Err(report)
    }
}

/// Normalizes column names then applies the dataset's rename map.
pub fn normalize_rows(rows: Vec<Row>, rename_map: &BTreeMap<String, String>) -> Vec<Row> {
    let renamed: BTreeMap<String, String> = rename_map
        .iter()
        .map(|(from, to)| (normalize_column_name(from), to.clone()))
        .collect();
    apply_rename_map(normalize_names(rows), &renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn column_names_are_canonical_and_idempotent() {
        let cases = [
            ("PassingYards", "passing_yards"),
            ("passing yards", "passing_yards"),
            ("  Passing--Yards ", "passing_yards"),
            ("_player_id_", "player_id"),
            ("gsisID", "gsis_id"),
            ("HTTPStatus", "http_status"),
            ("week2Total", "week2_total"),
        ];
        for (input, expected) in cases {
            let once = normalize_column_name(input);
            assert_eq!(once, expected, "normalizing {input:?}");
            assert_eq!(normalize_column_name(&once), once);
        }
    }

    #[test]
    fn rename_map_only_touches_present_columns() {
        let rows = vec![row(json!({"recent_team": "KC", "season": 2024}))];
        let map = BTreeMap::from([
            ("recent_team".to_string(), "team".to_string()),
            ("club".to_string(), "club_code".to_string()),
        ]);
        let out = apply_rename_map(rows, &map);
        assert_eq!(out[0], row(json!({"team": "KC", "season": 2024})));
    }

    #[test]
    fn normalize_rows_matches_rename_keys_after_normalizing() {
        let rows = vec![row(json!({"RecentTeam": "BUF"}))];
        let map = BTreeMap::from([("RecentTeam".to_string(), "team".to_string())]);
        assert_eq!(normalize_rows(rows, &map)[0], row(json!({"team": "BUF"})));
    }

    #[test]
    fn required_field_report_lists_every_problem() {
        let rows = vec![
            row(json!({"season": 2024, "player_id": null})),
            row(json!({"season": 2024, "player_id": null})),
        ];
        let fields = vec!["season".to_string(), "player_id".to_string(), "week".to_string()];
        let err = validate_required("weekly_player_stats", &rows, &fields).unwrap_err();
        assert_eq!(err.missing, vec!["week"]);
        assert_eq!(err.all_null, vec!["player_id"]);
        assert_eq!(err.problems.len(), 2);
    }

    #[test]
    fn negative_keys_are_rejected() {
        let rows = vec![
            row(json!({"season": 2024, "week": 1})),
            row(json!({"season": 2024, "week": -1})),
        ];
        let err = check_key_domain("injuries", &rows).unwrap_err();
        assert_eq!(err.problems.len(), 1);
        assert!(err.problems[0].starts_with("week has 1 negative value(s), first at row 1"));
        assert!(check_key_domain("injuries", &rows[..1]).is_ok());
    }

    #[test]
    fn non_integer_keys_are_rejected_but_absent_keys_pass() {
        let rows = vec![
            row(json!({"season": 2024, "week": "WC"})),
            row(json!({"season": 2024, "week": 10.5})),
            row(json!({"season": true, "week": 3})),
            row(json!({"season": 2024, "week": null})),
            row(json!({"season": 2024, "week": ""})),
            row(json!({"season": "2024"})),
        ];
        let err = check_key_domain("injuries", &rows).unwrap_err();
        assert_eq!(
            err.problems,
            vec![
                "season has 1 non-integer value(s), first at row 2".to_string(),
                "week has 2 non-integer value(s), first at row 0".to_string(),
            ]
        );
        assert!(check_key_domain("injuries", &rows[3..]).is_ok());
    }

    #[test]
    fn batch_validation_merges_both_checks() {
        let rows = vec![row(json!({"season": -1}))];
        let err = validate_batch("rosters", &rows, &["player_id".to_string()]).unwrap_err();
        assert_eq!(err.problems.len(), 2);
    }
}
