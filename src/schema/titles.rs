// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Human-readable field titles from remote field metadata.

use serde_json::Value;

/// Metadata keys consulted for a title, most preferred first.
pub const TITLE_KEYS: [&str; 7] = [
    "title",
    "formLabel",
    "listLabel",
    "filterLabel",
    "editFormLabel",
    "label",
    "name",
];

/// Language keys tried, in order, when a label is a per-language map.
const LANGUAGE_KEYS: [&str; 4] = ["ru", "en", "de", "ua"];

/// A label is either a plain string or a `{lang: text}` map.
pub fn label_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()).map(str::to_string),
        Value::Object(map) => LANGUAGE_KEYS
            .iter()
            .filter_map(|lang| map.get(*lang))
            .chain(map.values())
            .find_map(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()))
            .map(str::to_string),
        _ => None,
    }
}

/// Pick the display title for a field.
///
/// A candidate that merely repeats the remote field code (user fields
/// report their code as `title`) is skipped in favour of a real label.
/// Falls back to a title synthesized from the local column name.
pub fn display_title(remote_name: &str, meta: &Value, column_name: &str) -> String {
    TITLE_KEYS
        .iter()
        .filter_map(|key| meta.get(*key).and_then(label_to_string))
        .find(|title| !title.eq_ignore_ascii_case(remote_name))
        .unwrap_or_else(|| humanize(column_name))
}

/// `uf_crm_1_amount` becomes `Uf Crm 1 Amount`.
pub fn humanize(column_name: &str) -> String {
    let spaced = column_name.replace('_', " ");
    let mut out = String::with_capacity(spaced.len());
    let mut prev_alpha = false;
    for ch in spaced.trim().chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}
