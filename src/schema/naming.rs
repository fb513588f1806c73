// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local identifier rules.
//!
//! Remote field names are arbitrary strings; local column names must be
//! safe SQL identifiers and unique within their table.
//!
//! ```
//! use crm_mirror::schema::naming::{sanitize_ident, ColumnAllocator};
//!
//! assert_eq!(sanitize_ident("UF_CRM_1700000000"), "uf_crm_1700000000");
//! assert_eq!(sanitize_ident("Сумма"), "field");
//! assert_eq!(sanitize_ident("2nd phone"), "f_2nd_phone");
//!
//! let mut columns = ColumnAllocator::with_reserved();
//! assert_eq!(columns.allocate("title"), "title");
//! assert_eq!(columns.allocate("TITLE"), "title_2");
//! assert_eq!(columns.allocate("ID"), "id_2");
//! ```

use std::collections::HashSet;

/// Longest sanitized identifier, before the digit prefix.
pub const MAX_IDENT_LEN: usize = 55;

/// Columns every entity table has; remote fields never take these names.
pub const RESERVED_COLUMNS: [&str; 4] = ["id", "raw_snapshot", "created_at", "updated_at"];

/// Turn an arbitrary remote name into a safe lowercase SQL identifier.
pub fn sanitize_ident(name: &str) -> String {
    let lowered = name.to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut last_underscore = false;
    for ch in lowered.chars() {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() { ch } else { '_' };
        if ch == '_' {
            if !last_underscore {
                out.push('_');
            }
            last_underscore = true;
        } else {
            out.push(ch);
            last_underscore = false;
        }
    }

    let mut name = out.trim_matches('_').to_string();
    if name.is_empty() {
        name = "field".to_string();
    }
    if name.len() > MAX_IDENT_LEN {
        // ASCII-only at this point, so byte truncation is char-safe
        name.truncate(MAX_IDENT_LEN);
        name = name.trim_end_matches('_').to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name = format!("f_{name}");
    }
    name
}

/// True if `ident` is something [`sanitize_ident`] could have produced.
pub fn is_safe_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident.len() <= MAX_IDENT_LEN + 8
        && ident.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit())
}

/// Hands out unique column names in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ColumnAllocator {
    taken: HashSet<String>,
}

impl ColumnAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An allocator with the base table columns already claimed.
    pub fn with_reserved() -> Self {
        let mut allocator = Self::new();
        for column in RESERVED_COLUMNS {
            allocator.claim(column);
        }
        allocator
    }

    /// Mark a name as used without allocating it.
    pub fn claim(&mut self, column: &str) {
        self.taken.insert(column.to_string());
    }

    pub fn is_taken(&self, column: &str) -> bool {
        self.taken.contains(column)
    }

    /// Sanitize `remote_name` and suffix `_2`, `_3`, ... until unique.
    pub fn allocate(&mut self, remote_name: &str) -> String {
        let base = sanitize_ident(remote_name);
        if self.taken.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_ident("TITLE"), "title");
        assert_eq!(sanitize_ident("UF_CRM_5F3A__AMOUNT"), "uf_crm_5f3a_amount");
        assert_eq!(sanitize_ident("  opportunity-Amount!! "), "opportunity_amount");
        assert_eq!(sanitize_ident("___"), "field");
        assert_eq!(sanitize_ident(""), "field");
    }

    #[test]
    fn test_sanitize_leading_digit() {
        assert_eq!(sanitize_ident("123"), "f_123");
        assert_eq!(sanitize_ident("_9lives"), "f_9lives");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_ident(&long).len(), MAX_IDENT_LEN);

        // truncation point lands right after an underscore
        let name = format!("{}_bbbb", "a".repeat(54));
        assert_eq!(sanitize_ident(&name), "a".repeat(54));
    }

    #[test]
    fn test_sanitize_non_ascii() {
        assert_eq!(sanitize_ident("Дата оплаты"), "field");
        assert_eq!(sanitize_ident("price€usd"), "price_usd");
    }

    #[test]
    fn test_allocator_collisions_in_declaration_order() {
        let mut columns = ColumnAllocator::new();
        assert_eq!(columns.allocate("x"), "x");
        assert_eq!(columns.allocate("X"), "x_2");
        assert_eq!(columns.allocate("x!"), "x_3");
    }

    #[test]
    fn test_allocator_skips_claimed_suffixes() {
        let mut columns = ColumnAllocator::new();
        columns.claim("amount");
        columns.claim("amount_2");
        assert_eq!(columns.allocate("AMOUNT"), "amount_3");
    }

    #[test]
    fn test_reserved_columns() {
        let mut columns = ColumnAllocator::with_reserved();
        assert_eq!(columns.allocate("ID"), "id_2");
        assert_eq!(columns.allocate("UPDATED_AT"), "updated_at_2");
        assert!(columns.is_taken("raw_snapshot"));
    }

    #[test]
    fn test_is_safe_ident() {
        assert!(is_safe_ident("crm_deal"));
        assert!(is_safe_ident("uf_crm_1_2"));
        assert!(!is_safe_ident("drop table"));
        assert!(!is_safe_ident("1abc"));
        assert!(!is_safe_ident(""));
        assert!(!is_safe_ident("a\"b"));
    }
}
