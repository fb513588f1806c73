// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor sanity checks and the freshness-pass day boundary.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};

/// Result of checking a stored cursor against the local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorCheck {
    /// Cursor is plausible; resume from it
    Valid(i64),
    /// Cursor points far beyond anything stored locally (table wiped or
    /// restored from an old backup); restart from zero
    Stale { stored: i64, max_local: i64 },
}

impl CursorCheck {
    pub fn position(&self) -> i64 {
        match self {
            Self::Valid(position) => *position,
            Self::Stale { .. } => 0,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// A cursor more than `margin` past the highest local id is stale.
pub fn check_cursor(stored: i64, max_local_id: Option<i64>, margin: i64) -> CursorCheck {
    let stored = stored.max(0);
    let max_local = max_local_id.unwrap_or(0);
    if stored > max_local.saturating_add(margin) {
        CursorCheck::Stale { stored, max_local }
    } else {
        CursorCheck::Valid(stored)
    }
}

/// Midnight of the current local day, local time being UTC + `offset_minutes`.
pub fn start_of_local_day(now: DateTime<Utc>, offset_minutes: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
    let local_date = now.with_timezone(&offset).date_naive();
    local_date
        .and_time(NaiveTime::MIN)
        .and_local_timezone(offset)
        .single()
        .unwrap_or_else(|| now.with_timezone(&offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cursor_within_margin_is_kept() {
        assert_eq!(check_cursor(1500, Some(1000), 1000), CursorCheck::Valid(1500));
        assert_eq!(check_cursor(2000, Some(1000), 1000), CursorCheck::Valid(2000));
        assert_eq!(check_cursor(0, None, 1000), CursorCheck::Valid(0));
    }

    #[test]
    fn test_cursor_past_margin_resets() {
        let check = check_cursor(2001, Some(1000), 1000);
        assert!(check.is_stale());
        assert_eq!(check.position(), 0);

        // empty table, large cursor
        assert_eq!(check_cursor(50_000, None, 1000).position(), 0);
        // a tighter margin is honoured
        assert!(check_cursor(1011, Some(1000), 10).is_stale());
    }

    #[test]
    fn test_negative_cursor_clamped() {
        assert_eq!(check_cursor(-5, Some(10), 1000), CursorCheck::Valid(0));
    }

    #[test]
    fn test_start_of_local_day() {
        // 22:30 UTC is already the next day at UTC+3
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 22, 30, 0).unwrap();
        let start = start_of_local_day(now, 180);
        assert_eq!(start.to_rfc3339(), "2024-05-02T00:00:00+03:00");

        let start = start_of_local_day(now, 0);
        assert_eq!(start.to_rfc3339(), "2024-05-01T00:00:00+00:00");

        let start = start_of_local_day(Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap(), -300);
        assert_eq!(start.to_rfc3339(), "2024-04-30T00:00:00-05:00");
    }
}
