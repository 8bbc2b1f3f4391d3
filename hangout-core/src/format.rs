//! Formatting helpers shared across presentation surfaces.

use chrono::{DateTime, Utc};

/// Largest count rendered verbatim on a badge
pub const BADGE_MAX: usize = 99;

/// Render an unread count for a tab badge.
///
/// Zero renders nothing; anything above [`BADGE_MAX`] renders as "99+".
pub fn badge_label(count: usize) -> Option<String> {
    match count {
        0 => None,
        n if n > BADGE_MAX => Some(format!("{}+", BADGE_MAX)),
        n => Some(n.to_string()),
    }
}

/// Format a timestamp as relative time (e.g., "2m ago").
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    let now = Utc::now();
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else {
        format!("{}d ago", duration.num_days())
    }
}
