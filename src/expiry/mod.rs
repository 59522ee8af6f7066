// Token lifetime display helpers
use chrono::{DateTime, Utc};

/// Render the time left until `expires_at`, or "EXPIRED"
pub fn format_time_remaining(expires_at: &DateTime<Utc>) -> String {
    let remaining = (*expires_at - Utc::now()).num_seconds();
    if remaining <= 0 {
        return "EXPIRED".to_string();
    }

    let (hours, minutes, seconds) = (remaining / 3600, (remaining % 3600) / 60, remaining % 60);
    match (hours, minutes) {
        (0, 0) => format!("{}s", seconds),
        (0, _) => format!("{}m {}s", minutes, seconds),
        _ => format!("{}h {}m", hours, minutes),
    }
}

/// True when the token is still valid but inside the refresh window
pub fn is_expiring_soon(expires_at: &DateTime<Utc>, window_seconds: i64) -> bool {
    let remaining = (*expires_at - Utc::now()).num_seconds();
    remaining > 0 && remaining < window_seconds
}
