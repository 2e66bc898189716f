use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Formats a `SystemTime` as an RFC3339 string, e.g. for log lines
/// and for persisted timestamps.
pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let t: DateTime<Utc> = t.into();
    t.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_roundtrip_format() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1);
        let s = system_time_to_rfc3339(t);
        assert_eq!(s, "1970-01-01T00:00:01+00:00");
    }
}
