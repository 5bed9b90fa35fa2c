//! Wall-clock helpers. Persisted timestamps are Unix epoch based.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_values_agree() {
        let secs = epoch_secs();
        let millis = epoch_millis();
        // Should be after 2024-01-01.
        assert!(secs > 1_704_067_200);
        assert!(millis / 1000 >= secs);
    }
}
