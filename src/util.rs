//! Shared utility functions used across the codebase.

/// Current wall-clock time as epoch milliseconds.
///
/// All persisted timestamps (cooldown records, queue entries, lock files)
/// use this representation so files stay comparable across restarts.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Best-effort hostname for lock-file ownership records.
///
/// Reads `$HOSTNAME`, falling back to `/etc/hostname`, falling back to a
/// fixed placeholder. Only used for diagnostics when inspecting a lock left
/// behind by another process.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Ok(contents) = std::fs::read_to_string("/etc/hostname") {
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    "unknown-host".to_string()
}

/// Whole minutes remaining in `ms`, rounding up so a 1 ms residue still
/// reports as one minute in health output.
pub fn ms_to_minutes_ceil(ms: u64) -> u64 {
    ms.div_ceil(60_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after 2020
    }

    #[test]
    fn ms_to_minutes_rounds_up() {
        assert_eq!(ms_to_minutes_ceil(0), 0);
        assert_eq!(ms_to_minutes_ceil(1), 1);
        assert_eq!(ms_to_minutes_ceil(60_000), 1);
        assert_eq!(ms_to_minutes_ceil(60_001), 2);
        assert_eq!(ms_to_minutes_ceil(29 * 60_000), 29);
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }
}
