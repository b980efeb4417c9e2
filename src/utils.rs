use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since the Unix epoch, 0 if the clock is
/// set before it.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock time in nanoseconds since the Unix epoch. Used as the capture
/// timestamp of ingress frames.
pub fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_agree() {
        let ms = epoch_millis();
        let ns = epoch_nanos();
        assert!(ns / 1_000_000 >= ms);
        assert!(ns / 1_000_000 - ms < 1_000);
    }
}
