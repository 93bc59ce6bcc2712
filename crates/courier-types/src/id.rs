//! Correlation id generation.
//!
//! Ids combine the current time in milliseconds with a random component, both
//! rendered in base 36, so that ids issued in the same millisecond still differ.
//! Two outstanding calls sharing an id is unsupported.

use rand::Rng;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Allocate a new correlation id.
pub fn next_call_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let random: u64 = rand::thread_rng().gen_range(0..36u64.pow(8));
    format!("{}-{:0>8}", base36(millis), base36(random))
}

fn base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn test_id_shape() {
        let id = next_call_id();
        let (time, random) = id.split_once('-').unwrap();
        assert!(!time.is_empty());
        assert_eq!(random.len(), 8);
        assert!(id.chars().all(|c| c == '-' || c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_rapid_issuance_unique() {
        let ids: HashSet<String> = (0..10_000).map(|_| next_call_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
