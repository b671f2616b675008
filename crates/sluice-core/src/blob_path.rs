//! Destination paths for uploaded blobs.
//!
//! A path must never repeat across channels or calls. The per-call counter
//! comes from the client-wide request counter, and the thread id packs the
//! channel id into the top 16 bits above 48 random bits.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::Rng;

/// File extension of uploaded blobs.
pub const BLOB_EXTENSION: &str = "bdec";

const RANDOM_BITS: u32 = 48;

/// Thread id for a blob: channel id in the upper 16 bits, random below.
pub fn thread_id(channel_id: i16) -> u64 {
    let random: u64 = rand::rng().random_range(0..(1u64 << RANDOM_BITS));
    ((channel_id as u16 as u64) << RANDOM_BITS) | random
}

/// Build `{y}/{m}/{d}/{h}/{min}/{base36 secs}_{prefix}_{thread}_{counter}.bdec`.
pub fn generate_blob_path(
    now: DateTime<Utc>,
    client_prefix: &str,
    thread_id: u64,
    counter: i64,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}_{}_{}_{}.{}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        to_base36(now.timestamp().max(0) as u64),
        client_prefix,
        thread_id,
        counter,
        BLOB_EXTENSION
    )
}

/// Last path segment; stored in the file metadata as its primary id.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_path_layout() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();
        let path = generate_blob_path(now, "pfx_12", 42, 7);
        let expected_secs = to_base36(now.timestamp() as u64);
        assert_eq!(path, format!("2024/3/7/9/5/{}_pfx_12_42_7.bdec", expected_secs));
        assert_eq!(file_name(&path), format!("{}_pfx_12_42_7.bdec", expected_secs));
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000), "s44we8");
    }

    #[test]
    fn test_thread_id_carries_channel_id() {
        assert_eq!(thread_id(5) >> 48, 5);
        assert_eq!(thread_id(-1) >> 48, 0xFFFF);
        assert!(thread_id(0) < (1 << 48));
    }

    proptest! {
        #[test]
        fn prop_paths_unique_across_channels(
            channel_ids in proptest::collection::hash_set(any::<i16>(), 1..8),
            calls in 1usize..50,
        ) {
            // One shared counter for every channel of a client.
            let now = Utc::now();
            let mut counter = 0i64;
            let mut seen = HashSet::new();
            for _ in 0..calls {
                for id in &channel_ids {
                    counter += 1;
                    let path = generate_blob_path(now, "pfx_1", thread_id(*id), counter);
                    prop_assert!(seen.insert(path));
                }
            }
        }

        #[test]
        fn prop_same_counter_distinct_channels(a in any::<i16>(), b in any::<i16>()) {
            prop_assume!(a != b);
            let now = Utc::now();
            prop_assert_ne!(
                generate_blob_path(now, "p", thread_id(a), 1),
                generate_blob_path(now, "p", thread_id(b), 1)
            );
        }
    }
}
