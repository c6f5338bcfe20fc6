//! Utility functions for identifiers and idempotency keys

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Stable key handed to an external operation so retries of the same step for
/// the same case can be deduplicated on the other side.
pub fn idempotency_key(case_id: &str, activity: &str) -> String {
    sha256::digest(format!("{case_id}:{activity}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_ids_carry_prefix_and_are_unique() {
        let a = new_uuid_to_bech32("case_").unwrap();
        let b = new_uuid_to_bech32("case_").unwrap();

        assert!(a.starts_with("case_1"));
        assert_ne!(a, b);
    }

    #[test]
    fn idempotency_key_is_stable_per_case_and_activity() {
        let first = idempotency_key("case_abc", "disburse_funds");
        let again = idempotency_key("case_abc", "disburse_funds");
        let other = idempotency_key("case_def", "disburse_funds");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(first.len(), 64);
    }
}
