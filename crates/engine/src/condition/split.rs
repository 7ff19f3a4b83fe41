//! Deterministic split-test bucketing

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::definition::Branch;

/// Bucket in `0..100` for a contact, stable for a given salt
///
/// The salt is the condition node id, so two split tests in the same
/// workflow bucket a contact independently.
pub fn bucket(salt: &str, contact_id: Uuid) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(contact_id.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

/// Branch whose cumulative percentage range contains `bucket`
///
/// `branches` must already be sorted by `branch_order`.
pub fn pick<'a>(branches: &[&'a Branch], bucket: u8) -> Option<&'a Branch> {
    let mut upper = 0u32;
    for branch in branches {
        upper += u32::from(branch.percentage.unwrap_or(0));
        if u32::from(bucket) < upper {
            return Some(branch);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches() -> Vec<Branch> {
        vec![
            Branch::new("a", 0).with_percentage(50).to("email_a"),
            Branch::new("b", 1).with_percentage(30).to("email_b"),
            Branch::new("c", 2).with_percentage(20).default_branch().to("email_c"),
        ]
    }

    #[test]
    fn test_bucket_is_stable() {
        let contact = Uuid::now_v7();
        let first = bucket("split-1", contact);
        for _ in 0..10 {
            assert_eq!(bucket("split-1", contact), first);
        }
        assert!(first < 100);
    }

    #[test]
    fn test_pick_uses_cumulative_ranges() {
        let owned = branches();
        let refs: Vec<&Branch> = owned.iter().collect();

        assert_eq!(pick(&refs, 0).map(|b| b.id.as_str()), Some("a"));
        assert_eq!(pick(&refs, 49).map(|b| b.id.as_str()), Some("a"));
        assert_eq!(pick(&refs, 50).map(|b| b.id.as_str()), Some("b"));
        assert_eq!(pick(&refs, 79).map(|b| b.id.as_str()), Some("b"));
        assert_eq!(pick(&refs, 80).map(|b| b.id.as_str()), Some("c"));
        assert_eq!(pick(&refs, 99).map(|b| b.id.as_str()), Some("c"));
    }

    #[test]
    fn test_distribution_is_roughly_proportional() {
        let owned = branches();
        let refs: Vec<&Branch> = owned.iter().collect();
        let mut counts = [0usize; 3];

        for _ in 0..3000 {
            let picked = pick(&refs, bucket("split-1", Uuid::new_v4())).unwrap();
            let idx = owned.iter().position(|b| b.id == picked.id).unwrap();
            counts[idx] += 1;
        }

        // 1500 / 900 / 600 expected
        assert!((1300..1700).contains(&counts[0]), "{:?}", counts);
        assert!((750..1050).contains(&counts[1]), "{:?}", counts);
        assert!((450..750).contains(&counts[2]), "{:?}", counts);
    }
}
