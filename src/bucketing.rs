use std::io::Cursor;

use murmur3::murmur3_32;

/// Seed of the murmur3 hash every bucketing decision uses.
pub const HASH_SEED: u32 = 1;
/// Bucket space for traffic membership, in percent.
pub const MAX_TRAFFIC_PERCENT: u32 = 100;
/// Bucket space for variation, group and whitelisting ranges.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

const HASH_SPACE: f64 = 4_294_967_296.0; // 2^32

/// BucketSeed selects how the per-user bucketing seed is built.
///
/// Campaigns that share a salt produce the same seed for a user, which keeps users consistently
/// placed across sister campaigns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BucketSeed<'a> {
    /// `{groupId}_{userId}`, used to pick a group winner.
    Group(u64),
    /// `{salt or campaignId}_{userId}`, used for traffic membership and whitelisting.
    Campaign { id: u64, salt: Option<&'a str> },
    /// `{salt or campaignId}_{accountId}_{userId}`, used for variation selection.
    Account {
        id: u64,
        salt: Option<&'a str>,
        account_id: u64,
    },
}

impl<'a> BucketSeed<'a> {
    pub fn for_user(&self, user_id: &str) -> String {
        match self {
            BucketSeed::Group(group_id) => format!("{}_{}", group_id, user_id),
            BucketSeed::Campaign { id, salt } => format!("{}_{}", campaign_part(*id, *salt), user_id),
            BucketSeed::Account {
                id,
                salt,
                account_id,
            } => format!("{}_{}_{}", campaign_part(*id, *salt), account_id, user_id),
        }
    }

    /// Shorthand for [bucket_value] over this seed.
    pub fn bucket(&self, user_id: &str, max_value: u32) -> u32 {
        bucket_value(&self.for_user(user_id), max_value)
    }
}

fn campaign_part(id: u64, salt: Option<&str>) -> String {
    match salt.filter(|s| !s.is_empty()) {
        Some(salt) => salt.to_string(),
        None => id.to_string(),
    }
}

pub fn hash(seed: &str) -> u32 {
    murmur3_32(&mut Cursor::new(seed.as_bytes()), HASH_SEED).unwrap_or(0)
}

/// Maps `seed` onto `1..=max_value`.
pub fn bucket_value(seed: &str, max_value: u32) -> u32 {
    scale(hash(seed), max_value)
}

fn scale(hash: u32, max_value: u32) -> u32 {
    let ratio = hash as f64 / HASH_SPACE;
    (max_value as f64 * ratio + 1.0).floor() as u32
}
