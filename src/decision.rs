use log::debug;

use crate::bucketing::{BucketSeed, MAX_TRAFFIC_PERCENT, MAX_TRAFFIC_VALUE};
use crate::processing::sequential_ranges;
use crate::settings::{Campaign, Variation};

/// Whether the user falls inside the campaign's traffic allocation.
///
/// Single-variation campaigns allocate traffic through their variation's weight and salt; AB
/// campaigns through `percentTraffic` and the campaign salt.
pub fn is_member(user_id: &str, campaign: &Campaign) -> bool {
    let (traffic, salt) = if campaign.kind.is_single_variation() {
        match campaign.variations.first() {
            Some(variation) => (variation.weight, variation.salt()),
            None => return false,
        }
    } else {
        (campaign.percent_traffic, campaign.salt())
    };

    let value = BucketSeed::Campaign {
        id: campaign.id,
        salt,
    }
    .bucket(user_id, MAX_TRAFFIC_PERCENT);
    let member = value != 0 && f64::from(value) <= traffic;
    debug!(
        "User {} bucket value {} for campaign {} with traffic {}: member={}",
        user_id, value, campaign.key, traffic, member
    );
    member
}

/// The variation whose precomputed range holds the user's account-scoped bucket value.
pub fn select_variation<'c>(
    campaign: &'c Campaign,
    account_id: u64,
    user_id: &str,
) -> Option<&'c Variation> {
    let value = BucketSeed::Account {
        id: campaign.id,
        salt: campaign.salt(),
        account_id,
    }
    .bucket(user_id, MAX_TRAFFIC_VALUE);
    campaign
        .variations
        .iter()
        .find(|v| v.bucket_range.map_or(false, |r| r.contains(value)))
}

/// Traffic gate followed by variation choice.
pub fn allot<'c>(user_id: &str, account_id: u64, campaign: &'c Campaign) -> Option<&'c Variation> {
    if !is_member(user_id, campaign) {
        return None;
    }
    if campaign.kind.is_single_variation() {
        campaign.variations.first()
    } else {
        select_variation(campaign, account_id, user_id)
    }
}

/// Lay the candidates' weights end to end over `1..=10000` and return the one whose range
/// holds `bucket_value`.
pub(crate) fn pick_by_weight<T: Copy>(candidates: &[(T, f64)], bucket_value: u32) -> Option<T> {
    let ranges = sequential_ranges(candidates.iter().map(|(_, weight)| *weight));
    candidates
        .iter()
        .zip(ranges)
        .find(|(_, range)| range.map_or(false, |r| r.contains(bucket_value)))
        .map(|((candidate, _), _)| *candidate)
}

/// Rescale weights so they sum to 100. When they sum to nothing, every candidate gets an equal
/// share.
pub(crate) fn normalize_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.iter().map(|w| w / total * 100.0).collect()
    } else if weights.is_empty() {
        Vec::new()
    } else {
        let share = 100.0 / weights.len() as f64;
        vec![share; weights.len()]
    }
}

/// Pick one of several variations whose whitelisting targeting matched the user.
pub(crate) fn whitelisted_variation<'c>(
    campaign: &Campaign,
    matched: &[&'c Variation],
    user_id: &str,
) -> Option<&'c Variation> {
    match matched {
        [] => None,
        [only] => Some(*only),
        _ => {
            let weights: Vec<f64> = matched.iter().map(|v| v.weight).collect();
            let candidates: Vec<(usize, f64)> = normalize_weights(&weights)
                .into_iter()
                .enumerate()
                .collect();
            let value = BucketSeed::Campaign {
                id: campaign.id,
                salt: campaign.salt(),
            }
            .bucket(user_id, MAX_TRAFFIC_VALUE);
            pick_by_weight(&candidates, value).map(|i| matched[i])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::settings_from_json;
    use serde_json::json;
    use spectral::prelude::*;

    fn ab_campaign(percent_traffic: f64, salt: Option<&str>) -> Campaign {
        let settings = settings_from_json(json!({
            "accountId": 999,
            "campaigns": [{
                "id": 123, "key": "test", "type": "FLAG_TESTING",
                "percentTraffic": percent_traffic, "salt": salt,
                "variations": [{"id": 1, "key": "control", "weight": 50},
                               {"id": 2, "key": "variation", "weight": 50}]
            }]
        }));
        settings.campaigns[0].clone()
    }

    fn rollout_campaign(weight: f64) -> Campaign {
        let settings = settings_from_json(json!({
            "accountId": 999,
            "campaigns": [{
                "id": 1, "key": "rollout", "type": "FLAG_ROLLOUT",
                "variations": [{"id": 1, "key": "default", "weight": weight}]
            }]
        }));
        settings.campaigns[0].clone()
    }

    #[test]
    fn membership_uses_percent_bucket() {
        // "123_u1" buckets to 72 of 100
        assert!(is_member("u1", &ab_campaign(72.0, None)));
        assert!(!is_member("u1", &ab_campaign(71.0, None)));
        assert!(!is_member("u1", &ab_campaign(0.0, None)));
        // "1_u1" buckets to 2 of 100
        assert!(is_member("u1", &rollout_campaign(2.0)));
        assert!(!is_member("u1", &rollout_campaign(1.0)));
    }

    #[test]
    fn variation_uses_account_scoped_seed() {
        // "S_999_u1" buckets to 6954 of 10000
        let salted = ab_campaign(100.0, Some("S"));
        assert_that!(select_variation(&salted, 999, "u1").map(|v| v.id)).contains_value(2);
        assert_that!(allot("u1", 999, &salted).map(|v| v.id)).contains_value(2);
    }

    #[test]
    fn rollout_allots_its_only_variation() {
        assert_that!(allot("u1", 999, &rollout_campaign(100.0)).map(|v| v.id)).contains_value(1);
        assert_that!(allot("u1", 999, &rollout_campaign(0.0))).is_none();
    }

    #[test]
    fn ab_split_is_even() {
        let campaign = ab_campaign(100.0, None);
        let mut counts = [0u32; 2];
        for i in 0..10_000 {
            let variation = allot(&format!("user-{}", i), 999, &campaign).expect("allotted");
            counts[(variation.id - 1) as usize] += 1;
        }
        for count in counts {
            assert_that!(count).is_greater_than(4_700);
            assert_that!(count).is_less_than(5_300);
        }
    }

    #[test]
    fn weights_are_normalized() {
        assert_eq!(normalize_weights(&[20.0, 20.0]), vec![50.0, 50.0]);
        assert_eq!(normalize_weights(&[0.0, 0.0, 0.0, 0.0]), vec![25.0; 4]);
        assert_that!(normalize_weights(&[])).is_empty();
    }

    #[test]
    fn pick_by_weight_walks_ranges() {
        let candidates = [("a", 25.0), ("b", 0.0), ("c", 75.0)];
        assert_eq!(pick_by_weight(&candidates, 1), Some("a"));
        assert_eq!(pick_by_weight(&candidates, 2500), Some("a"));
        assert_eq!(pick_by_weight(&candidates, 2501), Some("c"));
        assert_eq!(pick_by_weight(&candidates, 10_000), Some("c"));
        assert_eq!(pick_by_weight(&[("a", 10.0)], 1001), None);
    }

    #[test]
    fn single_whitelisted_variation_wins_outright() {
        let campaign = ab_campaign(100.0, None);
        let only = &campaign.variations[1];
        assert_that!(whitelisted_variation(&campaign, &[only], "u1").map(|v| v.id)).contains_value(2);
        assert_that!(whitelisted_variation(&campaign, &[], "u1")).is_none();
    }

    #[test]
    fn several_whitelisted_variations_are_bucketed() {
        let campaign = ab_campaign(100.0, None);
        let matched: Vec<&Variation> = campaign.variations.iter().collect();
        // "123_u1" buckets to 7130 of 10000
        assert_that!(whitelisted_variation(&campaign, &matched, "u1").map(|v| v.id))
            .contains_value(2);
    }
}
