use log::{debug, info, warn};

use crate::bucketing::{BucketSeed, MAX_TRAFFIC_VALUE};
use crate::decision::{is_member, normalize_weights, pick_by_weight};
use crate::eval::{EvaluationScratch, RuleEvaluator};
use crate::settings::{Campaign, CampaignType, Feature, Group, GroupMember};
use crate::store::{save_decision, StoredDecision};

/// Decide whether `campaign`, which belongs to the mutually exclusive group `group_id`, may be
/// shown to the user. Only the group's winner passes.
///
/// The winner is taken from this evaluation's scratch if already known, then from the stored
/// group decision, and is resolved fresh otherwise. Fresh resolution only happens when the
/// candidate's own targeting matches.
pub(crate) fn evaluate_group_candidate<'a>(
    evaluator: &RuleEvaluator<'a>,
    feature: &'a Feature,
    campaign: &'a Campaign,
    group_id: u64,
    scratch: &mut EvaluationScratch,
) -> bool {
    let member = campaign.group_member();

    if let Some(winner) = scratch.group_winners.get(&group_id) {
        debug!(
            "Group {} already resolved in this evaluation, winner {:?}",
            group_id, winner
        );
        return *winner == Some(member);
    }

    if scratch.groups_in_progress.contains(&group_id) {
        debug!(
            "Group {} is being resolved; evaluating {} on its own targeting",
            group_id, campaign.key
        );
        return evaluator.pre_segmentation(feature, campaign);
    }

    let group_key = StoredDecision::group_feature_key(group_id);
    if let Some(stored) = evaluator.stored_decision(&group_key) {
        if let Some(campaign_id) = stored.experiment_id {
            let winner = GroupMember {
                campaign_id,
                variation_id: stored.experiment_variation_id,
            };
            info!(
                "Stored winner {} of group {} found for user {}",
                winner,
                group_id,
                evaluator.user_id()
            );
            scratch.group_winners.insert(group_id, Some(winner));
            return winner == member;
        }
    }

    if !evaluator.pre_segmentation(feature, campaign) {
        return false;
    }

    let winner = resolve_group(evaluator, group_id, scratch);
    scratch.group_winners.insert(group_id, winner);
    winner == Some(member)
}

/// Pick the single campaign of a group the user takes part in, and record it.
pub(crate) fn resolve_group<'a>(
    evaluator: &RuleEvaluator<'a>,
    group_id: u64,
    scratch: &mut EvaluationScratch,
) -> Option<GroupMember> {
    let settings = evaluator.settings;
    let group = match settings.groups.get(&group_id) {
        Some(group) => group,
        None => {
            warn!("Group {} referenced by campaignGroups is not defined", group_id);
            return None;
        }
    };

    scratch.groups_in_progress.insert(group_id);
    let (with_storage, eligible) = eligible_campaigns(evaluator, group, scratch);
    scratch.groups_in_progress.remove(&group_id);

    debug!(
        "Group {}: {} campaigns with stored decisions, {} eligible",
        group_id,
        with_storage.len(),
        eligible.len()
    );

    let candidates = if with_storage.is_empty() {
        &eligible
    } else {
        &with_storage
    };
    let winner = select_winner(group, group_id, candidates, evaluator.user_id())?;

    info!(
        "Campaign {} won group {} for user {}",
        winner.key,
        group_id,
        evaluator.user_id()
    );
    if let Some(storage) = evaluator.collaborators.storage() {
        save_decision(
            storage,
            &StoredDecision {
                feature_key: StoredDecision::group_feature_key(group_id),
                user_id: evaluator.user_id().to_string(),
                experiment_id: Some(winner.id),
                experiment_key: Some(winner.key.clone()),
                experiment_variation_id: winner.group_member().variation_id,
                ..Default::default()
            },
        );
    }
    Some(winner.group_member())
}

// Campaigns are gathered from every feature that links one of the group's campaigns. A feature's
// experiments only contribute when its rollouts (if any) let the user through; rollouts listed
// in the group compete on their own targeting and traffic.
fn eligible_campaigns<'a>(
    evaluator: &RuleEvaluator<'a>,
    group: &Group,
    scratch: &mut EvaluationScratch,
) -> (Vec<&'a Campaign>, Vec<&'a Campaign>) {
    let mut with_storage = Vec::new();
    let mut eligible = Vec::new();

    for feature in evaluator.settings.features.iter() {
        let (rollouts, experiments): (Vec<&'a Campaign>, Vec<&'a Campaign>) = feature
            .linked_campaigns
            .iter()
            .filter(|c| group.contains(c))
            .partition(|c| c.kind == CampaignType::Rollout);
        if rollouts.is_empty() && experiments.is_empty() {
            continue;
        }

        let mut candidates = rollouts;
        if !experiments.is_empty() {
            if feature.has_rollout() && evaluator.rollout_decision(feature, scratch).is_none() {
                debug!(
                    "Experiments of feature {} skipped for group resolution, rollout not passed",
                    feature.key
                );
            } else {
                candidates.extend(experiments);
            }
        }

        let stored = evaluator.stored_decision(&feature.key);
        for campaign in candidates {
            let stuck = stored
                .as_ref()
                .map_or(false, |s| is_stored_for(s, campaign));
            if stuck {
                with_storage.push(campaign);
            } else if evaluator.pre_segmentation(feature, campaign)
                && is_member(evaluator.user_id(), campaign)
            {
                eligible.push(campaign);
            }
        }
    }

    (with_storage, eligible)
}

fn is_stored_for(stored: &StoredDecision, campaign: &Campaign) -> bool {
    let (key, variation_id) = if campaign.kind == CampaignType::Rollout {
        (stored.rollout_key.as_deref(), stored.rollout_variation_id)
    } else {
        (stored.experiment_key.as_deref(), stored.experiment_variation_id)
    };
    key == Some(campaign.key.as_str())
        && variation_id.map_or(false, |id| campaign.variation(id).is_some())
}

fn select_winner<'a>(
    group: &Group,
    group_id: u64,
    candidates: &[&'a Campaign],
    user_id: &str,
) -> Option<&'a Campaign> {
    match candidates {
        [] => None,
        [only] => Some(*only),
        _ if group.is_random() => random_winner(group_id, candidates, user_id),
        _ => advanced_winner(group, group_id, candidates, user_id),
    }
}

fn random_winner<'a>(
    group_id: u64,
    candidates: &[&'a Campaign],
    user_id: &str,
) -> Option<&'a Campaign> {
    let share = round_to_4_places(100.0 / candidates.len() as f64);
    let weighted: Vec<(usize, f64)> = (0..candidates.len()).map(|i| (i, share)).collect();
    let value = BucketSeed::Group(group_id).bucket(user_id, MAX_TRAFFIC_VALUE);
    pick_by_weight(&weighted, value).map(|i| candidates[i])
}

/// Priority list first; campaigns without priority compete by the group's weights.
fn advanced_winner<'a>(
    group: &Group,
    group_id: u64,
    candidates: &[&'a Campaign],
    user_id: &str,
) -> Option<&'a Campaign> {
    for entry in &group.p {
        let prioritized = candidates.iter().find(|c| {
            let member = c.group_member();
            *entry == member || *entry == member.plain()
        });
        if let Some(campaign) = prioritized {
            debug!("Campaign {} wins group {} by priority", campaign.key, group_id);
            return Some(*campaign);
        }
    }

    let weighted: Vec<(&'a Campaign, f64)> = candidates
        .iter()
        .filter_map(|c| group.weight_of(c).map(|w| (*c, w)))
        .collect();
    let weights: Vec<f64> = weighted.iter().map(|(_, w)| *w).collect();
    let normalized: Vec<(usize, f64)> = normalize_weights(&weights).into_iter().enumerate().collect();
    let value = BucketSeed::Group(group_id).bucket(user_id, MAX_TRAFFIC_VALUE);
    pick_by_weight(&normalized, value).map(|i| weighted[i].0)
}

fn round_to_4_places(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::UserContextBuilder;
    use crate::services::Collaborators;
    use crate::settings::Settings;
    use crate::store::{load_decision, InMemoryStorage, Storage};
    use crate::test_common::{group_settings, settings_from_json};
    use serde_json::json;
    use spectral::prelude::*;

    fn resolve(
        settings: &Settings,
        collaborators: &Collaborators,
        user_id: &str,
    ) -> Option<GroupMember> {
        let context = UserContextBuilder::new(user_id).build();
        let evaluator = RuleEvaluator::new(settings, &context, collaborators);
        let mut scratch = EvaluationScratch::default();
        resolve_group(&evaluator, 7, &mut scratch)
    }

    #[test]
    fn random_group_winner_is_stable_and_recorded() {
        let settings = group_settings(1, json!([]), json!({}));
        let storage = Arc::new(InMemoryStorage::new());
        let collaborators = Collaborators {
            storage: Some(storage.clone()),
            ..Default::default()
        };

        let first = resolve(&settings, &collaborators, "u1");
        assert_that!(first).is_some();
        assert_eq!(resolve(&settings, &collaborators, "u1"), first);

        let stored = load_decision(storage.as_ref(), "_vwo_meta_meg_7", "u1").expect("stored");
        assert_eq!(stored.experiment_id, first.map(|m| m.campaign_id));
        assert_eq!(stored.experiment_variation_id, None);
    }

    #[test]
    fn random_group_splits_users() {
        let settings = group_settings(1, json!([]), json!({}));
        let collaborators = Collaborators::default();
        let mut first_wins = 0;
        for i in 0..2_000 {
            match resolve(&settings, &collaborators, &format!("user-{}", i)) {
                Some(GroupMember { campaign_id: 101, .. }) => first_wins += 1,
                Some(GroupMember { campaign_id: 201, .. }) => (),
                other => panic!("unexpected winner {:?}", other),
            }
        }
        assert_that!(first_wins).is_greater_than(850);
        assert_that!(first_wins).is_less_than(1_150);
    }

    #[test]
    fn advanced_group_prefers_priority() {
        let settings = group_settings(2, json!(["201", "101"]), json!({"101": 100, "201": 0}));
        let collaborators = Collaborators::default();
        for user in ["u1", "u2", "alice"] {
            assert_that!(resolve(&settings, &collaborators, user).map(|m| m.campaign_id))
                .contains_value(201);
        }
    }

    #[test]
    fn advanced_group_falls_back_to_weights() {
        let settings = group_settings(2, json!(["999"]), json!({"101": 0, "201": 100}));
        let collaborators = Collaborators::default();
        for user in ["u1", "u2", "alice"] {
            assert_that!(resolve(&settings, &collaborators, user).map(|m| m.campaign_id))
                .contains_value(201);
        }
    }

    #[test]
    fn stored_experiment_takes_priority() {
        let settings = group_settings(2, json!(["101"]), json!({}));
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .set(
                "feature-b_u1",
                json!({"featureKey": "feature-b", "userId": "u1",
                       "experimentId": 201, "experimentKey": "b_test", "experimentVariationId": 1}),
            )
            .unwrap();
        let collaborators = Collaborators {
            storage: Some(storage),
            ..Default::default()
        };
        assert_that!(resolve(&settings, &collaborators, "u1").map(|m| m.campaign_id))
            .contains_value(201);
    }

    // Both features' campaigns get no fresh traffic, so only stored decisions make them eligible.
    fn stored_siblings(
        et: u8,
        p: serde_json::Value,
        wt: serde_json::Value,
        user_id: &str,
    ) -> (Settings, Collaborators) {
        let mut settings = group_settings(et, p, wt);
        for feature in settings.features.iter_mut() {
            for campaign in feature.linked_campaigns.iter_mut() {
                campaign.percent_traffic = 0.0;
            }
        }
        let storage = Arc::new(InMemoryStorage::new());
        for (feature_key, campaign_id, campaign_key) in
            [("feature-a", 101, "a_test"), ("feature-b", 201, "b_test")]
        {
            storage
                .set(
                    &format!("{}_{}", feature_key, user_id),
                    json!({"featureKey": feature_key, "userId": user_id,
                           "experimentId": campaign_id, "experimentKey": campaign_key,
                           "experimentVariationId": 2}),
                )
                .unwrap();
        }
        let collaborators = Collaborators {
            storage: Some(storage),
            ..Default::default()
        };
        (settings, collaborators)
    }

    #[test]
    fn stored_siblings_share_random_group_equally() {
        // "7_u1" buckets to 8521 of 10000, "7_u2" to 4271
        let (settings, collaborators) = stored_siblings(1, json!([]), json!({}), "u1");
        assert_that!(resolve(&settings, &collaborators, "u1").map(|m| m.campaign_id))
            .contains_value(201);
        let (settings, collaborators) = stored_siblings(1, json!([]), json!({}), "u2");
        assert_that!(resolve(&settings, &collaborators, "u2").map(|m| m.campaign_id))
            .contains_value(101);
    }

    #[test]
    fn stored_siblings_in_advanced_group() {
        let (settings, collaborators) =
            stored_siblings(2, json!(["999", "101"]), json!({"101": 0, "201": 100}), "u1");
        assert_that!(resolve(&settings, &collaborators, "u1").map(|m| m.campaign_id))
            .contains_value(101);

        let (settings, collaborators) =
            stored_siblings(2, json!(["999"]), json!({"101": 0, "201": 100}), "u1");
        assert_that!(resolve(&settings, &collaborators, "u1").map(|m| m.campaign_id))
            .contains_value(201);
    }

    #[test]
    fn fresh_siblings_without_stored_decisions_have_no_winner() {
        let mut settings = group_settings(1, json!([]), json!({}));
        for feature in settings.features.iter_mut() {
            for campaign in feature.linked_campaigns.iter_mut() {
                campaign.percent_traffic = 0.0;
            }
        }
        assert_that!(resolve(&settings, &Collaborators::default(), "u1")).is_none();
    }

    #[test]
    fn personalize_variation_wins_by_priority() {
        let settings = settings_from_json(json!({
            "accountId": 999,
            "campaigns": [{"id": 30, "key": "p_personalize", "type": "FLAG_PERSONALIZE",
                           "variations": [{"id": 1, "key": "one", "weight": 100},
                                          {"id": 2, "key": "two", "weight": 100}]}],
            "features": [{"id": 1, "key": "feature-p", "rules": [
                {"ruleKey": "first", "campaignId": 30, "variationId": 1, "type": "FLAG_PERSONALIZE"},
                {"ruleKey": "second", "campaignId": 30, "variationId": 2, "type": "FLAG_PERSONALIZE"}
            ]}],
            "groups": {"7": {"campaigns": ["30_1", "30_2"], "et": 2, "p": ["30_2"]}},
            "campaignGroups": {"30_1": 7, "30_2": 7}
        }));
        let storage = Arc::new(InMemoryStorage::new());
        let collaborators = Collaborators {
            storage: Some(storage.clone()),
            ..Default::default()
        };

        assert_that!(resolve(&settings, &collaborators, "u1")).contains_value(GroupMember {
            campaign_id: 30,
            variation_id: Some(2),
        });
        let stored = load_decision(storage.as_ref(), "_vwo_meta_meg_7", "u1").expect("stored");
        assert_eq!(stored.experiment_id, Some(30));
        assert_eq!(stored.experiment_variation_id, Some(2));

        let context = UserContextBuilder::new("u1").build();
        let evaluator = RuleEvaluator::new(&settings, &context, &collaborators);
        let feature = settings.feature("feature-p").unwrap();
        let mut scratch = EvaluationScratch::default();
        assert!(!evaluate_group_candidate(
            &evaluator,
            feature,
            &feature.linked_campaigns[0],
            7,
            &mut scratch
        ));
        assert!(evaluate_group_candidate(
            &evaluator,
            feature,
            &feature.linked_campaigns[1],
            7,
            &mut scratch
        ));
    }

    #[test]
    fn grouped_rollout_competes_on_its_own_targeting() {
        let settings = settings_from_json(json!({
            "accountId": 999,
            "campaigns": [{"id": 11, "key": "f_rollout", "type": "FLAG_ROLLOUT",
                           "variations": [{"id": 1, "key": "default", "weight": 100}]}],
            "features": [{"id": 1, "key": "f",
                          "rules": [{"ruleKey": "rollout", "campaignId": 11, "type": "FLAG_ROLLOUT"}]}],
            "groups": {"7": {"campaigns": ["11"], "et": 1}},
            "campaignGroups": {"11": 7}
        }));
        assert_that!(resolve(&settings, &Collaborators::default(), "u1").map(|m| m.campaign_id))
            .contains_value(11);
    }

    #[test]
    fn undefined_group_has_no_winner() {
        let settings = settings_from_json(json!({"accountId": 1}));
        assert_that!(resolve(&settings, &Collaborators::default(), "u1")).is_none();
    }

    #[test]
    fn candidate_passes_only_when_it_wins() {
        let settings = group_settings(2, json!(["201"]), json!({}));
        let storage = Arc::new(InMemoryStorage::new());
        let collaborators = Collaborators {
            storage: Some(storage.clone()),
            ..Default::default()
        };
        let context = UserContextBuilder::new("u1").build();
        let evaluator = RuleEvaluator::new(&settings, &context, &collaborators);
        let feature_a = settings.feature("feature-a").unwrap();
        let feature_b = settings.feature("feature-b").unwrap();

        let mut scratch = EvaluationScratch::default();
        assert!(!evaluate_group_candidate(
            &evaluator,
            feature_a,
            &feature_a.linked_campaigns[0],
            7,
            &mut scratch
        ));
        assert!(evaluate_group_candidate(
            &evaluator,
            feature_b,
            &feature_b.linked_campaigns[0],
            7,
            &mut scratch
        ));

        // a later evaluation reads the recorded winner
        let mut fresh = EvaluationScratch::default();
        assert!(!evaluate_group_candidate(
            &evaluator,
            feature_a,
            &feature_a.linked_campaigns[0],
            7,
            &mut fresh
        ));
        assert_eq!(
            fresh.group_winners.get(&7).copied().flatten().map(|m| m.campaign_id),
            Some(201)
        );
    }

    #[test]
    fn equal_shares_are_rounded() {
        assert_eq!(round_to_4_places(100.0 / 3.0), 33.3333);
        assert_eq!(round_to_4_places(50.0), 50.0);
    }
}
