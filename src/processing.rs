use log::warn;

use crate::bucketing::MAX_TRAFFIC_VALUE;
use crate::settings::{BucketRange, Campaign, Rule, Settings, Variation};
use crate::util::weight_to_units;

/// Prepare a freshly fetched snapshot for evaluation: compute every variation's bucket range,
/// resolve each feature's rules into linked campaigns, and flag features whose targeting needs
/// gateway-resolved attributes.
///
/// Running this twice on the same snapshot is a no-op.
pub fn process_settings(settings: &mut Settings) {
    if settings.processed {
        return;
    }

    for campaign in settings.campaigns.iter_mut() {
        assign_campaign_ranges(campaign);
    }

    let campaigns = &settings.campaigns;
    for feature in settings.features.iter_mut() {
        let linked: Vec<Campaign> = feature
            .rules
            .iter()
            .filter_map(|rule| link_rule(campaigns, rule, &feature.key))
            .collect();
        feature.is_gateway_service_required = linked.iter().any(|campaign| {
            campaign
                .pre_segmentation()
                .map_or(false, |segments| segments.requires_gateway())
        });
        feature.linked_campaigns = linked;
    }

    settings.processed = true;
}

fn assign_campaign_ranges(campaign: &mut Campaign) {
    if campaign.kind.is_single_variation() {
        for variation in campaign.variations.iter_mut() {
            let end = (variation.weight * 100.0).floor();
            variation.bucket_range = if end >= 1.0 {
                Some(BucketRange {
                    start: 1,
                    end: end.min(MAX_TRAFFIC_VALUE as f64) as u32,
                })
            } else {
                None
            };
        }
    } else {
        assign_sequential_ranges(&mut campaign.variations);
    }
}

/// Lay variations end to end over the bucket space in declaration order, each taking
/// `ceil(weight * 100)` units. A variation without units gets no range.
pub(crate) fn assign_sequential_ranges(variations: &mut [Variation]) {
    let ranges = sequential_ranges(variations.iter().map(|v| v.weight));
    for (variation, range) in variations.iter_mut().zip(ranges) {
        variation.bucket_range = range;
    }
}

pub(crate) fn sequential_ranges<I>(weights: I) -> Vec<Option<BucketRange>>
where
    I: IntoIterator<Item = f64>,
{
    let mut allocated = 0;
    weights
        .into_iter()
        .map(|weight| {
            let units = weight_to_units(weight).min(MAX_TRAFFIC_VALUE);
            if units == 0 {
                return None;
            }
            let range = BucketRange {
                start: allocated + 1,
                end: allocated + units,
            };
            allocated += units;
            Some(range)
        })
        .collect()
}

fn link_rule(campaigns: &[Campaign], rule: &Rule, feature_key: &str) -> Option<Campaign> {
    let campaign = match campaigns.iter().find(|c| c.id == rule.campaign_id) {
        Some(campaign) => campaign,
        None => {
            warn!(
                "Rule {} of feature {} references unknown campaign {}; dropping it",
                rule.rule_key, feature_key, rule.campaign_id
            );
            return None;
        }
    };

    let mut linked = campaign.clone();
    linked.rule_key = Some(rule.rule_key.clone());
    if let Some(variation_id) = rule.variation_id {
        linked.variations.retain(|v| v.id == variation_id);
        if linked.variations.is_empty() {
            warn!(
                "Rule {} of feature {} narrows campaign {} to unknown variation {}",
                rule.rule_key, feature_key, campaign.id, variation_id
            );
        }
    }
    Some(linked)
}
