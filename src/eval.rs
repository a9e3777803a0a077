use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::EvaluatorConfig;
use crate::context::UserContext;
use crate::decision::{allot, whitelisted_variation};
use crate::list_cache::ListMembershipCache;
use crate::meg::evaluate_group_candidate;
use crate::segment::{SegmentEvaluator, VWO_USER_ID_ATTRIBUTE};
use crate::services::{
    AttributeListService, AttributeProvider, Collaborators, ContextAttributeProvider, Impression,
    ImpressionKind, ImpressionSink,
};
use crate::settings::{Campaign, Feature, GroupMember, Settings, Variable, Variation};
use crate::store::{load_decision, save_decision, Storage, StoredDecision};
use crate::AttributeValue;

const VWO_NAMESPACE_URL: &str = "https://vwo.com";
const IMPACT_DISABLED_VARIATION: u64 = 1;
const IMPACT_ENABLED_VARIATION: u64 = 2;

/// The outcome of evaluating a feature flag for a user.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FlagResult {
    enabled: bool,
    variables: Vec<Variable>,
}

impl FlagResult {
    fn disabled() -> Self {
        Self::default()
    }

    fn enabled(variation: &Variation) -> Self {
        Self {
            enabled: true,
            variables: variation.variables.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// The value of the variable named `key`, if the chosen variation defines one.
    pub fn variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.iter().find(|v| v.key == key).map(|v| &v.value)
    }
}

/// A Detail combines the result of a flag evaluation with an explanation of how it was reached.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail {
    pub result: FlagResult,
    pub reason: Reason,
}

impl Detail {
    fn err(error: Error) -> Detail {
        Detail {
            result: FlagResult::disabled(),
            reason: Reason::Error { error },
        }
    }
}

/// Reason describes the main factor behind an evaluation result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// A decision stored by an earlier evaluation was reused.
    #[serde(rename_all = "camelCase")]
    StoredVariation {
        campaign_key: String,
        variation_id: u64,
    },
    /// The user matched a variation's whitelisting targeting.
    #[serde(rename_all = "camelCase")]
    Whitelisted { campaign_id: u64, variation_id: u64 },
    /// The user passed a rollout and no experiment applied.
    #[serde(rename_all = "camelCase")]
    Rollout { campaign_id: u64, variation_id: u64 },
    /// The user was allotted a variation of an experiment.
    #[serde(rename_all = "camelCase")]
    Experiment { campaign_id: u64, variation_id: u64 },
    /// The feature has rollouts and the user passed none of them.
    RolloutNotPassed,
    /// No rollout or experiment let the user through.
    NoExperimentMatched,
    /// The flag could not be evaluated.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

/// Error is carried by [Reason::Error] when a flag could not be evaluated. The result is then
/// always disabled.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// The feature key did not match any feature of the settings.
    FeatureNotFound,
    /// The user context had a blank id.
    InvalidContext,
}

/// Rollout decision of one feature, remembered for the rest of an evaluation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RolloutOutcome {
    campaign_id: u64,
    variation_id: u64,
}

/// State scoped to a single flag evaluation, shared with the group resolution it triggers.
#[derive(Default)]
pub(crate) struct EvaluationScratch {
    pub(crate) evaluated_features: HashMap<String, Option<RolloutOutcome>>,
    pub(crate) group_winners: HashMap<u64, Option<GroupMember>>,
    pub(crate) groups_in_progress: HashSet<u64>,
}

/// Evaluates feature flags against a settings snapshot.
///
/// The evaluator holds the collaborators (storage, list service, attribute provider, impression
/// sink) and is cheap to share between threads; every call works on its own scratch state.
pub struct Evaluator {
    collaborators: Collaborators,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn builder() -> EvaluatorBuilder {
        EvaluatorBuilder::new()
    }

    /// Decide whether `feature_key` is enabled for the user and with which variables. Failures
    /// are logged and yield a disabled result.
    pub fn evaluate_flag(
        &self,
        settings: &Settings,
        feature_key: &str,
        context: &UserContext,
    ) -> FlagResult {
        self.evaluate_flag_detail(settings, feature_key, context).result
    }

    /// Like [Evaluator::evaluate_flag], with the reason for the result.
    pub fn evaluate_flag_detail(
        &self,
        settings: &Settings,
        feature_key: &str,
        context: &UserContext,
    ) -> Detail {
        if context.id().trim().is_empty() {
            error!("Cannot evaluate {}: user id is blank", feature_key);
            return Detail::err(Error::InvalidContext);
        }
        let feature = match settings.feature(feature_key) {
            Some(feature) => feature,
            None => {
                error!("Feature {} not found in settings", feature_key);
                return Detail::err(Error::FeatureNotFound);
            }
        };
        if !settings.is_processed() {
            warn!("Evaluating {} against settings that were not processed", feature_key);
        }

        let evaluator = RuleEvaluator::new(settings, context, &self.collaborators);
        let mut scratch = EvaluationScratch::default();
        let stored = evaluator.stored_decision(&feature.key);

        if let Some(detail) = stored
            .as_ref()
            .and_then(|stored| stored_experiment(settings, stored))
        {
            return detail;
        }

        let mut decision = StoredDecision {
            feature_key: feature.key.clone(),
            user_id: context.id().to_string(),
            ..Default::default()
        };
        let mut outcome = None;

        let stored_rollout = stored
            .as_ref()
            .and_then(|stored| stored_rollout(settings, stored));
        if let Some((campaign, variation)) = stored_rollout {
            info!(
                "Stored rollout {} found for feature {} and user {}",
                campaign.key,
                feature.key,
                context.id()
            );
            scratch.evaluated_features.insert(
                feature.key.clone(),
                Some(RolloutOutcome {
                    campaign_id: campaign.id,
                    variation_id: variation.id,
                }),
            );
            record_rollout(&mut decision, campaign, variation);
            outcome = Some((
                FlagResult::enabled(variation),
                Reason::StoredVariation {
                    campaign_key: campaign.key.clone(),
                    variation_id: variation.id,
                },
            ));
        } else if feature.has_rollout() {
            match evaluator.rollout_decision(feature, &mut scratch) {
                Some((campaign, variation)) => {
                    info!(
                        "User {} passed rollout {} of feature {}",
                        context.id(),
                        campaign.key,
                        feature.key
                    );
                    self.notify(feature, campaign.id, variation.id, context, ImpressionKind::Rollout);
                    record_rollout(&mut decision, campaign, variation);
                    outcome = Some((
                        FlagResult::enabled(variation),
                        Reason::Rollout {
                            campaign_id: campaign.id,
                            variation_id: variation.id,
                        },
                    ));
                }
                None => {
                    info!(
                        "User {} passed no rollout of feature {}",
                        context.id(),
                        feature.key
                    );
                    self.notify_impact(feature, false, context);
                    return Detail {
                        result: FlagResult::disabled(),
                        reason: Reason::RolloutNotPassed,
                    };
                }
            }
        }

        if let Some((campaign, variation, whitelisted)) =
            evaluator.experiment_decision(feature, &mut scratch)
        {
            let (kind, reason) = if whitelisted {
                (
                    ImpressionKind::Whitelisted,
                    Reason::Whitelisted {
                        campaign_id: campaign.id,
                        variation_id: variation.id,
                    },
                )
            } else {
                (
                    ImpressionKind::Experiment,
                    Reason::Experiment {
                        campaign_id: campaign.id,
                        variation_id: variation.id,
                    },
                )
            };
            self.notify(feature, campaign.id, variation.id, context, kind);
            decision.experiment_id = Some(campaign.id);
            decision.experiment_key = Some(campaign.key.clone());
            decision.experiment_variation_id = Some(variation.id);
            outcome = Some((FlagResult::enabled(variation), reason));
        }

        let (result, reason) =
            outcome.unwrap_or_else(|| (FlagResult::disabled(), Reason::NoExperimentMatched));
        if result.is_enabled() {
            if let Some(storage) = self.collaborators.storage() {
                save_decision(storage, &decision);
            }
        }
        self.notify_impact(feature, result.is_enabled(), context);
        debug!(
            "Feature {} evaluated for user {}: {:?}",
            feature.key,
            context.id(),
            reason
        );
        Detail { result, reason }
    }

    fn notify(
        &self,
        feature: &Feature,
        campaign_id: u64,
        variation_id: u64,
        context: &UserContext,
        kind: ImpressionKind,
    ) {
        if !self.config.impressions_enabled() {
            return;
        }
        if let Some(sink) = &self.collaborators.impression_sink {
            sink.notify(Impression {
                feature_key: feature.key.clone(),
                campaign_id,
                variation_id,
                user_id: context.id().to_string(),
                kind,
                created_at: Utc::now(),
            });
        }
    }

    fn notify_impact(&self, feature: &Feature, enabled: bool, context: &UserContext) {
        if let Some(impact) = &feature.impact_campaign {
            let variation_id = if enabled {
                IMPACT_ENABLED_VARIATION
            } else {
                IMPACT_DISABLED_VARIATION
            };
            self.notify(
                feature,
                impact.campaign_id,
                variation_id,
                context,
                ImpressionKind::Impact,
            );
        }
    }
}

fn stored_experiment(settings: &Settings, stored: &StoredDecision) -> Option<Detail> {
    let key = stored.experiment_key.as_deref()?;
    let variation_id = stored.experiment_variation_id?;
    match settings.variation_by_campaign_key(key, variation_id) {
        Some((campaign, variation)) => {
            info!(
                "Stored variation {} of campaign {} found for user {}",
                variation.key, campaign.key, stored.user_id
            );
            Some(Detail {
                result: FlagResult::enabled(variation),
                reason: Reason::StoredVariation {
                    campaign_key: campaign.key.clone(),
                    variation_id: variation.id,
                },
            })
        }
        None => {
            warn!(
                "Stored variation {} of campaign {} no longer exists; evaluating afresh",
                variation_id, key
            );
            None
        }
    }
}

fn stored_rollout<'a>(
    settings: &'a Settings,
    stored: &StoredDecision,
) -> Option<(&'a Campaign, &'a Variation)> {
    if !stored.has_rollout() {
        return None;
    }
    let key = stored.rollout_key.as_deref()?;
    let variation_id = stored.rollout_variation_id?;
    let found = settings.variation_by_campaign_key(key, variation_id);
    if found.is_none() {
        warn!(
            "Stored rollout variation {} of campaign {} no longer exists; evaluating afresh",
            variation_id, key
        );
    }
    found
}

fn record_rollout(decision: &mut StoredDecision, campaign: &Campaign, variation: &Variation) {
    decision.rollout_id = Some(campaign.id);
    decision.rollout_key = Some(campaign.key.clone());
    decision.rollout_variation_id = Some(variation.id);
}

/// The bucketing id a campaign sees for the user: a name-based UUID scoped to the account when
/// the campaign targets user lists, the raw id otherwise.
pub fn bucketing_user_id(account_id: u64, user_id: &str, is_user_list_enabled: bool) -> String {
    if !is_user_list_enabled {
        return user_id.to_string();
    }
    let vwo_namespace = Uuid::new_v5(&Uuid::NAMESPACE_URL, VWO_NAMESPACE_URL.as_bytes());
    let account_namespace = Uuid::new_v5(&vwo_namespace, account_id.to_string().as_bytes());
    Uuid::new_v5(&account_namespace, user_id.as_bytes())
        .simple()
        .to_string()
        .to_uppercase()
}

/// Walks a feature's rules for one user: rollouts, then experiments with whitelisting and group
/// resolution.
pub(crate) struct RuleEvaluator<'a> {
    pub(crate) settings: &'a Settings,
    pub(crate) context: &'a UserContext,
    pub(crate) collaborators: &'a Collaborators,
}

impl<'a> RuleEvaluator<'a> {
    pub(crate) fn new(
        settings: &'a Settings,
        context: &'a UserContext,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            settings,
            context,
            collaborators,
        }
    }

    pub(crate) fn user_id(&self) -> &'a str {
        self.context.id()
    }

    pub(crate) fn stored_decision(&self, feature_key: &str) -> Option<StoredDecision> {
        let storage = self.collaborators.storage()?;
        load_decision(storage, feature_key, self.user_id())
    }

    fn with_vwo_user_id(
        &self,
        campaign: &Campaign,
        attributes: &HashMap<String, AttributeValue>,
    ) -> HashMap<String, AttributeValue> {
        let mut attributes = attributes.clone();
        attributes.insert(
            VWO_USER_ID_ATTRIBUTE.to_string(),
            AttributeValue::String(bucketing_user_id(
                self.settings.account_id,
                self.user_id(),
                campaign.is_user_list_enabled,
            )),
        );
        attributes
    }

    /// The campaign's own targeting against the user's custom variables.
    pub(crate) fn pre_segmentation(&self, feature: &Feature, campaign: &Campaign) -> bool {
        let attributes = self.with_vwo_user_id(campaign, self.context.custom_variables());
        let passed = SegmentEvaluator::new(self.settings, &feature.key, self.context, self.collaborators)
            .is_valid(campaign.pre_segmentation(), &attributes);
        debug!(
            "Pre-segmentation of {} for user {}: {}",
            campaign.key,
            self.user_id(),
            passed
        );
        passed
    }

    /// Pre-segmentation, deferring to group resolution when the campaign is part of a mutually
    /// exclusive group.
    pub(crate) fn passes_pre_segmentation(
        &self,
        feature: &'a Feature,
        campaign: &'a Campaign,
        scratch: &mut EvaluationScratch,
    ) -> bool {
        let member = campaign.group_member();
        match self.settings.group_of(member.campaign_id, member.variation_id) {
            Some(group_id) => {
                evaluate_group_candidate(self, feature, campaign, group_id, scratch)
            }
            None => self.pre_segmentation(feature, campaign),
        }
    }

    /// The first rollout whose targeting matches is the only one considered; the user must then
    /// fall inside its traffic. The outcome is remembered for the rest of the evaluation.
    pub(crate) fn rollout_decision(
        &self,
        feature: &'a Feature,
        scratch: &mut EvaluationScratch,
    ) -> Option<(&'a Campaign, &'a Variation)> {
        if let Some(memo) = scratch.evaluated_features.get(&feature.key) {
            let memo = memo.clone()?;
            return feature
                .rollout_campaigns()
                .find(|c| c.id == memo.campaign_id)
                .and_then(|c| c.variation(memo.variation_id).map(|v| (c, v)))
                .or_else(|| {
                    self.settings
                        .campaign(memo.campaign_id)
                        .and_then(|c| c.variation(memo.variation_id).map(|v| (c, v)))
                });
        }

        let matched = feature
            .rollout_campaigns()
            .find(|campaign| self.passes_pre_segmentation(feature, *campaign, scratch));
        let decision = matched.and_then(|campaign| {
            allot(self.user_id(), self.settings.account_id, campaign).map(|v| (campaign, v))
        });
        if matched.is_some() && decision.is_none() {
            debug!(
                "User {} matched rollout targeting of {} but is outside its traffic",
                self.user_id(),
                feature.key
            );
        }

        scratch.evaluated_features.insert(
            feature.key.clone(),
            decision.map(|(campaign, variation)| RolloutOutcome {
                campaign_id: campaign.id,
                variation_id: variation.id,
            }),
        );
        decision
    }

    /// Experiments in rule order. A whitelisting hit wins outright; otherwise the first
    /// experiment whose targeting matches is traffic-gated and no other is tried.
    pub(crate) fn experiment_decision(
        &self,
        feature: &'a Feature,
        scratch: &mut EvaluationScratch,
    ) -> Option<(&'a Campaign, &'a Variation, bool)> {
        let mut queued = None;
        for campaign in feature.experiment_campaigns() {
            if campaign.is_forced_variation_enabled {
                if let Some(variation) = self.whitelisting(feature, campaign) {
                    info!(
                        "User {} whitelisted into variation {} of {}",
                        self.user_id(),
                        variation.key,
                        campaign.key
                    );
                    return Some((campaign, variation, true));
                }
            }
            if self.passes_pre_segmentation(feature, campaign, scratch) {
                queued = Some(campaign);
                break;
            }
        }

        let campaign = queued?;
        match allot(self.user_id(), self.settings.account_id, campaign) {
            Some(variation) => {
                info!(
                    "User {} allotted variation {} of {}",
                    self.user_id(),
                    variation.key,
                    campaign.key
                );
                Some((campaign, variation, false))
            }
            None => {
                debug!(
                    "User {} matched targeting of {} but is outside its traffic",
                    self.user_id(),
                    campaign.key
                );
                None
            }
        }
    }

    fn whitelisting(&self, feature: &Feature, campaign: &'a Campaign) -> Option<&'a Variation> {
        let attributes =
            self.with_vwo_user_id(campaign, self.context.variation_targeting_variables());
        let segments =
            SegmentEvaluator::new(self.settings, &feature.key, self.context, self.collaborators);
        let matched: Vec<&'a Variation> = campaign
            .variations
            .iter()
            .filter(|v| v.segments.is_some() && segments.is_valid(v.segments.as_ref(), &attributes))
            .collect();
        whitelisted_variation(campaign, &matched, self.user_id())
    }
}

/// Contains methods for configuring an [Evaluator].
pub struct EvaluatorBuilder {
    storage: Option<Arc<dyn Storage>>,
    list_service: Option<Arc<dyn AttributeListService>>,
    attribute_provider: Option<Arc<dyn AttributeProvider>>,
    impression_sink: Option<Arc<dyn ImpressionSink>>,
    config: EvaluatorConfig,
}

impl EvaluatorBuilder {
    pub fn new() -> Self {
        Self {
            storage: None,
            list_service: None,
            attribute_provider: None,
            impression_sink: None,
            config: EvaluatorConfig::default(),
        }
    }

    pub fn storage(&mut self, storage: Arc<dyn Storage>) -> &mut Self {
        self.storage = Some(storage);
        self
    }

    pub fn list_service(&mut self, service: Arc<dyn AttributeListService>) -> &mut Self {
        self.list_service = Some(service);
        self
    }

    /// Defaults to reading attributes off the [UserContext].
    pub fn attribute_provider(&mut self, provider: Arc<dyn AttributeProvider>) -> &mut Self {
        self.attribute_provider = Some(provider);
        self
    }

    pub fn impression_sink(&mut self, sink: Arc<dyn ImpressionSink>) -> &mut Self {
        self.impression_sink = Some(sink);
        self
    }

    pub fn config(&mut self, config: EvaluatorConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn build(&self) -> Evaluator {
        Evaluator {
            collaborators: Collaborators {
                storage: self.storage.clone(),
                list_service: self.list_service.clone(),
                attribute_provider: self
                    .attribute_provider
                    .clone()
                    .unwrap_or_else(|| Arc::new(ContextAttributeProvider)),
                impression_sink: self.impression_sink.clone(),
                list_cache: ListMembershipCache::new(
                    self.config.list_cache_ttl(),
                    self.config.list_cache_capacity(),
                ),
            },
            config: self.config.clone(),
        }
    }
}

impl Default for EvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
