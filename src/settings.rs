use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::processing::process_settings;
use crate::segment::{deserialize_segments, SegmentNode};

/// A settings snapshot, as delivered by the server and then processed by
/// [crate::process_settings].
///
/// Settings are read-only once processed. A new fetch produces a new snapshot which replaces the
/// old one wholesale, see [SettingsHandle].
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub account_id: u64,
    #[serde(default)]
    pub sdk_key: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde_as(as = "HashMap<DisplayFromStr, _>")]
    #[serde(default)]
    pub groups: HashMap<u64, Group>,
    #[serde_as(as = "HashMap<DisplayFromStr, PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub campaign_groups: HashMap<GroupMember, u64>,

    #[serde(skip)]
    pub(crate) processed: bool,
}

/// Errors raised while loading a settings snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings payload is not valid: {0}")]
    Json(#[from] serde_json::Error),
}

impl Settings {
    /// Parse a raw settings payload and run the settings processor over it.
    pub fn from_json_str(json: &str) -> Result<Settings, SettingsError> {
        let mut settings: Settings = serde_json::from_str(json)?;
        process_settings(&mut settings);
        Ok(settings)
    }

    pub fn feature(&self, feature_key: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.key == feature_key)
    }

    pub fn feature_by_id(&self, feature_id: u64) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == feature_id)
    }

    pub fn campaign(&self, campaign_id: u64) -> Option<&Campaign> {
        self.campaigns.iter().find(|c| c.id == campaign_id)
    }

    /// Re-resolve a variation from a campaign key and variation id, as recorded by a previous
    /// decision. Returns None when either no longer exists in this snapshot.
    pub fn variation_by_campaign_key(
        &self,
        campaign_key: &str,
        variation_id: u64,
    ) -> Option<(&Campaign, &Variation)> {
        let campaign = self.campaigns.iter().find(|c| c.key == campaign_key)?;
        let variation = campaign.variation(variation_id)?;
        Some((campaign, variation))
    }

    /// The group a campaign belongs to, if any. Personalize campaigns are registered per
    /// variation, so the caller passes the narrowed variation id for them.
    pub fn group_of(&self, campaign_id: u64, variation_id: Option<u64>) -> Option<u64> {
        let member = GroupMember {
            campaign_id,
            variation_id,
        };
        self.campaign_groups.get(&member).copied()
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: u64,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub impact_campaign: Option<ImpactCampaign>,

    /// One fully resolved campaign per rule, filled in by the settings processor.
    #[serde(skip)]
    pub linked_campaigns: Vec<Campaign>,
    /// Set when a linked campaign's targeting needs location or user agent data from outside
    /// the SDK.
    #[serde(skip)]
    pub is_gateway_service_required: bool,
}

impl Feature {
    pub fn rollout_campaigns(&self) -> impl Iterator<Item = &Campaign> {
        self.linked_campaigns
            .iter()
            .filter(|c| c.kind == CampaignType::Rollout)
    }

    pub fn experiment_campaigns(&self) -> impl Iterator<Item = &Campaign> {
        self.linked_campaigns.iter().filter(|c| c.kind.is_experiment())
    }

    pub fn has_rollout(&self) -> bool {
        self.rollout_campaigns().next().is_some()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_key: String,
    pub campaign_id: u64,
    #[serde(default)]
    pub variation_id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: CampaignType,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub identifier: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImpactCampaign {
    pub campaign_id: u64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
pub enum CampaignType {
    #[serde(rename = "FLAG_TESTING", alias = "AB")]
    Ab,
    #[serde(rename = "FLAG_PERSONALIZE", alias = "PERSONALIZE")]
    Personalize,
    #[serde(rename = "FLAG_ROLLOUT", alias = "ROLLOUT")]
    Rollout,
}

impl CampaignType {
    pub fn is_experiment(&self) -> bool {
        matches!(self, CampaignType::Ab | CampaignType::Personalize)
    }

    /// Rollout and personalize campaigns carry a single variation whose weight is the traffic
    /// allocation.
    pub fn is_single_variation(&self) -> bool {
        matches!(self, CampaignType::Rollout | CampaignType::Personalize)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: u64,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: CampaignType,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_segments")]
    pub segments: Option<SegmentNode>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub percent_traffic: f64,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub is_forced_variation_enabled: bool,
    #[serde(default)]
    pub is_user_list_enabled: bool,

    /// Stamped from the linking rule by the settings processor.
    #[serde(default)]
    pub rule_key: Option<String>,
}

impl Campaign {
    pub fn variation(&self, variation_id: u64) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == variation_id)
    }

    /// The targeting tree applied before traffic allocation. Single-variation campaigns keep
    /// their targeting on the variation.
    pub fn pre_segmentation(&self) -> Option<&SegmentNode> {
        if self.kind.is_single_variation() {
            self.variations.first().and_then(|v| v.segments.as_ref())
        } else {
            self.segments.as_ref()
        }
    }

    /// The identifier under which a linked campaign appears in a group: plain campaign id, or
    /// `campaignId_variationId` for personalize rules.
    pub fn group_member(&self) -> GroupMember {
        let variation_id = match self.kind {
            CampaignType::Personalize => self.variations.first().map(|v| v.id),
            _ => None,
        };
        GroupMember {
            campaign_id: self.id,
            variation_id,
        }
    }

    pub(crate) fn salt(&self) -> Option<&str> {
        self.salt.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: u64,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default, deserialize_with = "deserialize_segments")]
    pub segments: Option<SegmentNode>,

    /// Inclusive bucket range in `1..=10000`; None never matches.
    #[serde(skip)]
    pub bucket_range: Option<BucketRange>,
}

impl Variation {
    pub(crate) fn salt(&self) -> Option<&str> {
        self.salt.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketRange {
    pub start: u32,
    pub end: u32,
}

impl BucketRange {
    pub fn contains(&self, bucket_value: u32) -> bool {
        self.start <= bucket_value && bucket_value <= self.end
    }

    pub fn width(&self) -> u32 {
        self.end + 1 - self.start
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Variable {
    pub id: u64,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: VariableType,
    pub value: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Boolean,
    Integer,
    Double,
    String,
    Json,
    #[serde(other)]
    Unknown,
}

#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub name: Option<String>,
    #[serde_as(as = "Vec<PickFirst<(DisplayFromStr, _)>>")]
    #[serde(default)]
    pub campaigns: Vec<GroupMember>,
    /// Winner selection algorithm; 1 selects the random algorithm.
    #[serde(default = "default_group_algorithm")]
    pub et: u8,
    #[serde_as(as = "Vec<PickFirst<(DisplayFromStr, _)>>")]
    #[serde(default)]
    pub p: Vec<GroupMember>,
    #[serde_as(as = "HashMap<DisplayFromStr, _>")]
    #[serde(default)]
    pub wt: HashMap<GroupMember, f64>,
}

pub const RANDOM_GROUP_ALGORITHM: u8 = 1;

fn default_group_algorithm() -> u8 {
    RANDOM_GROUP_ALGORITHM
}

impl Group {
    pub fn is_random(&self) -> bool {
        self.et == RANDOM_GROUP_ALGORITHM
    }

    /// Whether a linked campaign is listed in this group, either by plain id or by
    /// `campaignId_variationId`.
    pub fn contains(&self, campaign: &Campaign) -> bool {
        let member = campaign.group_member();
        self.campaigns.iter().any(|m| {
            m.campaign_id == member.campaign_id
                && (m.variation_id.is_none() || m.variation_id == member.variation_id)
        })
    }

    pub fn weight_of(&self, campaign: &Campaign) -> Option<f64> {
        let member = campaign.group_member();
        self.wt.get(&member.plain()).or_else(|| self.wt.get(&member)).copied()
    }
}

/// A campaign reference inside a group: `"12"` or `"12_3"` for a single personalize variation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "u64")]
pub struct GroupMember {
    pub campaign_id: u64,
    pub variation_id: Option<u64>,
}

impl GroupMember {
    pub fn plain(&self) -> GroupMember {
        GroupMember {
            campaign_id: self.campaign_id,
            variation_id: None,
        }
    }
}

impl From<u64> for GroupMember {
    fn from(campaign_id: u64) -> Self {
        GroupMember {
            campaign_id,
            variation_id: None,
        }
    }
}

impl fmt::Display for GroupMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variation_id {
            Some(variation_id) => write!(f, "{}_{}", self.campaign_id, variation_id),
            None => write!(f, "{}", self.campaign_id),
        }
    }
}

/// Error for group member identifiers that are neither `id` nor `id_variationId`.
#[derive(Debug, thiserror::Error)]
#[error("invalid group member identifier '{0}'")]
pub struct GroupMemberParseError(String);

impl FromStr for GroupMember {
    type Err = GroupMemberParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| GroupMemberParseError(s.to_string()))
        };
        match s.split_once('_') {
            Some((campaign_id, variation_id)) => Ok(GroupMember {
                campaign_id: parse(campaign_id)?,
                variation_id: Some(parse(variation_id)?),
            }),
            None => Ok(GroupMember {
                campaign_id: parse(s)?,
                variation_id: None,
            }),
        }
    }
}

/// Shared, atomically replaceable reference to the current settings snapshot.
///
/// Evaluations hold the [Arc] they started with, so replacing the snapshot never exposes a
/// partially updated view.
#[derive(Default)]
pub struct SettingsHandle {
    current: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    /// Install a new snapshot, processing it first if that has not happened yet.
    pub fn replace(&self, mut settings: Settings) {
        if !settings.processed {
            process_settings(&mut settings);
        }
        *self.current.write() = Arc::new(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test_case("12", 12, None)]
    #[test_case("12_3", 12, Some(3))]
    #[test_case(" 7 ", 7, None)]
    fn parse_group_member(s: &str, campaign_id: u64, variation_id: Option<u64>) {
        let member: GroupMember = s.parse().expect("should parse");
        assert_eq!(
            member,
            GroupMember {
                campaign_id,
                variation_id
            }
        );
        assert_eq!(member.to_string(), s.trim());
    }

    #[test_case("")]
    #[test_case("abc")]
    #[test_case("1_x")]
    fn reject_bad_group_member(s: &str) {
        assert_that!(s.parse::<GroupMember>()).is_err();
    }

    #[test]
    fn parse_minimal_settings() {
        let settings: Settings =
            serde_json::from_str(r#"{"accountId": "123"}"#).expect("should parse");
        assert_eq!(settings.account_id, 123);
        assert_that!(settings.features).is_empty();
        assert!(settings.groups.is_empty());
        assert!(!settings.is_processed());
    }

    #[test]
    fn parse_groups_and_campaign_groups() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "accountId": 1,
                "groups": {
                    "7": {"name": "g", "campaigns": ["1", 2, "3_30"], "et": 2,
                          "p": ["3_30", "1"], "wt": {"1": 20, "2": 30, "3_30": 50}}
                },
                "campaignGroups": {"1": 7, "2": "7", "3_30": 7}
            }"#,
        )
        .expect("should parse");

        let group = settings.groups.get(&7).expect("group 7");
        assert!(!group.is_random());
        assert_eq!(group.campaigns.len(), 3);
        assert_eq!(group.p[0].variation_id, Some(30));
        assert_eq!(group.wt.get(&GroupMember::from(2)), Some(&30.0));
        assert_eq!(settings.group_of(2, None), Some(7));
        assert_eq!(settings.group_of(3, Some(30)), Some(7));
        assert_eq!(settings.group_of(3, None), None);
    }

    #[test]
    fn group_algorithm_defaults_to_random() {
        let group: Group = serde_json::from_str(r#"{"campaigns": []}"#).unwrap();
        assert!(group.is_random());
    }

    #[test]
    fn campaign_type_wire_names() {
        let parse = |s: &str| serde_json::from_str::<CampaignType>(s).unwrap();
        assert_eq!(parse(r#""FLAG_TESTING""#), CampaignType::Ab);
        assert_eq!(parse(r#""AB""#), CampaignType::Ab);
        assert_eq!(parse(r#""FLAG_ROLLOUT""#), CampaignType::Rollout);
        assert_eq!(parse(r#""FLAG_PERSONALIZE""#), CampaignType::Personalize);
    }

    #[test]
    fn unknown_variable_type_is_tolerated() {
        let variable: Variable =
            serde_json::from_str(r#"{"id": 1, "key": "k", "type": "date", "value": "x"}"#)
                .unwrap();
        assert_eq!(variable.kind, VariableType::Unknown);
    }

    #[test]
    fn handle_swaps_whole_snapshot() {
        let handle = SettingsHandle::new(Settings {
            account_id: 1,
            ..Default::default()
        });
        let before = handle.current();

        handle.replace(Settings {
            account_id: 2,
            ..Default::default()
        });

        assert_eq!(before.account_id, 1);
        assert_eq!(handle.current().account_id, 2);
        assert!(handle.current().is_processed());
    }
}
