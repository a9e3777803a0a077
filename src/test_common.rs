#![cfg(test)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::processing::process_settings;
use crate::services::{AttributeListService, Impression, ImpressionSink, ListCheckError};
use crate::settings::Settings;

pub fn settings_from_json(value: Value) -> Settings {
    let mut settings: Settings = serde_json::from_value(value).expect("settings should parse");
    process_settings(&mut settings);
    settings
}

fn variables(color: &str) -> Value {
    json!([{"id": 1, "key": "color", "type": "string", "value": color}])
}

/// Features:
/// - `no-rules`: nothing to evaluate
/// - `rollout-all`: one rollout open to everyone, with an impact campaign
/// - `ab-test`: one 50/50 AB campaign on all traffic
/// - `targeted`: a rollout for `plan=pro` followed by an AB campaign for `age >= 18` whose second
///   variation whitelists `beta=true`
/// - `closed`: a rollout with no traffic, with an impact campaign
pub fn flag_settings() -> Settings {
    settings_from_json(json!({
        "accountId": 999,
        "version": 3,
        "campaigns": [
            {"id": 1, "key": "rollout-all_rollout", "type": "FLAG_ROLLOUT",
             "variations": [{"id": 1, "key": "default", "weight": 100,
                             "variables": variables("blue")}]},
            {"id": 2, "key": "ab-test_test", "type": "FLAG_TESTING", "percentTraffic": 100,
             "segments": {},
             "variations": [
                {"id": 1, "key": "control", "weight": 50, "variables": variables("red")},
                {"id": 2, "key": "variation", "weight": 50, "variables": variables("green")}
             ]},
            {"id": 3, "key": "targeted_rollout", "type": "FLAG_ROLLOUT",
             "variations": [{"id": 1, "key": "default", "weight": 100,
                             "segments": {"custom_variable": {"plan": "pro"}},
                             "variables": variables("blue")}]},
            {"id": 4, "key": "targeted_test", "type": "FLAG_TESTING", "percentTraffic": 100,
             "isForcedVariationEnabled": true,
             "segments": {"custom_variable": {"age": "gte(18)"}},
             "variations": [
                {"id": 1, "key": "control", "weight": 50, "variables": variables("red")},
                {"id": 2, "key": "beta", "weight": 50, "variables": variables("purple"),
                 "segments": {"custom_variable": {"beta": "true"}}}
             ]},
            {"id": 5, "key": "closed_rollout", "type": "FLAG_ROLLOUT",
             "variations": [{"id": 1, "key": "default", "weight": 0}]}
        ],
        "features": [
            {"id": 1, "key": "no-rules", "rules": []},
            {"id": 2, "key": "rollout-all", "impactCampaign": {"campaignId": 60},
             "rules": [{"ruleKey": "rollout", "campaignId": 1, "type": "FLAG_ROLLOUT"}]},
            {"id": 3, "key": "ab-test",
             "rules": [{"ruleKey": "test", "campaignId": 2, "type": "FLAG_TESTING"}]},
            {"id": 4, "key": "targeted", "rules": [
                {"ruleKey": "rollout", "campaignId": 3, "type": "FLAG_ROLLOUT"},
                {"ruleKey": "test", "campaignId": 4, "type": "FLAG_TESTING"}
            ]},
            {"id": 5, "key": "closed", "impactCampaign": {"campaignId": 50},
             "rules": [{"ruleKey": "rollout", "campaignId": 5, "type": "FLAG_ROLLOUT"}]}
        ]
    }))
}

/// Two features, `feature-a` (campaign 101, `a_test`) and `feature-b` (campaign 201, `b_test`),
/// each with one AB campaign on all traffic, both in group 7.
pub fn group_settings(et: u8, p: Value, wt: Value) -> Settings {
    let campaign = |id: u64, key: &str| {
        json!({"id": id, "key": key, "type": "FLAG_TESTING", "percentTraffic": 100,
               "variations": [{"id": 1, "key": "control", "weight": 50},
                              {"id": 2, "key": "variation", "weight": 50}]})
    };
    settings_from_json(json!({
        "accountId": 999,
        "campaigns": [campaign(101, "a_test"), campaign(201, "b_test")],
        "features": [
            {"id": 1, "key": "feature-a",
             "rules": [{"ruleKey": "test", "campaignId": 101, "type": "FLAG_TESTING"}]},
            {"id": 2, "key": "feature-b",
             "rules": [{"ruleKey": "test", "campaignId": 201, "type": "FLAG_TESTING"}]}
        ],
        "groups": {"7": {"name": "exclusive", "campaigns": ["101", "201"],
                         "et": et, "p": p, "wt": wt}},
        "campaignGroups": {"101": 7, "201": 7}
    }))
}

/// Answers membership from a fixed set of (list id, attribute value) pairs.
pub struct FakeListService {
    members: HashSet<(String, String)>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeListService {
    pub fn new(members: &[(&str, &str)]) -> Self {
        Self {
            members: members
                .iter()
                .map(|(list, value)| (list.to_string(), value.to_string()))
                .collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AttributeListService for FakeListService {
    fn check_membership(
        &self,
        list_id: &str,
        attribute_value: &str,
        _user_id: &str,
    ) -> Result<bool, ListCheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ListCheckError::Transport("connection refused".into()));
        }
        Ok(self
            .members
            .contains(&(list_id.to_string(), attribute_value.to_string())))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    impressions: Mutex<Vec<Impression>>,
}

impl RecordingSink {
    pub fn impressions(&self) -> Vec<Impression> {
        self.impressions.lock().clone()
    }
}

impl ImpressionSink for RecordingSink {
    fn notify(&self, impression: Impression) {
        self.impressions.lock().push(impression);
    }
}
