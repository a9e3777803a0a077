use std::collections::HashMap;

use log::{debug, error, warn};
use regex::RegexBuilder;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::context::{DeviceAttribute, LocationField, UserAgentField, UserContext};
use crate::list_cache::ListCacheKey;
use crate::operand::Operand;
use crate::services::Collaborators;
use crate::settings::Settings;
use crate::store::load_decision;
use crate::AttributeValue;

/// The attribute under which the bucketing user id is exposed to segment evaluation.
pub const VWO_USER_ID_ATTRIBUTE: &str = "_vwoUserId";

/// A node of the segmentation DSL.
///
/// Each JSON object in a segments tree has exactly one key, which selects the node kind. Objects
/// with zero or several keys, unknown keys and malformed operands all parse to
/// [SegmentNode::Invalid], which never matches.
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentNode {
    And(Vec<SegmentNode>),
    Or(Vec<SegmentNode>),
    Not(Box<SegmentNode>),
    CustomVariable {
        key: String,
        operand: Operand,
    },
    /// A comma separated list of user ids, or a remote list of them.
    User(Operand),
    /// Matched against the raw user agent string.
    UserAgent(Operand),
    Location {
        field: LocationField,
        value: String,
    },
    /// Matched against the parsed user agent, case-insensitively, with `wildcard(...)` globs.
    UaParser {
        field: UserAgentField,
        value: String,
    },
    Device {
        attribute: DeviceAttribute,
        operand: Operand,
    },
    /// Passes when the user has (`on`) or has not (`off`) been stuck to some decision for another
    /// feature.
    FeatureDependency {
        feature_id: u64,
        enabled: bool,
    },
    Invalid(String),
}

impl SegmentNode {
    /// Parse a segments tree. An empty object or null means "no targeting" and yields None.
    pub fn from_json(value: &Value) -> Option<SegmentNode> {
        match value {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            _ => Some(parse_node(value)),
        }
    }

    /// Whether evaluating this tree needs location or user agent data that the host resolves
    /// through an external gateway service.
    pub fn requires_gateway(&self) -> bool {
        match self {
            SegmentNode::And(children) | SegmentNode::Or(children) => {
                children.iter().any(SegmentNode::requires_gateway)
            }
            SegmentNode::Not(child) => child.requires_gateway(),
            SegmentNode::Location { .. }
            | SegmentNode::UaParser { .. }
            | SegmentNode::UserAgent(_) => true,
            _ => false,
        }
    }
}

pub(crate) fn deserialize_segments<'de, D>(deserializer: D) -> Result<Option<SegmentNode>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(SegmentNode::from_json(&value))
}

fn parse_node(value: &Value) -> SegmentNode {
    let (key, inner) = match value.as_object().and_then(single_entry) {
        Some(entry) => entry,
        None => return SegmentNode::Invalid(value.to_string()),
    };

    let invalid = || SegmentNode::Invalid(value.to_string());

    match key.as_str() {
        "and" | "or" => {
            let children = match inner.as_array() {
                Some(children) => children.iter().map(parse_node).collect(),
                None => return invalid(),
            };
            if key == "and" {
                SegmentNode::And(children)
            } else {
                SegmentNode::Or(children)
            }
        }
        "not" => SegmentNode::Not(Box::new(parse_node(inner))),
        "custom_variable" => {
            let parsed = inner
                .as_object()
                .and_then(single_entry)
                .and_then(|(name, operand)| Some((name, operand_text(operand)?)));
            match parsed {
                Some((name, operand)) => SegmentNode::CustomVariable {
                    key: name.clone(),
                    operand: Operand::parse(&operand),
                },
                None => invalid(),
            }
        }
        "user" => match operand_text(inner) {
            Some(raw) if raw.starts_with("inlist") => SegmentNode::User(Operand::parse(&raw)),
            Some(raw) => SegmentNode::User(Operand::Equals(raw)),
            None => invalid(),
        },
        "ua" => match operand_text(inner) {
            Some(raw) => SegmentNode::UserAgent(Operand::parse(&raw)),
            None => invalid(),
        },
        "featureId" => parse_feature_dependency(inner).unwrap_or_else(invalid),
        other => {
            let text = match operand_text(inner) {
                Some(text) => text,
                None => return invalid(),
            };
            if let Some(field) = LocationField::from_key(other) {
                SegmentNode::Location { field, value: text }
            } else if let Some(field) = UserAgentField::from_key(other) {
                SegmentNode::UaParser { field, value: text }
            } else if let Some(attribute) = DeviceAttribute::from_key(other) {
                SegmentNode::Device {
                    attribute,
                    operand: Operand::parse(&text),
                }
            } else {
                invalid()
            }
        }
    }
}

fn single_entry(map: &Map<String, Value>) -> Option<(&String, &Value)> {
    if map.len() == 1 {
        map.iter().next()
    } else {
        None
    }
}

fn operand_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// {"featureId": {"123": "on"}}
fn parse_feature_dependency(value: &Value) -> Option<SegmentNode> {
    let (id, state) = value.as_object().and_then(single_entry)?;
    let feature_id = id.trim().parse().ok()?;
    let enabled = match state.as_str()? {
        "on" => true,
        "off" => false,
        _ => return None,
    };
    Some(SegmentNode::FeatureDependency {
        feature_id,
        enabled,
    })
}

/// Interprets segment trees for one user during the evaluation of one feature.
pub(crate) struct SegmentEvaluator<'a> {
    settings: &'a Settings,
    feature_key: &'a str,
    context: &'a UserContext,
    collaborators: &'a Collaborators,
}

impl<'a> SegmentEvaluator<'a> {
    pub(crate) fn new(
        settings: &'a Settings,
        feature_key: &'a str,
        context: &'a UserContext,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            settings,
            feature_key,
            context,
            collaborators,
        }
    }

    /// Evaluate `segments` against `attributes`. An absent tree always passes.
    pub(crate) fn is_valid(
        &self,
        segments: Option<&SegmentNode>,
        attributes: &HashMap<String, AttributeValue>,
    ) -> bool {
        match segments {
            Some(node) => self.evaluate(node, attributes),
            None => true,
        }
    }

    fn evaluate(&self, node: &SegmentNode, attributes: &HashMap<String, AttributeValue>) -> bool {
        match node {
            SegmentNode::Not(child) => !self.evaluate(child, attributes),
            SegmentNode::And(children) => self.evaluate_and(children, attributes),
            SegmentNode::Or(children) => self.evaluate_or(children, attributes),
            SegmentNode::CustomVariable { key, operand } => match attributes.get(key) {
                Some(value) => {
                    let actual = value.to_operand_string();
                    match operand {
                        Operand::InList(list_id) => self.in_list(list_id, &actual, true),
                        _ => operand.matches(&actual),
                    }
                }
                None => {
                    debug!("Custom variable {} not supplied", key);
                    false
                }
            },
            SegmentNode::User(operand) => {
                let user_id = attributes
                    .get(VWO_USER_ID_ATTRIBUTE)
                    .and_then(AttributeValue::as_str)
                    .unwrap_or_else(|| self.context.id());
                match operand {
                    Operand::InList(list_id) => self.in_list(list_id, user_id, false),
                    Operand::Equals(ids) => ids.split(',').any(|id| id.trim() == user_id),
                    _ => false,
                }
            }
            SegmentNode::UserAgent(operand) => self
                .collaborators
                .attribute_provider
                .user_agent(self.context)
                .map(|ua| operand.matches(&ua))
                .unwrap_or(false),
            SegmentNode::Device { attribute, operand } => self
                .collaborators
                .attribute_provider
                .device_attribute(self.context, *attribute)
                .map(|actual| operand.matches(&actual))
                .unwrap_or(false),
            SegmentNode::Location { field, value } => self.location_matches(&[(*field, value)]),
            SegmentNode::UaParser { field, value } => self.user_agent_matches(&[(*field, value)]),
            SegmentNode::FeatureDependency {
                feature_id,
                enabled,
            } => self.feature_dependency_matches(*feature_id, *enabled),
            SegmentNode::Invalid(raw) => {
                warn!("Invalid segment node evaluates to false: {}", raw);
                false
            }
        }
    }

    // Location leaves are gathered into one query, checked once after the other children.
    fn evaluate_and(
        &self,
        children: &[SegmentNode],
        attributes: &HashMap<String, AttributeValue>,
    ) -> bool {
        let mut location_query = Vec::new();
        for child in children {
            if let SegmentNode::Location { field, value } = child {
                location_query.push((*field, value.as_str()));
            } else if !self.evaluate(child, attributes) {
                return false;
            }
        }
        location_query.is_empty() || self.location_matches(&location_query)
    }

    fn evaluate_or(
        &self,
        children: &[SegmentNode],
        attributes: &HashMap<String, AttributeValue>,
    ) -> bool {
        if !children.is_empty()
            && children
                .iter()
                .all(|c| matches!(c, SegmentNode::UaParser { .. }))
        {
            let query: Vec<_> = children
                .iter()
                .filter_map(|c| match c {
                    SegmentNode::UaParser { field, value } => Some((*field, value.as_str())),
                    _ => None,
                })
                .collect();
            return self.user_agent_matches(&query);
        }

        for child in children {
            if let SegmentNode::FeatureDependency { .. } = child {
                return self.evaluate(child, attributes);
            }
            if self.evaluate(child, attributes) {
                return true;
            }
        }
        false
    }

    fn location_matches(&self, query: &[(LocationField, &str)]) -> bool {
        let location = match self.collaborators.attribute_provider.location(self.context) {
            Some(location) => location,
            None => {
                debug!("No location available for user {}", self.context.id());
                return false;
            }
        };
        query.iter().all(|(field, expected)| {
            location
                .get(*field)
                .map(|actual| unquote(actual) == unquote(expected))
                .unwrap_or(false)
        })
    }

    fn user_agent_matches(&self, query: &[(UserAgentField, &str)]) -> bool {
        let info = match self
            .collaborators
            .attribute_provider
            .user_agent_info(self.context)
        {
            Some(info) => info,
            None => {
                debug!("No parsed user agent available for user {}", self.context.id());
                return false;
            }
        };
        query.iter().any(|(field, expected)| {
            info.get(*field)
                .map(|actual| user_agent_value_matches(expected, actual))
                .unwrap_or(false)
        })
    }

    fn feature_dependency_matches(&self, feature_id: u64, enabled: bool) -> bool {
        let feature = match self.settings.feature_by_id(feature_id) {
            Some(feature) => feature,
            None => {
                warn!("Feature {} referenced by segment not found", feature_id);
                return false;
            }
        };
        let stored = self
            .collaborators
            .storage()
            .and_then(|storage| load_decision(storage, &feature.key, self.context.id()))
            .is_some();
        stored == enabled
    }

    fn in_list(&self, list_id: &str, attribute: &str, is_custom_variable: bool) -> bool {
        let user_id = self.context.id();
        let key = ListCacheKey {
            feature_key: self.feature_key.to_string(),
            list_id: list_id.to_string(),
            attribute: attribute.to_string(),
            user_id: user_id.to_string(),
            is_custom_variable,
        };
        if let Some(member) = self.collaborators.list_cache.get(&key) {
            return member;
        }

        let service = match &self.collaborators.list_service {
            Some(service) => service,
            None => {
                warn!(
                    "No attribute list service configured, list {} does not match",
                    list_id
                );
                return false;
            }
        };

        match service.check_membership(list_id, attribute, user_id) {
            Ok(member) => {
                self.collaborators.list_cache.insert(key, member);
                member
            }
            Err(e) => {
                error!("Membership check for list {} failed: {}", list_id, e);
                false
            }
        }
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

fn user_agent_value_matches(expected: &str, actual: &str) -> bool {
    let pattern = expected
        .strip_prefix("wildcard(")
        .and_then(|rest| rest.strip_suffix(')'));
    match pattern {
        Some(glob) => {
            let source = format!(
                "^{}$",
                glob.split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*")
            );
            match RegexBuilder::new(&source).case_insensitive(true).build() {
                Ok(re) => re.is_match(actual),
                Err(e) => {
                    warn!("Invalid user agent pattern {}: {}", expected, e);
                    false
                }
            }
        }
        None => expected.to_lowercase() == actual.to_lowercase(),
    }
}
