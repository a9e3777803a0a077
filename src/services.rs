use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EvaluatorConfig;
use crate::context::{DeviceAttribute, Location, UserAgentInfo, UserContext};
use crate::list_cache::ListMembershipCache;
use crate::store::Storage;

/// Supplies attributes the SDK cannot compute by itself: the user's location, the parsed user
/// agent and device properties.
///
/// Every method defaults to reading the value off the [UserContext]; hosts that resolve these
/// lazily (for instance through a gateway service) override the methods they can answer.
/// Returning None makes the corresponding segment leaf evaluate to false.
pub trait AttributeProvider: Send + Sync {
    fn location(&self, context: &UserContext) -> Option<Location> {
        context.location().cloned()
    }

    fn user_agent(&self, context: &UserContext) -> Option<String> {
        context.user_agent().map(str::to_owned)
    }

    fn user_agent_info(&self, context: &UserContext) -> Option<UserAgentInfo> {
        context.user_agent_info().cloned()
    }

    fn device_attribute(&self, context: &UserContext, attribute: DeviceAttribute) -> Option<String> {
        context.device_attribute(attribute).map(str::to_owned)
    }
}

/// The default [AttributeProvider]: everything comes from the [UserContext].
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextAttributeProvider;

impl AttributeProvider for ContextAttributeProvider {}

/// Remote attribute-list membership checks, backing the `inlist(...)` operand.
///
/// Implementations perform a blocking call and are expected to bound it with a timeout.
pub trait AttributeListService: Send + Sync {
    fn check_membership(
        &self,
        list_id: &str,
        attribute_value: &str,
        user_id: &str,
    ) -> Result<bool, ListCheckError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ListCheckError {
    #[error("list membership request failed: {0}")]
    Transport(String),
    #[error("list membership request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected list membership response: {0}")]
    InvalidResponse(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImpressionKind {
    Rollout,
    Experiment,
    Whitelisted,
    /// Impact analysis: the variation id is 2 when the flag ended up enabled, 1 otherwise.
    Impact,
}

/// A decision the host may want to report.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub feature_key: String,
    pub campaign_id: u64,
    pub variation_id: u64,
    pub user_id: String,
    pub kind: ImpressionKind,
    pub created_at: DateTime<Utc>,
}

/// Receives impressions. Notification is fire-and-forget: the evaluator neither waits for nor
/// depends on what the sink does with them.
pub trait ImpressionSink: Send + Sync {
    fn notify(&self, impression: Impression);
}

/// The collaborators an evaluation reaches out to, bundled so they can be threaded through the
/// rule evaluator, the group resolver and the segment evaluator as one reference.
pub(crate) struct Collaborators {
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) list_service: Option<Arc<dyn AttributeListService>>,
    pub(crate) attribute_provider: Arc<dyn AttributeProvider>,
    pub(crate) impression_sink: Option<Arc<dyn ImpressionSink>>,
    pub(crate) list_cache: ListMembershipCache,
}

impl Collaborators {
    pub(crate) fn storage(&self) -> Option<&dyn Storage> {
        self.storage.as_deref()
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        let config = EvaluatorConfig::default();
        Self {
            storage: None,
            list_service: None,
            attribute_provider: Arc::new(ContextAttributeProvider),
            impression_sink: None,
            list_cache: ListMembershipCache::new(
                config.list_cache_ttl(),
                config.list_cache_capacity(),
            ),
        }
    }
}
