use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::AttributeValue;

/// Geographic attributes of a user, resolved outside the SDK.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Location {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl Location {
    pub fn get(&self, field: LocationField) -> Option<&str> {
        match field {
            LocationField::Country => self.country.as_deref(),
            LocationField::Region => self.region.as_deref(),
            LocationField::City => self.city.as_deref(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationField {
    Country,
    Region,
    City,
}

impl LocationField {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "country" => Some(LocationField::Country),
            "region" => Some(LocationField::Region),
            "city" => Some(LocationField::City),
            _ => None,
        }
    }
}

/// The result of parsing the user's user agent string.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAgentInfo {
    pub os: Option<String>,
    pub browser: Option<String>,
    pub device_type: Option<String>,
    pub device: Option<String>,
}

impl UserAgentInfo {
    pub fn get(&self, field: UserAgentField) -> Option<&str> {
        match field {
            UserAgentField::Os => self.os.as_deref(),
            UserAgentField::BrowserString => self.browser.as_deref(),
            UserAgentField::DeviceType => self.device_type.as_deref(),
            UserAgentField::Device => self.device.as_deref(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UserAgentField {
    Os,
    BrowserString,
    DeviceType,
    Device,
}

impl UserAgentField {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "os" => Some(UserAgentField::Os),
            "browser_string" => Some(UserAgentField::BrowserString),
            "device_type" => Some(UserAgentField::DeviceType),
            "device" => Some(UserAgentField::Device),
            _ => None,
        }
    }
}

/// Device attributes supplied by the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    DeviceModel,
    Locale,
    AppVersion,
    OsVersion,
    Manufacturer,
}

impl DeviceAttribute {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "device_model" => Some(DeviceAttribute::DeviceModel),
            "locale" => Some(DeviceAttribute::Locale),
            "app_version" => Some(DeviceAttribute::AppVersion),
            "os_version" => Some(DeviceAttribute::OsVersion),
            "manufacturer" => Some(DeviceAttribute::Manufacturer),
            _ => None,
        }
    }
}

/// The user a flag is evaluated for.
///
/// The id is expected to be resolved by the host (for instance to a device id when the
/// application has no signed-in user); a blank id disables every flag.
///
/// UserContext fields are immutable and can be accessed only via getter methods. To construct a
/// UserContext, use [UserContextBuilder].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserContext {
    id: String,
    custom_variables: HashMap<String, AttributeValue>,
    variation_targeting_variables: HashMap<String, AttributeValue>,
    user_agent: Option<String>,
    ip_address: Option<String>,
    location: Option<Location>,
    user_agent_info: Option<UserAgentInfo>,
    device_attributes: HashMap<DeviceAttribute, String>,
}

impl UserContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attributes available to campaign pre-segmentation.
    pub fn custom_variables(&self) -> &HashMap<String, AttributeValue> {
        &self.custom_variables
    }

    /// Attributes available only to variation whitelisting.
    pub fn variation_targeting_variables(&self) -> &HashMap<String, AttributeValue> {
        &self.variation_targeting_variables
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn user_agent_info(&self) -> Option<&UserAgentInfo> {
        self.user_agent_info.as_ref()
    }

    pub fn device_attribute(&self, attribute: DeviceAttribute) -> Option<&str> {
        self.device_attributes.get(&attribute).map(String::as_str)
    }
}

/// Contains methods for building a [UserContext] with a specified id.
pub struct UserContextBuilder {
    context: UserContext,
}

impl UserContextBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            context: UserContext {
                id: id.into(),
                ..Default::default()
            },
        }
    }

    pub fn custom_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        self.context
            .custom_variables
            .insert(name.into(), value.into());
        self
    }

    pub fn custom_variables(&mut self, variables: HashMap<String, AttributeValue>) -> &mut Self {
        self.context.custom_variables.extend(variables);
        self
    }

    pub fn variation_targeting_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        self.context
            .variation_targeting_variables
            .insert(name.into(), value.into());
        self
    }

    pub fn user_agent(&mut self, user_agent: impl Into<String>) -> &mut Self {
        self.context.user_agent = Some(user_agent.into());
        self
    }

    pub fn ip_address(&mut self, ip_address: impl Into<String>) -> &mut Self {
        self.context.ip_address = Some(ip_address.into());
        self
    }

    pub fn location(&mut self, location: Location) -> &mut Self {
        self.context.location = Some(location);
        self
    }

    pub fn user_agent_info(&mut self, info: UserAgentInfo) -> &mut Self {
        self.context.user_agent_info = Some(info);
        self
    }

    pub fn device_attribute(
        &mut self,
        attribute: DeviceAttribute,
        value: impl Into<String>,
    ) -> &mut Self {
        self.context
            .device_attributes
            .insert(attribute, value.into());
        self
    }

    pub fn build(&self) -> UserContext {
        self.context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn builder_sets_attributes() {
        let context = UserContextBuilder::new("user-1")
            .custom_variable("age", 30)
            .variation_targeting_variable("beta", true)
            .user_agent("Mozilla/5.0")
            .device_attribute(DeviceAttribute::AppVersion, "2.1.0")
            .location(Location {
                country: Some("IN".into()),
                ..Default::default()
            })
            .build();

        assert_eq!(context.id(), "user-1");
        assert_that!(context.custom_variables().get("age")).contains_value(&AttributeValue::Int(30));
        assert_that!(context.custom_variables().get("beta")).is_none();
        assert_that!(context.variation_targeting_variables().get("beta"))
            .contains_value(&AttributeValue::Bool(true));
        assert_that!(context.user_agent()).contains_value("Mozilla/5.0");
        assert_that!(context.device_attribute(DeviceAttribute::AppVersion)).contains_value("2.1.0");
        assert_that!(context.device_attribute(DeviceAttribute::Locale)).is_none();
        assert_that!(context.location().and_then(|l| l.get(LocationField::Country)))
            .contains_value("IN");
    }

    #[test]
    fn field_keys() {
        assert_eq!(LocationField::from_key("city"), Some(LocationField::City));
        assert_eq!(
            UserAgentField::from_key("browser_string"),
            Some(UserAgentField::BrowserString)
        );
        assert_eq!(
            DeviceAttribute::from_key("os_version"),
            Some(DeviceAttribute::OsVersion)
        );
        assert_eq!(DeviceAttribute::from_key("ua"), None);
    }
}
