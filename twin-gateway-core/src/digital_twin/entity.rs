use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{DataType, TimedValue};
use crate::registry::ActionHandler;

/// Name of the service every provider carries.
pub const ADMIN_SERVICE: &str = "admin";

/// Resources of the admin service.
pub mod admin {
    pub const FRIENDLY_NAME: &str = "friendlyName";
    pub const LOCATION: &str = "location";
    pub const MODEL: &str = "model";
    pub const MODEL_PACKAGE_URI: &str = "modelPackageUri";
    pub const DESCRIPTION: &str = "description";
}

/// Who may write a resource once it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// Set once at creation.
    Fixed,
    /// Written by producers only.
    Updatable,
    /// Producers and external SET.
    Modifiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Sensor,
    Property,
    StateVariable,
    Action,
}

/// `provider/service/resource` address of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub provider: String,
    pub service: String,
    pub resource: String,
}

impl ResourcePath {
    pub fn new(
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.service, self.resource)
    }
}

/// Shape requested for a resource by `get_or_create_resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDecl {
    pub data_type: DataType,
    pub resource_type: ResourceType,
    pub value_type: ValueType,
}

impl ResourceDecl {
    /// What dynamic updates create: an updatable sensor.
    pub const fn sensor(data_type: DataType) -> Self {
        Self {
            data_type,
            resource_type: ResourceType::Sensor,
            value_type: ValueType::Updatable,
        }
    }

    pub const fn property(data_type: DataType) -> Self {
        Self {
            data_type,
            resource_type: ResourceType::Property,
            value_type: ValueType::Modifiable,
        }
    }

    pub const fn state_variable(data_type: DataType) -> Self {
        Self {
            data_type,
            resource_type: ResourceType::StateVariable,
            value_type: ValueType::Updatable,
        }
    }

    pub const fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }
}

/// Argument signature and handler of an action resource.
#[derive(Clone)]
pub struct ActionBinding {
    pub(crate) arguments: Vec<(String, DataType)>,
    pub(crate) handler: Option<Arc<dyn ActionHandler>>,
}

impl ActionBinding {
    pub fn arguments(&self) -> &[(String, DataType)] {
        &self.arguments
    }

    pub fn is_bound(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for ActionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionBinding")
            .field("arguments", &self.arguments)
            .field("bound", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub(crate) name: String,
    pub(crate) data_type: DataType,
    pub(crate) resource_type: ResourceType,
    pub(crate) value_type: ValueType,
    pub(crate) value: TimedValue,
    pub(crate) metadata: BTreeMap<String, TimedValue>,
    pub(crate) action: Option<ActionBinding>,
}

impl Resource {
    pub(crate) fn new(name: &str, decl: ResourceDecl) -> Self {
        Self {
            name: name.to_string(),
            data_type: decl.data_type,
            resource_type: decl.resource_type,
            value_type: decl.value_type,
            value: TimedValue::empty(),
            metadata: BTreeMap::new(),
            action: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn value(&self) -> &TimedValue {
        &self.value
    }

    pub fn metadata(&self) -> &BTreeMap<String, TimedValue> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&TimedValue> {
        self.metadata.get(key)
    }

    pub fn action(&self) -> Option<&ActionBinding> {
        self.action.as_ref()
    }

    pub fn is_action(&self) -> bool {
        self.resource_type == ResourceType::Action
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    pub(crate) name: String,
    pub(crate) provider: String,
    pub(crate) resources: BTreeMap<String, Resource>,
    pub(crate) owner: Option<String>,
    pub(crate) exclusively_owned: bool,
    pub(crate) auto_delete: bool,
}

impl Service {
    pub(crate) fn new(provider: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            resources: BTreeMap::new(),
            owner: None,
            exclusively_owned: false,
            auto_delete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning provider.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn is_exclusively_owned(&self) -> bool {
        self.exclusively_owned
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub(crate) name: String,
    pub(crate) model: String,
    pub(crate) package_uri: Option<String>,
    pub(crate) created: DateTime<Utc>,
    pub(crate) services: BTreeMap<String, Service>,
    pub(crate) owner: Option<String>,
    pub(crate) exclusively_owned: bool,
    pub(crate) auto_delete: bool,
}

impl Provider {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn package_uri(&self) -> Option<&str> {
        self.package_uri.as_deref()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn is_exclusively_owned(&self) -> bool {
        self.exclusively_owned
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Resources outside the admin service.
    pub fn live_resource_count(&self) -> usize {
        self.services
            .values()
            .filter(|s| s.name != ADMIN_SERVICE)
            .map(|s| s.resources.len())
            .sum()
    }
}

/// Options for `DigitalTwin::create_provider_with`.
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub model: String,
    pub name: String,
    pub package_uri: Option<String>,
    pub created: DateTime<Utc>,
    pub owner: Option<String>,
    pub exclusively_owned: bool,
    pub auto_delete: bool,
}

impl NewProvider {
    pub fn new(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: name.into(),
            package_uri: None,
            created: Utc::now(),
            owner: None,
            exclusively_owned: false,
            auto_delete: false,
        }
    }

    pub fn package_uri(mut self, uri: impl Into<String>) -> Self {
        self.package_uri = Some(uri.into());
        self
    }

    pub fn created_at(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    /// Only `owner` may delete the provider afterwards.
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.exclusively_owned = true;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}
