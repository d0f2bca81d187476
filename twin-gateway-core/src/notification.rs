use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::NotificationBus;
use crate::digital_twin::{DataType, ResourcePath, TimedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    ProviderCreated,
    ProviderDeleted,
    ServiceCreated,
    ServiceDeleted,
    ResourceCreated,
    ResourceDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleNotification {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub status: LifecycleStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataNotification {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    pub path: ResourcePath,
    pub data_type: DataType,
    pub old: TimedValue,
    pub new: TimedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataNotification {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    pub path: ResourcePath,
    pub key: String,
    pub old: TimedValue,
    pub new: TimedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionNotification {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    pub path: ResourcePath,
    pub timestamp: DateTime<Utc>,
}

/// One change recorded by a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    Lifecycle(LifecycleNotification),
    Data(DataNotification),
    Metadata(MetadataNotification),
    Action(ActionNotification),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Lifecycle(_) => "LIFECYCLE",
            Notification::Data(_) => "DATA",
            Notification::Metadata(_) => "METADATA",
            Notification::Action(_) => "ACTION",
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Notification::Lifecycle(n) => &n.provider,
            Notification::Data(n) => &n.path.provider,
            Notification::Metadata(n) => &n.path.provider,
            Notification::Action(n) => &n.path.provider,
        }
    }

    /// `provider[/service[/resource]]` segments, used for topic matching.
    pub fn segments(&self) -> Vec<&str> {
        let path = match self {
            Notification::Lifecycle(n) => {
                let mut segments = vec![n.provider.as_str()];
                if let Some(service) = &n.service {
                    segments.push(service);
                    if let Some(resource) = &n.resource {
                        segments.push(resource);
                    }
                }
                return segments;
            }
            Notification::Data(n) => &n.path,
            Notification::Metadata(n) => &n.path,
            Notification::Action(n) => &n.path,
        };
        vec![path.provider.as_str(), path.service.as_str(), path.resource.as_str()]
    }

    pub fn path(&self) -> String {
        self.segments().join("/")
    }

    pub fn topic(&self) -> String {
        format!("{}/{}", self.kind(), self.path())
    }
}

/// Ordered log of the notifications one command produced.
///
/// Installed in the twin for the duration of a command body and flushed to
/// the bus by the worker once the caller's handle has been resolved. Records
/// are never coalesced.
#[derive(Debug, Default)]
pub struct NotificationAccumulator {
    records: Vec<Notification>,
}

impl NotificationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lifecycle(
        &mut self,
        model: &str,
        package_uri: Option<&str>,
        provider: &str,
        service: Option<&str>,
        resource: Option<&str>,
        status: LifecycleStatus,
    ) {
        self.records.push(Notification::Lifecycle(LifecycleNotification {
            model: model.to_string(),
            package_uri: package_uri.map(str::to_string),
            provider: provider.to_string(),
            service: service.map(str::to_string),
            resource: resource.map(str::to_string),
            status,
        }));
    }

    pub fn add_data_update(
        &mut self,
        model: &str,
        package_uri: Option<&str>,
        path: &ResourcePath,
        data_type: DataType,
        old: TimedValue,
        new: TimedValue,
    ) {
        self.records.push(Notification::Data(DataNotification {
            model: model.to_string(),
            package_uri: package_uri.map(str::to_string),
            path: path.clone(),
            data_type,
            old,
            new,
        }));
    }

    pub fn add_metadata_update(
        &mut self,
        model: &str,
        package_uri: Option<&str>,
        path: &ResourcePath,
        key: &str,
        old: TimedValue,
        new: TimedValue,
    ) {
        self.records.push(Notification::Metadata(MetadataNotification {
            model: model.to_string(),
            package_uri: package_uri.map(str::to_string),
            path: path.clone(),
            key: key.to_string(),
            old,
            new,
        }));
    }

    pub fn add_action(
        &mut self,
        model: &str,
        package_uri: Option<&str>,
        path: &ResourcePath,
        timestamp: DateTime<Utc>,
    ) {
        self.records.push(Notification::Action(ActionNotification {
            model: model.to_string(),
            package_uri: package_uri.map(str::to_string),
            path: path.clone(),
            timestamp,
        }));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops everything recorded after the first `len` records.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.records.iter()
    }

    /// Delivers every record in order and returns how many there were.
    pub fn flush(self, bus: &NotificationBus) -> usize {
        let count = self.records.len();
        for notification in &self.records {
            bus.deliver(notification);
        }
        count
    }
}

impl IntoIterator for NotificationAccumulator {
    type Item = Notification;
    type IntoIter = std::vec::IntoIter<Notification>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
