use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What to do with an update whose value is null or missing.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NullAction {
    /// Leave the stored value alone.
    #[default]
    Ignore,
    /// Store an explicit null.
    Update,
}

/// What to do when the update carries the value already stored.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicateAction {
    #[default]
    UpdateAlways,
    UpdateIfDifferent,
}

/// One southbound update, as producers send it.
///
/// Everything is optional on the wire; missing path parts are reported as
/// mapping errors rather than deserialization failures.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenericDto {
    /// Defaults to the provider name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_package_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Type name (`integer`, `java.lang.Double`, ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    /// Ingestion time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    #[serde(default)]
    pub null_action: NullAction,
    #[serde(default)]
    pub duplicate_action: DuplicateAction,
}

impl GenericDto {
    pub fn new(provider: impl Into<String>, service: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            service: Some(service.into()),
            resource: Some(resource.into()),
            ..Self::default()
        }
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn data_type(mut self, name: impl Into<String>) -> Self {
        self.data_type = Some(name.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn null_action(mut self, action: NullAction) -> Self {
        self.null_action = action;
        self
    }

    pub fn duplicate_action(mut self, action: DuplicateAction) -> Self {
        self.duplicate_action = action;
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BulkGenericDto {
    pub dtos: Vec<GenericDto>,
}

/// Accept the bulk envelope, a bare array of DTOs or a single DTO.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum UpdatePayload {
    Bulk(BulkGenericDto),
    List(Vec<GenericDto>),
    Single(GenericDto),
}

impl UpdatePayload {
    pub fn into_dtos(self) -> Vec<GenericDto> {
        match self {
            UpdatePayload::Bulk(bulk) => bulk.dtos,
            UpdatePayload::List(dtos) => dtos,
            UpdatePayload::Single(dto) => vec![dto],
        }
    }
}

impl From<GenericDto> for UpdatePayload {
    fn from(dto: GenericDto) -> Self {
        UpdatePayload::Single(dto)
    }
}

impl From<BulkGenericDto> for UpdatePayload {
    fn from(bulk: BulkGenericDto) -> Self {
        UpdatePayload::Bulk(bulk)
    }
}

impl From<Vec<GenericDto>> for UpdatePayload {
    fn from(dtos: Vec<GenericDto>) -> Self {
        UpdatePayload::List(dtos)
    }
}
