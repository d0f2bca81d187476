use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entity::{Provider, Resource, ResourceType, Service, ValueType};
use super::value::{DataType, TimedValue};

/// Owned copy of a provider, safe to hand out of the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub name: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_package_uri: Option<String>,
    pub created: DateTime<Utc>,
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub name: String,
    pub resources: Vec<ResourceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub name: String,
    pub data_type: DataType,
    pub resource_type: ResourceType,
    pub value_type: ValueType,
    #[serde(skip_serializing_if = "TimedValue::is_empty")]
    pub value: TimedValue,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, TimedValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<(String, DataType)>,
}

impl ProviderSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    pub(crate) fn capture<F>(provider: &Provider, keep: F) -> Self
    where
        F: Fn(&Service, Option<&Resource>) -> bool,
    {
        let keep = &keep;
        let services = provider
            .services
            .values()
            .filter(|service| keep(*service, None))
            .map(move |service| ServiceSnapshot {
                name: service.name.clone(),
                resources: service
                    .resources
                    .values()
                    .filter(move |resource| keep(service, Some(*resource)))
                    .map(ResourceSnapshot::from)
                    .collect(),
            })
            .collect();
        Self {
            name: provider.name.clone(),
            model: provider.model.clone(),
            model_package_uri: provider.package_uri.clone(),
            created: provider.created,
            services,
        }
    }
}

impl ServiceSnapshot {
    pub fn resource(&self, name: &str) -> Option<&ResourceSnapshot> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl From<&Service> for ServiceSnapshot {
    fn from(service: &Service) -> Self {
        Self {
            name: service.name.clone(),
            resources: service.resources.values().map(ResourceSnapshot::from).collect(),
        }
    }
}

impl From<&Resource> for ResourceSnapshot {
    fn from(resource: &Resource) -> Self {
        Self {
            name: resource.name.clone(),
            data_type: resource.data_type,
            resource_type: resource.resource_type,
            value_type: resource.value_type,
            value: resource.value.clone(),
            metadata: resource.metadata.clone(),
            arguments: resource
                .action
                .as_ref()
                .map(|a| a.arguments.clone())
                .unwrap_or_default(),
        }
    }
}
