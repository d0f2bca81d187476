//! In-memory twin of the providers known to the gateway.
//!
//! The store is only ever touched from inside a command running on the
//! gateway worker, so nothing here is synchronized. Every accepted mutation
//! is recorded into the notification accumulator installed for the running
//! command.

mod entity;
mod snapshot;
mod value;

use std::collections::BTreeMap;
use std::mem;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tracing::{debug, trace};

pub use entity::{
    admin, ActionBinding, NewProvider, Provider, Resource, ResourceDecl, ResourcePath, ResourceType,
    Service, ValueType, ADMIN_SERVICE,
};
pub use snapshot::{ProviderSnapshot, ResourceSnapshot, ServiceSnapshot};
pub use value::{CoercionError, DataType, TimedValue, UnknownDataType, Value};

use crate::command::CommandFuture;
use crate::error::TwinError;
use crate::notification::{LifecycleStatus, NotificationAccumulator};
use crate::registry::{Model, ModelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOrigin {
    /// Producers and commands.
    Internal,
    /// Northbound SET.
    External,
}

/// Ownership and cleanup policy of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePolicy {
    /// Only this requester may delete the service.
    pub owner: Option<String>,
    /// Remove the service once its last resource is gone.
    pub auto_delete: bool,
}

#[derive(Debug, Default)]
pub struct DigitalTwin {
    providers: BTreeMap<String, Provider>,
    models: ModelRegistry,
    notifications: NotificationAccumulator,
}

impl DigitalTwin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: ModelRegistry) -> Self {
        Self {
            models,
            ..Self::default()
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut ModelRegistry {
        &mut self.models
    }

    // -- accumulator ------------------------------------------------------

    /// Installs a fresh accumulator for the next command body.
    pub(crate) fn begin_command(&mut self) {
        self.notifications = NotificationAccumulator::new();
    }

    /// Removes what the running command has recorded so far.
    pub fn take_notifications(&mut self) -> NotificationAccumulator {
        mem::take(&mut self.notifications)
    }

    // -- lookups ----------------------------------------------------------

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.values()
    }

    /// The provider named `name`, only if it is of `model`.
    pub fn provider_of_model(&self, model: &str, name: &str) -> Option<&Provider> {
        self.providers.get(name).filter(|p| p.model == model)
    }

    pub fn service(&self, provider: &str, service: &str) -> Option<&Service> {
        self.providers.get(provider)?.services.get(service)
    }

    pub fn resource(&self, path: &ResourcePath) -> Option<&Resource> {
        self.service(&path.provider, &path.service)?.resources.get(&path.resource)
    }

    pub fn resource_value(&self, path: &ResourcePath) -> Option<&TimedValue> {
        self.resource(path).map(Resource::value)
    }

    pub fn resource_metadata(&self, path: &ResourcePath, key: &str) -> Option<&TimedValue> {
        self.resource(path)?.metadata.get(key)
    }

    // -- creation ---------------------------------------------------------

    pub fn create_provider(
        &mut self,
        model: &str,
        name: &str,
        created: DateTime<Utc>,
        package_uri: Option<&str>,
    ) -> Result<&Provider, TwinError> {
        let mut spec = NewProvider::new(model, name).created_at(created);
        spec.package_uri = package_uri.map(str::to_string);
        self.create_provider_with(spec)
    }

    /// Creates a provider with its admin service and every service and
    /// resource its model declares. Unknown models are registered as empty
    /// dynamic models.
    pub fn create_provider_with(&mut self, spec: NewProvider) -> Result<&Provider, TwinError> {
        if self.providers.contains_key(&spec.name) {
            return Err(TwinError::AlreadyExists { provider: spec.name });
        }
        let model: Model = self.models.ensure(&spec.model, spec.package_uri.as_deref()).clone();
        let package_uri = spec.package_uri.or_else(|| model.package_uri.clone());
        let name = spec.name;
        let created = spec.created;

        debug!(provider = %name, model = %model.name, "creating provider");
        let mark = self.notifications.len();
        self.providers.insert(
            name.clone(),
            Provider {
                name: name.clone(),
                model: model.name.clone(),
                package_uri: package_uri.clone(),
                created,
                services: BTreeMap::new(),
                owner: spec.owner,
                exclusively_owned: spec.exclusively_owned,
                auto_delete: spec.auto_delete,
            },
        );
        self.notifications.add_lifecycle(
            &model.name,
            package_uri.as_deref(),
            &name,
            None,
            None,
            LifecycleStatus::ProviderCreated,
        );

        // A provider is created whole or not at all.
        if let Err(e) = self.populate_provider(&name, &model, package_uri.as_deref(), created) {
            self.providers.remove(&name);
            self.notifications.truncate(mark);
            return Err(e);
        }

        self.providers
            .get(&name)
            .ok_or(TwinError::ProviderNotFound { provider: name })
    }

    fn populate_provider(
        &mut self,
        name: &str,
        model: &Model,
        package_uri: Option<&str>,
        created: DateTime<Utc>,
    ) -> Result<(), TwinError> {
        self.insert_service(name, ADMIN_SERVICE);
        let text = DataType::String;
        let fixed = ResourceDecl::property(text).with_value_type(ValueType::Fixed);
        for (resource, decl) in [
            (admin::FRIENDLY_NAME, ResourceDecl::property(text)),
            (admin::LOCATION, ResourceDecl::property(DataType::Any)),
            (admin::MODEL, fixed),
            (admin::MODEL_PACKAGE_URI, fixed),
            (admin::DESCRIPTION, ResourceDecl::property(text)),
        ] {
            self.insert_resource(&ResourcePath::new(name, ADMIN_SERVICE, resource), decl, None);
        }
        self.write_value(
            &ResourcePath::new(name, ADMIN_SERVICE, admin::MODEL),
            Value::String(model.name.clone()),
            created,
            WriteOrigin::Internal,
        )?;
        if let Some(uri) = package_uri {
            self.write_value(
                &ResourcePath::new(name, ADMIN_SERVICE, admin::MODEL_PACKAGE_URI),
                Value::String(uri.to_string()),
                created,
                WriteOrigin::Internal,
            )?;
        }

        for (service, service_model) in model.services() {
            if service != ADMIN_SERVICE {
                self.insert_service(name, service);
            }
            for (resource, resource_model) in service_model.resources() {
                let path = ResourcePath::new(name, service, resource);
                self.insert_resource(&path, resource_model.decl, resource_model.action.clone());
                if let Some(initial) = &resource_model.initial_value {
                    self.write_value(&path, initial.clone(), created, WriteOrigin::Internal)?;
                }
            }
        }
        Ok(())
    }

    pub fn get_or_create_service(&mut self, provider: &str, service: &str) -> Result<&Service, TwinError> {
        let owner = self
            .providers
            .get(provider)
            .ok_or_else(|| TwinError::ProviderNotFound { provider: provider.to_string() })?;
        if !owner.services.contains_key(service) {
            if let Some(model) = self.models.get(&owner.model) {
                if model.is_locked() && model.service(service).is_none() {
                    return Err(TwinError::UndeclaredResource {
                        model: model.name.clone(),
                        service: service.to_string(),
                        resource: "*".to_string(),
                    });
                }
            }
            self.insert_service(provider, service);
        }
        self.service(provider, service)
            .ok_or_else(|| TwinError::ProviderNotFound { provider: provider.to_string() })
    }

    /// Returns the resource at `path`, creating it (and its service) when
    /// missing.
    ///
    /// An existing resource must be compatible with `decl`. A resource the
    /// provider's model declares is created with the declared shape.
    pub fn get_or_create_resource(&mut self, path: &ResourcePath, decl: ResourceDecl) -> Result<&Resource, TwinError> {
        self.get_or_create_service(&path.provider, &path.service)?;

        if let Some(existing) = self.resource(path) {
            if !existing.data_type.is_compatible_with(decl.data_type) {
                return Err(TwinError::TypeConflict {
                    path: path.clone(),
                    existing: existing.data_type,
                    requested: decl.data_type,
                });
            }
            if existing.resource_type != decl.resource_type {
                return Err(TwinError::ResourceTypeConflict {
                    path: path.clone(),
                    existing: existing.resource_type,
                    requested: decl.resource_type,
                });
            }
        } else {
            let model_name = self.providers.get(&path.provider).map(|p| p.model.clone()).unwrap_or_default();
            let declared = self.models.get(&model_name).map(|model| {
                (model.allows(&path.service, &path.resource), model.resource(&path.service, &path.resource).cloned())
            });
            let (decl, action) = match declared {
                Some((false, _)) => {
                    return Err(TwinError::UndeclaredResource {
                        model: model_name,
                        service: path.service.clone(),
                        resource: path.resource.clone(),
                    })
                }
                Some((true, Some(declared))) => {
                    if !declared.decl.data_type.is_compatible_with(decl.data_type) {
                        return Err(TwinError::TypeConflict {
                            path: path.clone(),
                            existing: declared.decl.data_type,
                            requested: decl.data_type,
                        });
                    }
                    (declared.decl, declared.action)
                }
                _ => (decl, None),
            };
            self.insert_resource(path, decl, action);
        }
        self.resource(path).ok_or_else(|| TwinError::not_found(path))
    }

    pub fn set_service_policy(&mut self, provider: &str, service: &str, policy: ServicePolicy) -> Result<(), TwinError> {
        let target = self
            .providers
            .get_mut(provider)
            .and_then(|p| p.services.get_mut(service))
            .ok_or_else(|| TwinError::ProviderNotFound { provider: provider.to_string() })?;
        target.exclusively_owned = policy.owner.is_some();
        target.owner = policy.owner;
        target.auto_delete = policy.auto_delete;
        Ok(())
    }

    fn insert_service(&mut self, provider: &str, service: &str) {
        let Some(owner) = self.providers.get_mut(provider) else {
            return;
        };
        if owner.services.contains_key(service) {
            return;
        }
        owner.services.insert(service.to_string(), Service::new(provider, service));
        self.notifications.add_lifecycle(
            &owner.model,
            owner.package_uri.as_deref(),
            provider,
            Some(service),
            None,
            LifecycleStatus::ServiceCreated,
        );
    }

    /// Value-less resources stay silent until their first value; actions are
    /// announced right away since they never hold one.
    fn insert_resource(&mut self, path: &ResourcePath, decl: ResourceDecl, action: Option<ActionBinding>) {
        let Some(provider) = self.providers.get_mut(&path.provider) else {
            return;
        };
        let Some(service) = provider.services.get_mut(&path.service) else {
            return;
        };
        if service.resources.contains_key(&path.resource) {
            return;
        }
        let mut resource = Resource::new(&path.resource, decl);
        if decl.resource_type == ResourceType::Action {
            resource.action = Some(action.unwrap_or(ActionBinding { arguments: Vec::new(), handler: None }));
            self.notifications.add_lifecycle(
                &provider.model,
                provider.package_uri.as_deref(),
                &path.provider,
                Some(&path.service),
                Some(&path.resource),
                LifecycleStatus::ResourceCreated,
            );
        }
        trace!(%path, data_type = %decl.data_type, "resource created");
        service.resources.insert(path.resource.clone(), resource);
    }

    // -- writes -----------------------------------------------------------

    /// Producer-side write. Returns `Ok(false)` when `timestamp` is older
    /// than the stored one.
    pub fn set_resource_value(&mut self, path: &ResourcePath, value: Value, timestamp: DateTime<Utc>) -> Result<bool, TwinError> {
        self.write_value(path, value, timestamp, WriteOrigin::Internal)
    }

    /// Northbound SET; only MODIFIABLE resources accept it.
    pub fn external_set(&mut self, path: &ResourcePath, value: Value, timestamp: DateTime<Utc>) -> Result<bool, TwinError> {
        self.write_value(path, value, timestamp, WriteOrigin::External)
    }

    fn write_value(
        &mut self,
        path: &ResourcePath,
        value: Value,
        timestamp: DateTime<Utc>,
        origin: WriteOrigin,
    ) -> Result<bool, TwinError> {
        let provider = self.providers.get_mut(&path.provider).ok_or_else(|| TwinError::not_found(path))?;
        let resource = provider
            .services
            .get_mut(&path.service)
            .and_then(|s| s.resources.get_mut(&path.resource))
            .ok_or_else(|| TwinError::not_found(path))?;

        if resource.is_action() {
            return Err(TwinError::ActionResource { path: path.clone() });
        }
        let allowed = match (origin, resource.value_type) {
            (WriteOrigin::External, ValueType::Modifiable) => true,
            (WriteOrigin::External, _) => false,
            (WriteOrigin::Internal, ValueType::Fixed) => resource.value.is_empty(),
            (WriteOrigin::Internal, _) => true,
        };
        if !allowed {
            return Err(TwinError::NotModifiable {
                path: path.clone(),
                value_type: resource.value_type,
            });
        }
        let value = resource
            .data_type
            .coerce(value)
            .map_err(|source| TwinError::TypeMismatch { path: path.clone(), source })?;
        if !resource.value.accepts(timestamp) {
            trace!(%path, %timestamp, "stale value dropped");
            return Ok(false);
        }

        let first = resource.value.is_empty();
        let new = TimedValue::new(value, timestamp);
        let old = mem::replace(&mut resource.value, new.clone());
        if first {
            self.notifications.add_lifecycle(
                &provider.model,
                provider.package_uri.as_deref(),
                &path.provider,
                Some(&path.service),
                Some(&path.resource),
                LifecycleStatus::ResourceCreated,
            );
        }
        self.notifications.add_data_update(
            &provider.model,
            provider.package_uri.as_deref(),
            path,
            resource.data_type,
            old,
            new,
        );
        Ok(true)
    }

    /// Same timestamp rule as values, applied per key.
    pub fn set_resource_metadata(
        &mut self,
        path: &ResourcePath,
        key: &str,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, TwinError> {
        let provider = self.providers.get_mut(&path.provider).ok_or_else(|| TwinError::not_found(path))?;
        let resource = provider
            .services
            .get_mut(&path.service)
            .and_then(|s| s.resources.get_mut(&path.resource))
            .ok_or_else(|| TwinError::not_found(path))?;

        let entry = resource.metadata.entry(key.to_string()).or_default();
        if !entry.accepts(timestamp) {
            return Ok(false);
        }
        let new = TimedValue::new(value, timestamp);
        let old = mem::replace(entry, new.clone());
        self.notifications.add_metadata_update(
            &provider.model,
            provider.package_uri.as_deref(),
            path,
            key,
            old,
            new,
        );
        Ok(true)
    }

    /// Validates `args` against the action's signature and starts it.
    ///
    /// The returned future must be driven off the worker; commands hand it
    /// back as a deferred completion.
    pub fn invoke_action(&mut self, path: &ResourcePath, args: Vec<Value>) -> Result<CommandFuture<Value>, TwinError> {
        let provider = self.providers.get(&path.provider).ok_or_else(|| TwinError::not_found(path))?;
        let resource = provider
            .services
            .get(&path.service)
            .and_then(|s| s.resources.get(&path.resource))
            .ok_or_else(|| TwinError::not_found(path))?;
        if !resource.is_action() {
            return Err(TwinError::NotAnAction { path: path.clone() });
        }
        let binding = resource
            .action
            .as_ref()
            .ok_or_else(|| TwinError::ActionUnbound { path: path.clone() })?;
        let handler = binding
            .handler
            .clone()
            .ok_or_else(|| TwinError::ActionUnbound { path: path.clone() })?;
        if args.len() != binding.arguments.len() {
            return Err(TwinError::InvalidArguments {
                path: path.clone(),
                expected: binding.arguments.len(),
                actual: args.len(),
            });
        }
        let args = binding
            .arguments
            .iter()
            .zip(args)
            .map(|((name, data_type), arg)| {
                data_type.coerce(arg).map_err(|source| TwinError::InvalidArgument {
                    path: path.clone(),
                    argument: name.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.notifications
            .add_action(&provider.model, provider.package_uri.as_deref(), path, Utc::now());
        debug!(%path, "action invoked");

        let path = path.clone();
        Ok(async move {
            handler
                .invoke(args)
                .await
                .map_err(|source| TwinError::ActionFailed { path, source })
        }
        .boxed())
    }

    // -- deletion ---------------------------------------------------------

    /// Removes a provider and everything below it. Returns `Ok(false)` when
    /// there is no such provider.
    pub fn delete_provider(&mut self, name: &str, requester: Option<&str>) -> Result<bool, TwinError> {
        let Some(provider) = self.providers.get(name) else {
            return Ok(false);
        };
        check_owner(name, provider.owner(), provider.exclusively_owned, requester)?;
        self.remove_provider(name);
        Ok(true)
    }

    pub fn delete_service(&mut self, provider: &str, service: &str, requester: Option<&str>) -> Result<bool, TwinError> {
        let Some(owner) = self.providers.get(provider) else {
            return Ok(false);
        };
        let Some(target) = owner.services.get(service) else {
            return Ok(false);
        };
        check_owner(provider, owner.owner(), owner.exclusively_owned, requester)?;
        check_owner(&format!("{provider}/{service}"), target.owner(), target.exclusively_owned, requester)?;
        self.remove_service(provider, service);
        self.auto_delete_provider(provider);
        Ok(true)
    }

    pub fn delete_resource(&mut self, path: &ResourcePath, requester: Option<&str>) -> Result<bool, TwinError> {
        let Some(owner) = self.providers.get_mut(&path.provider) else {
            return Ok(false);
        };
        let Some(service) = owner.services.get_mut(&path.service) else {
            return Ok(false);
        };
        if !service.resources.contains_key(&path.resource) {
            return Ok(false);
        }
        check_owner(&path.provider, owner.owner.as_deref(), owner.exclusively_owned, requester)?;
        check_owner(
            &format!("{}/{}", path.provider, path.service),
            service.owner.as_deref(),
            service.exclusively_owned,
            requester,
        )?;

        service.resources.remove(&path.resource);
        self.notifications.add_lifecycle(
            &owner.model,
            owner.package_uri.as_deref(),
            &path.provider,
            Some(&path.service),
            Some(&path.resource),
            LifecycleStatus::ResourceDeleted,
        );
        if service.auto_delete && service.resources.is_empty() {
            self.remove_service(&path.provider, &path.service);
        }
        self.auto_delete_provider(&path.provider);
        Ok(true)
    }

    fn auto_delete_provider(&mut self, name: &str) {
        let empty = self
            .providers
            .get(name)
            .is_some_and(|p| p.auto_delete && p.live_resource_count() == 0);
        if empty {
            debug!(provider = %name, "auto-deleting provider");
            self.remove_provider(name);
        }
    }

    fn remove_service(&mut self, provider: &str, service: &str) {
        let Some(owner) = self.providers.get_mut(provider) else {
            return;
        };
        let Some(removed) = owner.services.remove(service) else {
            return;
        };
        for resource in removed.resources.keys() {
            self.notifications.add_lifecycle(
                &owner.model,
                owner.package_uri.as_deref(),
                provider,
                Some(service),
                Some(resource),
                LifecycleStatus::ResourceDeleted,
            );
        }
        self.notifications.add_lifecycle(
            &owner.model,
            owner.package_uri.as_deref(),
            provider,
            Some(service),
            None,
            LifecycleStatus::ServiceDeleted,
        );
    }

    fn remove_provider(&mut self, name: &str) {
        let services: Vec<String> = match self.providers.get(name) {
            Some(p) => p.services.keys().cloned().collect(),
            None => return,
        };
        for service in services {
            self.remove_service(name, &service);
        }
        if let Some(removed) = self.providers.remove(name) {
            self.notifications.add_lifecycle(
                &removed.model,
                removed.package_uri.as_deref(),
                name,
                None,
                None,
                LifecycleStatus::ProviderDeleted,
            );
            debug!(provider = %name, "provider removed");
        }
    }

    // -- snapshots --------------------------------------------------------

    pub fn snapshot_provider(&self, name: &str) -> Option<ProviderSnapshot> {
        self.providers.get(name).map(|p| ProviderSnapshot::capture(p, |_, _| true))
    }

    pub fn snapshot_service(&self, provider: &str, service: &str) -> Option<ServiceSnapshot> {
        self.service(provider, service).map(ServiceSnapshot::from)
    }

    pub fn snapshot_resource(&self, path: &ResourcePath) -> Option<ResourceSnapshot> {
        self.resource(path).map(ResourceSnapshot::from)
    }

    pub fn snapshot_all(&self) -> Vec<ProviderSnapshot> {
        self.filtered_snapshot(|_| true, |_| true, |_| true)
    }

    /// Copies the providers, services and resources accepted by the three
    /// filters. A service is kept even when none of its resources are.
    pub fn filtered_snapshot<P, S, R>(&self, provider_filter: P, service_filter: S, resource_filter: R) -> Vec<ProviderSnapshot>
    where
        P: Fn(&Provider) -> bool,
        S: Fn(&Service) -> bool,
        R: Fn(&Resource) -> bool,
    {
        self.providers
            .values()
            .filter(|p| provider_filter(*p))
            .map(|p| {
                ProviderSnapshot::capture(p, |service, resource| match resource {
                    None => service_filter(service),
                    Some(resource) => resource_filter(resource),
                })
            })
            .collect()
    }
}

fn check_owner(target: &str, owner: Option<&str>, exclusive: bool, requester: Option<&str>) -> Result<(), TwinError> {
    match owner {
        Some(owner) if exclusive && Some(owner) != requester => Err(TwinError::NotOwner {
            target: target.to_string(),
            owner: owner.to_string(),
        }),
        _ => Ok(()),
    }
}
