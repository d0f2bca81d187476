use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use crate::digital_twin::{ActionBinding, DataType, ResourceDecl, ResourceType, Value, ValueType};
use crate::error::TwinError;

/// Function bound to an ACTION resource.
///
/// Arguments arrive already coerced to the declared argument types. The
/// returned future runs off the gateway worker.
pub trait ActionHandler: Send + Sync + 'static {
    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> ActionHandler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self)(args).boxed()
    }
}

/// Declared shape of one resource of a model.
#[derive(Debug, Clone)]
pub struct ResourceModel {
    pub(crate) decl: ResourceDecl,
    pub(crate) initial_value: Option<Value>,
    pub(crate) action: Option<ActionBinding>,
}

impl ResourceModel {
    pub fn sensor(data_type: DataType) -> Self {
        Self::from_decl(ResourceDecl::sensor(data_type))
    }

    pub fn property(data_type: DataType) -> Self {
        Self::from_decl(ResourceDecl::property(data_type))
    }

    pub fn state_variable(data_type: DataType) -> Self {
        Self::from_decl(ResourceDecl::state_variable(data_type))
    }

    /// A property only settable once, typically given an initial value.
    pub fn fixed(data_type: DataType) -> Self {
        Self::from_decl(ResourceDecl::property(data_type).with_value_type(ValueType::Fixed))
    }

    pub fn from_decl(decl: ResourceDecl) -> Self {
        Self { decl, initial_value: None, action: None }
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.decl.value_type = value_type;
        self
    }

    /// Value stamped with the provider creation instant.
    pub fn initial_value(mut self, value: impl Into<Value>) -> Self {
        self.initial_value = Some(value.into());
        self
    }

    pub fn decl(&self) -> ResourceDecl {
        self.decl
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceModel {
    pub(crate) resources: BTreeMap<String, ResourceModel>,
}

impl ServiceModel {
    pub fn resource(&self, name: &str) -> Option<&ResourceModel> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = (&str, &ResourceModel)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Declared shape of a provider.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) package_uri: Option<String>,
    pub(crate) locked: bool,
    pub(crate) services: BTreeMap<String, ServiceModel>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package_uri: None,
            locked: false,
            services: BTreeMap::new(),
        }
    }

    pub fn package_uri(mut self, uri: impl Into<String>) -> Self {
        self.package_uri = Some(uri.into());
        self
    }

    /// A locked model rejects services and resources it does not declare.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn with_resource(
        mut self,
        service: impl Into<String>,
        resource: impl Into<String>,
        model: ResourceModel,
    ) -> Self {
        self.services
            .entry(service.into())
            .or_default()
            .resources
            .insert(resource.into(), model);
        self
    }

    /// Declares an ACTION resource with its positional argument signature.
    pub fn with_action<H: ActionHandler>(
        self,
        service: impl Into<String>,
        resource: impl Into<String>,
        arguments: Vec<(String, DataType)>,
        returns: DataType,
        handler: H,
    ) -> Self {
        let model = ResourceModel {
            decl: ResourceDecl {
                data_type: returns,
                resource_type: ResourceType::Action,
                value_type: ValueType::Fixed,
            },
            initial_value: None,
            action: Some(ActionBinding {
                arguments,
                handler: Some(Arc::new(handler)),
            }),
        };
        self.with_resource(service, resource, model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn service(&self, name: &str) -> Option<&ServiceModel> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = (&str, &ServiceModel)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn resource(&self, service: &str, resource: &str) -> Option<&ResourceModel> {
        self.services.get(service).and_then(|s| s.resource(resource))
    }

    /// Whether a provider of this model may hold `service/resource`.
    pub fn allows(&self, service: &str, resource: &str) -> bool {
        !self.locked || self.resource(service, resource).is_some()
    }
}

/// Models known to a twin, keyed by name.
///
/// Owned by the `DigitalTwin`, so it is only reached from inside commands.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Model>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: Model) -> Result<(), TwinError> {
        if self.models.contains_key(&model.name) {
            return Err(TwinError::ModelExists { model: model.name });
        }
        for (service, service_model) in model.services() {
            for (resource, resource_model) in service_model.resources() {
                if let Some(initial) = &resource_model.initial_value {
                    resource_model.decl.data_type.coerce(initial.clone()).map_err(|source| {
                        TwinError::InvalidInitialValue {
                            model: model.name.clone(),
                            service: service.to_string(),
                            resource: resource.to_string(),
                            source,
                        }
                    })?;
                }
            }
        }
        debug!(model = %model.name, locked = model.locked, "model registered");
        self.models.insert(model.name.clone(), model);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    /// Returns the model named `name`, registering an empty dynamic one if
    /// it is unknown.
    pub fn ensure(&mut self, name: &str, package_uri: Option<&str>) -> &Model {
        self.models.entry(name.to_string()).or_insert_with(|| {
            debug!(model = %name, "dynamic model registered");
            Model {
                name: name.to_string(),
                package_uri: package_uri.map(str::to_string),
                locked: false,
                services: BTreeMap::new(),
            }
        })
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
