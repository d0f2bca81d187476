use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::canonical::GenericDto;
use crate::digital_twin::{CoercionError, DataType, ResourcePath, ResourceType, ValueType};

/// Failure of a twin operation or of the command that ran it.
///
/// A write rejected because its timestamp is older than the stored one is
/// not an error: the store reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum TwinError {
    #[error("resource {path} not found")]
    ResourceNotFound { path: ResourcePath },

    #[error("provider {provider} not found")]
    ProviderNotFound { provider: String },

    #[error("provider {provider} already exists")]
    AlreadyExists { provider: String },

    #[error("model {model} is already registered")]
    ModelExists { model: String },

    #[error("model {model} declares an invalid initial value for {service}/{resource}: {source}")]
    InvalidInitialValue {
        model: String,
        service: String,
        resource: String,
        #[source]
        source: CoercionError,
    },

    #[error("provider {provider} uses model {actual}, not {expected}")]
    ModelMismatch {
        provider: String,
        expected: String,
        actual: String,
    },

    #[error("resource {path} is declared as {existing}, not {requested}")]
    TypeConflict {
        path: ResourcePath,
        existing: DataType,
        requested: DataType,
    },

    #[error("resource {path} is a {existing:?} resource, not {requested:?}")]
    ResourceTypeConflict {
        path: ResourcePath,
        existing: ResourceType,
        requested: ResourceType,
    },

    #[error("invalid value for {path}: {source}")]
    TypeMismatch {
        path: ResourcePath,
        #[source]
        source: CoercionError,
    },

    #[error("resource {path} is {value_type:?} and cannot be set this way")]
    NotModifiable {
        path: ResourcePath,
        value_type: ValueType,
    },

    #[error("resource {path} is an action and can only be invoked")]
    ActionResource { path: ResourcePath },

    #[error("resource {path} is not an action")]
    NotAnAction { path: ResourcePath },

    #[error("action {path} has no bound handler")]
    ActionUnbound { path: ResourcePath },

    #[error("action {path} expects {expected} arguments, got {actual}")]
    InvalidArguments {
        path: ResourcePath,
        expected: usize,
        actual: usize,
    },

    #[error("argument {argument} of action {path}: {source}")]
    InvalidArgument {
        path: ResourcePath,
        argument: String,
        #[source]
        source: CoercionError,
    },

    #[error("action {path} failed: {source}")]
    ActionFailed {
        path: ResourcePath,
        #[source]
        source: anyhow::Error,
    },

    #[error("{target} is exclusively owned by {owner}")]
    NotOwner { target: String, owner: String },

    #[error("model {model} does not declare {service}/{resource}")]
    UndeclaredResource {
        model: String,
        service: String,
        resource: String,
    },

    #[error("gateway queue is full ({limit} pending commands)")]
    QueueFull { limit: usize },

    #[error("gateway is closed")]
    Closed,

    #[error("command panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Command(#[from] anyhow::Error),
}

impl TwinError {
    pub(crate) fn not_found(path: &ResourcePath) -> Self {
        Self::ResourceNotFound { path: path.clone() }
    }
}

/// A DTO that could not be turned into an update.
///
/// Carries the offending DTO and whatever part of the target path had been
/// resolved before the failure.
#[derive(Debug, Clone)]
pub struct DataMappingError {
    pub index: usize,
    pub dto: Box<GenericDto>,
    pub provider: Option<String>,
    pub service: Option<String>,
    pub resource: Option<String>,
    pub cause: String,
}

impl fmt::Display for DataMappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot map update #{} ({}): {}",
            self.index,
            self.resolved_path(),
            self.cause
        )
    }
}

impl std::error::Error for DataMappingError {}

impl DataMappingError {
    pub fn resolved_path(&self) -> String {
        [&self.provider, &self.service, &self.resource]
            .iter()
            .map(|part| part.as_deref().unwrap_or("?"))
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// One failed item of a `push_update` call.
#[derive(Debug, Error)]
pub enum UpdateFailure {
    #[error(transparent)]
    Mapping(DataMappingError),

    #[error("update #{index} failed: {error}")]
    Update {
        index: usize,
        dto: Box<GenericDto>,
        #[source]
        error: TwinError,
    },

    #[error("updates {indices:?} for provider {provider} were not applied: {error}")]
    Batch {
        provider: String,
        indices: Vec<usize>,
        #[source]
        error: TwinError,
    },
}

impl UpdateFailure {
    /// Position of the first affected item in the submitted batch.
    pub fn index(&self) -> usize {
        match self {
            Self::Mapping(e) => e.index,
            Self::Update { index, .. } => *index,
            Self::Batch { indices, .. } => indices.first().copied().unwrap_or_default(),
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }
}

/// Aggregate rejection of a `push_update` call.
///
/// Every item that could be applied has already been committed when this is
/// returned.
#[derive(Debug)]
pub struct FailedUpdates {
    pub failures: Vec<UpdateFailure>,
}

impl fmt::Display for FailedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} update(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FailedUpdates {}

impl FailedUpdates {
    pub fn mapping_errors(&self) -> impl Iterator<Item = &DataMappingError> {
        self.failures.iter().filter_map(|f| match f {
            UpdateFailure::Mapping(e) => Some(e),
            _ => None,
        })
    }

    /// Flat, serializable view used by the HTTP surface.
    pub fn report(&self) -> Vec<FailureReport> {
        self.failures
            .iter()
            .map(|failure| {
                let (provider, service, resource) = match failure {
                    UpdateFailure::Mapping(e) => {
                        (e.provider.clone(), e.service.clone(), e.resource.clone())
                    }
                    UpdateFailure::Update { dto, .. } => {
                        (dto.provider.clone(), dto.service.clone(), dto.resource.clone())
                    }
                    UpdateFailure::Batch { provider, .. } => (Some(provider.clone()), None, None),
                };
                FailureReport {
                    index: failure.index(),
                    kind: if failure.is_mapping() { "mapping" } else { "update" },
                    provider,
                    service,
                    resource,
                    error: failure.to_string(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub index: usize,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub error: String,
}
