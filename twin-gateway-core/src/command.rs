//! Units of work executed by the gateway worker.
//!
//! A command gets exclusive access to the twin for the duration of its body
//! and answers with a [`Completion`]: either a ready value or a future the
//! worker drives elsewhere. The twin borrow never outlives the call.

use std::future::Future;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::digital_twin::{DigitalTwin, Resource, ResourcePath, TimedValue, Value};
use crate::error::TwinError;
use crate::gateway::CommandHandle;

pub type CommandFuture<T> = BoxFuture<'static, Result<T, TwinError>>;
pub type CommandResult<T> = Result<Completion<T>, TwinError>;

/// Outcome of a command body.
pub enum Completion<T> {
    Done(T),
    /// Resolved later, off the worker. Notifications recorded by the body
    /// are flushed once this settles, and discarded if it fails.
    Deferred(CommandFuture<T>),
}

impl<T: Send + 'static> Completion<T> {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, TwinError>> + Send + 'static,
    {
        Completion::Deferred(future.boxed())
    }

    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Completion::Done(value) => Completion::Done(f(value)),
            Completion::Deferred(future) => Completion::Deferred(future.map(|r| r.map(f)).boxed()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Completion::Done(_))
    }
}

impl<T> From<T> for Completion<T> {
    fn from(value: T) -> Self {
        Completion::Done(value)
    }
}

pub trait TwinCommand: Send + 'static {
    type Output: Send + 'static;

    fn call(self, twin: &mut DigitalTwin) -> CommandResult<Self::Output>;
}

/// Closure command for ad hoc work.
pub struct FnCommand<F, T> {
    body: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> FnCommand<F, T>
where
    F: FnOnce(&mut DigitalTwin) -> CommandResult<T> + Send + 'static,
    T: Send + 'static,
{
    pub fn new(body: F) -> Self {
        Self { body, _output: PhantomData }
    }
}

impl<F, T> TwinCommand for FnCommand<F, T>
where
    F: FnOnce(&mut DigitalTwin) -> CommandResult<T> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn call(self, twin: &mut DigitalTwin) -> CommandResult<T> {
        (self.body)(twin)
    }
}

/// Twin access scoped to one resolved resource.
pub struct ResourceScope<'a> {
    twin: &'a mut DigitalTwin,
    path: &'a ResourcePath,
}

impl<'a> ResourceScope<'a> {
    pub fn path(&self) -> &ResourcePath {
        self.path
    }

    pub fn resource(&self) -> Result<&Resource, TwinError> {
        self.twin.resource(self.path).ok_or_else(|| TwinError::not_found(self.path))
    }

    pub fn value(&self) -> Result<&TimedValue, TwinError> {
        self.resource().map(Resource::value)
    }

    pub fn set_value(&mut self, value: Value, timestamp: DateTime<Utc>) -> Result<bool, TwinError> {
        self.twin.set_resource_value(self.path, value, timestamp)
    }

    pub fn external_set(&mut self, value: Value, timestamp: DateTime<Utc>) -> Result<bool, TwinError> {
        self.twin.external_set(self.path, value, timestamp)
    }

    pub fn set_metadata(&mut self, key: &str, value: Value, timestamp: DateTime<Utc>) -> Result<bool, TwinError> {
        self.twin.set_resource_metadata(self.path, key, value, timestamp)
    }

    pub fn invoke(&mut self, args: Vec<Value>) -> Result<CommandFuture<Value>, TwinError> {
        self.twin.invoke_action(self.path, args)
    }

    /// The whole twin, for work that reaches beyond this resource.
    pub fn twin(&mut self) -> &mut DigitalTwin {
        self.twin
    }
}

/// Command bound to a `provider/service/resource` triple. Fails with
/// `ResourceNotFound` before the body runs when the triple does not resolve.
pub struct ResourceCommand<F, T> {
    path: ResourcePath,
    body: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> ResourceCommand<F, T>
where
    F: FnOnce(&mut ResourceScope<'_>) -> CommandResult<T> + Send + 'static,
    T: Send + 'static,
{
    pub fn new(path: ResourcePath, body: F) -> Self {
        Self { path, body, _output: PhantomData }
    }
}

impl<F, T> TwinCommand for ResourceCommand<F, T>
where
    F: FnOnce(&mut ResourceScope<'_>) -> CommandResult<T> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn call(self, twin: &mut DigitalTwin) -> CommandResult<T> {
        if twin.resource(&self.path).is_none() {
            return Err(TwinError::not_found(&self.path));
        }
        let mut scope = ResourceScope { twin, path: &self.path };
        (self.body)(&mut scope)
    }
}

/// Where a dependent command gets its input from.
pub(crate) enum Parent<P> {
    Command(Box<dyn FnOnce(&mut DigitalTwin) -> CommandResult<P> + Send>),
    Handle(CommandHandle<P>),
}

/// A continuation queued as a new command once its parent resolved.
///
/// The worker is never held while the parent is pending: the parent runs
/// (or is awaited) on its own and the continuation is submitted afterwards,
/// behind whatever was queued in between.
pub struct DependentCommand<P, T> {
    pub(crate) parent: Parent<P>,
    pub(crate) continuation: Box<dyn FnOnce(P, &mut DigitalTwin) -> CommandResult<T> + Send>,
}

impl<P, T> DependentCommand<P, T>
where
    P: Send + 'static,
    T: Send + 'static,
{
    pub fn new<C, K>(parent: C, continuation: K) -> Self
    where
        C: TwinCommand<Output = P>,
        K: FnOnce(P, &mut DigitalTwin) -> CommandResult<T> + Send + 'static,
    {
        Self {
            parent: Parent::Command(Box::new(move |twin: &mut DigitalTwin| parent.call(twin))),
            continuation: Box::new(continuation),
        }
    }

    /// Chains onto a command that was already submitted.
    pub fn after<K>(parent: CommandHandle<P>, continuation: K) -> Self
    where
        K: FnOnce(P, &mut DigitalTwin) -> CommandResult<T> + Send + 'static,
    {
        Self {
            parent: Parent::Handle(parent),
            continuation: Box::new(continuation),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::digital_twin::{DataType, ResourceDecl};

    fn twin() -> DigitalTwin {
        let mut twin = DigitalTwin::new();
        twin.create_provider("P1", "P1", Utc::now(), None).unwrap();
        twin.get_or_create_resource(&ResourcePath::new("P1", "svc", "val"), ResourceDecl::sensor(DataType::Long))
            .unwrap();
        twin
    }

    #[test]
    fn resource_command_fails_before_body_on_missing_resource() {
        let mut twin = twin();
        let cmd = ResourceCommand::<_, ()>::new(ResourcePath::new("P1", "svc", "nope"), |_scope: &mut ResourceScope<'_>| {
            panic!("body must not run")
        });
        let err = cmd.call(&mut twin).err().unwrap();
        assert!(matches!(err, TwinError::ResourceNotFound { .. }));
    }

    #[test]
    fn resource_command_sees_its_resource() {
        let mut twin = twin();
        let cmd = ResourceCommand::new(ResourcePath::new("P1", "svc", "val"), |scope: &mut ResourceScope<'_>| {
            scope.set_value(json!(3), Utc::now())?;
            Ok(Completion::Done(scope.value()?.value.clone()))
        });
        match cmd.call(&mut twin).unwrap() {
            Completion::Done(v) => assert_eq!(v, json!(3)),
            Completion::Deferred(_) => panic!("expected a ready value"),
        }
    }

    #[tokio::test]
    async fn deferred_completion_maps_its_output() {
        let completion = Completion::deferred(async { Ok::<_, TwinError>(20) }).map(|n: i32| n + 1);
        assert!(!completion.is_ready());
        match completion {
            Completion::Deferred(f) => assert_eq!(f.await.unwrap(), 21),
            Completion::Done(_) => panic!("expected a deferred value"),
        }
        let ready = Completion::from("x").map(str::len);
        assert!(matches!(ready, Completion::Done(1)));
    }
}
