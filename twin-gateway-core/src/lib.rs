pub mod bus;
pub mod canonical;
pub mod command;
pub mod config;
pub mod digital_twin;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod notification;
pub mod protocols;
pub mod registry;
pub mod update;

pub use bus::{NotificationBus, NotificationListener, SubscriptionId};
pub use canonical::{BulkGenericDto, GenericDto, UpdatePayload};
pub use command::{Completion, DependentCommand, ResourceCommand, TwinCommand};
pub use digital_twin::DigitalTwin;
pub use error::{DataMappingError, FailedUpdates, TwinError};
pub use gateway::{CommandHandle, GatewayThread, ShutdownMode};
pub use notification::Notification;
pub use update::DataUpdate;
