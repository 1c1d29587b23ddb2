//! Assistant core: plugin dispatch and orchestration.
//!
//! Natural-language requests are resolved to an [`Intent`], routed by the
//! [`Dispatcher`] to permission-gated plugin handlers in priority order, and
//! answered with a structured [`Response`]. Plugins coordinate through the
//! [`EventBus`] and keep state in namespaced, expiring storage.

pub mod ai;
pub mod batch;
pub mod builtin;
pub mod cli;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod intent;
pub mod loader;
pub mod monitoring;
pub mod orchestrator;
pub mod permissions;
pub mod persistence;
pub mod plugin;
pub mod registry;
pub mod response;
pub mod settings;
pub mod storage;
pub mod telemetry;

pub use dispatcher::{DispatchResult, Dispatcher};
pub use error::{DispatchError, HandlerError, NotFoundError, RegistrationError};
pub use event_bus::EventBus;
pub use intent::{Intent, IntentResolver, RawRequest};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use permissions::{Permission, PermissionGate, Subject};
pub use plugin::{
    HandlerOutput, HandlerRequest, HandlerSpec, Plugin, PluginContext, PluginDescriptor,
};
pub use registry::PluginRegistry;
pub use response::Response;
pub use settings::Settings;
pub use storage::{KeyedExpiringStore, PluginStorage};
