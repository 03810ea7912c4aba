//! IM providers service.
//!
//! Hosts provider adapters behind two entry points: the `/wh/{provider}`
//! webhook router and one bus pipeline per outbound operation.

pub mod config;
pub mod dispatcher;
pub mod failure;
pub mod http;
mod main_logic;

pub use config::{ConfigArgs, ConfigError, ServiceConfig};
pub use dispatcher::{
    DispatchError, DispatchSettings, Dispatcher, DispatcherHandle, Outcome, PanicPolicy, Skip,
    new_instance_id,
};
pub use failure::{BusFailureSink, FailureSink, TerminalFailure};
pub use http::{WebhookState, build_router};
pub use main_logic::{Drain, GatewayServices, build_registry, drain_within, run};
