//! Provider adapter contracts and the registry shared by webhook ingress and bus dispatch.

pub mod errors;
pub mod logging;
pub mod registry;
pub mod traits;

#[cfg(feature = "testkit")]
pub mod testkit;

pub use errors::{ProviderError, RetryClass};
pub use logging::LoggingProvider;
pub use registry::{ProviderBuilder, ProviderRegistry, RegistryError};
pub use traits::{Receiver, Sender};
