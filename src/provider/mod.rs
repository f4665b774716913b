pub mod client;
pub mod handle;
pub mod protocol;
pub mod registry;

pub use client::{ClientError, ProviderClient, ProviderTransport};
pub use handle::{ProviderHandle, ProviderSpawnSpec};
pub use registry::ProviderRegistry;
