pub mod config;
pub mod diff_cache;
pub mod engine;
pub mod error;
pub mod frustum;
pub mod host;
pub mod linker;
pub mod occlusion;
pub mod proxy;
pub mod registry;
pub mod renderer;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod transform;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::EngineConfig;
pub use engine::PortalEngine;
pub use error::EngineError;
pub use host::{ClientFlags, ClientId, ClientSink, ClientView, PortalHost, WorldId};
