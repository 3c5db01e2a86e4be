//! External configuration service (ECS)
//!
//! The ECS is responsible for:
//! - Launching storage nodes from a configured pool
//! - Computing ring metadata and distributing it to nodes
//! - Moving key ranges when nodes join or leave
//! - Health monitoring through the coordination registry

pub mod admin;
pub mod controller;
pub mod health;
pub mod launcher;
pub mod lifecycle;
pub mod registry;

pub use admin::AdminClient;
pub use controller::Controller;
pub use health::HealthChecker;
pub use launcher::{LaunchSpec, Launcher, ScriptLauncher};
pub use lifecycle::{EcsNode, NodeLifecycle};
pub use registry::{CreateMode, MemoryRegistry, Registry, RegistryEvent, RegistryWatch};
