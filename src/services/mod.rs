pub mod app_registry;
pub mod connection_pool;
pub mod reflection;
pub mod retry;
pub mod runners;

pub use app_registry::{AppManifest, AppRegistry};
pub use connection_pool::{Connection, ConnectionHealth, ConnectionPool};
pub use reflection::{RecordingHandler, ReflectionBus, ReflectionHandler, TracingHandler};
pub use retry::{RetryDecision, RetryPolicy};
pub use runners::AppRunners;
