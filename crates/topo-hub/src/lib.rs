pub mod config;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;

pub use hub::{Hub, HubConfig, HubHandle};
pub use metrics::{FixedMetrics, MetricsSource};
pub use registry::ServiceRegistry;
pub use server::{launch, LaunchOptions, RunningHub, ServerConfig};
pub use session::Session;
