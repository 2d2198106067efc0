//! Backend transports and health tracking for the relay engine.

pub mod directory;
pub mod echo;
pub mod health;
pub mod mock;
pub mod transport;

pub use directory::BackendDirectory;
pub use echo::EchoBackend;
pub use health::{BackendHealth, HealthConfig, HealthMonitor, HealthSnapshot};
pub use mock::{MockBackend, MockReply};
pub use transport::{Backend, BackendReply};
