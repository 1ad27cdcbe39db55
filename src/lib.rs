pub mod client;
pub mod error;
pub mod frame;
pub mod lock;
pub mod logger;
pub mod message;
pub mod paths;
pub mod process;
pub mod ready;
pub mod server;

// Re-export commonly used types
pub use client::{ClientConfig, DaemonClient, RequestHandle};
pub use error::{Result, SockdError};
pub use lock::StartingLock;
pub use paths::ServicePaths;
pub use server::{DaemonServer, Handler, ListenOutcome, ServerConfig};
