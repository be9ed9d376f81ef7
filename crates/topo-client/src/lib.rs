pub mod backoff;
pub mod client;
pub mod error;

pub use backoff::{next_backoff, retry_with_backoff, BackoffPolicy, RetryError};
pub use client::{ClientConfig, ClientStatus, Handler, ResilientClient};
pub use error::ClientError;
