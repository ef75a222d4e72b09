mod blocking;
mod error;
mod worker;

pub use blocking::BlockingToolClient;
pub use error::{BridgeError, ClientError};
pub use worker::{AsyncBridge, BridgeHandle};
