pub mod application;
pub mod config;
pub mod constants;
pub mod domain;
pub mod infrastructure;

pub use application::{agent, bridge, jobs, pipeline, tooling};
pub use config::{AppConfig, EndpointSpec, ModelProviderConfig};
pub use domain::{ChatMessage, ConversationState, Task, ToolCall, ToolDescriptor};
pub use infrastructure::model;
