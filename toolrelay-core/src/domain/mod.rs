pub mod task;
pub mod types;

pub use task::{ConversationState, Task};
pub use types::{ChatMessage, MessageRole, ToolCall, ToolDescriptor};
