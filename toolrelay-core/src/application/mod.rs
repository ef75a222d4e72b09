//! # Application Module
//!
//! ## Submodules
//!
//! - [`tooling`] - Provider transports and the connection registry
//! - [`agent`] - Conversation driver turning model tool calls into invocations
//! - [`bridge`] - Single event-loop worker callable from synchronous code
//! - [`jobs`] - Background job supervisor
//! - [`pipeline`] - Task files and the verification step

pub mod agent;
pub mod bridge;
pub mod jobs;
pub mod pipeline;
pub mod tooling;
