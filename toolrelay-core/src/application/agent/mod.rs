mod directive;
mod models;
mod runner;

#[cfg(test)]
mod tests;

pub use directive::ReplyDirective;
pub use models::{ConversationOutcome, DriverOptions, FailureReason, TerminalState};
pub use runner::ConversationDriver;
