pub mod app;
pub mod endpoint;
pub mod error;
pub mod loader;
pub mod provider;

pub use crate::constants::CONFIG_PATH;
pub use app::AppConfig;
pub use endpoint::{EndpointKind, EndpointParseError, EndpointSpec, Launch, ResolvedEndpoint};
pub use error::ConfigError;
pub use provider::ModelProviderConfig;
