mod connector;
mod error;
mod http;
mod interface;
#[cfg(feature = "native-transport")]
mod process;
mod registry;

pub use connector::DefaultConnector;
pub use error::ToolInvokeError;
pub use http::HttpTransport;
pub use interface::{ProviderConnector, ProviderTransport, ToolInvoker, ToolOutput};
#[cfg(feature = "native-transport")]
pub use process::StdioTransport;
pub use registry::{
    CatalogEntry, CloseSummary, ConnectionRegistry, EndpointFailure, EndpointStatus,
    ProviderSession, RegistryError, SessionId, SessionInfo, ToolCatalog,
};
