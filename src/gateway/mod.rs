//! Gateway server implementation

pub mod proxy;
mod router;
mod server;

pub use proxy::{ProxyServices, WebsocketProxy};
pub use router::create_router;
pub use server::Gateway;
