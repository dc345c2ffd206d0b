pub mod acceptor;
pub mod config;
pub mod config_validation;
pub mod connection;
pub mod error;
pub mod forward_proxy;
pub mod forwarder;
pub mod initializer;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod resolver;
pub mod shutdown;
pub mod worker;

pub use config::Config;
pub use error::ProxyError;
pub use forward_proxy::ForwardProxy;
pub use shutdown::Shutdown;
