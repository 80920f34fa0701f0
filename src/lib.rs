pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod dashboards;
pub mod error;
pub mod host;
pub mod plugins;
pub mod renderer;

pub use client::PluginClient;
pub use config::NovaConfig;
pub use context::CallContext;
pub use error::{ErrorKind, NovaError, Result};
pub use host::PluginHost;
pub use plugins::{PluginManager, PluginRegistry, PluginStore};
