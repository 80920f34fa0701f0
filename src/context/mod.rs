mod call_context;
pub mod dto;

pub use call_context::CallContext;
pub use dto::{PluginContext, User};
