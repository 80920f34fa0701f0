pub mod dto;
mod store;

pub use dto::{
    DashboardFileContent, GetPluginDashboardFileContentsArgs,
    GetPluginDashboardFileContentsResult, ListPluginDashboardFilesArgs,
    ListPluginDashboardFilesResult,
};
pub use store::{DashboardFileStore, FsDashboardFileStore};
