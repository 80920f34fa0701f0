use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListPluginDashboardFilesArgs {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListPluginDashboardFilesResult {
    pub file_references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetPluginDashboardFileContentsArgs {
    pub plugin_id: String,
    pub file_reference: String,
}

#[derive(Debug)]
pub struct GetPluginDashboardFileContentsResult {
    pub content: DashboardFileContent,
}

/// Open dashboard file. The file handle is released on drop or `close()`.
#[derive(Debug)]
pub struct DashboardFileContent {
    file: Option<File>,
}

impl DashboardFileContent {
    pub(crate) fn new(file: File) -> Self {
        Self { file: Some(file) }
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub async fn read_to_string(mut self) -> io::Result<String> {
        use tokio::io::AsyncReadExt;

        let mut out = String::new();
        AsyncReadExt::read_to_string(&mut self, &mut out).await?;
        Ok(out)
    }
}

impl AsyncRead for DashboardFileContent {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "dashboard file is closed",
            ))),
        }
    }
}
