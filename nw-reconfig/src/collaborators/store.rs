use std::path::PathBuf;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use nw_reconfig_schemas::payload::BatchPayload;
use crate::collaborators::RequestStore;

/// Keeps the latest payload in a JSON file, overwritten on every update.
pub struct JsonFileStore {
    location: PathBuf,
}

impl JsonFileStore {
    pub fn new(location: PathBuf) -> Self {
        Self { location }
    }
}

#[async_trait]
impl RequestStore for JsonFileStore {
    async fn store(&self, payload: &BatchPayload) -> anyhow::Result<()> {
        let mut output = File::create(&self.location).await?;
        output.write_all(format!("{payload}").as_bytes()).await?;
        tracing::debug!("stored request data in {:?}", self.location);
        Ok(())
    }
}

/// Only keeps the final payload and prints it to stdout when asked.
#[derive(Default)]
pub struct StdoutStore {
    last: tokio::sync::Mutex<Option<BatchPayload>>,
}

impl StdoutStore {
    pub async fn print(&self) {
        if let Some(payload) = self.last.lock().await.as_ref() {
            println!("{payload}");
        }
    }
}

#[async_trait]
impl RequestStore for StdoutStore {
    async fn store(&self, payload: &BatchPayload) -> anyhow::Result<()> {
        *self.last.lock().await = Some(payload.clone());
        Ok(())
    }
}
