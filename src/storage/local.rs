use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use super::{DurableSink, SinkError, SinkResult};

const WRITE_CHECK_FILE: &str = ".write-check";

/// Writes objects as files under a root directory, mirroring the object path.
pub struct LocalFileSink {
    root: PathBuf,
}

impl LocalFileSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> SinkResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(SinkError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DurableSink for LocalFileSink {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn put(&self, path: &str, _content_type: &str, bytes: Vec<u8>) -> SinkResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let size = bytes.len();
        fs::write(&target, bytes).await?;
        info!(target: "storage", path = %target.display(), bytes = size, "object written");
        Ok(())
    }

    async fn get(&self, path: &str) -> SinkResult<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn check(&self) -> SinkResult<String> {
        fs::create_dir_all(&self.root).await?;
        let marker = self.root.join(WRITE_CHECK_FILE);
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;
        Ok(format!("{} is writable", self.root.display()))
    }
}
