use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// Destination for published aggregates and archived raw data.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> anyhow::Result<()>;

    /// Human-readable location of `key`, for logs.
    fn location(&self, key: &str) -> String;
}

pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the standard AWS environment.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await?;
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

/// Writes objects as files under a root directory, keys becoming paths.
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectSink for LocalDirSink {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> anyhow::Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        self.root.join(key).display().to_string()
    }
}

/// Serializes a value to JSON and stores it under `key` with `application/json` content type.
pub async fn write_json(sink: &dyn ObjectSink, key: &str, value: &impl Serialize) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value)?;
    debug!(location = %sink.location(key), bytes = body.len(), "Writing JSON");
    sink.put(key, body, "application/json").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_sink_writes_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalDirSink::new(dir.path());
        write_json(&sink, "aggregates/2024-07-04/parks.json", &vec![1, 2, 3])
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.path().join("aggregates/2024-07-04/parks.json")).unwrap();
        assert_eq!(written, "[1,2,3]");
        assert!(sink.location("a.json").ends_with("a.json"));
    }
}
