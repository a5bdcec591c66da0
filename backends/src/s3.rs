use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use sealsnap_core::backend::{is_tmp_path, join_path};
use sealsnap_core::{Backend, BackendType, Error, Result};
use tracing::{debug, error, info};

/// S3 and S3-compatible object stores. Objects are replaced atomically by the
/// service, directories are implicit.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        // Path-style addressing for MinIO and friends
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn key(&self, path: &str) -> String {
        join_path(&self.prefix, path)
    }

    fn relative<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .and_then(|key| key.strip_prefix('/'))
                .unwrap_or(key)
        }
    }

    fn failure(action: &str, path: &str, err: impl std::fmt::Display) -> Error {
        error!("Failed to {} '{}': {}", action, path, err);
        Error::Transport(format!("Failed to {} '{}': {}", action, path, err))
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn url(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }

    async fn init(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::failure("access bucket", &self.bucket, e))?;

        let existing = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.key(""))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| Self::failure("list", &self.url(), e))?;

        if existing.key_count.unwrap_or(0) > 0 {
            error!("Repository location '{}' is not empty", self.url());
            return Err(Error::AlreadyExists { path: self.url() });
        }

        info!(url = %self.url(), "Initialized S3 repository");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(e) => Err(Self::failure("stat", path, e)),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    Error::NotFound { path: path.to_string() }
                } else {
                    Self::failure("read", path, e)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Self::failure("read body of", path, e))?;

        Ok(data.into_bytes())
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let len = data.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::failure("write", path, e))?;

        Ok(len)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| Self::failure("delete", path, e))?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut full_prefix = self.key(prefix.trim_matches('/'));
        if !full_prefix.is_empty() && !full_prefix.ends_with('/') {
            full_prefix.push('/');
        }

        let mut paths = Vec::new();
        let mut continuation = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Self::failure("list", prefix, e))?;

            for object in response.contents() {
                let Some(key) = object.key() else {
                    continue;
                };

                let path = self.relative(key);
                if !is_tmp_path(path) {
                    paths.push(path.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = paths.len(), "Listed S3 objects");
        Ok(paths)
    }

    async fn create_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }
}
