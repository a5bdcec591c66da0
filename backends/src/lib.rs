pub mod config;
pub mod pool;
pub mod retry;
pub mod s3;
pub mod sftp;

pub use config::{BackendConfig, LocalConfig, S3Config, SftpConfig};
pub use pool::{Connect, SessionHandle, SessionPool};
pub use retry::{retry_with_backoff, RetryConfig, Retryable, RetryingBackend};
pub use s3::S3Backend;
pub use sftp::SftpBackend;

use sealsnap_core::backend::default_threads;
use sealsnap_core::{Backend, BackendType, Disk, DiskConfig, LocalBackend, Result};
use std::sync::Arc;
use tracing::debug;

/// Builds the transport for `config`. Remote transports retry transient
/// failures.
pub async fn open_backend(config: &BackendConfig, threads: Option<usize>) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config {
        BackendConfig::Local(local) => return Ok(Arc::new(LocalBackend::new(&local.path))),
        BackendConfig::Sftp(sftp) => {
            // One session per worker
            let sessions = threads.unwrap_or_else(|| default_threads(BackendType::Sftp));
            Arc::new(SftpBackend::new(sftp.clone(), sessions))
        }
        BackendConfig::S3(s3) => Arc::new(S3Backend::new(s3).await?),
    };

    debug!(url = %backend.url(), "Opened remote transport");
    Ok(Arc::new(RetryingBackend::new(backend, RetryConfig::default())))
}

/// Opens a locked [`Disk`] on the transport described by `config`.
pub async fn open_disk(config: &BackendConfig, disk_config: DiskConfig) -> Result<Disk> {
    let backend = open_backend(config, disk_config.threads).await?;
    Ok(Disk::new(backend, disk_config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealsnap_core::DiskMode;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_open_local_disk() {
        let config = BackendConfig::Local(LocalConfig {
            path: PathBuf::from("/tmp/sealsnap-test"),
        });

        let disk = open_disk(&config, DiskConfig::default()).await.unwrap();
        assert_eq!(disk.mode(), DiskMode::Secure);
        assert_eq!(disk.backend().backend_type(), BackendType::Local);
    }

    #[tokio::test]
    async fn test_sftp_is_wrapped_in_retries() {
        let config = BackendConfig::from_url("sftp://backup@nas.local/srv/repo").unwrap();

        let backend = open_backend(&config, Some(4)).await.unwrap();
        assert_eq!(backend.backend_type(), BackendType::Sftp);
        assert_eq!(backend.url(), "sftp://backup@nas.local:22/srv/repo");
    }
}
