pub mod init;
pub mod ls;
pub mod restore;
pub mod snapshots;
pub mod users;

use crate::Cli;
use anyhow::{anyhow, Context, Result};
use sealsnap_backends::BackendConfig;
use sealsnap_core::{CacheSettings, Disk, DiskConfig, ObjectId};
use std::sync::Arc;
use tracing::info;

fn backend_config(cli: &Cli) -> Result<BackendConfig> {
    let location = cli
        .repository
        .as_deref()
        .ok_or_else(|| anyhow!("Repository location required (--repository or SEALSNAP_REPOSITORY)"))?;

    let mut config = BackendConfig::from_url(location)?;
    match &mut config {
        BackendConfig::Sftp(sftp) => {
            sftp.password = cli.ssh_password.clone();
            sftp.key_file = cli.ssh_key.clone();
            sftp.fingerprint = cli.ssh_fingerprint.clone();
        }
        BackendConfig::S3(s3) => s3.endpoint = cli.s3_endpoint.clone(),
        BackendConfig::Local(_) => {}
    }

    Ok(config)
}

fn disk_config(cli: &Cli) -> DiskConfig {
    DiskConfig {
        threads: cli.threads,
        cache: CacheSettings {
            enabled: !cli.no_cache,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Opens the repository without authenticating.
pub async fn open_disk(cli: &Cli) -> Result<Disk> {
    let config = backend_config(cli)?;
    let disk = sealsnap_backends::open_disk(&config, disk_config(cli)).await?;

    Ok(disk)
}

/// Opens and authenticates as `--user`.
pub async fn open_repository(cli: &Cli) -> Result<Disk> {
    let mut disk = open_disk(cli).await?;
    disk.check_repository().await?;

    let password = read_password(cli.password.as_deref(), "Repository password: ")?;
    disk.authenticate(&cli.user, &password)
        .await
        .with_context(|| format!("Cannot open repository '{}'", disk.url()))?;

    info!(mode = ?disk.mode(), "Opened repository '{}'", disk.url());
    Ok(disk)
}

pub async fn open_shared(cli: &Cli) -> Result<Arc<Disk>> {
    Ok(Arc::new(open_repository(cli).await?))
}

pub fn read_password(given: Option<&str>, prompt: &str) -> Result<String> {
    if let Some(password) = given {
        return Ok(password.to_string());
    }

    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    if password.is_empty() {
        return Err(anyhow!("Password cannot be empty"));
    }
    Ok(password)
}

/// Prompts twice for a new password.
pub fn read_new_password(prompt: &str) -> Result<String> {
    let password = read_password(None, prompt)?;
    let confirm = read_password(None, "Confirm: ")?;

    if password != confirm {
        return Err(anyhow!("Passwords do not match"));
    }
    Ok(password)
}

pub fn parse_id(id: &str) -> Result<ObjectId> {
    id.parse()
        .map_err(|_| anyhow!("Malformed object id '{}'", id))
}

pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
