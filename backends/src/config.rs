use sealsnap_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Password, or passphrase of `key_file` when both are set.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Remote directory holding the repository.
    pub path: String,
    /// Expected SHA-256 host key fingerprint (hex). Unchecked when unset.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalConfig),
    Sftp(SftpConfig),
    S3(S3Config),
}

impl BackendConfig {
    /// Parses a repository location:
    ///
    /// - `sftp://[user@]host[:port]/path` (user defaults to `$USER`)
    /// - `s3://bucket[/prefix]`
    /// - anything else is a local path
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(rest) = url.strip_prefix("sftp://") {
            return parse_sftp(rest).map(BackendConfig::Sftp);
        }

        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::Config(format!("Missing bucket name in '{}'", url)));
            }

            return Ok(BackendConfig::S3(S3Config {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
                endpoint: None,
            }));
        }

        if url.is_empty() {
            return Err(Error::Config("Empty repository location".to_string()));
        }
        Ok(BackendConfig::Local(LocalConfig { path: PathBuf::from(url) }))
    }
}

fn parse_sftp(rest: &str) -> Result<SftpConfig> {
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "."),
    };

    let (username, host_port) = match authority.rsplit_once('@') {
        Some((user, host)) => (user.to_string(), host),
        None => (std::env::var("USER").unwrap_or_default(), authority),
    };

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("Invalid SSH port '{}'", port)))?;
            (host, port)
        }
        None => (host_port, DEFAULT_SSH_PORT),
    };

    if host.is_empty() {
        return Err(Error::Config("Missing host in SFTP location".to_string()));
    }
    if username.is_empty() {
        return Err(Error::Config("Missing user in SFTP location".to_string()));
    }

    // sftp://host/~/backup is relative to the home directory
    let path = path.strip_prefix("/~/").unwrap_or(path);

    Ok(SftpConfig {
        host: host.to_string(),
        port,
        username,
        password: None,
        key_file: None,
        path: path.to_string(),
        fingerprint: None,
    })
}
