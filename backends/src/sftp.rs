use crate::config::SftpConfig;
use crate::pool::{Connect, SessionHandle, SessionPool};
use async_trait::async_trait;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sealsnap_core::backend::{is_tmp_path, join_path, layout_dirs, TMP_DIR};
use sealsnap_core::{Backend, BackendType, Error, Result};
use ssh2::{ErrorCode, FileStat, HashType, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const SESSION_TIMEOUT_MS: u32 = 60_000;

/// One authenticated SSH session with its SFTP channel.
pub struct SftpSession {
    _session: Session,
    sftp: Sftp,
}

pub struct SshConnector {
    config: SftpConfig,
}

impl SshConnector {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }

    fn check_host_key(&self, session: &Session) -> Result<()> {
        let Some(expected) = &self.config.fingerprint else {
            return Ok(());
        };

        let actual = session
            .host_key_hash(HashType::Sha256)
            .map(hex::encode)
            .ok_or_else(|| Error::Transport("Server did not send a host key".to_string()))?;

        let expected = expected.replace(':', "").to_lowercase();
        if actual != expected {
            error!(host = %self.config.host, fingerprint = %actual, "Host key fingerprint mismatch");
            return Err(Error::Transport(format!(
                "Unexpected host key for '{}'",
                self.config.host
            )));
        }

        Ok(())
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        let user = &self.config.username;

        let result = match (&self.config.key_file, &self.config.password) {
            (Some(key), passphrase) => session.userauth_pubkey_file(user, None, key, passphrase.as_deref()),
            (None, Some(password)) => session.userauth_password(user, password),
            (None, None) => session.userauth_agent(user),
        };

        if let Err(e) = result {
            error!(user = %user, host = %self.config.host, "SSH authentication failed: {}", e);
        }
        if !session.authenticated() {
            return Err(Error::Transport(format!(
                "SSH authentication refused for '{}@{}'",
                user, self.config.host
            )));
        }

        Ok(())
    }
}

impl Connect for SshConnector {
    type Conn = SftpSession;

    fn connect(&self) -> Result<SftpSession> {
        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port)).map_err(|e| {
            error!("Failed to connect to '{}:{}': {}", self.config.host, self.config.port, e);
            Error::Transport(format!("connection to '{}' failed: {}", self.config.host, e))
        })?;

        let mut session = Session::new().map_err(ssh_error)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SESSION_TIMEOUT_MS);
        session.handshake().map_err(ssh_error)?;

        self.check_host_key(&session)?;
        self.authenticate(&session)?;

        let sftp = session.sftp().map_err(ssh_error)?;
        Ok(SftpSession {
            _session: session,
            sftp,
        })
    }
}

const BROKEN_SESSION: &str = "SSH connection error";

fn ssh_error(e: ssh2::Error) -> Error {
    Error::Transport(format!("{}: {}", BROKEN_SESSION, e))
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE))
}

fn sftp_error(action: &str, path: &str, e: ssh2::Error) -> Error {
    match e.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => Error::NotFound { path: path.to_string() },
        ErrorCode::Session(_) => {
            error!("Failed to {} '{}': {}", action, path, e);
            ssh_error(e)
        }
        _ => Error::Transport(format!("Failed to {} '{}': {}", action, path, e)),
    }
}

/// SFTP transport. Every call runs on the blocking thread pool with a
/// session borrowed from a shared [`SessionPool`].
pub struct SftpBackend {
    pool: Arc<SessionPool<SshConnector>>,
    root: PathBuf,
    url: String,
}

impl SftpBackend {
    pub fn new(config: SftpConfig, max_sessions: usize) -> Self {
        let url = format!(
            "sftp://{}@{}:{}/{}",
            config.username,
            config.host,
            config.port,
            config.path.trim_start_matches('/')
        );
        let root = PathBuf::from(&config.path);

        Self {
            pool: SessionPool::new(SshConnector::new(config), max_sessions),
            root,
            url,
        }
    }

    /// Runs `f` on the blocking thread pool with a fresh session handle.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionHandle<SshConnector>, &Path) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || f(&mut pool.handle(), &root))
            .await
            .map_err(|e| Error::Transport(format!("SFTP task failed: {}", e)))?
    }
}

/// Sessions that fail below the SFTP layer are discarded instead of being
/// returned to the pool.
fn with_sftp<T>(handle: &mut SessionHandle<SshConnector>, f: impl FnOnce(&Sftp) -> Result<T>) -> Result<T> {
    let session = handle.acquire()?;
    let result = f(&session.sftp);

    match &result {
        Err(Error::Transport(msg)) if msg.starts_with(BROKEN_SESSION) => {
            warn!("Dropping broken SFTP session");
            handle.discard();
        }
        _ => handle.release(),
    }
    result
}

fn stat(sftp: &Sftp, path: &Path) -> std::result::Result<Option<FileStat>, ssh2::Error> {
    match sftp.stat(path) {
        Ok(stat) => Ok(Some(stat)),
        Err(e) if is_missing(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn make_dir(sftp: &Sftp, path: &Path, display: &str) -> Result<()> {
    match sftp.mkdir(path, 0o755) {
        Ok(()) => Ok(()),
        Err(e) => match stat(sftp, path) {
            Ok(Some(stat)) if stat.is_dir() => Ok(()),
            _ => Err(sftp_error("create directory", display, e)),
        },
    }
}

/// Lists `rel` recursively, sharing the caller's session at every level.
fn walk(handle: &mut SessionHandle<SshConnector>, root: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = with_sftp(handle, |sftp| match sftp.readdir(&root.join(rel)) {
        Ok(entries) => Ok(entries),
        Err(e) if is_missing(&e) => Ok(Vec::new()),
        Err(e) => Err(sftp_error("list", rel, e)),
    })?;

    // Keep the session while descending
    handle.acquire()?;
    let result = (|| {
        for (path, stat) in entries {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }

            let child = join_path(rel, name);
            if is_tmp_path(&child) {
                continue;
            }

            if stat.is_dir() {
                walk(handle, root, &child, out)?;
            } else {
                out.push(child);
            }
        }
        Ok(())
    })();
    handle.release();

    result
}

#[async_trait]
impl Backend for SftpBackend {
    fn url(&self) -> String {
        self.url.clone()
    }

    async fn init(&self) -> Result<()> {
        let url = self.url.clone();

        self.run(move |handle, root| {
            with_sftp(handle, |sftp| {
                let display = root.display().to_string();

                match stat(sftp, root).map_err(|e| sftp_error("stat", &display, e))? {
                    Some(_) => {
                        let entries = sftp.readdir(root).map_err(|e| sftp_error("list", &display, e))?;
                        let used = entries.iter().any(|(path, _)| {
                            !matches!(path.file_name().and_then(|n| n.to_str()), Some(".") | Some(".."))
                        });
                        if used {
                            error!("Directory '{}' exists and is not empty", url);
                            return Err(Error::AlreadyExists { path: url });
                        }
                    }
                    None => make_dir(sftp, root, &display)?,
                }

                for dir in layout_dirs() {
                    make_dir(sftp, &root.join(&dir), &dir)?;
                }
                Ok(())
            })
        })
        .await?;

        info!(url = %self.url, "Initialized SFTP repository layout");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = path.to_string();

        self.run(move |handle, root| {
            with_sftp(handle, |sftp| {
                stat(sftp, &root.join(&path))
                    .map(|stat| stat.is_some())
                    .map_err(|e| sftp_error("stat", &path, e))
            })
        })
        .await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let path = path.to_string();

        self.run(move |handle, root| {
            with_sftp(handle, |sftp| {
                let mut file = sftp.open(&root.join(&path)).map_err(|e| sftp_error("open", &path, e))?;

                let mut buf = Vec::new();
                file.read_to_end(&mut buf)
                    .map_err(|e| Error::Transport(format!("Failed to read '{}': {}", path, e)))?;
                Ok(Bytes::from(buf))
            })
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let path = path.to_string();

        self.run(move |handle, root| {
            with_sftp(handle, |sftp| {
                let name: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(24)
                    .map(char::from)
                    .collect();
                let tmp = root.join(TMP_DIR).join(name);
                let dest = root.join(&path);

                let written = (|| {
                    let mut file = sftp
                        .open_mode(&tmp, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE, 0o644, OpenType::File)
                        .map_err(|e| sftp_error("create", &path, e))?;
                    file.write_all(&data)
                        .map_err(|e| Error::Transport(format!("Failed to write '{}': {}", path, e)))?;
                    drop(file);

                    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
                    if let Err(e) = sftp.rename(&tmp, &dest, Some(flags)) {
                        // Servers without posix-rename refuse to overwrite
                        debug!("Atomic rename of '{}' failed ({}), retrying after unlink", path, e);
                        let _ = sftp.unlink(&dest);
                        sftp.rename(&tmp, &dest, None).map_err(|e| sftp_error("rename", &path, e))?;
                    }

                    Ok(data.len() as u64)
                })();

                if written.is_err() {
                    let _ = sftp.unlink(&tmp);
                }
                written
            })
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = path.to_string();

        self.run(move |handle, root| {
            with_sftp(handle, |sftp| match sftp.unlink(&root.join(&path)) {
                Ok(()) => Ok(()),
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => Err(sftp_error("delete", &path, e)),
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_matches('/').to_string();

        // One blocking task per top-level directory
        let top = {
            let prefix = prefix.clone();
            self.run(move |handle, root| {
                with_sftp(handle, |sftp| match sftp.readdir(&root.join(&prefix)) {
                    Ok(entries) => Ok(entries),
                    Err(e) if is_missing(&e) => Ok(Vec::new()),
                    Err(e) => Err(sftp_error("list", &prefix, e)),
                })
            })
            .await?
        };

        let mut paths = Vec::new();
        let mut dirs = Vec::new();
        for (path, stat) in top {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }

            let child = join_path(&prefix, name);
            if is_tmp_path(&child) {
                continue;
            }
            if stat.is_dir() {
                dirs.push(child);
            } else {
                paths.push(child);
            }
        }

        let tasks = dirs.into_iter().map(|dir| {
            self.run(move |handle, root| {
                let mut out = Vec::new();
                walk(handle, root, &dir, &mut out)?;
                Ok(out)
            })
        });
        for sub in futures::future::try_join_all(tasks).await? {
            paths.extend(sub);
        }

        Ok(paths)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = path.to_string();

        self.run(move |handle, root| with_sftp(handle, |sftp| make_dir(sftp, &root.join(&path), &path)))
            .await
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        let path = path.to_string();

        self.run(move |handle, root| {
            with_sftp(handle, |sftp| match sftp.rmdir(&root.join(&path)) {
                Ok(()) => Ok(()),
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => {
                    warn!("Failed to delete directory '{}': {}", path, e);
                    Err(sftp_error("delete directory", &path, e))
                }
            })
        })
        .await
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Sftp
    }
}
