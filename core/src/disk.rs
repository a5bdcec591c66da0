use crate::backend::Backend;
use crate::cache::{self, FileStat, LocalCache};
use crate::codec;
use crate::crypto::{self, KeySet, KEY_SIZE, SEAL_OVERHEAD};
use crate::pool::{TaskGroup, WorkerPool};
use crate::{BlobType, DiskConfig, DiskMode, Error, ID_SIZE, ObjectId, Result};
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Path of the encrypted repository id.
pub const SECRET_PATH: &str = "sealsnap";

pub const TAG_SIZE: usize = ID_SIZE + SEAL_OVERHEAD;
const TAG_NAME_LEN: usize = 8;
const TAG_ATTEMPTS: usize = 1000;

/// Cross-check misses tolerated before the cache is rebuilt.
const CACHE_MISS_LIMIT: usize = 4;

const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Exists,
    Missing,
}

impl From<bool> for Presence {
    fn from(exists: bool) -> Self {
        if exists {
            Presence::Exists
        } else {
            Presence::Missing
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    /// `ReadWrite` when the user has a full key, `WriteOnly` otherwise.
    pub mode: DiskMode,
}

/// Validates a repository user name: 1 to 32 characters of `[a-z0-9_.-]`.
pub fn check_username(username: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-');

    if username.is_empty() {
        return Err(Error::Config("Username cannot be empty".to_string()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(Error::Config(format!(
            "Username cannot have more than {} characters",
            MAX_USERNAME_LEN
        )));
    }
    if !username.chars().all(valid_char) {
        return Err(Error::Config(
            "Username must only contain lowercase alphanumeric, '_', '.' or '-' characters".to_string(),
        ));
    }

    Ok(())
}

fn key_paths(username: &str) -> (String, String, String) {
    let directory = format!("keys/{}", username);
    let full = format!("{}/full", directory);
    let write = format!("{}/write", directory);
    (directory, full, write)
}

/// An encrypted repository on top of one storage transport.
///
/// A disk starts in [`DiskMode::Secure`] with no key material. Authenticating
/// with a user's write password gives [`DiskMode::WriteOnly`] access (blobs
/// and tags can be written, nothing can be read back); the full password gives
/// [`DiskMode::ReadWrite`].
///
/// Operations other than [`Disk::init`], [`Disk::authenticate`] and
/// [`Disk::lock`] take `&self`, so an authenticated disk is usually shared
/// behind an `Arc` by the extraction and listing code.
///
/// # Examples
///
/// ```no_run
/// use sealsnap_core::{Disk, DiskConfig, LocalBackend};
/// use std::sync::Arc;
///
/// # async fn example() -> sealsnap_core::Result<()> {
/// let backend = Arc::new(LocalBackend::new("/srv/backup"));
/// let mut disk = Disk::new(backend, DiskConfig::default());
///
/// disk.authenticate("default", "my-password").await?;
/// for id in disk.list_tags().await? {
///     println!("{}", id);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Disk {
    backend: Arc<dyn Backend>,
    config: DiskConfig,
    pool: WorkerPool,

    mode: DiskMode,
    keys: Option<Arc<KeySet>>,

    cache: Option<LocalCache>,
    cache_misses: tokio::sync::Mutex<usize>,
}

impl Disk {
    pub fn new(backend: Arc<dyn Backend>, config: DiskConfig) -> Self {
        let threads = config.threads.unwrap_or_else(|| backend.default_threads());

        Self {
            backend,
            config,
            pool: WorkerPool::new(threads),
            mode: DiskMode::Secure,
            keys: None,
            cache: None,
            cache_misses: tokio::sync::Mutex::new(0),
        }
    }

    pub fn url(&self) -> String {
        self.backend.url()
    }

    pub fn mode(&self) -> DiskMode {
        self.mode
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn require(&self, required: DiskMode) -> Result<&Arc<KeySet>> {
        match &self.keys {
            Some(keys) if self.mode >= required => Ok(keys),
            _ => {
                error!(required = ?required, actual = ?self.mode, "Disk mode does not allow this operation");
                Err(Error::InsufficientMode {
                    required,
                    actual: self.mode,
                })
            }
        }
    }

    /// Salt for composite object ids, see [`ObjectId::hash_blob`].
    pub fn salt(&self) -> Result<[u8; ID_SIZE]> {
        Ok(*self.require(DiskMode::WriteOnly)?.id())
    }

    /// Fails unless the transport holds an initialized repository.
    pub async fn check_repository(&self) -> Result<()> {
        if !self.backend.exists(SECRET_PATH).await? {
            error!("Repository '{}' is not initialized or not valid", self.url());
            return Err(Error::NotFound { path: self.url() });
        }
        Ok(())
    }

    /// Creates the transport layout, then the repository identity and the
    /// `default` user. Leaves the disk in `ReadWrite` mode.
    pub async fn init(&mut self, full_pwd: &str, write_pwd: &str) -> Result<()> {
        self.backend.init().await?;
        self.init_default(full_pwd, write_pwd).await
    }

    /// Generates a new repository identity and writes the secret and both
    /// `default` key files. Anything written is deleted again on failure.
    pub async fn init_default(&mut self, full_pwd: &str, write_pwd: &str) -> Result<()> {
        self.lock().await;

        let keys = KeySet::generate();
        let mut created = Vec::new();

        if let Err(err) = self.write_identity(&keys, full_pwd, write_pwd, &mut created).await {
            for path in created.iter().rev() {
                if let Err(e) = self.backend.delete(path).await {
                    warn!("Failed to delete '{}' during rollback: {}", path, e);
                }
            }
            return Err(err);
        }

        self.keys = Some(Arc::new(keys));
        self.mode = DiskMode::ReadWrite;
        if let Err(e) = self.open_cache().await {
            self.lock().await;
            return Err(e);
        }

        info!(url = %self.url(), "Initialized repository");
        Ok(())
    }

    async fn write_identity(
        &self,
        keys: &KeySet,
        full_pwd: &str,
        write_pwd: &str,
        created: &mut Vec<String>,
    ) -> Result<()> {
        let (directory, full_path, write_path) = key_paths("default");

        self.write_secret_with(keys, SECRET_PATH, keys.id(), false).await?;
        created.push(SECRET_PATH.to_string());

        self.backend.create_dir("keys").await?;
        self.backend.create_dir(&directory).await?;

        let skey = keys
            .secret()
            .map(|skey| Zeroizing::new(skey.to_bytes()))
            .ok_or_else(|| Error::Other("Missing private key".to_string()))?;
        self.write_key(&full_path, &skey, full_pwd).await?;
        created.push(full_path);

        self.write_key(&write_path, keys.public().as_bytes(), write_pwd).await?;
        created.push(write_path);

        Ok(())
    }

    /// Opens the repository with a user's write or full password.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        self.lock().await;
        check_username(username)?;

        let (_, full_path, write_path) = key_paths(username);

        let (mode, mut keys) = match self.read_key(&write_path, password).await {
            Ok(pkey) => (DiskMode::WriteOnly, KeySet::write_only(*pkey)),
            Err(Error::Authentication | Error::NotFound { .. }) => match self.read_key(&full_path, password).await {
                Ok(skey) => (DiskMode::ReadWrite, KeySet::read_write(*skey)),
                Err(Error::Authentication | Error::NotFound { .. }) => {
                    error!("Failed to open repository (wrong password?)");
                    return Err(Error::Authentication);
                }
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };

        let id = self
            .read_secret_with(&keys, SECRET_PATH)
            .await
            .inspect_err(|e| error!("Failed to read repository id (corrupt repository?): {}", e))?;
        if id.len() != ID_SIZE {
            error!("Repository id has unexpected size {}", id.len());
            return Err(Error::malformed("invalid repository id"));
        }
        let mut raw = [0u8; ID_SIZE];
        raw.copy_from_slice(&id);
        keys.set_id(&raw);

        self.keys = Some(Arc::new(keys));
        self.mode = mode;
        if let Err(e) = self.open_cache().await {
            self.lock().await;
            return Err(e);
        }

        info!(user = username, mode = ?mode, "Opened repository '{}'", self.url());
        Ok(())
    }

    /// Forgets all key material and closes the cache. Safe to call repeatedly.
    pub async fn lock(&mut self) {
        self.keys = None;
        self.mode = DiskMode::Secure;

        if let Some(cache) = self.cache.take() {
            cache.close().await;
        }
        *self.cache_misses.get_mut() = 0;
    }

    async fn open_cache(&mut self) -> Result<()> {
        if !self.config.cache.enabled {
            return Ok(());
        }

        let keys = self.require(DiskMode::WriteOnly)?;
        let path = cache::cache_path(&self.config.cache, keys.id())?;
        self.cache = Some(LocalCache::open(&path).await?);

        Ok(())
    }

    async fn read_key(&self, path: &str, password: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let data = self.backend.read(path).await?;
        let password = Zeroizing::new(password.to_string());
        let params = self.config.kdf.clone();

        tokio::task::spawn_blocking(move || crypto::unwrap_key(&data, &password, &params))
            .await
            .map_err(|e| Error::Other(format!("Key derivation task failed: {}", e)))?
    }

    /// Refuses to replace an existing key file.
    async fn write_key(&self, path: &str, payload: &[u8; KEY_SIZE], password: &str) -> Result<u64> {
        if self.backend.exists(path).await? {
            error!("Key file '{}' already exists", path);
            return Err(Error::AlreadyExists { path: path.to_string() });
        }

        let payload = Zeroizing::new(*payload);
        let password = Zeroizing::new(password.to_string());
        let params = self.config.kdf.clone();

        let data = tokio::task::spawn_blocking(move || crypto::wrap_key(&payload, &password, &params))
            .await
            .map_err(|e| Error::Other(format!("Key derivation task failed: {}", e)))??;

        self.backend.write(path, Bytes::from(data)).await
    }

    async fn read_secret_with(&self, keys: &KeySet, path: &str) -> Result<Zeroizing<Vec<u8>>> {
        let data = self.backend.read(path).await?;
        crypto::decrypt_secret(keys.public(), &data)
    }

    async fn write_secret_with(&self, keys: &KeySet, path: &str, data: &[u8], overwrite: bool) -> Result<u64> {
        if !overwrite && self.backend.exists(path).await? {
            error!("Secret file '{}' already exists", path);
            return Err(Error::AlreadyExists { path: path.to_string() });
        }

        let encrypted = crypto::encrypt_secret(keys.public(), data)?;
        self.backend.write(path, Bytes::from(encrypted)).await
    }

    pub async fn read_secret(&self, path: &str) -> Result<Zeroizing<Vec<u8>>> {
        let keys = self.require(DiskMode::WriteOnly)?;
        self.read_secret_with(keys, path).await
    }

    pub async fn write_secret(&self, path: &str, data: &[u8], overwrite: bool) -> Result<u64> {
        let keys = self.require(DiskMode::WriteOnly)?;
        self.write_secret_with(keys, path, data, overwrite).await
    }

    /// Adds a user. A full password requires `ReadWrite` mode.
    pub async fn init_user(
        &self,
        username: &str,
        full_pwd: Option<&str>,
        write_pwd: Option<&str>,
        force: bool,
    ) -> Result<()> {
        let keys = self.require(DiskMode::WriteOnly)?;
        if full_pwd.is_some() {
            self.require(DiskMode::ReadWrite)?;
        }
        check_username(username)?;

        if full_pwd.is_none() && write_pwd.is_none() {
            return Err(Error::Config(format!("Cannot create user '{}' without any password", username)));
        }

        let (directory, full_path, write_path) = key_paths(username);

        let mut exists = false;
        if full_pwd.is_some() {
            exists |= self.backend.exists(&full_path).await?;
        }
        if write_pwd.is_some() {
            exists |= self.backend.exists(&write_path).await?;
        }

        if exists {
            if force {
                warn!("Overwriting existing user '{}'", username);
            } else {
                error!("User '{}' already exists", username);
                return Err(Error::AlreadyExists { path: directory });
            }
        }

        self.backend.delete(&full_path).await?;
        self.backend.delete(&write_path).await?;
        self.backend.create_dir(&directory).await?;

        if let Some(password) = full_pwd {
            let skey = keys
                .secret()
                .map(|skey| Zeroizing::new(skey.to_bytes()))
                .ok_or_else(|| Error::Other("Missing private key".to_string()))?;
            self.write_key(&full_path, &skey, password).await?;
        }
        if let Some(password) = write_pwd {
            self.write_key(&write_path, keys.public().as_bytes(), password).await?;
        }

        info!(user = username, "Created user");
        Ok(())
    }

    /// Removes a user's key files. Repository keys are never touched.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        check_username(username)?;

        let (directory, full_path, write_path) = key_paths(username);

        let exists = self.backend.exists(&full_path).await? | self.backend.exists(&write_path).await?;
        if !exists {
            error!("User '{}' does not exist", username);
            // Clean up the directory (if any) anyway
            if let Err(e) = self.backend.delete_dir(&directory).await {
                warn!("Failed to delete '{}': {}", directory, e);
            }
            return Err(Error::NotFound { path: directory });
        }

        self.backend.delete(&full_path).await?;
        self.backend.delete(&write_path).await?;
        self.backend.delete_dir(&directory).await?;

        info!(user = username, "Deleted user");
        Ok(())
    }

    /// Users sorted by name.
    pub async fn list_users(&self) -> Result<Vec<UserInfo>> {
        let mut users: Vec<UserInfo> = Vec::new();

        for path in self.backend.list("keys").await? {
            let Some(remain) = path.strip_prefix("keys/") else {
                continue;
            };
            let Some((username, kind)) = remain.split_once('/') else {
                continue;
            };
            if check_username(username).is_err() || (kind != "full" && kind != "write") {
                continue;
            }

            let mode = if kind == "full" {
                DiskMode::ReadWrite
            } else {
                DiskMode::WriteOnly
            };

            match users.iter_mut().find(|user| user.username == username) {
                Some(user) => user.mode = user.mode.max(mode),
                None => users.push(UserInfo {
                    username: username.to_string(),
                    mode,
                }),
            }
        }

        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    /// Reads and decrypts a blob. Requires `ReadWrite` mode.
    pub async fn read_blob(&self, id: &ObjectId) -> Result<(BlobType, Vec<u8>)> {
        let keys = self.require(DiskMode::ReadWrite)?;
        let skey = keys.secret().ok_or(Error::InsufficientMode {
            required: DiskMode::ReadWrite,
            actual: self.mode,
        })?;

        let raw = self
            .backend
            .read(&id.blob_path())
            .await
            .inspect_err(|e| error!("Failed to read blob '{}': {}", id, e))?;

        codec::decode_blob(&raw, keys.public(), skey).inspect_err(|e| error!("Blob '{}' is corrupt: {}", id, e))
    }

    /// Encrypts and stores a blob, returns the number of bytes written (0 when
    /// the blob already exists).
    pub async fn write_blob(&self, id: &ObjectId, blob_type: BlobType, plaintext: &[u8]) -> Result<u64> {
        let keys = self.require(DiskMode::WriteOnly)?;
        let path = id.blob_path();

        if self.test_fast(&path).await? == Presence::Exists {
            debug!(id = %id.short_string(), "Blob already exists");
            return Ok(0);
        }

        let raw = codec::encode_blob(blob_type, plaintext, keys.public())?;
        let written = self
            .backend
            .write(&path, Bytes::from(raw))
            .await
            .inspect_err(|e| error!("Failed to write blob '{}': {}", id, e))?;

        self.put_cache(&path).await?;
        Ok(written)
    }

    /// Stores `id` sealed under a fresh random name in `tags/`.
    pub async fn write_tag(&self, id: &ObjectId) -> Result<u64> {
        let keys = self.require(DiskMode::WriteOnly)?;
        let sealed = Bytes::from(crypto::seal(id.as_bytes(), keys.public())?);

        for _ in 0..TAG_ATTEMPTS {
            let name: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TAG_NAME_LEN)
                .map(char::from)
                .collect();
            let path = format!("tags/{}", name);

            if self.backend.exists(&path).await? {
                continue;
            }

            let written = self.backend.write(&path, sealed.clone()).await?;
            debug!(tag = %name, id = %id.short_string(), "Wrote tag");
            return Ok(written);
        }

        error!("Failed to create tag for '{}'", id);
        Err(Error::NamespaceExhausted("tags".to_string()))
    }

    /// Resolves every tag. Bad tags are logged and skipped.
    pub async fn list_tags(&self) -> Result<Vec<ObjectId>> {
        let keys = self.require(DiskMode::ReadWrite)?.clone();
        let paths = self.backend.list("tags").await?;

        let ids = Arc::new(Mutex::new(Vec::with_capacity(paths.len())));
        let group = TaskGroup::new(&self.pool);

        for path in paths {
            let backend = self.backend.clone();
            let keys = keys.clone();
            let ids = ids.clone();

            group.spawn(async move {
                let data = match backend.read(&path).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Failed to read tag '{}' (ignoring): {}", path, e);
                        return true;
                    }
                };
                if data.len() != TAG_SIZE {
                    warn!("Malformed tag file '{}' (ignoring)", path);
                    return true;
                }

                let Some(skey) = keys.secret() else {
                    return false;
                };
                let id = match crypto::unseal(&data, keys.public(), skey).and_then(|id| ObjectId::from_slice(&id)) {
                    Ok(id) => id,
                    Err(_) => {
                        warn!("Failed to unseal tag '{}' (ignoring)", path);
                        return true;
                    }
                };

                match ids.lock() {
                    Ok(mut ids) => ids.push(id),
                    Err(poisoned) => poisoned.into_inner().push(id),
                }
                true
            });
        }

        if !group.sync().await {
            return Err(Error::Other("Failed to list tags".to_string()));
        }

        let ids = match ids.lock() {
            Ok(mut ids) => std::mem::take(&mut *ids),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        Ok(ids)
    }

    /// Existence check through the local cache when there is one.
    ///
    /// A small share of cached answers is checked against the transport. When
    /// the cache claims a path exists but the transport does not have it, the
    /// cache is cleared and `Error::CacheInconsistency` is returned: whatever
    /// relied on the cache may be incomplete and must be started over.
    pub async fn test_fast(&self, path: &str) -> Result<Presence> {
        let Some(cache) = &self.cache else {
            return Ok(self.test_slow(path).await?.into());
        };

        let cached = cache.contains(path).await?;

        let check = rand::thread_rng().gen_range(0..100) < self.config.cache.check_percent;
        if !check {
            return Ok(cached.into());
        }

        let exists = self.test_slow(path).await?;
        match (cached, exists) {
            (true, false) => {
                error!("Cache says '{}' exists but it is missing, cache is out of sync", path);
                self.clear_cache().await?;
                return Err(Error::CacheInconsistency);
            }
            (false, true) => self.note_cache_miss().await,
            _ => {
                if let Ok(mut misses) = self.cache_misses.try_lock() {
                    *misses = 0;
                }
            }
        }

        Ok(exists.into())
    }

    async fn note_cache_miss(&self) {
        // Only one task rebuilds, the others move on
        let Ok(mut misses) = self.cache_misses.try_lock() else {
            return;
        };

        *misses += 1;
        if *misses >= CACHE_MISS_LIMIT {
            warn!("Local cache seems stale, rebuilding it");
            if let Err(e) = self.rebuild_cache().await {
                warn!("Failed to rebuild local cache: {}", e);
            }
            *misses = 0;
        }
    }

    /// Asks the transport directly.
    pub async fn test_slow(&self, path: &str) -> Result<bool> {
        self.backend.exists(path).await
    }

    pub async fn put_cache(&self, key: &str) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.insert(key).await,
            None => Ok(()),
        }
    }

    pub async fn clear_cache(&self) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => Ok(()),
        }
    }

    /// Replaces the cache content with a full listing of the transport.
    pub async fn rebuild_cache(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };

        let paths = self.backend.list("").await?;
        cache.replace_all(&paths).await?;

        info!(objects = paths.len(), "Rebuilt local cache");
        Ok(())
    }

    pub async fn put_stat(&self, stat: &FileStat) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.put_stat(stat).await,
            None => Ok(()),
        }
    }

    pub async fn get_stat(&self, path: &str) -> Result<Option<FileStat>> {
        match &self.cache {
            Some(cache) => cache.get_stat(path).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::{CacheSettings, KdfParams};
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> DiskConfig {
        DiskConfig {
            threads: Some(4),
            kdf: KdfParams::insecure_for_tests(),
            cache: CacheSettings {
                enabled: true,
                dir: Some(temp.path().join("cache")),
                check_percent: 0,
            },
        }
    }

    async fn new_repository(temp: &TempDir) -> Disk {
        let backend = Arc::new(LocalBackend::new(temp.path().join("repo")));
        let mut disk = Disk::new(backend, config(temp));
        disk.init("full-pwd", "write-pwd").await.unwrap();
        disk
    }

    #[test]
    fn test_check_username() {
        assert!(check_username("default").is_ok());
        assert!(check_username("a.b-c_9").is_ok());
        assert!(check_username("").is_err());
        assert!(check_username("Admin").is_err());
        assert!(check_username("a/b").is_err());
        assert!(check_username(&"x".repeat(33)).is_err());
    }

    #[tokio::test]
    async fn test_authenticate_modes() {
        let temp = TempDir::new().unwrap();
        let mut disk = new_repository(&temp).await;
        assert_eq!(disk.mode(), DiskMode::ReadWrite);
        let salt = disk.salt().unwrap();

        disk.authenticate("default", "write-pwd").await.unwrap();
        assert_eq!(disk.mode(), DiskMode::WriteOnly);
        assert_eq!(disk.salt().unwrap(), salt);

        disk.authenticate("default", "full-pwd").await.unwrap();
        assert_eq!(disk.mode(), DiskMode::ReadWrite);
        assert_eq!(disk.salt().unwrap(), salt);

        let err = disk.authenticate("default", "nope").await.unwrap_err();
        assert!(matches!(err, Error::Authentication));
        assert_eq!(disk.mode(), DiskMode::Secure);

        let err = disk.authenticate("ghost", "full-pwd").await.unwrap_err();
        assert!(matches!(err, Error::Authentication));
    }

    #[tokio::test]
    async fn test_cache_failure_leaves_disk_locked() {
        let temp = TempDir::new().unwrap();
        new_repository(&temp).await;

        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = config(&temp);
        config.cache.dir = Some(blocker.join("cache"));

        let backend = Arc::new(LocalBackend::new(temp.path().join("repo")));
        let mut disk = Disk::new(backend, config.clone());
        assert!(disk.authenticate("default", "full-pwd").await.is_err());
        assert_eq!(disk.mode(), DiskMode::Secure);
        assert!(disk.salt().is_err());

        let backend = Arc::new(LocalBackend::new(temp.path().join("other")));
        let mut disk = Disk::new(backend, config);
        assert!(disk.init("full-pwd", "write-pwd").await.is_err());
        assert_eq!(disk.mode(), DiskMode::Secure);
    }

    #[tokio::test]
    async fn test_lock_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut disk = new_repository(&temp).await;

        disk.lock().await;
        disk.lock().await;
        assert_eq!(disk.mode(), DiskMode::Secure);
        assert!(matches!(disk.salt(), Err(Error::InsufficientMode { .. })));
    }

    #[tokio::test]
    async fn test_init_refuses_existing_repository() {
        let temp = TempDir::new().unwrap();
        let mut disk = new_repository(&temp).await;

        assert!(disk.init("a", "b").await.is_err());

        // Nothing was damaged
        disk.authenticate("default", "full-pwd").await.unwrap();
    }

    #[tokio::test]
    async fn test_init_default_rolls_back() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(temp.path().join("repo")));
        backend.init().await.unwrap();

        // Pre-existing write key makes the last step fail
        backend
            .write("keys/default/write", Bytes::from_static(b"occupied"))
            .await
            .unwrap();

        let mut disk = Disk::new(backend.clone(), config(&temp));
        assert!(disk.init_default("full", "write").await.is_err());

        assert!(!backend.exists(SECRET_PATH).await.unwrap());
        assert!(!backend.exists("keys/default/full").await.unwrap());
        assert!(backend.exists("keys/default/write").await.unwrap());
        assert_eq!(disk.mode(), DiskMode::Secure);
    }

    #[tokio::test]
    async fn test_write_only_cannot_read() {
        let temp = TempDir::new().unwrap();
        let mut disk = new_repository(&temp).await;
        disk.authenticate("default", "write-pwd").await.unwrap();

        let salt = disk.salt().unwrap();
        let id = ObjectId::hash_blob(&salt, BlobType::Chunk, b"hello");
        assert!(disk.write_blob(&id, BlobType::Chunk, b"hello").await.unwrap() > 0);
        assert!(disk.write_tag(&id).await.unwrap() > 0);

        assert!(matches!(disk.read_blob(&id).await, Err(Error::InsufficientMode { .. })));
        assert!(matches!(disk.list_tags().await, Err(Error::InsufficientMode { .. })));

        disk.authenticate("default", "full-pwd").await.unwrap();
        let (blob_type, data) = disk.read_blob(&id).await.unwrap();
        assert_eq!(blob_type, BlobType::Chunk);
        assert_eq!(data, b"hello");
        assert_eq!(disk.list_tags().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_secure_mode_cannot_write() {
        let temp = TempDir::new().unwrap();
        let mut disk = new_repository(&temp).await;
        disk.lock().await;

        let id = ObjectId::from_bytes([1; ID_SIZE]);
        assert!(matches!(
            disk.write_blob(&id, BlobType::Chunk, b"x").await,
            Err(Error::InsufficientMode { .. })
        ));
        assert!(matches!(disk.write_tag(&id).await, Err(Error::InsufficientMode { .. })));
    }

    #[tokio::test]
    async fn test_write_blob_twice_is_noop() {
        let temp = TempDir::new().unwrap();
        let disk = new_repository(&temp).await;

        let id = ObjectId::from_bytes([9; ID_SIZE]);
        assert!(disk.write_blob(&id, BlobType::Chunk, b"data").await.unwrap() > 0);
        assert_eq!(disk.write_blob(&id, BlobType::Chunk, b"data").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_tags_skips_malformed() {
        let temp = TempDir::new().unwrap();
        let disk = new_repository(&temp).await;

        let a = ObjectId::from_bytes([1; ID_SIZE]);
        let b = ObjectId::from_bytes([2; ID_SIZE]);
        disk.write_tag(&a).await.unwrap();
        disk.write_tag(&b).await.unwrap();
        disk.backend().write("tags/garbage", Bytes::from_static(b"short")).await.unwrap();
        disk.backend().write("tags/badseal", Bytes::from(vec![7u8; TAG_SIZE])).await.unwrap();

        let mut ids = disk.list_tags().await.unwrap();
        ids.sort_by_key(|id| *id.as_bytes());
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn test_user_management() {
        let temp = TempDir::new().unwrap();
        let mut disk = new_repository(&temp).await;

        disk.init_user("alice", Some("alice-full"), None, false).await.unwrap();
        disk.init_user("bob", None, Some("bob-write"), false).await.unwrap();
        assert!(matches!(
            disk.init_user("bob", None, Some("again"), false).await,
            Err(Error::AlreadyExists { .. })
        ));
        disk.init_user("bob", None, Some("bob-write2"), true).await.unwrap();

        let users = disk.list_users().await.unwrap();
        let names: Vec<_> = users.iter().map(|u| (u.username.as_str(), u.mode)).collect();
        assert_eq!(
            names,
            vec![
                ("alice", DiskMode::ReadWrite),
                ("bob", DiskMode::WriteOnly),
                ("default", DiskMode::ReadWrite),
            ]
        );

        disk.authenticate("bob", "bob-write2").await.unwrap();
        assert_eq!(disk.mode(), DiskMode::WriteOnly);
        assert!(matches!(
            disk.init_user("carol", Some("x"), None, false).await,
            Err(Error::InsufficientMode { .. })
        ));

        disk.authenticate("alice", "alice-full").await.unwrap();
        assert_eq!(disk.mode(), DiskMode::ReadWrite);

        disk.delete_user("bob").await.unwrap();
        assert!(matches!(disk.delete_user("bob").await, Err(Error::NotFound { .. })));
        assert!(disk.authenticate("bob", "bob-write2").await.is_err());
    }

    #[tokio::test]
    async fn test_check_repository() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(temp.path().join("repo")));
        let disk = Disk::new(backend, config(&temp));
        assert!(disk.check_repository().await.is_err());

        let disk = new_repository(&temp).await;
        disk.check_repository().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_go_through_cache() {
        let temp = TempDir::new().unwrap();
        let disk = new_repository(&temp).await;

        let stat = FileStat {
            path: "/etc/hosts".to_string(),
            mtime: 1,
            mode: 0o644,
            size: 10,
            id: ObjectId::from_bytes([3; ID_SIZE]),
        };
        disk.put_stat(&stat).await.unwrap();
        assert_eq!(disk.get_stat("/etc/hosts").await.unwrap(), Some(stat));
    }
}
