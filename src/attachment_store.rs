use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Holds attachment bytes between enqueue and delivery.
pub trait BlobStore: Send + Sync {
    fn put(&self, data: &[u8]) -> Result<String>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Blobs as files named by a random uuid, fanned out over subdirectories
/// named by two characters near the end of the uuid.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn control_dir(&self, key: &str) -> PathBuf {
        if key.len() > 4 {
            let offset = key.len() - 3;
            self.root.join(&key[offset..offset + 2])
        } else {
            self.root.clone()
        }
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(Error::Store(format!("invalid blob key {:?}", key)));
        }
        Ok(self.control_dir(key).join(key))
    }
}

impl BlobStore for FileStore {
    fn put(&self, data: &[u8]) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        let path = self.path_of(&key)?;
        let dir = self.control_dir(&key);

        create_private_dir(&dir).map_err(|err| store_error("create", &dir, err))?;
        if let Err(err) = fs::write(&path, data) {
            let _ = fs::remove_file(&path);
            return Err(store_error("write", &path, err));
        }

        debug!("Stored {} byte(s) as {}", data.len(), key);
        Ok(key)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        fs::read(&path).map_err(|err| store_error("read", &path, err))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Blob {} was already removed", key);
                Ok(())
            }
            Err(err) => Err(store_error("remove", &path, err)),
        }
    }
}

fn store_error(action: &str, path: &Path, err: io::Error) -> Error {
    Error::Store(format!("cannot {} {}: {}", action, path.display(), err))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}
