//! Content-addressable blob storage on the local filesystem
//!
//! Blobs live at `root/<node id>/<segments...>/<filename>` as produced by the
//! configured [`PathTransform`]. The store never encrypts on its own; callers
//! compose the codec through [`Store::write_decrypt`] or by encrypting before
//! `write`.
//!
//! Writers to the same key are not serialised. The last writer wins.

mod path;

pub use path::{
    cas_path_transform, identity_path_transform, PathKey, PathTransform, SEGMENT_WIDTH,
};

use crate::crypto::{self, CryptoError};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Root directory used when none is configured
pub const DEFAULT_ROOT: &str = "vaultnode_data";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreOpts {
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: identity_path_transform,
        }
    }
}

/// Filesystem blob store
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    /// Create a store; an empty root falls back to [`DEFAULT_ROOT`]
    pub fn new(opts: StoreOpts) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };

        Self {
            root,
            path_transform: opts.path_transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of the leaf file for (id, key)
    pub fn full_path(&self, id: &str, key: &str) -> PathBuf {
        self.root.join(id).join((self.path_transform)(key).full_path())
    }

    /// Check if a blob exists; any stat failure reads as absent
    pub fn has(&self, id: &str, key: &str) -> bool {
        fs::metadata(self.full_path(id, key)).is_ok()
    }

    /// Copy `src` to disk verbatim, replacing any previous blob
    pub fn write<R: Read>(&self, id: &str, key: &str, src: &mut R) -> StorageResult<u64> {
        let mut file = self.open_for_writing(id, key)?;
        let n = io::copy(src, &mut file)?;
        log::trace!("wrote {} bytes for {}", n, key);
        Ok(n)
    }

    /// Decrypt `src` with `enc_key` and write the plaintext to disk.
    ///
    /// Returns the number of bytes consumed from `src` (IV included).
    pub fn write_decrypt<R: Read>(
        &self,
        enc_key: &[u8],
        id: &str,
        key: &str,
        src: &mut R,
    ) -> StorageResult<u64> {
        let mut file = self.open_for_writing(id, key)?;
        let n = crypto::copy_decrypt(enc_key, src, &mut file)?;
        Ok(n)
    }

    /// Open a blob for reading, returning its size and handle
    pub fn read(&self, id: &str, key: &str) -> StorageResult<(u64, File)> {
        let path = self.full_path(id, key);
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound {
                key: key.to_string(),
            },
            _ => StorageError::Io(e),
        })?;
        let size = file.metadata()?.len();
        Ok((size, file))
    }

    /// Remove the whole first-segment bucket holding the key.
    ///
    /// Sibling keys that share the first segment are removed too. Deleting an
    /// absent key is not an error.
    pub fn delete(&self, id: &str, key: &str) -> StorageResult<()> {
        let path_key = (self.path_transform)(key);
        let bucket = self.root.join(id).join(path_key.first_path_name());

        remove_dir_all_if_exists(&bucket)?;
        log::debug!("deleted [{}] from disk", path_key.filename);
        Ok(())
    }

    /// Remove the entire root directory
    pub fn clear(&self) -> StorageResult<()> {
        remove_dir_all_if_exists(&self.root)?;
        Ok(())
    }

    fn open_for_writing(&self, id: &str, key: &str) -> StorageResult<File> {
        let path = self.full_path(id, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(&path)?)
    }
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{copy_encrypt, generate_id, EncryptionKey};
    use tempfile::TempDir;

    fn new_store(dir: &TempDir) -> Store {
        Store::new(StoreOpts {
            root: dir.path().join("store"),
            path_transform: cas_path_transform,
        })
    }

    fn read_all(store: &Store, id: &str, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(id, key).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(size as usize, data.len());
        data
    }

    #[test]
    fn test_store_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);
        let id = generate_id();

        for i in 0..50 {
            let key = format!("foo_{}", i);
            let data = b"some jpg bytes";

            let n = store.write(&id, &key, &mut &data[..]).unwrap();
            assert_eq!(n, data.len() as u64);
            assert!(store.has(&id, &key));
            assert_eq!(read_all(&store, &id, &key), data);

            store.delete(&id, &key).unwrap();
            assert!(!store.has(&id, &key));
        }

        store.clear().unwrap();
        assert!(!store.root().exists());
    }

    #[test]
    fn test_layout_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("node", "momsbestpicture", &mut &b"x"[..]).unwrap();
        let expected = temp_dir
            .path()
            .join("store/node/68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff")
            .join("6804429f74181a63c50c3d81d733a12f14a353ff");
        assert!(expected.is_file());
    }

    #[test]
    fn test_nodes_are_scoped() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("a", "key", &mut &b"from a"[..]).unwrap();
        assert!(store.has("a", "key"));
        assert!(!store.has("b", "key"));
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("n", "k", &mut &b"a much longer first value"[..]).unwrap();
        store.write("n", "k", &mut &b"short"[..]).unwrap();
        assert_eq!(read_all(&store, "n", "k"), b"short");
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        match store.read("n", "missing") {
            Err(StorageError::NotFound { key }) => assert_eq!(key, "missing"),
            other => panic!("expected NotFound, got {:?}", other.map(|(s, _)| s)),
        }
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.delete("n", "never-written").unwrap();
        store.delete("n", "never-written").unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
    }

    #[test]
    fn test_delete_removes_whole_bucket() {
        fn bucketed(key: &str) -> PathKey {
            PathKey {
                segments: vec!["bucket".to_string(), key.to_string()],
                filename: key.to_string(),
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let store = Store::new(StoreOpts {
            root: temp_dir.path().to_path_buf(),
            path_transform: bucketed,
        });

        store.write("n", "first", &mut &b"1"[..]).unwrap();
        store.write("n", "second", &mut &b"2"[..]).unwrap();

        store.delete("n", "first").unwrap();

        // The sibling shares the "bucket" segment and goes with it
        assert!(!store.has("n", "first"));
        assert!(!store.has("n", "second"));
    }

    #[test]
    fn test_same_content_under_two_keys_is_not_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        store.write("n", "one", &mut &b"identical"[..]).unwrap();
        store.write("n", "two", &mut &b"identical"[..]).unwrap();

        assert_ne!(store.full_path("n", "one"), store.full_path("n", "two"));
        assert!(store.full_path("n", "one").is_file());
        assert!(store.full_path("n", "two").is_file());
    }

    #[test]
    fn test_write_decrypt() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);
        let key = EncryptionKey::generate();

        let mut encrypted = Vec::new();
        copy_encrypt(key.as_bytes(), &mut &b"plaintext body"[..], &mut encrypted).unwrap();

        let n = store
            .write_decrypt(key.as_bytes(), "n", "k", &mut encrypted.as_slice())
            .unwrap();
        assert_eq!(n as usize, encrypted.len());
        assert_eq!(read_all(&store, "n", "k"), b"plaintext body");
    }

    #[test]
    fn test_empty_root_uses_default() {
        let store = Store::new(StoreOpts {
            root: PathBuf::new(),
            path_transform: identity_path_transform,
        });
        assert_eq!(store.root(), Path::new(DEFAULT_ROOT));
    }
}
