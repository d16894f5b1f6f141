use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use cloud_link::{IdentityStore, StoredIdentity};
use tracing::warn;

pub const STATUS_FILE: &str = "cloudstatus.toml";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode cloud status: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Registration state kept in `cloudstatus.toml` under the state dir.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    state: StoredIdentity,
}

impl FileIdentityStore {
    /// Load the store, creating the directory if needed. An unreadable file
    /// starts from a blank identity, which only costs a re-registration.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(STATUS_FILE);
        let state = match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|err| {
                warn!(target: "hub_remote::cloud", path = %path.display(), error = %err, "discarding unreadable cloud status");
                StoredIdentity::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoredIdentity::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> StoredIdentity {
        self.state.clone()
    }

    fn save(&self) -> Result<(), StoreError> {
        let serialized = toml::to_string_pretty(&self.state)?;
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(io_err)?;
        file.write_all(serialized.as_bytes()).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().map_err(io_err)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).map_err(io_err)?;
        }
        Ok(())
    }

    fn persist(&self) {
        if let Err(err) = self.save() {
            warn!(target: "hub_remote::cloud", error = %err, "failed to persist cloud status");
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn registered(&self) -> bool {
        self.state.registered
    }

    fn set_registered(&mut self, registered: bool) {
        if self.state.registered != registered {
            self.state.registered = registered;
            self.persist();
        }
    }

    fn synced_name(&self) -> Option<String> {
        self.state.synced_name.clone()
    }

    fn set_synced_name(&mut self, name: Option<&str>) {
        let name = name.map(str::to_string);
        if self.state.synced_name != name {
            self.state.synced_name = name;
            self.persist();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileIdentityStore::open(dir.path()).expect("open");
        assert!(!store.registered());
        store.set_registered(true);
        store.set_synced_name(Some("Kitchen"));

        let reopened = FileIdentityStore::open(dir.path()).expect("reopen");
        assert!(reopened.registered());
        assert_eq!(reopened.synced_name().as_deref(), Some("Kitchen"));

        let raw = fs::read_to_string(dir.path().join(STATUS_FILE)).expect("read");
        assert!(raw.contains("registered = true"));
    }

    #[test_timeout::timeout]
    fn cleared_name_is_dropped_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileIdentityStore::open(dir.path()).expect("open");
        store.set_synced_name(Some("Kitchen"));
        store.set_synced_name(None);
        let reopened = FileIdentityStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.synced_name(), None);
    }

    #[test_timeout::timeout]
    fn corrupt_file_starts_blank() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(STATUS_FILE), "registered = [").expect("write");
        let store = FileIdentityStore::open(dir.path()).expect("open");
        assert_eq!(store.snapshot(), StoredIdentity::default());
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    fn status_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileIdentityStore::open(dir.path()).expect("open");
        store.set_registered(true);
        let mode = fs::metadata(store.path()).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
