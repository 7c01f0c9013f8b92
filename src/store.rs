use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};

use crate::common::{deserialize, serialize};

/// Stable storage for one recovery-aware module instance. One file per
/// storeid, replaced atomically on every store: a module that crashes
/// mid-write recovers either the previous state or the new one, never a
/// torn file.
///
/// No concurrent writers per storeid are supported.
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>, storeid: &str) -> Self {
        let mut path = dir.into();
        path.push(format!("__store.{}", storeid));
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn store<T: Serialize>(&self, value: &T) -> io::Result<()> {
        // the staging file must stay per-storeid; `with_extension` would
        // treat the storeid itself as the extension and collapse every
        // store in the directory onto one tmp file
        let file_name = self.path.file_name().expect("store path has a file name");
        let tmp = self
            .path
            .with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
        fs::write(&tmp, serialize(value))?;
        fs::rename(&tmp, &self.path)
    }

    pub fn retrieve<T: DeserializeOwned>(&self) -> io::Result<T> {
        let bytes = fs::read(&self.path)?;
        deserialize(&bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "corrupted store file"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stratum-store-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn roundtrip_replaces_previous_state() {
        let store = Store::new(scratch("roundtrip"), "a");
        assert!(!store.exists());

        let mut delivered = BTreeSet::new();
        delivered.insert(b"m1".to_vec());
        store.store(&delivered).unwrap();
        assert!(store.exists());

        delivered.insert(b"m2".to_vec());
        store.store(&delivered).unwrap();
        let restored: BTreeSet<Vec<u8>> = store.retrieve().unwrap();
        assert_eq!(restored, delivered);
    }

    #[test]
    fn distinct_storeids_do_not_alias() {
        let dir = scratch("alias");
        let left = Store::new(&dir, "left");
        let right = Store::new(&dir, "right");
        left.store(&1u64).unwrap();
        right.store(&2u64).unwrap();
        assert_eq!(left.retrieve::<u64>().unwrap(), 1);
        assert_eq!(right.retrieve::<u64>().unwrap(), 2);
    }

    #[test]
    fn concurrent_stores_keep_their_own_state() {
        // two recovery-aware modules sharing a store_dir write at the same
        // time; neither may ever observe the other's bytes
        let dir = scratch("race");
        let writers: Vec<_> = (0..2u64)
            .map(|owner| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let store = Store::new(dir, &format!("peer{}", owner));
                    for round in 0..200u64 {
                        store.store(&(owner, round)).unwrap();
                        let (seen, _) = store.retrieve::<(u64, u64)>().unwrap();
                        assert_eq!(seen, owner);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        for owner in 0..2u64 {
            let store = Store::new(&dir, &format!("peer{}", owner));
            assert_eq!(store.retrieve::<(u64, u64)>().unwrap(), (owner, 199));
        }
    }
}
