//! Storage backed by files in a directory.
//!
//! Each partition is a subdirectory of [Config::storage_directory] and each blob is a
//! file named by the hex encoding of its name.

use super::{from_hex, hex, validate_partition_name};
use crate::Error;
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Syncs a directory to ensure directory entry changes are durable.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), Error> {
    let dir = File::open(path).map_err(|e| {
        Error::BlobOpenFailed(
            path.to_string_lossy().to_string(),
            "directory".to_string(),
            e,
        )
    })?;
    dir.sync_all().map_err(|e| {
        Error::BlobSyncFailed(
            path.to_string_lossy().to_string(),
            "directory".to_string(),
            e,
        )
    })
}

#[cfg(not(unix))]
fn sync_dir(_: &Path) -> Result<(), Error> {
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub storage_directory: PathBuf,
}

impl Config {
    pub fn new(storage_directory: PathBuf) -> Self {
        Self { storage_directory }
    }
}

/// File-backed storage implementation.
#[derive(Clone)]
pub struct Storage {
    lock: Arc<Mutex<()>>,
    cfg: Config,
}

impl Storage {
    pub fn new(cfg: Config) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            cfg,
        }
    }
}

impl crate::Storage for Storage {
    type Blob = Blob;

    fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        // Create the partition directory, if it does not exist
        let dir = self.cfg.storage_directory.join(partition);
        let dir_existed = dir.exists();
        fs::create_dir_all(&dir).map_err(|_| Error::PartitionCreationFailed(partition.into()))?;

        // Open the file, creating it if it doesn't exist
        let path = dir.join(hex(name));
        let file_existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::BlobOpenFailed(partition.into(), hex(name), e))?;
        let len = file.metadata().map_err(|_| Error::ReadFailed)?.len();

        // Make a newly created file durable
        if !file_existed {
            file.sync_all()
                .map_err(|e| Error::BlobSyncFailed(partition.into(), hex(name), e))?;
            sync_dir(&dir)?;
            if !dir_existed {
                sync_dir(&self.cfg.storage_directory)?;
            }
        }

        Ok((Blob::new(partition.into(), name, file, len), len))
    }

    fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        let dir = self.cfg.storage_directory.join(partition);
        match name {
            Some(name) => {
                let path = dir.join(hex(name));
                fs::remove_file(&path)
                    .map_err(|_| Error::BlobMissing(partition.into(), hex(name)))?;
                sync_dir(&dir)?;
            }
            None => {
                fs::remove_dir_all(&dir)
                    .map_err(|_| Error::PartitionMissing(partition.into()))?;
                sync_dir(&self.cfg.storage_directory)?;
            }
        }
        Ok(())
    }

    fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        let dir = self.cfg.storage_directory.join(partition);
        let entries = fs::read_dir(&dir).map_err(|_| Error::PartitionMissing(partition.into()))?;
        let mut blobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|_| Error::ReadFailed)?;
            let file_type = entry.file_type().map_err(|_| Error::ReadFailed)?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(from_hex) else {
                warn!(partition, file = ?file_name, "ignoring unexpected file");
                continue;
            };
            blobs.push(name);
        }
        blobs.sort();
        Ok(blobs)
    }
}

/// Handle to a file-backed blob.
#[derive(Clone)]
pub struct Blob {
    partition: String,
    name: Vec<u8>,
    file: Arc<Mutex<(File, u64)>>,
}

impl Blob {
    fn new(partition: String, name: &[u8], file: File, len: u64) -> Self {
        Self {
            partition,
            name: name.into(),
            file: Arc::new(Mutex::new((file, len))),
        }
    }
}

impl crate::Blob for Blob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        let mut guard = self.file.lock().unwrap();
        let (file, len) = &mut *guard;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OffsetOverflow)?;
        if end > *len {
            return Err(Error::BlobInsufficientLength);
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::ReadFailed)?;
        file.read_exact(buf).map_err(|_| Error::ReadFailed)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let mut guard = self.file.lock().unwrap();
        let (file, len) = &mut *guard;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OffsetOverflow)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::WriteFailed)?;
        file.write_all(buf).map_err(|_| Error::WriteFailed)?;
        if end > *len {
            *len = end;
        }
        Ok(())
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        let mut guard = self.file.lock().unwrap();
        let (file, current) = &mut *guard;
        file.set_len(len).map_err(|e| {
            Error::BlobResizeFailed(self.partition.clone(), hex(&self.name), e)
        })?;
        *current = len;
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        let guard = self.file.lock().unwrap();
        guard
            .0
            .sync_all()
            .map_err(|e| Error::BlobSyncFailed(self.partition.clone(), hex(&self.name), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::tests::run_storage_tests, Blob as _, Storage as _};

    #[test]
    fn test_disk_storage() {
        let dir = tempfile::tempdir().unwrap();
        run_storage_tests(Storage::new(Config::new(dir.path().to_path_buf())));
    }

    #[test]
    fn test_reopen_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::new(dir.path().to_path_buf());
        {
            let storage = Storage::new(cfg.clone());
            let (blob, _) = storage.open("wal", &7u64.to_be_bytes()).unwrap();
            blob.write_at(b"persisted", 0).unwrap();
            blob.sync().unwrap();
        }

        let storage = Storage::new(cfg);
        let names = storage.scan("wal").unwrap();
        assert_eq!(names, vec![7u64.to_be_bytes().to_vec()]);
        let (blob, len) = storage.open("wal", &names[0]).unwrap();
        assert_eq!(len, 9);
        let mut buf = [0u8; 9];
        blob.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
