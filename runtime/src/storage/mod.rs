//! Implementations of the `Storage` trait.

pub mod disk;
pub mod memory;

/// Converts bytes to a lowercase hexadecimal string (used for blob file names).
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Converts a hexadecimal string back to bytes.
pub(crate) fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

pub(crate) fn validate_partition_name(partition: &str) -> Result<(), crate::Error> {
    if partition.is_empty()
        || partition
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || ['_', '-'].contains(&c)))
    {
        return Err(crate::Error::PartitionNameInvalid(partition.into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::{Blob, Error, Storage};

    /// Exercises behavior every [Storage] implementation must share.
    pub(crate) fn run_storage_tests<S: Storage>(storage: S) {
        // Invalid partitions are rejected
        assert!(matches!(
            storage.open("bad/name", b"blob"),
            Err(Error::PartitionNameInvalid(_))
        ));

        // New blobs are empty
        let (blob, len) = storage.open("partition", b"blob").unwrap();
        assert_eq!(len, 0);

        // Writes are readable and extend the blob
        blob.write_at(b"hello", 0).unwrap();
        blob.write_at(b"world", 5).unwrap();
        let mut buf = [0u8; 10];
        blob.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"helloworld");

        // Reads past the end fail
        let mut buf = [0u8; 4];
        assert!(matches!(
            blob.read_at(&mut buf, 8),
            Err(Error::BlobInsufficientLength)
        ));

        // Synced data is visible on reopen
        blob.sync().unwrap();
        drop(blob);
        let (blob, len) = storage.open("partition", b"blob").unwrap();
        assert_eq!(len, 10);

        // Truncation
        blob.resize(5).unwrap();
        blob.sync().unwrap();
        let (_, len) = storage.open("partition", b"blob").unwrap();
        assert_eq!(len, 5);

        // Scanning lists blobs in order
        storage.open("partition", b"another").unwrap();
        let names = storage.scan("partition").unwrap();
        assert_eq!(names, vec![b"another".to_vec(), b"blob".to_vec()]);

        // Removal
        storage.remove("partition", Some(b"blob")).unwrap();
        assert_eq!(storage.scan("partition").unwrap(), vec![b"another".to_vec()]);
        assert!(matches!(
            storage.remove("partition", Some(b"blob")),
            Err(Error::BlobMissing(_, _))
        ));
        storage.remove("partition", None).unwrap();
        assert!(matches!(
            storage.scan("partition"),
            Err(Error::PartitionMissing(_))
        ));
    }

    #[test]
    fn test_hex_round_trip() {
        let name = super::hex(&[0, 1, 0xfe]);
        assert_eq!(name, "0001fe");
        assert_eq!(super::from_hex(&name).unwrap(), vec![0, 1, 0xfe]);
        assert!(super::from_hex("abc").is_none());
    }
}
