use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::ScanError;

/// SHA-256 of a file's bytes, lowercase hex. Read in 1 MiB chunks so large
/// scans do not get buffered whole.
pub fn sha256_file(path: &Path) -> Result<String, ScanError> {
    let mut file = File::open(path).map_err(|source| ScanError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_matches_known_vector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc.bin");
        let mut f = File::create(&path).expect("create");
        f.write_all(b"abc").expect("write");
        drop(f);

        let sha = sha256_file(&path).expect("digest");
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_is_stable_across_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("receipt.jpg");
        std::fs::write(&path, vec![0u8; 3 * 1024 * 1024]).expect("write");

        let a = sha256_file(&path).expect("digest");
        let b = sha256_file(&path).expect("digest");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn missing_file_is_source_unreadable() {
        let err = sha256_file(Path::new("/no/such/file.png")).unwrap_err();
        assert!(matches!(err, ScanError::SourceUnreadable { .. }));
    }
}
