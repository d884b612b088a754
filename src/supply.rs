//! Fetching and verifying release files
//!
//! Provides:
//! - Downloads through the base system `fetch(1)`
//! - SHA256 checksums of downloaded files
//! - Parsing of release MANIFEST files

use crate::error::{Error, Result};
use crate::sys::CommandRunner;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Download `url` to `dest` with `fetch <url> -o <dest>`
pub fn fetch(sys: &dyn CommandRunner, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let dest_str = dest.display().to_string();
    debug!(url, dest = %dest_str, "fetching");
    sys.run("fetch", &[url, "-o", &dest_str])?;

    if !dest.is_file() {
        return Err(Error::CommandFailed {
            command: format!("fetch {} -o {}", url, dest_str),
            message: "no file was written".to_string(),
        });
    }

    Ok(())
}

/// Compute SHA256 hash of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Parse a MANIFEST file and return an archive -> sha256 mapping
///
/// Lines look like `base.txz\t<sha256>\t<files>\t<name>\t<description>\t<default>`.
pub fn parse_manifest(content: &str) -> HashMap<String, String> {
    let mut checksums = HashMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() >= 2 && !parts[1].is_empty() {
            checksums.insert(parts[0].to_string(), parts[1].to_lowercase());
        }
    }

    checksums
}

/// Compare a file against its expected checksum
pub fn verify_sha256(path: &Path, expected: &str) -> Result<String> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::FakeRunner;

    const HELLO_SHA256: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    #[test]
    fn test_sha256_computation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, b"hello world\n").unwrap();

        assert_eq!(sha256_file(&file).unwrap(), HELLO_SHA256);
        assert!(verify_sha256(&file, &HELLO_SHA256.to_uppercase()).is_ok());
        assert!(matches!(
            verify_sha256(&file, "00"),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_manifest_parsing() {
        let manifest = "base.txz\tABC123\t100\tbase\t\"Base system\"\ton\n\
                        kernel.txz\tdef456\t50\tkernel\t\"Kernel\"\ton\n\
                        garbage";
        let checksums = parse_manifest(manifest);

        assert_eq!(checksums.len(), 2);
        assert_eq!(checksums.get("base.txz"), Some(&"abc123".to_string()));
        assert_eq!(checksums.get("kernel.txz"), Some(&"def456".to_string()));
    }

    #[test]
    fn test_fetch_requires_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sub/base.txz");

        let sys = FakeRunner::ok();
        assert!(fetch(&sys, "http://mirror/base.txz", &dest).is_err());
        assert!(sys.ran(&format!("fetch http://mirror/base.txz -o {}", dest.display())));

        let sys = FakeRunner::new(|_, args| {
            fs::write(args[2], b"tarball").map_err(|e| e.to_string())?;
            Ok(String::new())
        });
        fetch(&sys, "http://mirror/base.txz", &dest).unwrap();
        assert!(dest.is_file());
    }
}
