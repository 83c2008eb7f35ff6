//! Checksum manifests for a staged release.
//!
//! `SHA256SUMS` and `SHA512SUMS` at the root of the tree list every staged file as
//! `<hex digest>  <relative path>`, sorted by path. Every file also gets a `.sha256` and
//! `.sha512` companion holding only its digest, for download scripts that fetch a single file.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use log::debug;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use walkdir::WalkDir;

pub const SHA256SUMS: &str = "SHA256SUMS";
pub const SHA512SUMS: &str = "SHA512SUMS";

#[derive(Error, Debug)]
pub enum Error {
    #[error("walk {path}: {err}")]
    Walk {
        err: walkdir::Error,
        path: String,
    },

    #[error("hash {path}: {err}")]
    Hash {
        err: io::Error,
        path: String,
    },

    #[error("write {path}: {err}")]
    Write {
        err: io::Error,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Path relative to the tree root, `/` separated.
    pub path: String,
    pub sha256: String,
    pub sha512: String,
}

/// Hash every file below `root`, sorted by relative path.
/// The manifests at the root are never listed.
pub fn digests(root: &Path) -> Result<Vec<FileDigest>, Error> {
    let mut digests = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| Error::Walk {
            err,
            path: root.display().to_string(),
        })?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !entry.file_type().is_file() || is_manifest(relative) {
            continue;
        }
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let (sha256, sha512) = hash_file(entry.path()).map_err(|err| Error::Hash {
            err,
            path: entry.path().display().to_string(),
        })?;
        digests.push(FileDigest { path, sha256, sha512 });
    }
    digests.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(digests)
}

/// Write the manifests and per-file companions for everything below `root`.
///
/// Every file present before the call is listed; companions written by this call are not.
pub fn write_checksums(root: &Path) -> Result<Vec<FileDigest>, Error> {
    let digests = digests(root)?;

    let mut sha256sums = String::new();
    let mut sha512sums = String::new();
    for digest in &digests {
        debug!("{}  {}", digest.sha256, digest.path);
        sha256sums.push_str(&format!("{}  {}\n", digest.sha256, digest.path));
        sha512sums.push_str(&format!("{}  {}\n", digest.sha512, digest.path));

        let file = root.join(&digest.path);
        write(&companion(&file, "sha256"), &digest.sha256)?;
        write(&companion(&file, "sha512"), &digest.sha512)?;
    }

    write(&root.join(SHA256SUMS), &sha256sums)?;
    write(&root.join(SHA512SUMS), &sha512sums)?;
    Ok(digests)
}

fn companion(file: &Path, extension: &str) -> std::path::PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    name.into()
}

fn is_manifest(relative: &Path) -> bool {
    relative == Path::new(SHA256SUMS) || relative == Path::new(SHA512SUMS)
}

fn hash_file(path: &Path) -> io::Result<(String, String)> {
    let mut file = File::open(path)?;
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        sha512.update(&buf[..n]);
    }
    Ok((hex::encode(sha256.finalize()), hex::encode(sha512.finalize())))
}

fn write(path: &Path, contents: &str) -> Result<(), Error> {
    std::fs::write(path, contents).map_err(|err| Error::Write {
        err,
        path: path.display().to_string(),
    })
}
