use std::path::Path;
use log::{debug, info};
use thiserror::Error;
use walkdir::WalkDir;
use crate::gcs::{self, ObjectStore, Payload, PutOptions};

#[derive(Error, Debug)]
pub enum Error {
    /// The version was pushed before. Only overridable with `allow_dup`.
    #[error("gs://{bucket}/{name} is already published, pass --allow-dup to overwrite it")]
    AlreadyPublished {
        bucket: String,
        name: String,
    },

    #[error("walk {path}: {err}")]
    Walk {
        err: walkdir::Error,
        path: String,
    },

    #[error("copy artifacts to GCS: {0}")]
    Upload(#[source] gcs::Error),
}

/// Copies a local staging tree into a bucket.
pub struct Publisher<'a, S> {
    store: &'a S,
    bucket: &'a str,
    allow_dup: bool,
}

impl<'a, S: ObjectStore> Publisher<'a, S> {
    pub fn new(store: &'a S, bucket: &'a str, allow_dup: bool) -> Self {
        Self {
            store,
            bucket,
            allow_dup,
        }
    }

    /// Upload every file below `src` to `gs://{bucket}/{destination}/{relative path}`.
    ///
    /// Unless duplicates are allowed, an object that already exists stops the push with
    /// [`Error::AlreadyPublished`] instead of being overwritten. Returns the uploaded object names.
    pub async fn push(&self, src: &Path, destination: &str) -> Result<Vec<String>, Error> {
        info!("Pushing release artifacts to gs://{}/{destination}", self.bucket);
        let options = PutOptions {
            no_clobber: !self.allow_dup,
            public_read: false,
        };

        let mut pushed = Vec::new();
        for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| Error::Walk {
                err,
                path: src.display().to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let name = object_name(destination, relative);

            debug!("Copying {} to gs://{}/{name}", entry.path().display(), self.bucket);
            self.store
                .put(self.bucket, &name, Payload::File(entry.path().to_path_buf()), options)
                .await
                .map_err(|err| match err {
                    gcs::Error::AlreadyExists { bucket, name } => Error::AlreadyPublished { bucket, name },
                    err => Error::Upload(err),
                })?;
            pushed.push(name);
        }

        info!("Pushed {} objects", pushed.len());
        Ok(pushed)
    }
}

/// Object names always use `/`, whatever the local path separator.
fn object_name(destination: &str, relative: &Path) -> String {
    let mut parts = vec![destination.trim_end_matches('/').to_string()];
    parts.extend(relative.components().map(|c| c.as_os_str().to_string_lossy().to_string()));
    parts.join("/")
}
