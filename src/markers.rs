use std::cmp::Ordering;
use log::info;
use thiserror::Error;
use crate::gcs::{self, ObjectStore, PutOptions};
use crate::push::DestinationPath;
use crate::version;

#[derive(Error, Debug)]
pub enum Error {
    #[error("version {version} cannot be used for markers: {err}")]
    InvalidVersion {
        err: semver::Error,
        version: String,
    },

    #[error("read marker {name}: {err}")]
    Read {
        err: gcs::Error,
        name: String,
    },

    #[error("write marker {name}: {err}")]
    Write {
        err: gcs::Error,
        name: String,
    },
}

/// Publishes the small text files downstream consumers read to find the newest build.
#[allow(async_fn_in_trait)]
pub trait ReleaseMarkerPublisher {
    /// Point the markers next to `destination` at `version`.
    ///
    /// With `update_latest` unset only `extra_markers` are written.
    async fn publish_version(
        &self,
        destination: &DestinationPath,
        version: &str,
        bucket: &str,
        extra_markers: &[String],
        private_bucket: bool,
        update_latest: bool,
    ) -> Result<(), Error>;
}

/// Marker names for `version`, without the `.txt` extension.
pub fn marker_names(version: &semver::Version, extra_markers: &[String], update_latest: bool) -> Vec<String> {
    let mut names = Vec::new();
    if update_latest {
        names.push("latest".to_string());
        names.push(format!("latest-{}", version.major));
        names.push(format!("latest-{}.{}", version.major, version.minor));
    }
    names.extend(extra_markers.iter().cloned());
    names
}

/// Writes markers as objects in the same bucket as the build.
pub struct GcsMarkers<'a, S> {
    store: &'a S,
}

impl<'a, S: ObjectStore> GcsMarkers<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Whether the marker at `name` should move to `version`.
    /// Markers never move backwards; content that is not a version is overwritten.
    async fn needs_update(&self, bucket: &str, name: &str, version: &semver::Version) -> Result<bool, Error> {
        let existing = self.store.get(bucket, name).await.map_err(|err| Error::Read {
            err,
            name: name.to_string(),
        })?;
        let Some(existing) = existing else {
            return Ok(true);
        };

        let existing = String::from_utf8_lossy(&existing);
        match version::parse(existing.trim()) {
            Ok(current) if current.cmp_precedence(version) != Ordering::Less => {
                info!("Not updating {name}, it points to {} which is not older", existing.trim());
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

impl<'a, S: ObjectStore> ReleaseMarkerPublisher for GcsMarkers<'a, S> {
    async fn publish_version(
        &self,
        destination: &DestinationPath,
        version: &str,
        bucket: &str,
        extra_markers: &[String],
        private_bucket: bool,
        update_latest: bool,
    ) -> Result<(), Error> {
        let parsed = version::parse(version).map_err(|err| Error::InvalidVersion {
            err,
            version: version.to_string(),
        })?;
        let options = PutOptions {
            no_clobber: false,
            public_read: !private_bucket,
        };

        for marker in marker_names(&parsed, extra_markers, update_latest) {
            let name = format!("{}/{marker}.txt", destination.marker_root());
            if !self.needs_update(bucket, &name, &parsed).await? {
                continue;
            }

            info!("Publishing version marker gs://{bucket}/{name}: {version}");
            self.store
                .put(bucket, &name, version.as_bytes().to_vec().into(), options)
                .await
                .map_err(|err| Error::Write { err, name: name.clone() })?;
        }
        Ok(())
    }
}
