use log::info;
use thiserror::Error;
use crate::gcs::{self, ObjectStore};

/// The minimum capability needed to push a build.
pub const REQUIRED_PERMISSION: &str = "storage.objects.create";

#[derive(Error, Debug)]
pub enum Error {
    #[error("find release artifact bucket: {0}")]
    Bucket(#[from] gcs::Error),

    #[error("GCP user must have at least [storage.objects.create] permissions on bucket {bucket}, got {granted:?}")]
    InsufficientPermissions {
        bucket: String,
        granted: Vec<String>,
    },
}

/// Make sure `bucket` exists and the caller may create objects in it.
///
/// Anything other than exactly the one requested permission coming back is treated as
/// insufficient.
pub async fn check<S: ObjectStore>(store: &S, bucket: &str) -> Result<(), Error> {
    info!("Checking permissions on bucket {bucket}");
    let granted = store.test_permissions(bucket, &[REQUIRED_PERMISSION]).await?;

    match granted.as_slice() {
        [permission] if permission == REQUIRED_PERMISSION => Ok(()),
        _ => Err(Error::InsufficientPermissions {
            bucket: bucket.to_string(),
            granted,
        }),
    }
}
