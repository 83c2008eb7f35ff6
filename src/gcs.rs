use std::path::PathBuf;
use log::debug;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use crate::auth;

const STORAGE_URL: &str = "https://storage.googleapis.com/";

/// `predefinedAcl` on uploads requires full control.
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Audience of tokens minted from Application Default Credentials.
const TOKEN_AUDIENCE: &str = "https://oauth2.googleapis.com/token/";

const TOKEN_REQUEST: auth::TokenRequest<'static> = auth::TokenRequest {
    scopes: &[STORAGE_SCOPE],
    audience: TOKEN_AUDIENCE,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("fetching gcloud credentials, try running \"gcloud auth application-default login\": {0}")]
    Unauthenticated(#[from] auth::Error),

    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("access to bucket {bucket} denied, code: {status}, body: {body}")]
    Unauthorized {
        bucket: String,
        status: u16,
        body: String,
    },

    #[error("gs://{bucket}/{name} already exists")]
    AlreadyExists {
        bucket: String,
        name: String,
    },

    #[error("gs://{bucket}/{name}: code: {status}, body: {body}")]
    Status {
        bucket: String,
        name: String,
        status: u16,
        body: String,
    },

    #[error("cannot build request url for gs://{bucket}/{name}")]
    InvalidUrl {
        bucket: String,
        name: String,
    },

    #[error("open {path} for upload: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("decode response: {0}")]
    Deserialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Fail with [`Error::AlreadyExists`] instead of overwriting an existing object.
    pub no_clobber: bool,

    /// Make the object readable by anyone.
    pub public_read: bool,
}

/// Contents of an object to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    /// Streamed from disk while uploading, never held in memory as a whole.
    File(PathBuf),
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Bytes(data)
    }
}

impl Payload {
    /// Request body and its length in bytes.
    async fn into_body(self) -> Result<(reqwest::Body, u64), Error> {
        match self {
            Payload::Bytes(data) => {
                let len = data.len() as u64;
                Ok((reqwest::Body::from(data), len))
            }
            Payload::File(path) => {
                let read_err = |err| Error::ReadFile {
                    err,
                    path: path.display().to_string(),
                };
                let file = tokio::fs::File::open(&path).await.map_err(read_err)?;
                let len = file.metadata().await.map_err(read_err)?.len();
                Ok((reqwest::Body::from(file), len))
            }
        }
    }
}

/// The storage primitives the push pipeline needs from a bucket.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    /// Return the subset of `permissions` that the caller holds on `bucket`.
    async fn test_permissions(&self, bucket: &str, permissions: &[&str]) -> Result<Vec<String>, Error>;

    async fn put(&self, bucket: &str, name: &str, payload: Payload, options: PutOptions) -> Result<(), Error>;

    /// Object contents, or `None` if the object does not exist.
    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Vec<u8>>, Error>;
}

/// Google Cloud Storage JSON API client.
///
/// Credentials are looked up on the first request, so a client can be created before
/// it is known whether the push will ever reach the bucket.
pub struct GcsClient {
    client: reqwest::Client,
    base: Url,
    token: OnceCell<String>,
}

#[derive(Deserialize)]
struct TestPermissionsResponse {
    #[serde(default)]
    permissions: Vec<String>,
}

impl GcsClient {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base: Url::parse(STORAGE_URL).map_err(|_| Error::InvalidUrl {
                bucket: String::new(),
                name: String::new(),
            })?,
            token: OnceCell::new(),
        })
    }

    async fn token(&self) -> Result<&str, Error> {
        let token = self.token.get_or_try_init(|| auth::token(TOKEN_REQUEST)).await?;
        Ok(token.as_str())
    }

    fn url(&self, bucket: &str, name: &str, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl {
                bucket: bucket.to_string(),
                name: name.to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Map a non-success response onto the error taxonomy callers match on.
fn status_error(bucket: &str, name: &str, status: StatusCode, body: &[u8]) -> Error {
    let body = String::from_utf8_lossy(body).to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized {
            bucket: bucket.to_string(),
            status: status.as_u16(),
            body,
        },
        StatusCode::PRECONDITION_FAILED => Error::AlreadyExists {
            bucket: bucket.to_string(),
            name: name.to_string(),
        },
        StatusCode::NOT_FOUND if name.is_empty() => Error::BucketNotFound(bucket.to_string()),
        _ => Error::Status {
            bucket: bucket.to_string(),
            name: name.to_string(),
            status: status.as_u16(),
            body,
        },
    }
}

impl ObjectStore for GcsClient {
    async fn test_permissions(&self, bucket: &str, permissions: &[&str]) -> Result<Vec<String>, Error> {
        debug!("Testing permissions {permissions:?} on bucket {bucket}");
        let url = self.url(bucket, "", &["storage", "v1", "b", bucket, "iam", "testPermissions"])?;
        let query: Vec<_> = permissions.iter().map(|p| ("permissions", *p)).collect();

        let resp = self.client.get(url)
            .bearer_auth(self.token().await?)
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(status_error(bucket, "", status, &bytes));
        }
        Ok(serde_json::from_slice::<TestPermissionsResponse>(&bytes)?.permissions)
    }

    async fn put(&self, bucket: &str, name: &str, payload: Payload, options: PutOptions) -> Result<(), Error> {
        let (body, len) = payload.into_body().await?;
        debug!("Uploading gs://{bucket}/{name} ({len} bytes)");
        let url = self.url(bucket, name, &["upload", "storage", "v1", "b", bucket, "o"])?;

        let mut request = self.client.post(url)
            .bearer_auth(self.token().await?)
            .query(&[("uploadType", "media"), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len);
        if options.no_clobber {
            // Generation 0 only matches an object that does not exist yet.
            request = request.query(&[("ifGenerationMatch", "0")]);
        }
        if options.public_read {
            request = request.query(&[("predefinedAcl", "publicRead")]);
        }

        let resp = request.body(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let bytes = resp.bytes().await?;
        Err(status_error(bucket, name, status, &bytes))
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Vec<u8>>, Error> {
        debug!("Reading gs://{bucket}/{name}");
        let url = self.url(bucket, name, &["storage", "v1", "b", bucket, "o", name])?;

        let resp = self.client.get(url)
            .bearer_auth(self.token().await?)
            .query(&[("alt", "media")])
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        match status {
            s if s.is_success() => Ok(Some(bytes.to_vec())),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(status_error(bucket, name, s, &bytes)),
        }
    }
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Bucket contents kept in memory, honouring no-clobber the way GCS does.
    pub struct MemoryStore {
        pub granted: Vec<String>,
        pub unauthenticated: bool,
        objects: Mutex<BTreeMap<(String, String), Stored>>,
    }

    struct Stored {
        data: Vec<u8>,
        options: PutOptions,
        streamed: bool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::with_permissions(&["storage.objects.create"])
        }

        pub fn with_permissions(granted: &[&str]) -> Self {
            Self {
                granted: granted.iter().map(|p| p.to_string()).collect(),
                unauthenticated: false,
                objects: Mutex::new(BTreeMap::new()),
            }
        }

        pub fn object(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
            self.objects.lock().unwrap()
                .get(&(bucket.to_string(), name.to_string()))
                .map(|stored| stored.data.clone())
        }

        pub fn options(&self, bucket: &str, name: &str) -> Option<PutOptions> {
            self.objects.lock().unwrap()
                .get(&(bucket.to_string(), name.to_string()))
                .map(|stored| stored.options)
        }

        /// Whether the object was uploaded from a file rather than from memory.
        pub fn streamed(&self, bucket: &str, name: &str) -> bool {
            self.objects.lock().unwrap()
                .get(&(bucket.to_string(), name.to_string()))
                .is_some_and(|stored| stored.streamed)
        }

        pub fn names(&self, bucket: &str) -> Vec<String> {
            self.objects.lock().unwrap()
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, name)| name.clone())
                .collect()
        }

        fn authenticate(&self) -> Result<(), Error> {
            if self.unauthenticated {
                return Err(Error::Unauthenticated(auth::Error::Deserialize(401, "no credentials".into())));
            }
            Ok(())
        }
    }

    impl ObjectStore for MemoryStore {
        async fn test_permissions(&self, _bucket: &str, _permissions: &[&str]) -> Result<Vec<String>, Error> {
            self.authenticate()?;
            Ok(self.granted.clone())
        }

        async fn put(&self, bucket: &str, name: &str, payload: Payload, options: PutOptions) -> Result<(), Error> {
            self.authenticate()?;
            let (data, streamed) = match payload {
                Payload::Bytes(data) => (data, false),
                Payload::File(path) => {
                    let data = std::fs::read(&path).map_err(|err| Error::ReadFile {
                        err,
                        path: path.display().to_string(),
                    })?;
                    (data, true)
                }
            };
            let mut objects = self.objects.lock().unwrap();
            let key = (bucket.to_string(), name.to_string());
            if options.no_clobber && objects.contains_key(&key) {
                return Err(Error::AlreadyExists {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                });
            }
            objects.insert(key, Stored { data, options, streamed });
            Ok(())
        }

        async fn get(&self, bucket: &str, name: &str) -> Result<Option<Vec<u8>>, Error> {
            self.authenticate()?;
            Ok(self.object(bucket, name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_urls_are_percent_encoded() {
        let client = GcsClient::new().unwrap();
        let url = client
            .url("bucket", "ci/v1.2.3+abc/kubernetes.tar.gz", &["storage", "v1", "b", "bucket", "o", "ci/v1.2.3+abc/kubernetes.tar.gz"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/ci%2Fv1.2.3+abc%2Fkubernetes.tar.gz"
        );
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error("b", "o", StatusCode::PRECONDITION_FAILED, b""),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            status_error("b", "", StatusCode::NOT_FOUND, b""),
            Error::BucketNotFound(_)
        ));
        assert!(matches!(
            status_error("b", "", StatusCode::FORBIDDEN, b"denied"),
            Error::Unauthorized { status: 403, .. }
        ));
        assert!(matches!(
            status_error("b", "o", StatusCode::INTERNAL_SERVER_ERROR, b""),
            Error::Status { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn file_payloads_are_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubernetes.tar.gz");
        std::fs::write(&path, vec![0u8; 256 * 1024]).unwrap();

        let (body, len) = Payload::File(path).into_body().await.unwrap();
        assert_eq!(len, 256 * 1024);
        assert!(body.as_bytes().is_none());

        let (body, len) = Payload::from(b"v1.2.3".to_vec()).into_body().await.unwrap();
        assert_eq!(len, 6);
        assert_eq!(body.as_bytes(), Some(&b"v1.2.3"[..]));
    }

    #[tokio::test]
    async fn missing_upload_file() {
        let err = Payload::File("/nonexistent/kubernetes.tar.gz".into()).into_body().await.unwrap_err();
        assert!(matches!(err, Error::ReadFile { .. }));
    }

    #[test]
    fn empty_permissions_field() {
        let resp: TestPermissionsResponse =
            serde_json::from_str(r#"{"kind": "storage#testIamPermissionsResponse"}"#).unwrap();
        assert!(resp.permissions.is_empty());
    }
}
