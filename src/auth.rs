use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("auth error: {0}")]
    AuthError(#[from] google_cloud_auth::error::Error),

    #[error("auth token error: {0}")]
    AuthTokenError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("unexpected token response, code: {0}, body: {1}")]
    Deserialize(u16, String),
}

/// What kind of access token a client needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRequest<'a> {
    pub scopes: &'a [&'a str],
    /// Audience of tokens minted from Application Default Credentials.
    pub audience: &'a str,
}

/// A GitHub Actions job allowed to impersonate through a workload identity pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub pool: String,
    pub id_token_url: String,
    pub id_token_request_token: String,
}

impl WorkloadIdentity {
    /// Present only if all three variables are set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        Some(Self {
            pool: lookup("WORKLOAD_IDENTITY_POOL")?,
            id_token_url: lookup("ACTIONS_ID_TOKEN_REQUEST_URL")?,
            id_token_request_token: lookup("ACTIONS_ID_TOKEN_REQUEST_TOKEN")?,
        })
    }
}

/// Obtain an OAuth2 access token for `request`.
///
/// Inside GitHub Actions with a workload identity pool configured, the job's OIDC token is
/// exchanged for a federated access token. Everywhere else, Application Default Credentials are used.
pub async fn token(request: TokenRequest<'_>) -> Result<String, Error> {
    match WorkloadIdentity::from_env() {
        Some(identity) => {
            let id_token = github_id_token(&identity).await?;
            exchange_federated_token(&identity.pool, &id_token.value, request.scopes).await
                .map(|token| token.access_token)
        }
        None => application_default_token(request).await,
    }
}

pub async fn application_default_token(request: TokenRequest<'_>) -> Result<String, Error> {
    debug!("Exchanging application default credentials for an oauth2 token");

    use google_cloud_auth::{project::Config, token::DefaultTokenSourceProvider};
    use google_cloud_token::TokenSourceProvider as _;

    let config = Config::default()
        .with_audience(request.audience)
        .with_scopes(request.scopes);
    let tsp = DefaultTokenSourceProvider::new(config).await.map_err(Error::AuthError)?;
    let ts = tsp.token_source();
    let token = ts.token().await.map_err(Error::AuthTokenError)?;
    Ok(strip_bearer(&token).to_string())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenExchangeRequest<'a> {
    grant_type: &'a str,
    audience: &'a str,
    scope: &'a str,
    requested_token_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Deserialize)]
pub struct TokenExchangeResponse {
    pub access_token: String,
}

#[derive(Deserialize)]
pub struct GitHubTokenResponse {
    pub value: String,
}

pub async fn exchange_federated_token(workload_identity_pool: &str, github_id_token: &str, scopes: &[&str]) -> Result<TokenExchangeResponse, Error> {
    debug!("Exchanging federated GitHub token for an oauth2 token");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    let scope = scopes.join(" ");
    let request = TokenExchangeRequest {
        audience: &format!("//iam.googleapis.com/{workload_identity_pool}"),
        grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
        requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
        scope: &scope,
        subject_token_type: "urn:ietf:params:oauth:token-type:jwt",
        subject_token: github_id_token,
    };

    let resp = client.post("https://sts.googleapis.com/v1/token")
        .json(&request)
        .send()
        .await?;

    decode(resp).await
}

pub async fn github_id_token(identity: &WorkloadIdentity) -> Result<GitHubTokenResponse, Error> {
    debug!("Getting GitHub actions id_token");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    let resp = client.get(&identity.id_token_url)
        .bearer_auth(&identity.id_token_request_token)
        .query(&[("audience", format!("https://iam.googleapis.com/{}", identity.pool))])
        .send()
        .await?;

    decode(resp).await
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    match serde_json::from_slice(&bytes) {
        Ok(token) => Ok(token),
        Err(_) => {
            let body = String::from_utf8_lossy(&bytes);
            Err(Error::Deserialize(status, body.to_string()))
        }
    }
}

/// Token sources hand out `Bearer <token>`; the storage client sets its own header.
fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}
