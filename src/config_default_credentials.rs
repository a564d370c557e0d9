use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, Level};

use crate::custom_service_account::CustomServiceAccount;
use crate::default_credentials::TokenProvider;
use crate::types::{HttpClient, RawServiceAccountKey, Token};
use crate::Error;

/// Contents of an application default credentials file
///
/// Either a downloaded service account key (`gcloud iam service-accounts keys create`) or the
/// user credentials written by `gcloud auth application-default login`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum CredentialsFile {
    ServiceAccount(RawServiceAccountKey),
    AuthorizedUser(UserCredentials),
}

impl CredentialsFile {
    pub(crate) fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|err| Error::Io("failed to read application credentials file", err))?;
        json.parse()
    }

    pub(crate) fn from_gcloud_config() -> Result<Self, Error> {
        let mut path = home::home_dir().ok_or(Error::Str("home directory not found"))?;
        path.push(USER_CREDENTIALS_PATH);
        debug!(?path, "try to load gcloud application default credentials");
        Self::from_file(path)
    }

    pub(crate) fn into_provider(
        self,
        client: HttpClient,
    ) -> Result<Arc<dyn TokenProvider>, Error> {
        Ok(match self {
            Self::ServiceAccount(key) => {
                Arc::new(CustomServiceAccount::new(key.try_into()?, client)?)
            }
            Self::AuthorizedUser(credentials) => {
                debug!(
                    client = credentials.client_id,
                    project = ?credentials.quota_project_id,
                    "found user credentials"
                );
                Arc::new(ConfigDefaultCredentials {
                    client,
                    credentials,
                })
            }
        })
    }
}

impl std::str::FromStr for CredentialsFile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
            .map_err(|err| Error::Json("failed to deserialize application credentials", err))
    }
}

/// A token provider that exchanges the refresh token of gcloud user credentials
#[derive(Debug)]
pub(crate) struct ConfigDefaultCredentials {
    client: HttpClient,
    credentials: UserCredentials,
}

#[async_trait]
impl TokenProvider for ConfigDefaultCredentials {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, _scopes: &[&str]) -> Result<Token, Error> {
        let req = refresh_request(&self.credentials)?;
        self.client.token(req, "ConfigDefaultCredentials").await
    }
}

fn refresh_request(cred: &UserCredentials) -> Result<Request<Full<Bytes>>, Error> {
    let body = serde_json::to_vec(&RefreshRequest {
        client_id: &cred.client_id,
        client_secret: &cred.client_secret,
        grant_type: "refresh_token",
        refresh_token: &cred.refresh_token,
    })
    .map_err(|err| Error::Json("failed to serialize refresh request", err))?;

    Request::builder()
        .method(Method::POST)
        .uri(DEFAULT_TOKEN_GCP_URI)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(body)))
        .map_err(|err| Error::InvalidRequest(DEFAULT_TOKEN_GCP_URI.to_owned(), err))
}

#[derive(Serialize, Debug)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct UserCredentials {
    client_id: String,
    client_secret: String,
    quota_project_id: Option<String>,
    refresh_token: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials")
            .field("client_id", &self.client_id)
            .field("quota_project_id", &self.quota_project_id)
            .finish_non_exhaustive()
    }
}

const DEFAULT_TOKEN_GCP_URI: &str = "https://accounts.google.com/o/oauth2/token";
const USER_CREDENTIALS_PATH: &str = ".config/gcloud/application_default_credentials.json";
