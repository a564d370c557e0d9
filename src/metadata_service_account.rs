use std::str;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request};
use tracing::{debug, instrument, Level};

use crate::default_credentials::TokenProvider;
use crate::types::{HttpClient, Token};
use crate::Error;

/// A token provider that queries the GCP instance metadata server for access tokens
///
/// See https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys for details.
#[derive(Debug)]
pub(crate) struct MetadataServiceAccount {
    client: HttpClient,
}

impl MetadataServiceAccount {
    /// Check that the metadata server answers and has a service account attached
    pub(crate) async fn new(client: &HttpClient) -> Result<Self, Error> {
        debug!("checking for GCP instance metadata server");
        let body = client
            .request(metadata_request(DEFAULT_EMAIL_GCP_URI)?, "MetadataServiceAccount")
            .await?;

        match str::from_utf8(&body) {
            Ok(email) if !email.trim().is_empty() => {
                debug!(email = email.trim(), "found default service account");
            }
            _ => {
                return Err(Error::Str(
                    "no default service account on GCP instance metadata server",
                ))
            }
        }

        Ok(Self {
            client: client.clone(),
        })
    }
}

#[async_trait]
impl TokenProvider for MetadataServiceAccount {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, scopes: &[&str]) -> Result<Token, Error> {
        let req = metadata_request(&token_uri(scopes))?;
        self.client.token(req, "MetadataServiceAccount").await
    }
}

fn token_uri(scopes: &[&str]) -> String {
    if scopes.is_empty() {
        return DEFAULT_TOKEN_GCP_URI.to_owned();
    }
    format!("{DEFAULT_TOKEN_GCP_URI}?scopes={}", scopes.join(","))
}

fn metadata_request(uri: &str) -> Result<Request<Full<Bytes>>, Error> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("Metadata-Flavor", "Google")
        .body(Full::from(Bytes::new()))
        .map_err(|err| Error::InvalidRequest(uri.to_owned(), err))
}

// https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys
const DEFAULT_EMAIL_GCP_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/email";
const DEFAULT_TOKEN_GCP_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
