use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use serde::Serialize;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::default_credentials::TokenProvider;
use crate::jwt::{self, Header};
use crate::types::{HttpClient, ServiceAccountKey, Signer, Token};
use crate::Error;

/// A token provider that trades a self-signed assertion for an access token
///
/// Used when the ambient credentials are a service account key file. Unlike the IAP token, the
/// assertion here is addressed to the OAuth2 token endpoint and carries the requested scopes.
#[derive(Debug)]
pub(crate) struct CustomServiceAccount {
    client: HttpClient,
    key: ServiceAccountKey,
    signer: Signer,
}

impl CustomServiceAccount {
    pub(crate) fn new(key: ServiceAccountKey, client: HttpClient) -> Result<Self, Error> {
        debug!(project = ?key.project_id, email = key.client_email, "found credentials");
        Ok(Self {
            client,
            signer: Signer::new(&key.private_key)?,
            key,
        })
    }
}

#[async_trait]
impl TokenProvider for CustomServiceAccount {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, scopes: &[&str]) -> Result<Token, Error> {
        let req = token_request(&self.key, &self.signer, scopes)?;
        self.client.token(req, "CustomServiceAccount").await
    }
}

fn token_request(
    key: &ServiceAccountKey,
    signer: &Signer,
    scopes: &[&str],
) -> Result<Request<Full<Bytes>>, Error> {
    let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
    let jwt = jwt::encode(
        &Header::rs256(Some(&key.private_key_id)),
        &GrantClaims::new(&key.client_email, token_uri, scopes),
        signer,
    )?;

    let body = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&[("grant_type", GRANT_TYPE), ("assertion", jwt.as_str())])
        .finish();

    Request::post(token_uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Full::from(Bytes::from(body)))
        .map_err(|err| Error::InvalidRequest(token_uri.to_owned(), err))
}

/// Claims of the JWT-bearer grant
///
/// See https://developers.google.com/identity/protocols/OAuth2ServiceAccount#authorizingrequests.
#[derive(Serialize, Debug)]
struct GrantClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
    scope: String,
}

impl<'a> GrantClaims<'a> {
    fn new(iss: &'a str, aud: &'a str, scopes: &[&str]) -> Self {
        let iat = Utc::now().timestamp();
        Self {
            iss,
            aud,
            exp: iat + 3600 - 5, // Max validity is 1h
            iat,
            scope: scopes.join(" "),
        }
    }
}

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
