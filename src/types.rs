use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, io};

use bytes::Buf;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::jwt::{self, Header};
use crate::{Claims, Error};

#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    inner: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub(crate) fn new() -> Result<Self, Error> {
        #[cfg(feature = "webpki-roots")]
        let https = HttpsConnectorBuilder::new().with_webpki_roots();
        #[cfg(not(feature = "webpki-roots"))]
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                Error::Io("failed to load native TLS root certificates for HTTPS", err)
            })?;

        Ok(Self {
            inner: Client::builder(TokioExecutor::new())
                .build(https.https_or_http().enable_http2().build()),
        })
    }

    /// Send `req` once and return the body of a successful response
    ///
    /// Non-success statuses become [`Error::Server`] so callers can tell a refused permission
    /// apart from a network failure.
    pub(crate) async fn request(
        &self,
        req: Request<Full<Bytes>>,
        context: &'static str,
    ) -> Result<Bytes, Error> {
        debug!(url = ?req.uri(), context, "sending request");
        let (parts, body) = self
            .inner
            .request(req)
            .await
            .map_err(|err| Error::Http("HTTP request failed", Box::new(err)))?
            .into_parts();

        let mut body = body
            .collect()
            .await
            .map_err(|err| Error::Http("failed to read HTTP response body", Box::new(err)))?
            .aggregate();

        let body = body.copy_to_bytes(body.remaining());
        if !parts.status.is_success() {
            let body = String::from_utf8_lossy(body.as_ref()).into_owned();
            warn!(%body, status = ?parts.status, context, "request failed");
            return Err(Error::Server {
                context,
                status: parts.status,
                body,
            });
        }

        Ok(body)
    }

    /// Send `req` and deserialize an access token from the response
    pub(crate) async fn token(
        &self,
        req: Request<Full<Bytes>>,
        context: &'static str,
    ) -> Result<Token, Error> {
        let body = self.request(req, context).await?;
        serde_json::from_slice(&body)
            .map_err(|err| Error::Json("failed to deserialize token from response", err))
    }
}

/// An OAuth2 access token obtained from ambient credentials
///
/// The token does not implement [`Display`] to avoid accidentally printing the token in log
/// files, likewise [`Debug`] does not expose the token value itself which is only available
/// using the [`Token::as_str`] method.
///
/// [`Display`]: fmt::Display
#[derive(Clone, Deserialize)]
pub struct Token {
    access_token: String,
    #[serde(
        deserialize_with = "deserialize_time",
        rename(deserialize = "expires_in")
    )]
    expires_at: DateTime<Utc>,
}

impl Token {
    /// Wrap an access token obtained elsewhere, for use with a custom [`TokenProvider`]
    ///
    /// [`TokenProvider`]: crate::TokenProvider
    pub fn from_string(access_token: String, expires_in: Duration) -> Self {
        Token {
            access_token,
            expires_at: Utc::now() + expires_in,
        }
    }

    /// Get str representation of the token.
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    /// Get expiry of token
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"****")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds_from_now: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Utc::now() + Duration::from_secs(seconds_from_now))
}

/// A signed JWT in compact serialization
///
/// Like [`Token`], the value is masked in [`Debug`] output and only available through
/// [`SignedJwt::as_str`], [`SignedJwt::into_string`] or [`SignedJwt::bearer`].
#[derive(Clone, PartialEq, Eq)]
pub struct SignedJwt(String);

impl SignedJwt {
    pub(crate) fn new(jwt: String) -> Self {
        Self(jwt)
    }

    /// The compact JWT
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The compact JWT, consuming `self`
    pub fn into_string(self) -> String {
        self.0
    }

    /// Value for an `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }

    /// Decode the header and claims without verifying the signature
    pub fn decode_unverified(&self) -> Result<(Header, Claims), Error> {
        jwt::decode_unverified(&self.0)
    }
}

impl fmt::Debug for SignedJwt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignedJwt").field(&"****").finish()
    }
}

/// An RSA PKCS1 SHA256 signer
pub struct Signer {
    key: RsaKeyPair,
    rng: SystemRandom,
}

impl Signer {
    /// Load a PEM-encoded RSA private key, in PKCS#8 or PKCS#1 form
    pub fn new(pem: &str) -> Result<Self, Error> {
        let key = PrivateKeyDer::from_pem_slice(pem.as_bytes())
            .map_err(|err| Error::InvalidKey(format!("failed to read PEM data: {err}")))?;

        let key = match &key {
            PrivateKeyDer::Pkcs8(der) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            _ => {
                return Err(Error::InvalidKey(
                    "private key is not an RSA key".to_owned(),
                ))
            }
        }
        .map_err(|err| Error::InvalidKey(format!("rejected RSA key: {err}")))?;

        Ok(Signer {
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Sign the input message and return the signature
    pub fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(&RSA_PKCS1_SHA256, &self.rng, input, &mut signature)
            .map_err(|_| Error::Str("failed to sign with credentials key"))?;
        Ok(signature)
    }

    /// DER-encoded `RSAPublicKey` matching the private key
    pub fn public_key_der(&self) -> &[u8] {
        self.key.public().as_ref()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish()
    }
}

/// Key material from a downloaded service account key file
///
/// Only the fields needed to sign a JWT are required; all other fields of the file are ignored.
#[derive(Clone)]
pub struct ServiceAccountKey {
    pub(crate) private_key: String,
    pub(crate) private_key_id: String,
    pub(crate) client_email: String,
    pub(crate) project_id: Option<String>,
    pub(crate) token_uri: Option<String>,
}

impl ServiceAccountKey {
    /// Read a key from the given JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!(?path, "reading service account key file");
        let json = fs::read_to_string(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => Error::Io("service account key file not found", err),
            _ => Error::Io("failed to read service account key file", err),
        })?;
        json.parse()
    }

    /// The PEM-encoded private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key
    }

    /// The ID of the private key, used as `kid` in JWT headers
    pub fn private_key_id(&self) -> &str {
        &self.private_key_id
    }

    /// The service account email
    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// The project the service account belongs to, if present in the file
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }
}

impl FromStr for ServiceAccountKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str::<RawServiceAccountKey>(s)
            .map_err(|err| Error::Json("failed to deserialize service account key", err))?
            .try_into()
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

/// Key file fields before checking that the required ones are present
#[derive(Deserialize)]
pub(crate) struct RawServiceAccountKey {
    private_key: Option<String>,
    private_key_id: Option<String>,
    client_email: Option<String>,
    project_id: Option<String>,
    token_uri: Option<String>,
}

impl fmt::Debug for RawServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .finish_non_exhaustive()
    }
}

impl TryFrom<RawServiceAccountKey> for ServiceAccountKey {
    type Error = Error;

    fn try_from(raw: RawServiceAccountKey) -> Result<Self, Self::Error> {
        Ok(Self {
            private_key: raw.private_key.ok_or(Error::MissingField("private_key"))?,
            private_key_id: raw
                .private_key_id
                .ok_or(Error::MissingField("private_key_id"))?,
            client_email: raw.client_email.ok_or(Error::MissingField("client_email"))?,
            project_id: raw.project_id,
            token_uri: raw.token_uri,
        })
    }
}
