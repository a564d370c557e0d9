use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::Request;
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_FIXED};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, Level};

use crate::jwt::{Parts, ES256};
use crate::types::HttpClient;
use crate::{Error, IapAudience};

/// Issuer of the JWTs IAP attaches to the requests it forwards
pub const IAP_ISSUER: &str = "https://cloud.google.com/iap";

/// Verify the `x-goog-iap-jwt-assertion` header IAP adds to the requests it forwards
///
/// Fetches IAP's current public keys, then checks the ES256 signature, the issuer, the validity
/// window and, if `audience` is given, the audience. Without an audience any IAP-protected
/// backend's token is accepted, which is rarely what a backend wants.
#[instrument(level = Level::DEBUG, skip(token))]
pub async fn verify_iap_jwt(
    token: &str,
    audience: Option<&IapAudience>,
) -> Result<IapClaims, Error> {
    IapVerifier::new()?.verify(token, audience).await
}

/// Verifies IAP JWTs against the public keys IAP publishes
///
/// Keys are fetched on every call to [`IapVerifier::verify`]. Use [`IapVerifier::fetch_keys`]
/// and [`IapKeys::verify`] to check several tokens against one fetch.
#[derive(Debug)]
pub struct IapVerifier {
    client: HttpClient,
    keys_url: String,
}

impl IapVerifier {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            client: HttpClient::new()?,
            keys_url: IAP_KEYS_URL.to_owned(),
        })
    }

    /// Fetch keys from `url` instead of `https://www.gstatic.com/iap/verify/public_key-jwk`
    pub fn with_keys_url(mut self, url: impl Into<String>) -> Self {
        self.keys_url = url.into();
        self
    }

    /// Fetch the current IAP signing keys
    pub async fn fetch_keys(&self) -> Result<IapKeys, Error> {
        let req = Request::get(&self.keys_url)
            .body(Full::from(Bytes::new()))
            .map_err(|err| Error::InvalidRequest(self.keys_url.clone(), err))?;
        let body = self.client.request(req, "failed to fetch IAP keys").await?;
        let keys = serde_json::from_slice::<IapKeys>(&body)
            .map_err(|err| Error::Json("failed to deserialize IAP keys", err))?;
        debug!(keys = keys.keys.len(), "fetched IAP keys");
        Ok(keys)
    }

    pub async fn verify(
        &self,
        token: &str,
        audience: Option<&IapAudience>,
    ) -> Result<IapClaims, Error> {
        self.fetch_keys().await?.verify(token, audience)
    }
}

/// A JSON Web Key Set of IAP's ES256 public keys
#[derive(Clone, Debug, Deserialize)]
pub struct IapKeys {
    keys: Vec<Jwk>,
}

impl IapKeys {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(|err| Error::Json("failed to deserialize IAP keys", err))
    }

    /// Verify `token` as of now
    pub fn verify(&self, token: &str, audience: Option<&IapAudience>) -> Result<IapClaims, Error> {
        self.verify_at(token, audience, Utc::now())
    }

    /// Verify `token` as of `now`
    pub fn verify_at(
        &self,
        token: &str,
        audience: Option<&IapAudience>,
        now: DateTime<Utc>,
    ) -> Result<IapClaims, Error> {
        let parts = Parts::split(token)?;
        let header = parts.header()?;
        if header.alg() != ES256 {
            return Err(Error::Rejected("algorithm is not ES256"));
        }

        let kid = header.kid().ok_or(Error::Rejected("no key ID in header"))?;
        let key = self
            .keys
            .iter()
            .find(|key| key.kid == kid)
            .ok_or(Error::Rejected("signed with an unknown key"))?;

        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, key.public_key()?)
            .verify(parts.signing_input().as_bytes(), &parts.signature()?)
            .map_err(|_| Error::Rejected("invalid signature"))?;

        let claims = parts.claims::<IapClaims>()?;
        if claims.iss != IAP_ISSUER {
            return Err(Error::Rejected("issuer is not IAP"));
        }

        let now = now.timestamp();
        if claims.exp + CLOCK_SKEW_SECS <= now {
            return Err(Error::Rejected("expired"));
        }
        if claims.iat - CLOCK_SKEW_SECS > now {
            return Err(Error::Rejected("issued in the future"));
        }

        if let Some(audience) = audience {
            if claims.aud != audience.to_string() {
                return Err(Error::Rejected("audience mismatch"));
            }
        }

        Ok(claims)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    x: String,
    y: String,
}

impl Jwk {
    /// The key as an uncompressed SEC1 point
    fn public_key(&self) -> Result<Vec<u8>, Error> {
        if self.kty != "EC" || self.crv.as_deref().is_some_and(|crv| crv != "P-256") {
            return Err(Error::InvalidKey(format!(
                "IAP key {} is not a P-256 key",
                self.kid
            )));
        }

        let decode = |coord: &str| {
            URL_SAFE_NO_PAD
                .decode(coord)
                .ok()
                .filter(|bytes| bytes.len() == 32)
                .ok_or_else(|| Error::InvalidKey(format!("malformed IAP key {}", self.kid)))
        };

        let mut point = Vec::with_capacity(65);
        point.push(0x04);
        point.extend(decode(&self.x)?);
        point.extend(decode(&self.y)?);
        Ok(point)
    }
}

/// Claims of a verified IAP JWT
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IapClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hd: Option<String>,
}

impl IapClaims {
    /// Stable ID of the user, `accounts.google.com:{id}`
    pub fn subject(&self) -> &str {
        &self.sub
    }

    /// Email of the user
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Hosted domain of the user, for Google Workspace accounts
    pub fn hosted_domain(&self) -> Option<&str> {
        self.hd.as_deref()
    }

    pub fn audience(&self) -> &str {
        &self.aud
    }

    pub fn issued_at_secs(&self) -> i64 {
        self.iat
    }

    pub fn expires_at_secs(&self) -> i64 {
        self.exp
    }
}

const IAP_KEYS_URL: &str = "https://www.gstatic.com/iap/verify/public_key-jwk";
const CLOCK_SKEW_SECS: i64 = 30;
