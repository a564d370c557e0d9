//! Service account JWTs for Identity-Aware Proxy (IAP)
//!
//! IAP accepts a self-signed JWT from a Google Cloud service account as a bearer credential. This
//! crate produces such a token in one of two ways:
//!
//! 1. Ask the IAM Credentials API to sign the claims on behalf of a service account, using the
//!    ambient application default credentials of the calling process. See [`sign_jwt()`].
//! 2. Sign the claims locally with the RSA private key from a downloaded service account key
//!    file. See [`sign_jwt_with_key_file()`].
//!
//! Both paths produce the same claim set: `iss` and `sub` set to the service account email,
//! `aud` set to the URL of the protected resource, and a validity window of one hour.
//!
//! ## Signing with the IAM Credentials API
//!
//! ```rust,no_run
//! # async fn sign() -> Result<(), iap_jwt::Error> {
//! let jwt = iap_jwt::sign_jwt(
//!     "iap-caller@my-project.iam.gserviceaccount.com",
//!     "https://app.example.com/*",
//! )
//! .await?;
//! let authorization = jwt.bearer();
//! # Ok(())
//! # }
//! ```
//!
//! Ambient credentials are discovered the same way other Google client libraries do it:
//! `GOOGLE_APPLICATION_CREDENTIALS`, then the gcloud application default credentials file, then
//! the GCE metadata server, then the `gcloud` CLI. The caller needs the
//! `iam.serviceAccounts.signJwt` permission on the target service account.
//!
//! ## Signing with a key file
//!
//! ```rust,no_run
//! # fn sign() -> Result<(), iap_jwt::Error> {
//! let jwt = iap_jwt::sign_jwt_with_key_file("service-account.json", "https://app.example.com/*")?;
//! println!("{}", jwt.as_str());
//! # Ok(())
//! # }
//! ```
//!
//! ## Verifying IAP's own tokens
//!
//! Backends behind IAP receive a JWT signed by IAP in the `x-goog-iap-jwt-assertion` header.
//! [`verify_iap_jwt()`] checks it against IAP's published keys and the expected
//! [`IapAudience`].
//!
//! Neither path caches anything; every call reads credentials and signs a fresh token. Callers
//! that want a deadline on the remote path can wrap the future in `tokio::time::timeout`.

#![warn(unreachable_pub)]

use std::process::ExitStatus;
use std::{fmt, io};

use http::StatusCode;
use thiserror::Error;

mod audience;
pub use audience::IapAudience;

mod claims;
pub use claims::{Claims, TOKEN_LIFETIME_SECS};

mod config_default_credentials;
mod custom_service_account;
mod gcloud_authorized_user;
mod metadata_service_account;

mod default_credentials;
pub use default_credentials::{provider, TokenProvider};

mod iam_credentials;
pub use iam_credentials::{sign_jwt, IamCredentialsSigner, IAM_SCOPE};

mod jwt;
pub use jwt::{decode_unverified, Header};

mod key_file;
pub use key_file::{sign_jwt_with_key_file, KeyFileSigner};

mod types;
pub use types::{ServiceAccountKey, SignedJwt, Signer, Token};

mod verify;
pub use verify::{verify_iap_jwt, IapClaims, IapKeys, IapVerifier, IAP_ISSUER};

/// Enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum Error {
    /// None of the ambient credential sources could provide an access token
    ///
    /// Contains the error of every source that was tried, in discovery order.
    #[error("no ambient credentials found: {}", Summary(.0))]
    NoCredentials(Vec<Error>),

    /// Could not read a file or run a process
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),

    /// Could not (de)serialize JSON
    #[error("{0}: {1}")]
    Json(&'static str, #[source] serde_json::Error),

    /// A service account key file lacks a required field
    #[error("service account key is missing required field `{0}`")]
    MissingField(&'static str),

    /// The private key is not a usable PEM-encoded RSA key
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// A compact JWT could not be split into its parts or decoded
    #[error("malformed JWT: {0}")]
    MalformedJwt(&'static str),

    /// A JWT is well-formed but failed verification
    #[error("JWT rejected: {0}")]
    Rejected(&'static str),

    /// A request could not be built, usually because the URI is malformed
    #[error("invalid request to {0}: {1}")]
    InvalidRequest(String, #[source] http::Error),

    /// The request could not be sent or the response could not be read
    #[error("{0}: {1}")]
    Http(
        &'static str,
        #[source] Box<dyn std::error::Error + Send + Sync>,
    ),

    /// The server answered with a non-success status
    #[error("{context}: server responded with {status}: {body}")]
    Server {
        /// What was being requested
        context: &'static str,
        /// HTTP status of the response
        status: StatusCode,
        /// Response body, lossily decoded as UTF-8
        body: String,
    },

    /// The `gcloud` CLI exited with an error
    #[error("`gcloud` failed with {status}: {stderr}")]
    Gcloud {
        /// Exit status of the process
        status: ExitStatus,
        /// What the process wrote to stderr, lossily decoded as UTF-8
        stderr: String,
    },

    /// Other errors
    #[error("{0}")]
    Str(&'static str),
}

impl Error {
    /// Whether the error stems from missing credentials or insufficient permissions
    ///
    /// These are configuration problems; repeating the call will not help.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Error::NoCredentials(_) | Error::Gcloud { .. } => true,
            Error::Server { status, .. } => {
                *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
            }
            _ => false,
        }
    }

    /// Whether the error stems from a network failure or an unavailable server
    pub fn is_transport_error(&self) -> bool {
        match self {
            Error::Http(..) => true,
            Error::Server { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

struct Summary<'a>(&'a [Error]);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
