use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, Level};

use crate::config_default_credentials::CredentialsFile;
use crate::gcloud_authorized_user::GCloudAuthorizedUser;
use crate::metadata_service_account::MetadataServiceAccount;
use crate::types::{HttpClient, Token};
use crate::Error;

/// A source of OAuth2 access tokens
///
/// Implementations fetch a fresh token on every call; nothing is cached.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get an access token for the given scopes
    ///
    /// Sources that cannot narrow scopes (user credentials, `gcloud`) return a token with
    /// whatever scopes the underlying credentials carry.
    async fn token(&self, scopes: &[&str]) -> Result<Token, Error>;
}

/// Finds the ambient credentials of this process
///
/// Tries the following approaches, in order:
///
/// 1. If the `GOOGLE_APPLICATION_CREDENTIALS` environment variable is set, read the service
///    account key or authorized user credentials from the file it points to. Failure to read
///    that file is returned as is, without trying other sources.
/// 2. Look for credentials in `.config/gcloud/application_default_credentials.json` in the
///    home directory, as written by `gcloud auth application-default login`.
/// 3. Check whether the GCE metadata server is reachable; if so, use the attached service
///    account.
/// 4. Check whether `gcloud` is available on the `PATH`; if so, use
///    `gcloud auth print-access-token`.
#[instrument(level = Level::DEBUG)]
pub async fn provider() -> Result<Arc<dyn TokenProvider>, Error> {
    discover(HttpClient::new()?).await
}

pub(crate) async fn discover(client: HttpClient) -> Result<Arc<dyn TokenProvider>, Error> {
    if let Some(path) = env::var_os(CREDENTIALS_ENV) {
        debug!(?path, "reading credentials file from {CREDENTIALS_ENV} env var");
        return CredentialsFile::from_file(&path)?.into_provider(client);
    }

    let mut errors = Vec::with_capacity(3);
    match CredentialsFile::from_gcloud_config() {
        Ok(file) => {
            debug!("using gcloud application default credentials");
            return file.into_provider(client);
        }
        Err(err) => errors.push(err),
    }

    match MetadataServiceAccount::new(&client).await {
        Ok(provider) => {
            debug!("using GCE metadata server");
            return Ok(Arc::new(provider));
        }
        Err(err) => errors.push(err),
    }

    match GCloudAuthorizedUser::new() {
        Ok(provider) => {
            debug!("using gcloud CLI");
            return Ok(Arc::new(provider));
        }
        Err(err) => errors.push(err),
    }

    Err(Error::NoCredentials(errors))
}

const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
