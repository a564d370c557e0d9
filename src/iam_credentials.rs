use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, Level};

use crate::default_credentials::{self, TokenProvider};
use crate::types::{HttpClient, SignedJwt};
use crate::{Claims, Error};

/// OAuth2 scope needed to call the IAM Credentials API
pub const IAM_SCOPE: &str = "https://www.googleapis.com/auth/iam";

/// Have the IAM Credentials API sign a JWT for `audience` on behalf of `service_account`
///
/// Uses the ambient credentials of the process (see [`provider()`](crate::provider)), which
/// need the `iam.serviceAccounts.signJwt` permission on `service_account`. The service picks the
/// signing key; which one is not visible to the caller.
#[instrument(level = Level::DEBUG)]
pub async fn sign_jwt(service_account: &str, audience: &str) -> Result<SignedJwt, Error> {
    IamCredentialsSigner::new()
        .await?
        .sign(service_account, audience)
        .await
}

/// Signs JWTs through the IAM Credentials API
///
/// See https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/signJwt.
pub struct IamCredentialsSigner {
    client: HttpClient,
    provider: Arc<dyn TokenProvider>,
    endpoint: String,
    delegates: Vec<String>,
}

impl IamCredentialsSigner {
    /// Authenticate with the ambient credentials of this process
    pub async fn new() -> Result<Self, Error> {
        let client = HttpClient::new()?;
        let provider = default_credentials::discover(client.clone()).await?;
        Ok(Self::build(client, provider))
    }

    /// Authenticate with access tokens from `provider`
    pub fn with_provider(provider: Arc<dyn TokenProvider>) -> Result<Self, Error> {
        Ok(Self::build(HttpClient::new()?, provider))
    }

    fn build(client: HttpClient, provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            provider,
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            delegates: Vec::new(),
        }
    }

    /// Send requests to `endpoint` instead of `https://iamcredentials.googleapis.com`
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let mut endpoint = endpoint.into();
        endpoint.truncate(endpoint.trim_end_matches('/').len());
        self.endpoint = endpoint;
        self
    }

    /// Sign through a chain of delegate service accounts
    ///
    /// Each delegate must be allowed to sign for the next one; the last for the target.
    pub fn with_delegates(mut self, delegates: Vec<String>) -> Self {
        self.delegates = delegates;
        self
    }

    /// Sign claims for `audience` with `service_account` as issuer and subject
    pub async fn sign(&self, service_account: &str, audience: &str) -> Result<SignedJwt, Error> {
        self.sign_claims(service_account, &Claims::new(service_account, audience))
            .await
    }

    /// Sign the given claims with the key of `service_account`
    #[instrument(level = Level::DEBUG, skip(self, claims))]
    pub async fn sign_claims(
        &self,
        service_account: &str,
        claims: &Claims,
    ) -> Result<SignedJwt, Error> {
        let req = sign_jwt_request(
            self.provider.as_ref(),
            &self.endpoint,
            &self.delegates,
            service_account,
            claims,
        )
        .await?;
        let body = self.client.request(req, "signJwt request failed").await?;

        let response = serde_json::from_slice::<SignJwtResponse>(&body)
            .map_err(|err| Error::Json("failed to deserialize signJwt response", err))?;
        debug!(key_id = response.key_id, "JWT signed by IAM Credentials API");
        Ok(SignedJwt::new(response.signed_jwt))
    }
}

impl fmt::Debug for IamCredentialsSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamCredentialsSigner")
            .field("provider", &"Arc<dyn TokenProvider>")
            .field("endpoint", &self.endpoint)
            .field("delegates", &self.delegates)
            .finish()
    }
}

async fn sign_jwt_request(
    provider: &dyn TokenProvider,
    endpoint: &str,
    delegates: &[String],
    service_account: &str,
    claims: &Claims,
) -> Result<Request<Full<Bytes>>, Error> {
    // Reject a malformed target before exchanging credentials for a token.
    let uri = format!("{endpoint}/v1/{}:signJwt", resource_name(service_account));
    let parsed = Uri::try_from(uri.as_str())
        .map_err(|err| Error::InvalidRequest(uri.clone(), err.into()))?;

    let body = serde_json::to_vec(&SignJwtRequest {
        delegates: delegates.iter().map(|d| resource_name(d)).collect(),
        payload: claims.to_json()?,
    })
    .map_err(|err| Error::Json("failed to serialize signJwt request", err))?;

    let token = provider.token(&[IAM_SCOPE]).await?;
    Request::post(parsed)
        .header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
        .header(CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(body)))
        .map_err(|err| Error::InvalidRequest(uri, err))
}

/// The `-` wildcard lets the service infer the project from the account
fn resource_name(service_account: &str) -> String {
    format!("projects/-/serviceAccounts/{service_account}")
}

#[derive(Serialize)]
struct SignJwtRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    delegates: Vec<String>,
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignJwtResponse {
    key_id: String,
    signed_jwt: String,
}

const DEFAULT_ENDPOINT: &str = "https://iamcredentials.googleapis.com";

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use http::StatusCode;
    use http_body_util::BodyExt;

    use super::*;
    use crate::types::tests::{refused_url, serve_once};
    use crate::Token;

    const TARGET: &str = "iap-caller@test_project.iam.gserviceaccount.com";
    const URL: &str = "https://app.example.com/*";

    #[derive(Default)]
    struct StaticProvider {
        scopes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenProvider for StaticProvider {
        async fn token(&self, scopes: &[&str]) -> Result<Token, Error> {
            let mut requested = self.scopes.lock().unwrap();
            requested.extend(scopes.iter().map(|s| s.to_string()));
            Ok(Token::from_string(
                "ya29.static".to_owned(),
                Duration::from_secs(60),
            ))
        }
    }

    struct DeniedProvider;

    #[async_trait]
    impl TokenProvider for DeniedProvider {
        async fn token(&self, _scopes: &[&str]) -> Result<Token, Error> {
            Err(Error::Server {
                context: "ConfigDefaultCredentials",
                status: StatusCode::UNAUTHORIZED,
                body: "invalid_grant".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn test_sign_jwt_request() {
        let provider = StaticProvider::default();
        let claims = Claims::new(TARGET, URL);
        let req = sign_jwt_request(&provider, DEFAULT_ENDPOINT, &[], TARGET, &claims)
            .await
            .unwrap();

        assert_eq!(*provider.scopes.lock().unwrap(), [IAM_SCOPE]);
        assert_eq!(
            req.uri(),
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/iap-caller@test_project.iam.gserviceaccount.com:signJwt"
        );
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer ya29.static");
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");

        let body = req.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body.get("delegates").is_none());

        // The payload is the claim set as a JSON string, not a nested object.
        let payload: Claims = serde_json::from_str(body["payload"].as_str().unwrap()).unwrap();
        assert_eq!(payload, claims);
    }

    #[tokio::test]
    async fn test_delegates() {
        let delegates = vec!["hop@test_project.iam.gserviceaccount.com".to_owned()];
        let req = sign_jwt_request(
            &StaticProvider::default(),
            "https://private.iamcredentials.example",
            &delegates,
            TARGET,
            &Claims::new(TARGET, URL),
        )
        .await
        .unwrap();
        assert!(req
            .uri()
            .to_string()
            .starts_with("https://private.iamcredentials.example/v1/projects/-/"));

        let body = req.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body["delegates"],
            serde_json::json!(["projects/-/serviceAccounts/hop@test_project.iam.gserviceaccount.com"])
        );
    }

    #[tokio::test]
    async fn test_malformed_target() {
        let claims = Claims::new(TARGET, URL);
        let provider = StaticProvider::default();
        let err = sign_jwt_request(&provider, DEFAULT_ENDPOINT, &[], "not an account", &claims)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(..)), "{err:?}");
        assert!(!err.is_auth_error());
        assert!(!err.is_transport_error());
        assert!(provider.scopes.lock().unwrap().is_empty());

        // Without usable credentials the malformed target is still what gets reported.
        let err = sign_jwt_request(&DeniedProvider, DEFAULT_ENDPOINT, &[], "not an account", &claims)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(..)), "{err:?}");
    }

    fn signer(endpoint: &str) -> IamCredentialsSigner {
        IamCredentialsSigner::with_provider(Arc::new(StaticProvider::default()))
            .unwrap()
            .with_endpoint(format!("{endpoint}/"))
    }

    #[tokio::test]
    async fn test_sign_extracts_signed_jwt() {
        let (endpoint, server) =
            serve_once("200 OK", r#"{"keyId": "0123abcd", "signedJwt": "aaa.bbb.ccc"}"#).await;
        let jwt = signer(&endpoint).sign(TARGET, URL).await.unwrap();
        assert_eq!(jwt.as_str(), "aaa.bbb.ccc");

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "POST /v1/projects/-/serviceAccounts/iap-caller@test_project.iam.gserviceaccount.com:signJwt HTTP/1.1"
        ));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer ya29.static"));
    }

    #[tokio::test]
    async fn test_sign_permission_denied() {
        let (endpoint, _server) = serve_once(
            "403 Forbidden",
            r#"{"error": {"code": 403, "status": "PERMISSION_DENIED"}}"#,
        )
        .await;
        let err = signer(&endpoint).sign(TARGET, URL).await.unwrap_err();
        assert!(
            matches!(&err, Error::Server { status, .. } if *status == StatusCode::FORBIDDEN),
            "{err:?}"
        );
        assert!(err.is_auth_error());
        assert!(!err.is_transport_error());
    }

    #[tokio::test]
    async fn test_sign_unreachable_endpoint() {
        let err = signer(&refused_url().await)
            .sign(TARGET, URL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(..)), "{err:?}");
        assert!(err.is_transport_error());
        assert!(!err.is_auth_error());
    }

    #[tokio::test]
    async fn test_sign_unexpected_response() {
        let (endpoint, _server) = serve_once("200 OK", r#"{"keyId": "0123abcd"}"#).await;
        let err = signer(&endpoint).sign(TARGET, URL).await.unwrap_err();
        assert!(matches!(err, Error::Json(..)), "{err:?}");
    }

    #[tokio::test]
    async fn test_credential_failure_is_auth_error() {
        let claims = Claims::new(TARGET, URL);
        let err = sign_jwt_request(&DeniedProvider, DEFAULT_ENDPOINT, &[], TARGET, &claims)
            .await
            .unwrap_err();
        assert!(err.is_auth_error(), "{err:?}");
    }

    #[test]
    fn test_deserialize_response() {
        let body = r#"{"keyId": "0123abcd", "signedJwt": "aaa.bbb.ccc"}"#;
        let response: SignJwtResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.key_id, "0123abcd");
        assert_eq!(response.signed_jwt, "aaa.bbb.ccc");
    }
}
