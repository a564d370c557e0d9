use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// How long a token is valid for, in seconds
///
/// IAP rejects self-signed tokens with a longer lifetime.
pub const TOKEN_LIFETIME_SECS: i64 = 3600;

/// The claim set of a service account JWT for IAP
///
/// `iss` and `sub` both name the service account, `aud` is the URL of the protected resource.
/// Neither is validated; whatever the caller passes ends up in the token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
}

impl Claims {
    /// Claims for `service_account` and `audience`, issued now
    pub fn new(service_account: &str, audience: &str) -> Self {
        Self::issued_at(service_account, audience, Utc::now())
    }

    /// Claims for `service_account` and `audience`, issued at `now`
    ///
    /// Sub-second precision of `now` is discarded.
    pub fn issued_at(service_account: &str, audience: &str, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            iss: service_account.to_owned(),
            sub: service_account.to_owned(),
            aud: audience.to_owned(),
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        }
    }

    /// The claims as the JSON payload of a JWT
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Json("failed to serialize claims", err))
    }

    /// Issuer, the service account email
    pub fn issuer(&self) -> &str {
        &self.iss
    }

    /// Subject, the service account email
    pub fn subject(&self) -> &str {
        &self.sub
    }

    /// Audience, the URL of the protected resource
    pub fn audience(&self) -> &str {
        &self.aud
    }

    /// Issued at, in seconds since the Unix epoch
    pub fn issued_at_secs(&self) -> i64 {
        self.iat
    }

    /// Expires at, in seconds since the Unix epoch
    pub fn expires_at_secs(&self) -> i64 {
        self.exp
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const EMAIL: &str = "iap-caller@test_project.iam.gserviceaccount.com";
    const URL: &str = "https://app.example.com/*";

    #[test]
    fn test_lifetime_is_one_hour() {
        let claims = Claims::new(EMAIL, URL);
        assert_eq!(claims.expires_at_secs() - claims.issued_at_secs(), 3600);

        let now = Utc::now().timestamp();
        assert!((claims.issued_at_secs() - now).abs() <= 1);
    }

    #[test]
    fn test_identity_and_audience() {
        let claims = Claims::new(EMAIL, URL);
        assert_eq!(claims.issuer(), EMAIL);
        assert_eq!(claims.subject(), EMAIL);
        assert_eq!(claims.audience(), URL);
    }

    #[test]
    fn test_fixed_clock_is_deterministic() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(750);

        let first = Claims::issued_at(EMAIL, URL, now).to_json().unwrap();
        let second = Claims::issued_at(EMAIL, URL, now).to_json().unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            r#"{"iss":"iap-caller@test_project.iam.gserviceaccount.com","sub":"iap-caller@test_project.iam.gserviceaccount.com","aud":"https://app.example.com/*","iat":1714564800,"exp":1714568400}"#
        );
    }

    #[test]
    fn test_inputs_are_not_validated() {
        let claims = Claims::new("not an email", "not a url");
        assert_eq!(claims.issuer(), "not an email");
        assert_eq!(claims.audience(), "not a url");
    }
}
