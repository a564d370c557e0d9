use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Claims, Error, Signer};

/// JOSE header of a compact JWT
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl Header {
    /// An `RS256` header, optionally naming the signing key
    pub fn rs256(kid: Option<&str>) -> Self {
        Self {
            alg: RS256.to_owned(),
            typ: Some("JWT".to_owned()),
            kid: kid.map(str::to_owned),
        }
    }

    /// Signing algorithm
    pub fn alg(&self) -> &str {
        &self.alg
    }

    /// Token type, usually `JWT`
    pub fn typ(&self) -> Option<&str> {
        self.typ.as_deref()
    }

    /// ID of the signing key
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }
}

/// Encode `header` and `claims` and sign them with `signer`
pub(crate) fn encode<C: Serialize>(
    header: &Header,
    claims: &C,
    signer: &Signer,
) -> Result<String, Error> {
    let header = serde_json::to_vec(header)
        .map_err(|err| Error::Json("failed to serialize JWT header", err))?;

    let mut jwt = String::new();
    URL_SAFE_NO_PAD.encode_string(header, &mut jwt);
    jwt.push('.');
    let claims =
        serde_json::to_vec(claims).map_err(|err| Error::Json("failed to serialize claims", err))?;
    URL_SAFE_NO_PAD.encode_string(claims, &mut jwt);

    let signature = signer.sign(jwt.as_bytes())?;
    jwt.push('.');
    URL_SAFE_NO_PAD.encode_string(signature, &mut jwt);
    Ok(jwt)
}

/// Decode the header and claims of a compact JWT without verifying its signature
pub fn decode_unverified(token: &str) -> Result<(Header, Claims), Error> {
    let parts = Parts::split(token)?;
    Ok((parts.header()?, parts.claims()?))
}

/// The three segments of a compact JWT
pub(crate) struct Parts<'a> {
    header: &'a str,
    claims: &'a str,
    signature: &'a str,
}

impl<'a> Parts<'a> {
    pub(crate) fn split(token: &'a str) -> Result<Self, Error> {
        let mut parts = token.trim().split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedJwt("expected three dot-separated parts"));
        };

        Ok(Self {
            header,
            claims,
            signature,
        })
    }

    pub(crate) fn header(&self) -> Result<Header, Error> {
        decode_part(self.header, "header")
    }

    pub(crate) fn claims<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_part(self.claims, "claims")
    }

    /// The bytes covered by the signature, `header.claims`
    pub(crate) fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.claims)
    }

    pub(crate) fn signature(&self) -> Result<Vec<u8>, Error> {
        URL_SAFE_NO_PAD
            .decode(self.signature)
            .map_err(|_| Error::MalformedJwt("signature"))
    }
}

fn decode_part<T: DeserializeOwned>(part: &str, what: &'static str) -> Result<T, Error> {
    let json = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| Error::MalformedJwt(what))?;
    serde_json::from_slice(&json).map_err(|_| Error::MalformedJwt(what))
}

pub(crate) const RS256: &str = "RS256";
pub(crate) const ES256: &str = "ES256";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::KEY_FILE;
    use crate::ServiceAccountKey;

    fn signer() -> Signer {
        let key: ServiceAccountKey = KEY_FILE.parse().unwrap();
        Signer::new(key.private_key_pem()).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let claims = Claims::new("sa@example.iam.gserviceaccount.com", "https://example.com");
        let jwt = encode(&Header::rs256(Some("key-1")), &claims, &signer()).unwrap();

        let parts: Vec<_> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(!jwt.contains('='), "base64url must be unpadded");

        let header = URL_SAFE_NO_PAD.decode(parts[0]).unwrap();
        assert_eq!(header, br#"{"alg":"RS256","typ":"JWT","kid":"key-1"}"#);

        // 2048-bit key
        assert_eq!(URL_SAFE_NO_PAD.decode(parts[2]).unwrap().len(), 256);
    }

    #[test]
    fn test_decode_unverified() {
        let claims = Claims::new("sa@example.iam.gserviceaccount.com", "https://example.com");
        let jwt = encode(&Header::rs256(None), &claims, &signer()).unwrap();

        let (header, decoded) = decode_unverified(&jwt).unwrap();
        assert_eq!(header.alg(), "RS256");
        assert_eq!(header.typ(), Some("JWT"));
        assert_eq!(header.kid(), None);
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for token in ["", "abc", "a.b", "a.b.c.d", "!!!.e30.sig"] {
            let err = decode_unverified(token).unwrap_err();
            assert!(matches!(err, Error::MalformedJwt(_)), "{token}: {err:?}");
        }
    }
}
