//! Bearer credential verification.
//!
//! Tokens are JWTs signed with the shared HMAC secret. Only the HMAC family
//! is accepted; a token announcing any other algorithm is rejected before
//! its signature is looked at.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::http::request::Request;

/// Signing algorithms the verifier accepts.
pub const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Claims carried by an access token.
///
/// `exp` is mandatory. `iss` and `aud` are only enforced when the verifier
/// is configured with an issuer or audience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiration (seconds since the epoch)
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// All other claims
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Verifies bearer tokens against one symmetric secret.
///
/// Built once at startup and shared by every request.
#[derive(Clone)]
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl CredentialVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = HMAC_ALGORITHMS.to_vec();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // exp and nbf are compared against the clock exactly
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Requires the `iss` claim to equal `issuer`.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self.validation.required_spec_claims.insert("iss".to_string());
        self
    }

    /// Requires the `aud` claim to contain `audience`.
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self.validation.required_spec_claims.insert("aud".to_string());
        self
    }

    /// Validates `token` and returns its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GatewayError::MissingCredential);
        }

        let header = decode_header(token).map_err(map_jwt_error)?;
        if !HMAC_ALGORITHMS.contains(&header.alg) {
            return Err(GatewayError::UnexpectedAlgorithm(format!("{:?}", header.alg)));
        }

        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Extracts the bearer credential from the `Authorization` header and
    /// verifies it.
    pub fn verify_request(&self, request: &Request) -> Result<Claims> {
        let token = bearer_token(request.header("Authorization"))?;
        self.verify(token)
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

/// One-shot verification of `token` with `secret`.
pub fn verify(token: &str, secret: &[u8]) -> Result<Claims> {
    CredentialVerifier::new(secret).verify(token)
}

/// Pulls the token out of an `Authorization` header value.
///
/// Accepts `Bearer <token>` (scheme is case-insensitive) or a bare token.
/// Any other scheme is a malformed header.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let value = header
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(GatewayError::MissingCredential)?;
    if value.eq_ignore_ascii_case("Bearer") {
        return Err(GatewayError::MissingCredential);
    }

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("Bearer") => {
            let token = token.trim();
            if token.is_empty() {
                Err(GatewayError::MissingCredential)
            } else {
                Ok(token)
            }
        }
        Some(_) => Err(GatewayError::MalformedAuthorization),
        None => Ok(value),
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> GatewayError {
    match err.kind() {
        ErrorKind::ExpiredSignature => GatewayError::ExpiredCredential,
        ErrorKind::ImmatureSignature => GatewayError::ImmatureCredential,
        ErrorKind::InvalidSignature => GatewayError::InvalidSignature,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            GatewayError::UnexpectedAlgorithm(err.to_string())
        }
        ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidSubject
        | ErrorKind::MissingRequiredClaim(_) => GatewayError::InvalidCredential(err.to_string()),
        _ => GatewayError::MalformedCredential(err.to_string()),
    }
}
