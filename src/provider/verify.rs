//! ID-token verification with JWKS caching
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the issuer's JWKS (cached for 1 hour; refreshed once on an
//!    unknown `kid`, which covers key rotation without re-fetching forever
//!    for keys that truly do not exist).
//! 3. Verify the signature and the `exp` / `iss` claims, with 60 seconds of
//!    clock leeway.
//! 4. Check `aud` manually, accepting both the single-string and array forms.
//!
//! Verification failures are ordinary outcomes here, not gateway errors: the
//! caller turns any [`VerifyError`] into an unauthenticated request.

use std::time::{Duration, Instant};

use base64::Engine;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde_json::Value;
use tracing::{debug, warn};

/// Why a token failed verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Signature or standard-claim validation failed
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header carries no `kid`
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is absent from the issuer's JWKS even after a refresh
    #[error("Unknown key id: {0}")]
    UnknownKeyId(String),

    /// A required claim is absent from the payload
    #[error("Token missing required claim '{0}'")]
    MissingClaim(&'static str),

    /// The `aud` claim matches none of the accepted audiences
    #[error("Audience mismatch")]
    AudienceMismatch,

    /// Network or HTTP failure while fetching the JWKS
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Validated identity claims from an ID token or session.
///
/// `subject` and `issuer` are always present; everything the token carried
/// is kept in `extra` (including `sub` and `iss`), so policy predicates can
/// match on any claim by name.
#[derive(Debug, Clone)]
pub struct Claims {
    /// OIDC `sub` claim
    pub subject: String,
    /// OIDC `iss` claim
    pub issuer: String,
    /// `email` claim, when present
    pub email: Option<String>,
    /// `name` claim, when present
    pub name: Option<String>,
    /// Full claim set as delivered by the provider
    pub extra: serde_json::Map<String, Value>,
}

impl Claims {
    /// Build a minimal claim set (mostly useful in tests and as the base
    /// for session construction).
    #[must_use]
    pub fn new(subject: impl Into<String>, issuer: impl Into<String>) -> Self {
        let subject = subject.into();
        let issuer = issuer.into();
        let mut extra = serde_json::Map::new();
        extra.insert("sub".to_string(), Value::String(subject.clone()));
        extra.insert("iss".to_string(), Value::String(issuer.clone()));
        Self {
            subject,
            issuer,
            email: None,
            name: None,
            extra,
        }
    }

    /// Look up any claim by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// Read the `iss` claim without verifying the token, to pick the provider
/// the token must be verified against.
#[must_use]
pub fn unverified_issuer(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Map<String, Value> = serde_json::from_slice(&bytes).ok()?;
    claims.get("iss")?.as_str().map(str::to_string)
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// Token verifier with one cached JWKS per issuer.
pub struct Verifier {
    jwks: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl Verifier {
    /// Create with the shared HTTP client and a 1-hour JWKS TTL.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            jwks: DashMap::new(),
            http,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Fetch and cache the issuer's JWKS ahead of the first verification,
    /// so the request path only ever reads the cache (the single
    /// unknown-`kid` refresh aside).
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Http`] when the JWKS cannot be fetched.
    pub async fn prefetch(&self, issuer: &str, jwks_uri: &str) -> Result<(), VerifyError> {
        self.get_or_fetch(issuer, jwks_uri, true).await?;
        Ok(())
    }

    /// Verify `token` against `issuer` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`] for any invalid, expired, or mis-audienced
    /// token, and for JWKS fetch failures.
    pub async fn verify(
        &self,
        token: &str,
        issuer: &str,
        jwks_uri: &str,
        audiences: &[String],
    ) -> Result<Claims, VerifyError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.clone().ok_or(VerifyError::MissingKeyId)?;

        let key = self.find_decoding_key(&kid, issuer, jwks_uri).await?;

        let mut validation = build_validation(&header);
        validation.set_issuer(&[issuer]);
        // aud is checked manually below to accept both string and array forms
        validation.validate_aud = false;

        let token_data: TokenData<serde_json::Map<String, Value>> =
            jsonwebtoken::decode(token, &key, &validation)?;
        let payload = token_data.claims;

        if !audiences.is_empty() {
            let aud = payload.get("aud").unwrap_or(&Value::Null);
            check_audience(aud, audiences)?;
        }

        claims_from_payload(payload)
    }

    /// Find a decoding key by `kid`, refreshing the cached JWKS once if the
    /// key is not present.
    async fn find_decoding_key(
        &self,
        kid: &str,
        issuer: &str,
        jwks_uri: &str,
    ) -> Result<DecodingKey, VerifyError> {
        let jwks = self.get_or_fetch(issuer, jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.get_or_fetch(issuer, jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| VerifyError::UnknownKeyId(kid.to_string()))
    }

    async fn get_or_fetch(
        &self,
        issuer: &str,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, VerifyError> {
        if !force_refresh {
            if let Some(cached) = self.jwks.get(issuer) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(issuer = %issuer, "Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = self.http.get(jwks_uri).send().await?.json().await?;

        self.jwks.insert(
            issuer.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );

        Ok(jwks)
    }
}

/// Promote the raw payload into [`Claims`].
fn claims_from_payload(payload: serde_json::Map<String, Value>) -> Result<Claims, VerifyError> {
    let subject = payload
        .get("sub")
        .and_then(Value::as_str)
        .ok_or(VerifyError::MissingClaim("sub"))?
        .to_string();
    let issuer = payload
        .get("iss")
        .and_then(Value::as_str)
        .ok_or(VerifyError::MissingClaim("iss"))?
        .to_string();
    let email = payload
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string);
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Claims {
        subject,
        issuer,
        email,
        name,
        extra: payload,
    })
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60; // clock skew tolerance
    v
}

/// Validate that the token's `aud` claim contains one of the accepted values.
fn check_audience(aud_claim: &Value, expected: &[String]) -> Result<(), VerifyError> {
    let matches = match aud_claim {
        Value::String(s) => expected.iter().any(|e| e == s),
        Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(VerifyError::AudienceMismatch)
    }
}
