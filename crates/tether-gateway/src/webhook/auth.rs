//! Webhook authentication and server-side tenant resolution.
//!
//! Each registered source authenticates one of two ways:
//!
//! - **Signature sources** (`github`, `slack`): an HMAC-SHA256 signature
//!   over the raw request body, verified against the tenant's secret from
//!   the secret store. The secret that verifies the signature *is* the
//!   tenant resolution — exactly one tenant's secret may verify.
//! - **API-key sources** (`jira` and any source a policy declares a key
//!   for): the `X-API-Key` header, hashed and compared against the
//!   verifiers stored in NamespacePolicy `webhookAuth.apiKeys`.
//!
//! The schemes are not exclusive per source: a signature source also
//! accepts an API key when a tenant has declared one for it, so a tenant
//! may register e.g. a GitHub hook with either credential kind. A request
//! presenting `X-API-Key` for a key-declared source takes the API-key
//! path; everything else on a signature source takes the signature path.
//!
//! All comparisons are constant-time. The client payload is never
//! consulted for tenancy: a tenant hint in the body is ignored by
//! construction, because resolution happens before the body is parsed.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use tether_core::error::{Error, Result};
use tether_core::resource::policy::NamespacePolicy;
use tether_core::resource::POLICY_NAME;
use tether_core::secrets::SecretStore;
use tether_core::store::TypedStore;

type HmacSha256 = Hmac<Sha256>;

/// GitHub signature header.
const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Slack signature header.
const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
/// Slack request timestamp header.
const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
/// API key header for key-authenticated sources.
const API_KEY_HEADER: &str = "x-api-key";

/// Maximum accepted clock skew for Slack-signed requests, in seconds.
const SLACK_SKEW_SECS: i64 = 300;

/// Sources authenticated by body signature.
const SIGNATURE_SOURCES: [&str; 2] = ["github", "slack"];
/// Sources authenticated by API key even without a policy entry.
const BUILTIN_KEY_SOURCES: [&str; 1] = ["jira"];

/// Authenticates webhooks and resolves their tenant.
pub struct WebhookAuthenticator {
    policies: Arc<TypedStore<NamespacePolicy>>,
    secrets: Arc<dyn SecretStore>,
}

impl WebhookAuthenticator {
    /// Creates the authenticator.
    #[must_use]
    pub fn new(policies: Arc<TypedStore<NamespacePolicy>>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { policies, secrets }
    }

    /// Whether `source` is accepted at all.
    #[must_use]
    pub fn known_source(&self, source: &str) -> bool {
        SIGNATURE_SOURCES.contains(&source)
            || BUILTIN_KEY_SOURCES.contains(&source)
            || self
                .policies
                .list_all()
                .iter()
                .any(|p| p.resource.spec.webhook_auth.api_keys.contains_key(source))
    }

    /// Whether any tenant declared an API key for `source`.
    fn has_api_key_for(&self, source: &str) -> bool {
        self.policies
            .list_all()
            .iter()
            .any(|p| p.resource.spec.webhook_auth.api_keys.contains_key(source))
    }

    /// Authenticates a request and resolves the owning tenant.
    ///
    /// # Errors
    ///
    /// `AuthN` when no credential verifies, more than one tenant matches,
    /// or required headers are missing/malformed.
    pub async fn authenticate(
        &self,
        source: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<String> {
        // A presented API key wins whenever some tenant declared one for
        // this source; signature sources fall through to their signature
        // scheme otherwise.
        if headers.contains_key(API_KEY_HEADER) && self.has_api_key_for(source) {
            return self.authenticate_api_key(source, headers);
        }
        match source {
            "github" => self.authenticate_github(headers, body).await,
            "slack" => self.authenticate_slack(headers, body).await,
            _ => self.authenticate_api_key(source, headers),
        }
    }

    async fn authenticate_github(&self, headers: &HeaderMap, body: &[u8]) -> Result<String> {
        let signature = header(headers, GITHUB_SIGNATURE_HEADER)?;
        let signature = signature
            .strip_prefix("sha256=")
            .ok_or_else(|| Error::authn("SignatureFormat", "signature must be sha256=<hex>"))?;
        let signature = decode_hex(signature)
            .ok_or_else(|| Error::authn("SignatureFormat", "signature is not valid hex"))?;

        self.resolve_by_signature("github", &signature, |secret| {
            hmac_sha256(secret.as_bytes(), body)
        })
        .await
    }

    async fn authenticate_slack(&self, headers: &HeaderMap, body: &[u8]) -> Result<String> {
        let timestamp = header(headers, SLACK_TIMESTAMP_HEADER)?;
        let ts: i64 = timestamp
            .parse()
            .map_err(|_| Error::authn("TimestampFormat", "request timestamp is not an integer"))?;
        if (Utc::now().timestamp() - ts).abs() > SLACK_SKEW_SECS {
            return Err(Error::authn("TimestampSkew", "request timestamp outside tolerance"));
        }

        let signature = header(headers, SLACK_SIGNATURE_HEADER)?;
        let signature = signature
            .strip_prefix("v0=")
            .ok_or_else(|| Error::authn("SignatureFormat", "signature must be v0=<hex>"))?;
        let signature = decode_hex(signature)
            .ok_or_else(|| Error::authn("SignatureFormat", "signature is not valid hex"))?;

        let base = {
            let mut buf = format!("v0:{timestamp}:").into_bytes();
            buf.extend_from_slice(body);
            buf
        };
        self.resolve_by_signature("slack", &signature, move |secret| {
            hmac_sha256(secret.as_bytes(), &base)
        })
        .await
    }

    /// Verifies a signature against every tenant that configured a secret
    /// for the source. Exactly one must match; the match is the tenant.
    async fn resolve_by_signature(
        &self,
        source: &str,
        presented: &[u8],
        compute: impl Fn(&str) -> Vec<u8>,
    ) -> Result<String> {
        let mut matched: Option<String> = None;
        for stored in self.policies.list_all() {
            let policy = &stored.resource;
            let Some(secret_ref) = policy.spec.webhook_auth.signature_secret_refs.get(source)
            else {
                continue;
            };
            let Ok(secret) = self.secrets.fetch(secret_ref).await else {
                tracing::warn!(
                    tenant = %policy.tenant,
                    source,
                    "signature secret reference did not resolve"
                );
                continue;
            };
            let expected = compute(secret.expose_secret());
            if constant_time_eq(presented, &expected) {
                if matched.is_some() {
                    return Err(Error::authn(
                        "AmbiguousCredential",
                        "signature verifies for more than one tenant",
                    ));
                }
                matched = Some(policy.tenant.clone());
            }
        }
        matched.ok_or_else(|| Error::authn("InvalidSignature", "signature did not verify"))
    }

    fn authenticate_api_key(&self, source: &str, headers: &HeaderMap) -> Result<String> {
        let presented = header(headers, API_KEY_HEADER)?;
        let presented_verifier = api_key_verifier(&presented);

        let mut matched: Option<String> = None;
        for stored in self.policies.list_all() {
            let policy = &stored.resource;
            let Some(verifier) = policy.spec.webhook_auth.api_keys.get(source) else {
                continue;
            };
            if constant_time_eq(verifier.as_bytes(), presented_verifier.as_bytes()) {
                if matched.is_some() {
                    return Err(Error::authn(
                        "AmbiguousCredential",
                        "API key matches more than one tenant",
                    ));
                }
                matched = Some(policy.tenant.clone());
            }
        }
        matched.ok_or_else(|| Error::authn("InvalidApiKey", "API key did not match any tenant"))
    }

    /// The effective policy of a resolved tenant.
    #[must_use]
    pub fn tenant_policy(&self, tenant: &str) -> NamespacePolicy {
        self.policies
            .get(tenant, POLICY_NAME)
            .map_or_else(|| NamespacePolicy::unrestricted(tenant), |s| s.resource)
    }
}

/// The stored verifier form of an API key.
#[must_use]
pub fn api_key_verifier(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("sha256:{}", encode_hex(&digest))
}

fn header(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .ok_or_else(|| Error::authn("MissingCredential", format!("missing {name} header")))
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
