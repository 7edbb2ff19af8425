//! Caller identity resolution.
//!
//! Supports both transport modes: with mutual TLS the identity is the
//! subject CN of the verified client certificate; over plain HTTP it comes
//! from an API key (Authorization: Bearer or x-api-key) matched against the
//! configured callers. Keys are compared by SHA-256 hash so plaintext never
//! sits in lookup tables.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use x509_parser::prelude::FromDer;

use crate::core::config::CallerConfig;
use crate::core::error::{AppError, Result};

/// How a caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Subject CN of a CA-verified client certificate
    MutualTls,
    /// API key matched against the caller directory
    ApiKey,
    /// No callers configured; authentication disabled
    Anonymous,
}

/// Resolved caller identity, attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Name used in rate-limit keys and the audit log
    pub name: String,
    pub source: IdentitySource,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            source: IdentitySource::Anonymous,
        }
    }
}

/// Hash an API key using SHA-256.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the API key from headers. x-api-key takes priority over the
/// Authorization: Bearer form.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
}

/// Extract the subject CN from a DER-encoded client certificate.
pub fn common_name_from_cert(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der).ok()?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());
    cn
}

struct CallerEntry {
    enabled: bool,
}

/// Directory of configured callers, indexed for both auth modes.
pub struct CallerDirectory {
    by_key_hash: HashMap<String, String>,
    by_name: HashMap<String, CallerEntry>,
}

impl CallerDirectory {
    /// Build the directory, resolving each caller's API key from its
    /// environment variable. A caller without a resolvable key can still
    /// authenticate via mTLS.
    pub fn from_config(callers: &[CallerConfig]) -> Self {
        let mut by_key_hash = HashMap::new();
        let mut by_name = HashMap::new();
        for caller in callers {
            by_name.insert(
                caller.name.clone(),
                CallerEntry {
                    enabled: caller.enabled,
                },
            );
            let Some(var) = &caller.api_key_env else {
                continue;
            };
            match std::env::var(var) {
                Ok(key) if !key.is_empty() => {
                    by_key_hash.insert(hash_key(&key), caller.name.clone());
                }
                _ => {
                    tracing::warn!(
                        caller = %caller.name,
                        env_var = %var,
                        "Caller API key environment variable not set; key auth disabled for this caller"
                    );
                }
            }
        }
        Self {
            by_key_hash,
            by_name,
        }
    }

    /// Whether any callers are configured. With an empty directory,
    /// authentication is disabled and every request runs as anonymous.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Resolve an identity from request headers (plain-HTTP mode).
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<CallerIdentity> {
        if self.is_empty() {
            return Ok(CallerIdentity::anonymous());
        }
        let key = extract_api_key(headers).ok_or(AppError::Authentication)?;
        let name = self
            .by_key_hash
            .get(&hash_key(key))
            .ok_or(AppError::Authentication)?;
        self.admit(name, IdentitySource::ApiKey)
    }

    /// Resolve an identity from a verified client certificate CN (mTLS
    /// mode). The CA signature already authenticated the peer; the
    /// directory only rejects explicitly disabled callers.
    pub fn identity_from_cn(&self, cn: &str) -> Result<CallerIdentity> {
        self.admit(cn, IdentitySource::MutualTls)
    }

    fn admit(&self, name: &str, source: IdentitySource) -> Result<CallerIdentity> {
        if let Some(entry) = self.by_name.get(name) {
            if !entry.enabled {
                tracing::warn!(caller = %name, "Disabled caller rejected");
                return Err(AppError::Authentication);
            }
        }
        Ok(CallerIdentity {
            name: name.to_string(),
            source,
        })
    }
}
