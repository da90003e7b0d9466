use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use rsa::{
    pkcs1v15::{Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
    signature::Verifier,
    RsaPublicKey,
};
use serde_json::Value;
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use x509_cert::{
    der::{DecodePem, Encode},
    Certificate,
};

use sns_trigger_core::message::{
    payload_str, MessageType, Payload, FIELD_SIGNATURE, FIELD_SIGNATURE_VERSION,
    FIELD_SIGNING_CERT_URL,
};

use crate::http::{HttpApi, HttpApiError};

/// Default number of signing certificates kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Digest used by an SNS signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVersion {
    /// RSA PKCS#1 v1.5 with SHA-1.
    V1,
    /// RSA PKCS#1 v1.5 with SHA-256.
    V2,
}

impl SignatureVersion {
    pub fn parse(value: Option<&str>) -> Result<Self, VerificationError> {
        match value.map(str::trim) {
            Some("1") => Ok(Self::V1),
            Some("2") => Ok(Self::V2),
            other => Err(VerificationError::UnsupportedVersion(
                other.map(str::to_string),
            )),
        }
    }
}

/// Reasons a payload fails verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("message type is not recognised")]
    UndefinedType,
    #[error("nothing to sign")]
    EmptyStringToSign,
    #[error("invalid certificate url: {0}")]
    CertificateUrl(#[from] url::ParseError),
    #[error("certificate url is not trusted: {0}")]
    UntrustedCertificateUrl(String),
    #[error("failed to fetch certificate: {0}")]
    Fetch(#[from] HttpApiError),
    #[error("invalid certificate: {0}")]
    Certificate(x509_cert::der::Error),
    #[error("certificate is outside its validity period")]
    CertificateNotValid,
    #[error("certificate does not carry an rsa public key: {0}")]
    PublicKey(rsa::pkcs8::spki::Error),
    #[error("unsupported signature version: {0:?}")]
    UnsupportedVersion(Option<String>),
    #[error("signature is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("signature mismatch: {0}")]
    Signature(rsa::signature::Error),
}

/// Builds the canonical text SNS signs for `message_type`.
///
/// Each signed field present in the payload contributes `name\nvalue\n`.
/// Absent and null fields are skipped.
pub fn string_to_sign(payload: &Payload, message_type: MessageType) -> String {
    let mut buffer = String::new();
    for field in message_type.signed_fields() {
        let value = match payload.get(*field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        };
        buffer.push_str(field);
        buffer.push('\n');
        buffer.push_str(&value);
        buffer.push('\n');
    }
    buffer
}

/// Verifies SNS message signatures against the sender's signing certificate.
pub struct SignatureVerifier {
    http: Arc<dyn HttpApi>,
    cert_host: Option<Regex>,
    cache: Mutex<CertificateCache>,
}

impl SignatureVerifier {
    /// `cert_host` restricts certificate URLs to `https` hosts matching the pattern.
    pub fn new(http: Arc<dyn HttpApi>, cert_host: Option<Regex>, cache_capacity: usize) -> Self {
        Self {
            http,
            cert_host,
            cache: Mutex::new(CertificateCache::new(cache_capacity)),
        }
    }

    /// Returns `true` only when the payload carries a valid signature.
    pub async fn verify(&self, payload: &Payload) -> bool {
        match self.check(payload).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    stage = "signature",
                    message_type = MessageType::of(payload).as_str(),
                    error = %err,
                    "signature verification failed"
                );
                false
            }
        }
    }

    /// Like [`verify`](Self::verify) but reports why a payload was rejected.
    pub async fn check(&self, payload: &Payload) -> Result<(), VerificationError> {
        let cert_url = payload_str(payload, FIELD_SIGNING_CERT_URL)
            .ok_or(VerificationError::MissingField(FIELD_SIGNING_CERT_URL))?;
        let message_type = MessageType::of(payload);
        if message_type == MessageType::Undefined {
            return Err(VerificationError::UndefinedType);
        }
        let signature = payload_str(payload, FIELD_SIGNATURE)
            .ok_or(VerificationError::MissingField(FIELD_SIGNATURE))?;

        let canonical = string_to_sign(payload, message_type);
        if canonical.is_empty() {
            return Err(VerificationError::EmptyStringToSign);
        }

        let cert_url = Url::parse(cert_url)?;
        self.ensure_trusted(&cert_url)?;

        let version = SignatureVersion::parse(payload_str(payload, FIELD_SIGNATURE_VERSION))?;
        let signature = STANDARD.decode(signature.trim())?;
        let signature =
            Signature::try_from(signature.as_slice()).map_err(VerificationError::Signature)?;

        let key = self.public_key(&cert_url).await?;
        let verified = match version {
            SignatureVersion::V1 => {
                VerifyingKey::<Sha1>::new(key).verify(canonical.as_bytes(), &signature)
            }
            SignatureVersion::V2 => {
                VerifyingKey::<Sha256>::new(key).verify(canonical.as_bytes(), &signature)
            }
        };
        verified.map_err(VerificationError::Signature)
    }

    fn ensure_trusted(&self, url: &Url) -> Result<(), VerificationError> {
        let Some(pattern) = &self.cert_host else {
            return Ok(());
        };
        let trusted = url.scheme() == "https"
            && url
                .host_str()
                .map(|host| pattern.is_match(host))
                .unwrap_or(false);
        if trusted {
            Ok(())
        } else {
            Err(VerificationError::UntrustedCertificateUrl(url.to_string()))
        }
    }

    async fn public_key(&self, url: &Url) -> Result<RsaPublicKey, VerificationError> {
        let cached = self.lock_cache().get(url.as_str());
        if let Some(key) = cached {
            return Ok(key);
        }

        let pem = self.http.get(url).await?;
        let key = public_key_from_pem(&pem, SystemTime::now())?;
        debug!(stage = "signature", cert_url = %url, "signing certificate cached");
        self.lock_cache().insert(url.as_str(), key.clone());
        Ok(key)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, CertificateCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Extracts the RSA key of a PEM certificate valid at `now`.
pub fn public_key_from_pem(pem: &str, now: SystemTime) -> Result<RsaPublicKey, VerificationError> {
    let certificate =
        Certificate::from_pem(pem.trim().as_bytes()).map_err(VerificationError::Certificate)?;

    let validity = &certificate.tbs_certificate.validity;
    if now < validity.not_before.to_system_time() || now > validity.not_after.to_system_time() {
        return Err(VerificationError::CertificateNotValid);
    }

    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(VerificationError::Certificate)?;
    RsaPublicKey::from_public_key_der(&spki).map_err(VerificationError::PublicKey)
}

/// Signing keys by certificate URL. Entries are never replaced; the oldest
/// entry is evicted once `capacity` is reached.
struct CertificateCache {
    capacity: usize,
    keys: HashMap<String, RsaPublicKey>,
    order: VecDeque<String>,
}

impl CertificateCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, url: &str) -> Option<RsaPublicKey> {
        self.keys.get(url).cloned()
    }

    fn insert(&mut self, url: &str, key: RsaPublicKey) {
        if self.keys.contains_key(url) {
            return;
        }
        while self.keys.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
        }
        self.keys.insert(url.to_string(), key);
        self.order.push_back(url.to_string());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.len()
    }
}
