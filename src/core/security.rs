// src/core/security.rs

//! Security collaborator interfaces, the shared key storage, and a built-in
//! HMAC-SHA256 signing policy.

use crate::core::errors::PubSubError;
use crate::core::message::NetworkMessage;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Per-group security state created by a [`SecurityPolicy`]. Holds the
/// active key material; updated in place on key rotation.
pub trait PolicyContext: Send {
    fn set_keys(
        &mut self,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> Result<(), PubSubError>;

    /// Verifies (and, when the policy encrypts, decrypts) a received buffer.
    /// Called between header and payload decoding.
    fn verify_and_decrypt(
        &self,
        buffer: &Bytes,
        nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError>;
}

/// A message-security policy, supplied per group configuration.
pub trait SecurityPolicy: Send + Sync {
    fn uri(&self) -> &str;

    fn new_context(
        &self,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> Result<Box<dyn PolicyContext>, PubSubError>;
}

impl fmt::Debug for dyn SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityPolicy({})", self.uri())
    }
}

/// One generation of keys held by a [`KeyStorage`].
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMaterial {
    pub security_token_id: u32,
    pub signing_key: Bytes,
    pub encrypting_key: Bytes,
    pub key_nonce: Bytes,
}

/// Shared, reference-counted repository of security keys for one security
/// group. Groups using the same `security_group_id` share one storage; the
/// manager destroys it when the last group detaches.
#[derive(Debug, Clone)]
pub struct KeyStorage {
    pub security_group_id: String,
    pub policy_uri: String,
    pub reference_count: usize,
    keys: Vec<KeyMaterial>,
    current_token_id: Option<u32>,
}

impl KeyStorage {
    pub fn new(security_group_id: impl Into<String>, policy_uri: impl Into<String>) -> Self {
        Self {
            security_group_id: security_group_id.into(),
            policy_uri: policy_uri.into(),
            reference_count: 0,
            keys: Vec::new(),
            current_token_id: None,
        }
    }

    /// Adds a key generation. The first key pushed becomes current.
    pub fn push_key(&mut self, material: KeyMaterial) {
        if self.current_token_id.is_none() {
            self.current_token_id = Some(material.security_token_id);
        }
        self.keys.push(material);
    }

    /// Makes the key with `security_token_id` the current one.
    pub fn set_current(&mut self, security_token_id: u32) -> Result<(), PubSubError> {
        if self
            .keys
            .iter()
            .any(|k| k.security_token_id == security_token_id)
        {
            self.current_token_id = Some(security_token_id);
            Ok(())
        } else {
            Err(PubSubError::NotFound)
        }
    }

    pub fn current_key(&self) -> Option<&KeyMaterial> {
        let token = self.current_token_id?;
        self.keys.iter().find(|k| k.security_token_id == token)
    }
}

/// Reference signing-only policy: HMAC-SHA256 over the message body with the
/// signature appended as the final 32 bytes of the buffer. No encryption.
#[derive(Debug, Default)]
pub struct Sha256SigningPolicy;

impl Sha256SigningPolicy {
    pub const URI: &'static str = "https://ferrobus.dev/security/hmac-sha256-sign";

    const SIGNATURE_LEN: usize = 32;

    /// Signs `body` and returns the signature to append.
    pub fn sign(signing_key: &[u8], body: &[u8]) -> Result<Bytes, PubSubError> {
        let mut mac = HmacSha256::new_from_slice(signing_key)
            .map_err(|e| PubSubError::Security(format!("invalid signing key: {e}")))?;
        mac.update(body);
        Ok(Bytes::copy_from_slice(&mac.finalize().into_bytes()))
    }
}

impl SecurityPolicy for Sha256SigningPolicy {
    fn uri(&self) -> &str {
        Self::URI
    }

    fn new_context(
        &self,
        signing_key: &[u8],
        _encrypting_key: &[u8],
        _key_nonce: &[u8],
    ) -> Result<Box<dyn PolicyContext>, PubSubError> {
        if signing_key.is_empty() {
            return Err(PubSubError::Security("empty signing key".to_string()));
        }
        Ok(Box::new(Sha256SigningContext {
            signing_key: signing_key.to_vec(),
        }))
    }
}

struct Sha256SigningContext {
    signing_key: Vec<u8>,
}

impl PolicyContext for Sha256SigningContext {
    fn set_keys(
        &mut self,
        signing_key: &[u8],
        _encrypting_key: &[u8],
        _key_nonce: &[u8],
    ) -> Result<(), PubSubError> {
        if signing_key.is_empty() {
            return Err(PubSubError::Security("empty signing key".to_string()));
        }
        self.signing_key = signing_key.to_vec();
        Ok(())
    }

    fn verify_and_decrypt(
        &self,
        buffer: &Bytes,
        _nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError> {
        if buffer.len() < Sha256SigningPolicy::SIGNATURE_LEN {
            return Err(PubSubError::Security(
                "buffer too short for signature".to_string(),
            ));
        }
        let (body, signature) = buffer.split_at(buffer.len() - Sha256SigningPolicy::SIGNATURE_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| PubSubError::Security(format!("invalid signing key: {e}")))?;
        mac.update(body);
        mac.verify_slice(signature)
            .map_err(|_| PubSubError::Security("signature verification failed".to_string()))
    }
}
