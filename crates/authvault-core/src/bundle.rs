//! Credential bundle model.
//!
//! A bundle is opaque to the server: the client encrypts its credentials
//! locally and uploads the IV, the ciphertext and a lookup key derived from
//! the user's identifier. Nothing here inspects the contents.

use serde::{Deserialize, Serialize};

use crate::error::AccessError;

pub const FIELD_IV: &str = "iv";
pub const FIELD_CIPHER_TEXT: &str = "cipherText";
pub const FIELD_LOOKUP_KEY: &str = "lookupKey";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub iv: String,
    pub cipher_text: String,
    pub lookup_key: String,
}

/// Bundle fields exactly as received from a caller, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBundle {
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub cipher_text: Option<String>,
    #[serde(default)]
    pub lookup_key: Option<String>,
}

impl NewBundle {
    pub fn new(
        iv: impl Into<String>,
        cipher_text: impl Into<String>,
        lookup_key: impl Into<String>,
    ) -> Self {
        Self {
            iv: Some(iv.into()),
            cipher_text: Some(cipher_text.into()),
            lookup_key: Some(lookup_key.into()),
        }
    }

    /// Returns the complete bundle, or every absent or empty field by wire name.
    pub fn validate(self) -> Result<CredentialBundle, AccessError> {
        let mut missing = Vec::new();
        if is_blank(&self.iv) {
            missing.push(FIELD_IV);
        }
        if is_blank(&self.cipher_text) {
            missing.push(FIELD_CIPHER_TEXT);
        }
        if is_blank(&self.lookup_key) {
            missing.push(FIELD_LOOKUP_KEY);
        }
        match (self.iv, self.cipher_text, self.lookup_key) {
            (Some(iv), Some(cipher_text), Some(lookup_key)) if missing.is_empty() => {
                Ok(CredentialBundle {
                    iv,
                    cipher_text,
                    lookup_key,
                })
            }
            _ => Err(AccessError::MissingFields { fields: missing }),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}
