/// Handshake envelope and its line codec.
///
/// Each envelope travels as one JSON object terminated by `\n`. The
/// `checksum` field only ever covers the payload, through a canonical
/// string that always lists all six payload fields in a fixed order
/// (absent fields become `""`), so every step hashes the same shape.
///
/// Steps 1 and 2 carry `HMAC(CHECKSUM_KEY, canonical)`. Steps 3 and 4
/// carry the sender's RSA signature over that same HMAC digest.
use peersync_crypto::{
    hmac_sha256, rsa_verify, verify_hmac_sha256, RsaKeyPair, RsaPublicKey, HMAC_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// Fixed key of the first-layer checksum. Guards against corruption only.
pub const CHECKSUM_KEY: &[u8] = b"peersync-envelope";

/// Versioned, checksummed handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub step: u32,
    pub payload: Payload,
    #[serde(with = "b64")]
    pub checksum: Vec<u8>,
}

/// Step-dependent handshake fields. Only the fields a step uses are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Step 1: initiator's public key (base64 SPKI DER).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_public_key: Option<String>,
    /// Step 1: initiator nonce, in the clear.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub nonce_a: Option<Vec<u8>>,
    /// Step 2: responder's public key (base64 SPKI DER).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_public_key: Option<String>,
    /// Step 2: responder nonce, RSA-encrypted to the initiator.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub nonce_b_encrypted: Option<Vec<u8>>,
    /// Step 3: pre-master secret, RSA-encrypted to the responder.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub pre_master_encrypted: Option<Vec<u8>>,
    /// Steps 1-2: password HMAC over the sender's public key.
    /// Steps 3-4: AES-encrypted confirmation string.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub another_info: Option<Vec<u8>>,
}

/// Digest input shape: every field present, fixed order.
#[derive(Serialize)]
struct CanonicalPayload<'a> {
    initiator_public_key: &'a str,
    nonce_a: String,
    responder_public_key: &'a str,
    nonce_b_encrypted: String,
    pre_master_encrypted: String,
    another_info: String,
}

impl Payload {
    /// Canonical string fed to the checksum.
    pub fn canonical_string(&self) -> Result<String> {
        let canonical = CanonicalPayload {
            initiator_public_key: self.initiator_public_key.as_deref().unwrap_or(""),
            nonce_a: b64::encode_opt(&self.nonce_a),
            responder_public_key: self.responder_public_key.as_deref().unwrap_or(""),
            nonce_b_encrypted: b64::encode_opt(&self.nonce_b_encrypted),
            pre_master_encrypted: b64::encode_opt(&self.pre_master_encrypted),
            another_info: b64::encode_opt(&self.another_info),
        };
        serde_json::to_string(&canonical).map_err(|e| TransferError::Malformed(e.to_string()))
    }

    /// First-layer digest: HMAC(CHECKSUM_KEY, canonical string).
    pub fn digest(&self) -> Result<[u8; HMAC_SIZE]> {
        Ok(hmac_sha256(CHECKSUM_KEY, self.canonical_string()?.as_bytes())?)
    }
}

impl Envelope {
    /// Envelope whose checksum is the plain payload digest (steps 1-2).
    pub fn sealed(version: &str, step: u32, payload: Payload) -> Result<Self> {
        let checksum = payload.digest()?.to_vec();
        Ok(Self { version: version.to_string(), step, payload, checksum })
    }

    /// Envelope whose checksum is the signed payload digest (steps 3-4).
    pub fn signed(version: &str, step: u32, payload: Payload, keys: &RsaKeyPair) -> Result<Self> {
        let checksum = keys.sign(&payload.digest()?)?;
        Ok(Self { version: version.to_string(), step, payload, checksum })
    }

    /// Check a step 1-2 checksum.
    pub fn verify_digest(&self) -> Result<bool> {
        let canonical = self.payload.canonical_string()?;
        Ok(verify_hmac_sha256(CHECKSUM_KEY, canonical.as_bytes(), &self.checksum)?)
    }

    /// Check a step 3-4 signature against the recomputed digest.
    pub fn verify_signature(&self, signer: &RsaPublicKey) -> Result<bool> {
        Ok(rsa_verify(&self.payload.digest()?, &self.checksum, signer))
    }

    /// Serialize as one newline-terminated line.
    pub fn encode_line(&self) -> Result<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| TransferError::Malformed(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
            .map_err(|e| TransferError::Malformed(e.to_string()))
    }
}

mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode_opt(bytes: &Option<Vec<u8>>) -> String {
        bytes.as_ref().map(|b| BASE64.encode(b)).unwrap_or_default()
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
