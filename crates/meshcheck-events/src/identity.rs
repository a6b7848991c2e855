use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{json, Map, Value};

use crate::canonical::to_canonical_bytes;
use crate::error::EventError;

/// How long a served key document claims to stay valid.
pub const KEY_VALIDITY_MS: i64 = 24 * 60 * 60 * 1000;

/// Name and ed25519 key of one emulated server.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    server_name: String,
    key_id: String,
    signing_key: SigningKey,
}

impl ServerIdentity {
    pub fn new(server_name: impl Into<String>, key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            server_name: server_name.into(),
            key_id: key_id.into(),
            signing_key,
        }
    }

    /// Identity with a freshly generated key.
    pub fn generate(server_name: impl Into<String>, key_id: impl Into<String>) -> Self {
        let seed: [u8; 32] = rand::random();
        Self::new(server_name, key_id, SigningKey::from_bytes(&seed))
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.verifying_key().to_bytes())
    }

    pub fn sign_bytes(&self, payload: &[u8]) -> String {
        STANDARD_NO_PAD.encode(self.signing_key.sign(payload).to_bytes())
    }

    /// Sign a JSON object in place. `signatures` and `unsigned` are excluded
    /// from the signed bytes; existing signatures from other keys are kept.
    pub fn sign_json(&self, value: &mut Value) -> Result<(), EventError> {
        let signature = self.sign_bytes(&signable_bytes(value)?);
        insert_signature(value, &self.server_name, &self.key_id, signature)
    }

    /// The `/_matrix/key/v2/server` document for this identity, self-signed.
    pub fn key_document(&self, now_ms: i64) -> Result<Value, EventError> {
        let mut doc = json!({
            "server_name": self.server_name,
            "valid_until_ts": now_ms + KEY_VALIDITY_MS,
            "verify_keys": {
                self.key_id.clone(): { "key": self.public_key_base64() }
            },
            "old_verify_keys": {},
        });
        self.sign_json(&mut doc)?;
        Ok(doc)
    }

    /// Value for an `Authorization` header on a federation request to
    /// `destination`.
    pub fn request_authorization(
        &self,
        method: &str,
        uri: &str,
        destination: &str,
        content: Option<&Value>,
    ) -> Result<String, EventError> {
        let mut request = json!({
            "method": method,
            "uri": uri,
            "origin": self.server_name,
            "destination": destination,
        });
        if let (Some(content), Some(map)) = (content, request.as_object_mut()) {
            map.insert("content".into(), content.clone());
        }
        let signature = self.sign_bytes(&signable_bytes(&request)?);
        Ok(format!(
            "X-Matrix origin=\"{}\",destination=\"{}\",key=\"{}\",sig=\"{}\"",
            self.server_name, destination, self.key_id, signature
        ))
    }
}

/// Canonical bytes of `value` minus `signatures` and `unsigned`.
pub fn signable_bytes(value: &Value) -> Result<Vec<u8>, EventError> {
    let Some(map) = value.as_object() else {
        return Err(EventError::InvalidEvent("signed value must be an object".into()));
    };
    let mut stripped = map.clone();
    stripped.remove("signatures");
    stripped.remove("unsigned");
    Ok(to_canonical_bytes(&Value::Object(stripped)))
}

pub(crate) fn insert_signature(
    value: &mut Value,
    server_name: &str,
    key_id: &str,
    signature: String,
) -> Result<(), EventError> {
    let Some(map) = value.as_object_mut() else {
        return Err(EventError::InvalidEvent("signed value must be an object".into()));
    };
    let signatures = map
        .entry("signatures")
        .or_insert_with(|| Value::Object(Map::new()));
    if !signatures.is_object() {
        *signatures = Value::Object(Map::new());
    }
    if let Some(servers) = signatures.as_object_mut() {
        let server = servers
            .entry(server_name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !server.is_object() {
            *server = Value::Object(Map::new());
        }
        if let Some(keys) = server.as_object_mut() {
            keys.insert(key_id.to_string(), Value::String(signature));
        }
    }
    Ok(())
}

/// Verify the signature `server_name`/`key_id` carries on `value`.
pub fn verify_json(
    value: &Value,
    server_name: &str,
    key_id: &str,
    key: &VerifyingKey,
) -> Result<(), EventError> {
    let encoded = value
        .pointer(&format!(
            "/signatures/{}/{}",
            escape_pointer(server_name),
            escape_pointer(key_id)
        ))
        .and_then(Value::as_str)
        .ok_or_else(|| EventError::InvalidSignature(format!("no signature by {server_name} {key_id}")))?;
    let bytes = STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|e| EventError::InvalidSignature(format!("bad base64: {e}")))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|e| EventError::InvalidSignature(e.to_string()))?;
    key.verify(&signable_bytes(value)?, &signature)
        .map_err(|e| EventError::InvalidSignature(e.to_string()))
}

/// Decode an unpadded base64 ed25519 public key.
pub fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, EventError> {
    let bytes = STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| EventError::InvalidSignature(format!("bad key base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EventError::InvalidSignature("key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| EventError::InvalidSignature(e.to_string()))
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
