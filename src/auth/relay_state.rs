//! Signed RelayState codec.
//!
//! The RelayState carries the flow context (connection, AuthnRequest ID,
//! return URL) through the IdP round trip. It is signed, not encrypted: the
//! payload is not secret, but every downstream decision is taken from it, so
//! it must be tamper-evident.
//!
//! Wire format: `base64url(payload) "." base64url(HMAC-SHA256(key, base64url(payload)))`,
//! unpadded. The MAC covers the encoded payload segment, so any change to the
//! token text that keeps its shape is reported as [`StateError::Invalid`].

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::StateConfig;

type HmacSha256 = Hmac<Sha256>;

/// Tokens longer than this are rejected before any decoding work.
const MAX_TOKEN_LEN: usize = 8 * 1024;

/// Flow context round-tripped through the IdP.
///
/// Field order is the serialization order and part of the signed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    pub connection_id: String,
    pub request_id: String,
    pub return_url: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub nonce: String,
}

impl RelayState {
    /// Build a state with a fresh random nonce. `created_at` is truncated to
    /// whole seconds, the precision of the wire form.
    pub fn new(
        connection_id: impl Into<String>,
        request_id: impl Into<String>,
        return_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let nonce: [u8; 16] = rand::thread_rng().r#gen();
        Self {
            connection_id: connection_id.into(),
            request_id: request_id.into(),
            return_url: return_url.into(),
            created_at: DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now),
            nonce: hex::encode(nonce),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("malformed relay state: {0}")]
    Malformed(&'static str),

    #[error("relay state signature does not verify")]
    Invalid,

    #[error("relay state expired")]
    Expired,

    #[error("no relay state signing key configured")]
    NoSigningKey,
}

impl StateError {
    pub fn kind(&self) -> &'static str {
        match self {
            StateError::Malformed(_) => "MalformedState",
            StateError::Invalid | StateError::NoSigningKey => "InvalidState",
            StateError::Expired => "ExpiredState",
        }
    }
}

/// HMAC codec for [`RelayState`] with key rotation.
///
/// The first key signs. Every key verifies, so a retired key stays in the
/// list until flows signed with it have expired.
#[derive(Clone)]
pub struct RelayStateCodec {
    keys: Vec<Vec<u8>>,
    ttl: Duration,
    future_skew: Duration,
}

impl std::fmt::Debug for RelayStateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStateCodec")
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RelayStateCodec {
    pub fn new(keys: Vec<Vec<u8>>, ttl: Duration, future_skew: Duration) -> Result<Self, StateError> {
        if keys.is_empty() || keys.iter().any(Vec::is_empty) {
            return Err(StateError::NoSigningKey);
        }
        Ok(Self {
            keys,
            ttl,
            future_skew,
        })
    }

    pub fn from_config(config: &StateConfig, clock_skew: Duration) -> Result<Self, StateError> {
        Self::new(
            config.keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
            config.ttl(),
            clock_skew,
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn encode(&self, state: &RelayState) -> Result<String, StateError> {
        let payload =
            serde_json::to_vec(state).map_err(|_| StateError::Malformed("unserializable payload"))?;
        let payload_segment = URL_SAFE_NO_PAD.encode(payload);

        let mut mac = mac_for(self.keys.first().ok_or(StateError::NoSigningKey)?)?;
        mac.update(payload_segment.as_bytes());
        let tag = mac.finalize().into_bytes();

        Ok(format!("{}.{}", payload_segment, URL_SAFE_NO_PAD.encode(tag)))
    }

    pub fn decode(&self, token: &str) -> Result<RelayState, StateError> {
        self.decode_at(token, Utc::now())
    }

    /// Decode and verify against an explicit clock.
    pub fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<RelayState, StateError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(StateError::Malformed("bad length"));
        }
        let (payload_segment, tag_segment) = token
            .split_once('.')
            .ok_or(StateError::Malformed("missing separator"))?;
        if payload_segment.is_empty() || tag_segment.is_empty() {
            return Err(StateError::Malformed("empty segment"));
        }

        // An undecodable tag cannot match any key.
        let tag = URL_SAFE_NO_PAD
            .decode(tag_segment)
            .map_err(|_| StateError::Invalid)?;

        let mut verified = false;
        for key in &self.keys {
            let mut mac = mac_for(key)?;
            mac.update(payload_segment.as_bytes());
            if mac.verify_slice(&tag).is_ok() {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(StateError::Invalid);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_segment)
            .map_err(|_| StateError::Malformed("payload is not base64url"))?;
        let state: RelayState = serde_json::from_slice(&payload)
            .map_err(|_| StateError::Malformed("payload is not a relay state"))?;

        if now - state.created_at > self.ttl {
            return Err(StateError::Expired);
        }
        if state.created_at - now > self.future_skew {
            return Err(StateError::Expired);
        }

        Ok(state)
    }
}

fn mac_for(key: &[u8]) -> Result<HmacSha256, StateError> {
    HmacSha256::new_from_slice(key).map_err(|_| StateError::NoSigningKey)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const KEY_A: &[u8] = b"relay-state-key-a-0123456789abcdef";
    const KEY_B: &[u8] = b"relay-state-key-b-0123456789abcdef";

    fn codec(keys: &[&[u8]]) -> RelayStateCodec {
        RelayStateCodec::new(
            keys.iter().map(|k| k.to_vec()).collect(),
            Duration::minutes(10),
            Duration::minutes(2),
        )
        .unwrap()
    }

    fn sample_state(now: DateTime<Utc>) -> RelayState {
        RelayState::new(
            "conn-1",
            "id-6f1c2d3e4a5b",
            "https://app.example/cb?tab=home",
            now,
        )
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec(&[KEY_A]);
        let now = Utc::now();
        let state = sample_state(now);

        let token = codec.encode(&state).unwrap();
        assert_eq!(codec.decode_at(&token, now).unwrap(), state);
    }

    #[test]
    fn test_token_is_url_safe() {
        let codec = codec(&[KEY_A]);
        let token = codec.encode(&sample_state(Utc::now())).unwrap();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        );
    }

    #[test]
    fn test_nonce_is_random() {
        let now = Utc::now();
        assert_ne!(sample_state(now).nonce, sample_state(now).nonce);
        assert_eq!(sample_state(now).nonce.len(), 32);
    }

    #[test]
    fn test_every_payload_byte_is_protected() {
        let codec = codec(&[KEY_A]);
        let now = Utc::now();
        let token = codec.encode(&sample_state(now)).unwrap();
        let (payload_segment, tag_segment) = token.split_once('.').unwrap();
        let payload = URL_SAFE_NO_PAD.decode(payload_segment).unwrap();

        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&tampered), tag_segment);
            assert_eq!(
                codec.decode_at(&forged, now),
                Err(StateError::Invalid),
                "payload byte {i} not protected"
            );
        }
    }

    #[test]
    fn test_every_tag_byte_is_protected() {
        let codec = codec(&[KEY_A]);
        let now = Utc::now();
        let token = codec.encode(&sample_state(now)).unwrap();
        let (payload_segment, tag_segment) = token.split_once('.').unwrap();
        let tag = URL_SAFE_NO_PAD.decode(tag_segment).unwrap();

        for i in 0..tag.len() {
            let mut tampered = tag.clone();
            tampered[i] ^= 0x80;
            let forged = format!("{}.{}", payload_segment, URL_SAFE_NO_PAD.encode(&tampered));
            assert_eq!(codec.decode_at(&forged, now), Err(StateError::Invalid));
        }
    }

    #[test]
    fn test_every_token_character_is_protected() {
        let codec = codec(&[KEY_A]);
        let now = Utc::now();
        let token = codec.encode(&sample_state(now)).unwrap();
        let separator = token.find('.').unwrap();

        for (i, c) in token.char_indices() {
            if i == separator {
                continue;
            }
            let replacement = if c == 'A' { 'B' } else { 'A' };
            let mut forged = token.clone();
            forged.replace_range(i..i + 1, &replacement.to_string());
            assert_eq!(
                codec.decode_at(&forged, now),
                Err(StateError::Invalid),
                "character {i} not protected"
            );
        }
    }

    #[rstest]
    #[case::empty("", "bad length")]
    #[case::no_separator("abcdef", "missing separator")]
    #[case::empty_payload(".abcdef", "empty segment")]
    #[case::empty_tag("abcdef.", "empty segment")]
    fn test_malformed(#[case] token: &str, #[case] reason: &'static str) {
        let codec = codec(&[KEY_A]);
        assert_eq!(codec.decode(token), Err(StateError::Malformed(reason)));
    }

    #[test]
    fn test_signed_garbage_payload_is_malformed() {
        let payload_segment = URL_SAFE_NO_PAD.encode(b"{\"not\":\"a state\"}");
        let mut mac = HmacSha256::new_from_slice(KEY_A).unwrap();
        mac.update(payload_segment.as_bytes());
        let token = format!(
            "{}.{}",
            payload_segment,
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        );

        assert!(matches!(
            codec(&[KEY_A]).decode(&token),
            Err(StateError::Malformed(_))
        ));
    }

    #[rstest]
    #[case::fresh(0, true)]
    #[case::just_inside_window(599, true)]
    #[case::at_window(600, true)]
    #[case::just_outside_window(601, false)]
    #[case::long_expired(3600, false)]
    fn test_expiry_window(#[case] age_secs: i64, #[case] accepted: bool) {
        let codec = codec(&[KEY_A]);
        let created = Utc::now();
        let state = sample_state(created);
        let token = codec.encode(&state).unwrap();

        let result = codec.decode_at(&token, state.created_at + Duration::seconds(age_secs));
        if accepted {
            assert_eq!(result.unwrap(), state);
        } else {
            assert_eq!(result, Err(StateError::Expired));
        }
    }

    #[test]
    fn test_future_state_beyond_skew_rejected() {
        let codec = codec(&[KEY_A]);
        let now = Utc::now();
        let token = codec
            .encode(&sample_state(now + Duration::minutes(5)))
            .unwrap();
        assert_eq!(codec.decode_at(&token, now), Err(StateError::Expired));

        let token = codec
            .encode(&sample_state(now + Duration::minutes(1)))
            .unwrap();
        assert!(codec.decode_at(&token, now).is_ok());
    }

    #[test]
    fn test_key_rotation() {
        let now = Utc::now();
        let old = codec(&[KEY_A]);
        let rotated = codec(&[KEY_B, KEY_A]);

        // In-flight state signed with the previous key still verifies
        let in_flight = old.encode(&sample_state(now)).unwrap();
        assert!(rotated.decode_at(&in_flight, now).is_ok());

        // New states are signed with the current key only
        let fresh = rotated.encode(&sample_state(now)).unwrap();
        assert_eq!(old.decode_at(&fresh, now), Err(StateError::Invalid));
        assert!(codec(&[KEY_B]).decode_at(&fresh, now).is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let now = Utc::now();
        let token = codec(&[KEY_A]).encode(&sample_state(now)).unwrap();
        assert_eq!(
            codec(&[KEY_B]).decode_at(&token, now),
            Err(StateError::Invalid)
        );
    }

    #[test]
    fn test_requires_key() {
        assert_eq!(
            RelayStateCodec::new(vec![], Duration::minutes(10), Duration::zero()).unwrap_err(),
            StateError::NoSigningKey
        );
    }

    #[test]
    fn test_encode_without_key_errors() {
        let keyless = RelayStateCodec {
            keys: vec![],
            ttl: Duration::minutes(10),
            future_skew: Duration::zero(),
        };
        assert_eq!(
            keyless.encode(&sample_state(Utc::now())).unwrap_err(),
            StateError::NoSigningKey
        );
    }
}
