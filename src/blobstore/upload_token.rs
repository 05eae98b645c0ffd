//! The `_state` query-string token (§4.3): an HMAC-SHA256-signed,
//! base64url-encoded capsule binding an upload session to the repository
//! and offset it was issued for, so a resumed PATCH/PUT can be verified
//! without a server-side session table surviving client retries across
//! process restarts.
//!
//! Paired with the teacher's existing `sha2` dependency the same way the
//! teacher pairs `jsonwebtoken` with its own secret for JWTs (`utils/jwt.rs`);
//! here the payload is registry-internal so a minimal HMAC does the job
//! instead of a full JWT stack.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::OciError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    pub name: String,
    pub uuid: String,
    pub offset: u64,
    pub started_at: i64,
}

/// Signs `state` and returns the opaque token to embed as `_state=`.
pub fn sign(secret: &[u8], state: &UploadState) -> String {
    let payload = serde_json::to_vec(state).expect("UploadState always serializes");
    let mac = compute_mac(secret, &payload);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(mac)
    )
}

/// Verifies `token`'s HMAC and returns the decoded state on success.
pub fn verify(secret: &[u8], token: &str) -> Result<UploadState, OciError> {
    let invalid = || OciError::BlobUploadInvalid("invalid or tampered upload state token".into());

    let (payload_b64, mac_b64) = token.split_once('.').ok_or_else(invalid)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| invalid())?;
    let given_mac = URL_SAFE_NO_PAD.decode(mac_b64).map_err(|_| invalid())?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&payload);
    mac.verify_slice(&given_mac).map_err(|_| invalid())?;

    serde_json::from_slice(&payload).map_err(|_| invalid())
}

fn compute_mac(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Cross-checks a freshly-verified token against the URL path and the
/// session's persisted offset, per §4.3's four-point check on every
/// resume: HMAC validity (already done by `verify`), repository match,
/// uuid match, and offset match.
pub fn check_resume(
    state: &UploadState,
    expected_name: &str,
    expected_uuid: &str,
    persisted_offset: u64,
) -> Result<(), OciError> {
    if state.name != expected_name || state.uuid != expected_uuid || state.offset != persisted_offset {
        return Err(OciError::BlobUploadInvalid(
            "upload state token does not match this session".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Vec<u8> {
        b"test-secret-test-secret-test-se".to_vec()
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let state = UploadState {
            name: "foo/bar".into(),
            uuid: "abc-123".into(),
            offset: 42,
            started_at: 1000,
        };
        let token = sign(&secret(), &state);
        let decoded = verify(&secret(), &token).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let state = UploadState {
            name: "foo/bar".into(),
            uuid: "abc-123".into(),
            offset: 42,
            started_at: 1000,
        };
        let token = sign(&secret(), &state);
        let mut tampered = token.clone();
        tampered.replace_range(0..1, if tampered.starts_with('A') { "B" } else { "A" });
        assert!(verify(&secret(), &tampered).is_err());
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let state = UploadState {
            name: "foo/bar".into(),
            uuid: "abc-123".into(),
            offset: 0,
            started_at: 1000,
        };
        let token = sign(&secret(), &state);
        assert!(verify(b"a-completely-different-secret!!", &token).is_err());
    }

    #[test]
    fn check_resume_rejects_offset_mismatch() {
        let state = UploadState {
            name: "foo/bar".into(),
            uuid: "abc-123".into(),
            offset: 10,
            started_at: 1000,
        };
        assert!(check_resume(&state, "foo/bar", "abc-123", 99).is_err());
    }

    #[test]
    fn check_resume_rejects_uuid_mismatch() {
        let state = UploadState {
            name: "foo/bar".into(),
            uuid: "abc-123".into(),
            offset: 10,
            started_at: 1000,
        };
        assert!(check_resume(&state, "foo/bar", "other-uuid", 10).is_err());
    }

    #[test]
    fn check_resume_accepts_matching_state() {
        let state = UploadState {
            name: "foo/bar".into(),
            uuid: "abc-123".into(),
            offset: 10,
            started_at: 1000,
        };
        assert!(check_resume(&state, "foo/bar", "abc-123", 10).is_ok());
    }
}
