//! Manifest media-type fan-out (§4.4, §9 Design Notes). A tagged variant
//! plus a parser/validator per variant; legacy schema1 is recognized only
//! far enough to be rejected with a precise error.
//!
//! Body modeling follows the teacher's `service/manifest.rs`
//! (`oci_spec::image::ImageManifest`, deserialized directly off the
//! request bytes) generalized from one manifest type to the full
//! schema2/OCI-manifest/manifest-list/OCI-index set: image manifests parse
//! as `oci_spec::image::ImageManifest`, manifest lists and OCI indexes as
//! `oci_spec::image::ImageIndex`, since the Docker schema2 list and the OCI
//! index share the same `manifests[]`-of-`Descriptor` shape the crate
//! already models. `ManifestKind` itself has no `oci-spec` counterpart —
//! the crate only distinguishes OCI media types, not the wire-level
//! Docker-vs-OCI, manifest-vs-index fan-out this registry's content
//! negotiation needs — so it stays a small domain enum here.

use oci_spec::image::{ImageIndex, ImageManifest};

use crate::error::OciError;

pub const MT_SCHEMA2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MT_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MT_SCHEMA2_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MT_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MT_SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MT_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// Maximum accepted manifest request body, per §4.4.
pub const MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Schema2,
    Oci,
    ManifestList,
    OciIndex,
}

impl ManifestKind {
    pub fn is_index(self) -> bool {
        matches!(self, ManifestKind::ManifestList | ManifestKind::OciIndex)
    }

    pub fn from_media_type(media_type: &str) -> Result<ManifestKind, OciError> {
        match media_type {
            MT_SCHEMA2_MANIFEST => Ok(ManifestKind::Schema2),
            MT_OCI_MANIFEST => Ok(ManifestKind::Oci),
            MT_SCHEMA2_MANIFEST_LIST => Ok(ManifestKind::ManifestList),
            MT_OCI_INDEX => Ok(ManifestKind::OciIndex),
            MT_SCHEMA1 | MT_SCHEMA1_SIGNED => Err(OciError::ManifestInvalid(
                "Schema 1 manifest not supported".to_string(),
            )),
            other => Err(OciError::ManifestInvalid(format!(
                "unrecognized manifest media type: {other}"
            ))),
        }
    }

    pub fn as_media_type(self) -> &'static str {
        match self {
            ManifestKind::Schema2 => MT_SCHEMA2_MANIFEST,
            ManifestKind::Oci => MT_OCI_MANIFEST,
            ManifestKind::ManifestList => MT_SCHEMA2_MANIFEST_LIST,
            ManifestKind::OciIndex => MT_OCI_INDEX,
        }
    }
}

/// Image manifest (schema2 or OCI) together with the wire kind it was
/// declared as, or a manifest list / OCI index together with its wire
/// kind. Bodies are `oci-spec`'s own types, deserialized straight off the
/// request bytes rather than re-modeled by hand.
pub enum ParsedManifest {
    Image {
        kind: ManifestKind,
        body: ImageManifest,
    },
    Index {
        kind: ManifestKind,
        body: ImageIndex,
    },
}

/// Parses and minimally validates `bytes` as the manifest kind declared by
/// `declared_media_type` (normally the request's `Content-Type`, falling
/// back to the body's own `mediaType` field when absent — some old
/// clients omit the header).
pub fn parse_manifest(
    declared_media_type: Option<&str>,
    bytes: &[u8],
) -> Result<ParsedManifest, OciError> {
    if bytes.len() > MAX_MANIFEST_BYTES {
        return Err(OciError::ManifestInvalid(format!(
            "manifest exceeds {MAX_MANIFEST_BYTES} byte limit"
        )));
    }

    let sniffed: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| OciError::ManifestInvalid(format!("invalid JSON: {e}")))?;
    let body_media_type = sniffed
        .get("mediaType")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let media_type = declared_media_type
        .map(str::to_string)
        .or(body_media_type)
        .ok_or_else(|| {
            OciError::ManifestInvalid("manifest has no mediaType and none was declared".into())
        })?;

    let kind = ManifestKind::from_media_type(&media_type)?;

    match kind {
        ManifestKind::Schema2 | ManifestKind::Oci => {
            let body: ImageManifest = serde_json::from_slice(bytes)
                .map_err(|e| OciError::ManifestInvalid(format!("invalid image manifest: {e}")))?;
            Ok(ParsedManifest::Image { kind, body })
        }
        ManifestKind::ManifestList | ManifestKind::OciIndex => {
            let body: ImageIndex = serde_json::from_slice(bytes)
                .map_err(|e| OciError::ManifestInvalid(format!("invalid manifest list: {e}")))?;
            Ok(ParsedManifest::Index { kind, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const DIGEST_C: &str = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    #[test]
    fn schema1_is_rejected() {
        let err = ManifestKind::from_media_type(MT_SCHEMA1).unwrap_err();
        assert!(matches!(err, OciError::ManifestInvalid(_)));
    }

    #[test]
    fn parses_schema2_image_manifest() {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MT_SCHEMA2_MANIFEST,
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": DIGEST_A, "size": 10},
            "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": DIGEST_B, "size": 20}]
        });
        let parsed = parse_manifest(Some(MT_SCHEMA2_MANIFEST), body.to_string().as_bytes()).unwrap();
        match parsed {
            ParsedManifest::Image { kind, body } => {
                assert_eq!(kind, ManifestKind::Schema2);
                assert_eq!(body.layers().len(), 1);
            }
            _ => panic!("expected image manifest"),
        }
    }

    #[test]
    fn parses_manifest_list_with_platform() {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MT_SCHEMA2_MANIFEST_LIST,
            "manifests": [{
                "mediaType": MT_SCHEMA2_MANIFEST,
                "digest": DIGEST_C,
                "size": 30,
                "platform": {"architecture": "amd64", "os": "linux"}
            }]
        });
        let parsed =
            parse_manifest(Some(MT_SCHEMA2_MANIFEST_LIST), body.to_string().as_bytes()).unwrap();
        match parsed {
            ParsedManifest::Index { kind, body } => {
                assert_eq!(kind, ManifestKind::ManifestList);
                let platform = body.manifests()[0].platform().as_ref().unwrap();
                assert_eq!(platform.os().to_string(), "linux");
            }
            _ => panic!("expected index"),
        }
    }

    #[test]
    fn rejects_oversized_manifest() {
        let huge = vec![b' '; MAX_MANIFEST_BYTES + 1];
        assert!(parse_manifest(Some(MT_SCHEMA2_MANIFEST), &huge).is_err());
    }

    #[test]
    fn falls_back_to_body_media_type_when_header_absent() {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MT_OCI_MANIFEST,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": DIGEST_A, "size": 1},
            "layers": []
        });
        let parsed = parse_manifest(None, body.to_string().as_bytes()).unwrap();
        assert!(matches!(parsed, ParsedManifest::Image { kind: ManifestKind::Oci, .. }));
    }
}
