//! Repository name / reference validation (§4.1). A "reference" path
//! segment resolves to either a tag or a digest; handlers dispatch on
//! which it is before doing anything else.

use std::sync::LazyLock;

use regex::Regex;

use super::digest::Digest;

// Each slash-separated path component: lowercase alphanumerics, optionally
// punctuated by single `.`, `_`, `__` or runs of `-`.
static NAME_COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*$").unwrap());

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

pub fn is_valid_repository_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.split('/').all(|seg| NAME_COMPONENT_RE.is_match(seg))
}

pub fn is_valid_tag(tag: &str) -> bool {
    TAG_RE.is_match(tag)
}

/// A `{reference}` path segment: either a mutable tag name or an immutable
/// digest. `GET`/`HEAD` of manifests and blobs dispatch identically
/// regardless of which form was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    /// A reference string is a digest if it parses as one; any other
    /// syntactically valid string is treated as a tag. This mirrors the
    /// real-world rule that digests are the only references containing
    /// a colon, since tag names may not.
    pub fn parse(raw: &str) -> Option<Reference> {
        if raw.contains(':') {
            return raw.parse::<Digest>().ok().map(Reference::Digest);
        }
        if is_valid_tag(raw) {
            return Some(Reference::Tag(raw.to_string()));
        }
        None
    }

    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Reference::Digest(d) => Some(d),
            Reference::Tag(_) => None,
        }
    }

    pub fn as_tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(t) => Some(t),
            Reference::Digest(_) => None,
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Tag(t) => f.write_str(t),
            Reference::Digest(d) => write!(f, "{d}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_multi_segment_names() {
        assert!(is_valid_repository_name("foo/bar"));
        assert!(is_valid_repository_name("foo/bar-baz/qux_1.2"));
    }

    #[test]
    fn rejects_uppercase_or_empty_segments() {
        assert!(!is_valid_repository_name("Foo/bar"));
        assert!(!is_valid_repository_name("foo//bar"));
        assert!(!is_valid_repository_name(""));
    }

    #[test]
    fn reference_parse_prefers_digest_when_colon_present() {
        let r = Reference::parse(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert!(matches!(r, Reference::Digest(_)));
    }

    #[test]
    fn reference_parse_falls_back_to_tag() {
        let r = Reference::parse("latest").unwrap();
        assert_eq!(r, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn reference_parse_rejects_malformed_digest_with_colon() {
        assert!(Reference::parse("sha256:nothex").is_none());
    }
}
