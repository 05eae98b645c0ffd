pub mod digest;
pub mod manifest_kind;
pub mod models;
pub mod reference;

pub use digest::{Digest, DigestAlgorithm, DigestVerifier};
pub use manifest_kind::ManifestKind;
pub use reference::Reference;
