//! Library surface for the registry core, split out from `main.rs` so the
//! HTTP surface and its capability set (`AppState`, `MetadataStore`,
//! `BlobStore`) are reusable from integration tests without spawning a
//! real process. The teacher's `distribution` crate is binary-only; this
//! crate adds the library target the other example repos in the pack
//! (`Evoker-Industries-Rune`, `juliusl-lifec_registry`) already carry
//! alongside their binaries, purely for this reason.

pub mod api;
pub mod blobstore;
pub mod config;
pub mod domain;
pub mod error;
pub mod gc;
pub mod metadata;
pub mod metrics;
pub mod router;
pub mod state;
