//! Integrity and provenance gate for model artifacts.
//!
//! [`ArtifactTrustVerifier`] combines three checks before a model file may be
//! handed to an inference engine: a SHA-256 digest pinned on first use, an
//! optional detached Ed25519 signature, and a domain/publisher allow-list.
//! Only a digest mismatch (or a missing file) blocks loading; the other two
//! checks report warnings and leave escalation to the caller.

pub mod checksum;
pub mod error;
pub mod signature;
pub mod sources;
pub mod verifier;

pub use checksum::{checksum_async, hash_file, ChecksumCheck, ImportSummary, ModelChecksumRecord};
pub use error::{Result, TrustError};
pub use signature::{
    detect_signature_verifier, Ed25519Verifier, SignatureStatus, SignatureVerifier,
    UnavailableVerifier,
};
pub use sources::TrustedSource;
pub use verifier::{ArtifactTrustVerifier, ValidationResult};
