//! Secret custody for the Warden desktop assistant.
//!
//! The crate is organised leaves first: [`encryption::EncryptionService`] owns
//! the active data key, [`credential::CredentialManager`] owns the session and
//! decides when that key exists, and [`store::SecretStore`] plus
//! [`vault::SecretVault`] persist ciphertext produced under it.

pub mod credential;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod fsutil;
pub mod paths;
pub mod settings;
pub mod store;
pub mod vault;

pub use credential::{CredentialManager, CredentialState, SessionInfo};
pub use encryption::EncryptionService;
pub use error::{CoreError, Result};
pub use settings::WardenSettings;
pub use store::SecretStore;
pub use vault::SecretVault;
