//! Read-only view over the transaction creator's identity.
//!
//! The shim relays the serialized credential without interpreting it;
//! certificate parsing belongs to an external collaborator. What this type
//! adds over the raw [`SerializedCreator`] is a stable, comparable id
//! string derived from the credential, so chaincode can key access
//! decisions without touching the raw bytes.

use sha2::{Digest, Sha256};

use crate::error::ShimError;
use crate::stub::ChaincodeStub;
use crate::types::SerializedCreator;

/// Identity of the client that created the transaction proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    creator: SerializedCreator,
}

impl ClientIdentity {
    /// Build from a transaction context.
    ///
    /// # Errors
    /// Fails with [`ShimError::InvalidArgument`] when the transaction
    /// carries no signed proposal (and therefore no creator).
    pub fn new(stub: &ChaincodeStub) -> Result<Self, ShimError> {
        let creator = stub.get_creator().ok_or_else(|| {
            ShimError::invalid_argument("transaction carries no creator identity")
        })?;
        Ok(Self {
            creator: creator.clone(),
        })
    }

    /// MSP the creator belongs to.
    #[must_use]
    pub fn mspid(&self) -> &str {
        &self.creator.mspid
    }

    /// Raw serialized credential, typically a PEM certificate.
    #[must_use]
    pub fn id_bytes(&self) -> &[u8] {
        &self.creator.id_bytes
    }

    /// Stable id for this identity: hex-encoded SHA-256 over the MSP id
    /// and the credential bytes. Equal for equal credentials, opaque
    /// otherwise.
    #[must_use]
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.creator.mspid.as_bytes());
        hasher.update(&self.creator.id_bytes);
        hex::encode(hasher.finalize())
    }

    /// Whether the creator belongs to `mspid`.
    #[must_use]
    pub fn assert_mspid(&self, mspid: &str) -> bool {
        self.creator.mspid == mspid
    }
}
