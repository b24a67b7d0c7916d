use std::sync::Arc;

use fixed_hash::construct_fixed_hash;
use impl_serde::impl_fixed_hash_serde;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Epoch, Slot, ValidatorIndex, H256};

construct_fixed_hash! {
    pub struct SignatureBytes(96);
}

impl_fixed_hash_serde!(SignatureBytes, 96);

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: H256,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: u64,
    pub beacon_block_root: H256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct IndexedAttestation {
    pub attesting_indices: Vec<ValidatorIndex>,
    pub data: AttestationData,
    pub signature: SignatureBytes,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: H256,
    pub state_root: H256,
    pub body_root: H256,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    pub signature: SignatureBytes,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AttesterSlashing {
    pub attestation_1: IndexedAttestation,
    pub attestation_2: IndexedAttestation,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProposerSlashing {
    pub signed_header_1: SignedBeaconBlockHeader,
    pub signed_header_2: SignedBeaconBlockHeader,
}

#[derive(Debug, Error)]
pub enum InvalidAttestation {
    #[error("attestation has no attesting indices")]
    NoAttestingIndices,
    #[error("attesting indices are not strictly increasing")]
    UnsortedAttestingIndices,
    #[error("validator index {validator_index} is too large to be recorded")]
    UnstorableValidatorIndex { validator_index: ValidatorIndex },
    #[error("source epoch {source_epoch} is not before target epoch {target_epoch}")]
    SourceNotBeforeTarget {
        source_epoch: Epoch,
        target_epoch: Epoch,
    },
}

#[derive(Debug, Error)]
pub enum InvalidProposal {
    #[error("proposer index {proposer_index} is too large to be recorded")]
    UnstorableProposerIndex { proposer_index: ValidatorIndex },
}

/// An indexed attestation together with the root its signature covers.
///
/// Signature verification and signing root computation happen before attestations reach the
/// slasher.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AttestationRecord {
    pub indexed_attestation: IndexedAttestation,
    pub signing_root: H256,
}

impl AttestationRecord {
    #[must_use]
    pub const fn source(&self) -> Epoch {
        self.indexed_attestation.data.source.epoch
    }

    #[must_use]
    pub const fn target(&self) -> Epoch {
        self.indexed_attestation.data.target.epoch
    }

    #[must_use]
    pub fn attesting_indices(&self) -> &[ValidatorIndex] {
        &self.indexed_attestation.attesting_indices
    }

    pub fn validate(&self) -> Result<(), InvalidAttestation> {
        let source_epoch = self.source();
        let target_epoch = self.target();
        let at_genesis = source_epoch == Epoch::GENESIS && target_epoch == Epoch::GENESIS;

        if source_epoch >= target_epoch && !at_genesis {
            return Err(InvalidAttestation::SourceNotBeforeTarget {
                source_epoch,
                target_epoch,
            });
        }

        let attesting_indices = self.attesting_indices();

        let Some(last) = attesting_indices.last() else {
            return Err(InvalidAttestation::NoAttestingIndices);
        };

        if attesting_indices.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(InvalidAttestation::UnsortedAttestingIndices);
        }

        if !last.is_storable() {
            return Err(InvalidAttestation::UnstorableValidatorIndex {
                validator_index: *last,
            });
        }

        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProposalRecord {
    pub signed_header: SignedBeaconBlockHeader,
    pub signing_root: H256,
}

impl ProposalRecord {
    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.signed_header.message.slot
    }

    #[must_use]
    pub const fn proposer_index(&self) -> ValidatorIndex {
        self.signed_header.message.proposer_index
    }

    pub fn validate(&self) -> Result<(), InvalidProposal> {
        let proposer_index = self.proposer_index();

        if !proposer_index.is_storable() {
            return Err(InvalidProposal::UnstorableProposerIndex { proposer_index });
        }

        Ok(())
    }
}

/// The parts of an attestation the detection pipeline works with.
///
/// `attesting_indices` may be a subset of the indices in `record` after the attestation has been
/// split by validator chunk.
#[derive(Clone, Debug)]
pub struct CompactAttestation {
    pub attesting_indices: Vec<ValidatorIndex>,
    pub source: Epoch,
    pub target: Epoch,
    pub signing_root: H256,
    pub record: Arc<AttestationRecord>,
}

impl From<Arc<AttestationRecord>> for CompactAttestation {
    fn from(record: Arc<AttestationRecord>) -> Self {
        Self {
            attesting_indices: record.attesting_indices().to_vec(),
            source: record.source(),
            target: record.target(),
            signing_root: record.signing_root,
            record,
        }
    }
}

impl CompactAttestation {
    #[must_use]
    pub fn restricted_to(&self, mut keep: impl FnMut(ValidatorIndex) -> bool) -> Self {
        Self {
            attesting_indices: self
                .attesting_indices
                .iter()
                .copied()
                .filter(|validator_index| keep(*validator_index))
                .collect(),
            record: Arc::clone(&self.record),
            ..*self
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompactBeaconBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub signing_root: H256,
    pub record: Arc<ProposalRecord>,
}

impl From<Arc<ProposalRecord>> for CompactBeaconBlock {
    fn from(record: Arc<ProposalRecord>) -> Self {
        Self {
            slot: record.slot(),
            proposer_index: record.proposer_index(),
            signing_root: record.signing_root,
            record,
        }
    }
}
