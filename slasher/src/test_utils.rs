use std::sync::Arc;

use crate::{
    params::Params,
    primitives::{Epoch, Slot, ValidatorIndex, H256},
    records::{
        AttestationData, AttestationRecord, BeaconBlockHeader, Checkpoint, CompactAttestation,
        CompactBeaconBlock, IndexedAttestation, ProposalRecord, SignedBeaconBlockHeader,
    },
    slasher_db::{Databases, SlasherDb},
};

pub fn params() -> Params {
    Params::new(4, 2, 16).expect("parameters are valid")
}

pub fn in_memory_db(params: Params) -> SlasherDb {
    SlasherDb::new(params, 32, Databases::in_memory())
}

pub fn attestation(
    source: u64,
    target: u64,
    attesting_indices: &[u64],
    root: u64,
) -> AttestationRecord {
    let indexed_attestation = IndexedAttestation {
        attesting_indices: attesting_indices
            .iter()
            .copied()
            .map(ValidatorIndex::new)
            .collect(),
        data: AttestationData {
            slot: Epoch::new(target).start_slot(32),
            source: Checkpoint {
                epoch: Epoch::new(source),
                root: H256::repeat_byte(0xaa),
            },
            target: Checkpoint {
                epoch: Epoch::new(target),
                root: H256::from_low_u64_be(root),
            },
            ..AttestationData::default()
        },
        ..IndexedAttestation::default()
    };

    AttestationRecord {
        indexed_attestation,
        signing_root: signing_root(source, target, root),
    }
}

pub fn compact_attestation(
    source: u64,
    target: u64,
    attesting_indices: &[u64],
    root: u64,
) -> CompactAttestation {
    Arc::new(attestation(source, target, attesting_indices, root)).into()
}

pub fn proposal(slot: u64, proposer_index: u64, root: u64) -> ProposalRecord {
    let message = BeaconBlockHeader {
        slot: Slot::new(slot),
        proposer_index: ValidatorIndex::new(proposer_index),
        body_root: H256::from_low_u64_be(root),
        ..BeaconBlockHeader::default()
    };

    ProposalRecord {
        signed_header: SignedBeaconBlockHeader {
            message,
            ..SignedBeaconBlockHeader::default()
        },
        signing_root: H256::from_low_u64_be(root),
    }
}

pub fn compact_proposal(slot: u64, proposer_index: u64, root: u64) -> CompactBeaconBlock {
    Arc::new(proposal(slot, proposer_index, root)).into()
}

// Distinct votes must have distinct signing roots for the tests to be meaningful.
fn signing_root(source: u64, target: u64, root: u64) -> H256 {
    let mut bytes = [0; 32];
    bytes[..8].copy_from_slice(&source.to_be_bytes());
    bytes[8..16].copy_from_slice(&target.to_be_bytes());
    bytes[24..].copy_from_slice(&root.to_be_bytes());
    H256(bytes)
}
