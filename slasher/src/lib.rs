//! Detection of slashable attestations and block proposals.
//!
//! Incoming messages are queued and processed once per epoch in groups of validators. Double
//! votes and double proposals are found by comparing signing roots. Surround votes are found
//! through min-span and max-span chunks that store, for every validator and epoch in the history
//! window, the distance to the closest relevant target epoch.

pub use crate::{
    chunks::{Chunk, ChunkError, ChunkKind},
    messages::{NetworkToSlasher, SlasherToValidator, ValidatorToSlasher},
    params::{ChunkIndex, ChunkKey, Params, ParamsError, ValidatorChunkIndex},
    primitives::{Epoch, Slot, ValidatorIndex, H256},
    queue::{IngestionQueue, QueueState, Validate},
    records::{
        AttestationData, AttestationRecord, AttesterSlashing, BeaconBlockHeader, Checkpoint,
        CompactAttestation, CompactBeaconBlock, IndexedAttestation, InvalidAttestation,
        InvalidProposal, ProposalRecord, ProposerSlashing, SignatureBytes,
        SignedBeaconBlockHeader,
    },
    rpc::{QueryError, SlashingChecker},
    slasher::{
        ingestion_channel, GroupFailure, ProcessingReport, ProcessingStage, Slasher,
    },
    slasher_config::SlasherConfig,
    slasher_db::{
        AttesterDoubleVote, Databases, DoubleProposal, HighestAttestation, RecordError,
        SlasherDatabase, SlasherDb,
    },
    status::{Evidence, SlashedAt, Slashing, SlashingKey, SlashingKind},
};

mod attestations;
mod blocks;
mod chunks;
mod messages;
mod params;
mod primitives;
mod queue;
mod records;
mod rpc;
mod slasher;
mod slasher_config;
mod slasher_db;
mod spans;
mod status;

#[cfg(test)]
mod test_utils;
