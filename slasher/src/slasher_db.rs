use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::Arc,
};

use anyhow::{ensure, Result};
use bytesize::ByteSize;
use database::{Database, DatabaseMode};
use itertools::Itertools as _;
use log::warn;
use snap::raw::{Decoder, Encoder};
use thiserror::Error;

use crate::{
    chunks::{Chunk, ChunkKind},
    params::{ChunkKey, Params, CHUNK_KEY_LENGTH},
    primitives::{Epoch, Slot, ValidatorIndex, H256},
    records::{
        AttestationRecord, CompactAttestation, CompactBeaconBlock, IndexedAttestation,
        ProposalRecord, SignedBeaconBlockHeader,
    },
};

const VALIDATOR_KEY_LENGTH: usize = 5;
const TARGET_KEY_LENGTH: usize = size_of::<u16>();
const SLOT_KEY_LENGTH: usize = size_of::<u64>();
const ATTESTATION_KEY_LENGTH: usize = TARGET_KEY_LENGTH + VALIDATOR_KEY_LENGTH;
const PROPOSAL_KEY_LENGTH: usize = SLOT_KEY_LENGTH + VALIDATOR_KEY_LENGTH;
const CHUNK_DB_KEY_LENGTH: usize = 1 + CHUNK_KEY_LENGTH;
const LATEST_EPOCH_DB_KEY_LENGTH: usize = 1 + VALIDATOR_KEY_LENGTH;
const LATEST_EPOCH_KEY_PREFIX: u8 = 2;
const SIGNING_ROOT_LENGTH: usize = H256::len_bytes();

type ValidatorKey = [u8; VALIDATOR_KEY_LENGTH];
type AttestationKey = [u8; ATTESTATION_KEY_LENGTH];
type ProposalKey = [u8; PROPOSAL_KEY_LENGTH];
type ChunkDbKey = [u8; CHUNK_DB_KEY_LENGTH];
type LatestEpochDbKey = [u8; LATEST_EPOCH_DB_KEY_LENGTH];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("validator index {validator_index} does not fit in 5 bytes")]
    UnstorableValidatorIndex { validator_index: ValidatorIndex },
    #[error("{record} record has {length} bytes, which is too few")]
    Truncated { record: &'static str, length: usize },
    #[error("{record} key has {length} bytes instead of {expected}")]
    MalformedKey {
        record: &'static str,
        length: usize,
        expected: usize,
    },
}

/// A stored attestation that conflicts with a new one for the same validator and target.
#[derive(Clone, Debug)]
pub struct AttesterDoubleVote {
    pub validator_index: ValidatorIndex,
    pub target_epoch: Epoch,
    pub existing: AttestationRecord,
    pub attestation: Arc<AttestationRecord>,
}

#[derive(Clone, Debug)]
pub struct DoubleProposal {
    pub existing: ProposalRecord,
    pub proposal: Arc<ProposalRecord>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HighestAttestation {
    pub validator_index: ValidatorIndex,
    pub highest_source_epoch: Epoch,
    pub highest_target_epoch: Epoch,
}

/// Everything the slasher reads from or writes to storage.
///
/// Implementations must make each call's writes atomic. Calls from different threads may
/// interleave.
pub trait SlasherDatabase: Send + Sync {
    /// Returns one entry per key. `None` means no chunk has been stored under that key.
    fn load_slasher_chunks(&self, kind: ChunkKind, keys: &[ChunkKey])
        -> Result<Vec<Option<Chunk>>>;

    /// Chunks of both kinds may be saved in the same call.
    fn save_slasher_chunks(&self, chunks: &[(ChunkKey, Chunk)]) -> Result<()>;

    fn check_attester_double_votes(
        &self,
        attestations: &[CompactAttestation],
    ) -> Result<Vec<AttesterDoubleVote>>;

    fn attestation_record_for_validator(
        &self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<Option<AttestationRecord>>;

    fn save_attestation_records(&self, attestations: &[CompactAttestation]) -> Result<()>;

    /// Returns the validators in `attestation` whose record for its target would replace a stored
    /// record for a different target.
    fn validators_with_aliased_records(
        &self,
        attestation: &CompactAttestation,
    ) -> Result<Vec<ValidatorIndex>>;

    fn check_double_block_proposals(
        &self,
        proposals: &[CompactBeaconBlock],
    ) -> Result<Vec<DoubleProposal>>;

    fn save_block_proposals(&self, proposals: &[CompactBeaconBlock]) -> Result<()>;

    fn latest_epoch_written_for_validators(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<(ValidatorIndex, Epoch)>>;

    /// Never lowers an epoch that is already stored.
    fn save_latest_epoch_written_for_validators(
        &self,
        validator_indices: &[ValidatorIndex],
        epoch: Epoch,
    ) -> Result<()>;

    /// Saves `chunks` and the latest epoch written for `validator_indices` in a single
    /// transaction. Neither is written if either fails.
    fn save_span_updates(
        &self,
        chunks: &[(ChunkKey, Chunk)],
        validator_indices: &[ValidatorIndex],
        epoch: Epoch,
    ) -> Result<()>;

    fn prune_attestations(&self, current_epoch: Epoch, history_length: u64) -> Result<usize>;

    fn prune_proposals(&self, current_epoch: Epoch, history_length: u64) -> Result<usize>;

    fn highest_attestations(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<HighestAttestation>>;
}

/// Latest epochs written are stored in `chunks_db` so they can be committed with the chunks.
pub struct Databases {
    pub chunks_db: Database,
    pub attestations_db: Database,
    pub proposals_db: Database,
}

impl Databases {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            chunks_db: Database::in_memory(),
            attestations_db: Database::in_memory(),
            proposals_db: Database::in_memory(),
        }
    }

    pub fn persistent(directory: impl AsRef<Path>, max_size: ByteSize) -> Result<Self> {
        let open = |name: &str, subdirectory: &str| {
            Database::persistent(
                name,
                directory.as_ref().join(subdirectory),
                max_size,
                DatabaseMode::ReadWrite,
            )
        };

        Ok(Self {
            chunks_db: open("SLASHER_CHUNKS", "slasher_chunks_db")?,
            attestations_db: open("SLASHER_ATTESTATIONS", "slasher_attestations_db")?,
            proposals_db: open("SLASHER_PROPOSALS", "slasher_proposals_db")?,
        })
    }
}

pub struct SlasherDb {
    params: Params,
    slots_per_epoch: u64,
    databases: Databases,
}

impl SlasherDb {
    #[must_use]
    pub const fn new(params: Params, slots_per_epoch: u64, databases: Databases) -> Self {
        Self {
            params,
            slots_per_epoch,
            databases,
        }
    }

    fn attestation_key(
        &self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<AttestationKey> {
        let target = u16::try_from(target_epoch.get() % self.params.history_length())?;

        let mut key = [0; ATTESTATION_KEY_LENGTH];
        key[..TARGET_KEY_LENGTH].copy_from_slice(&target.to_le_bytes());
        key[TARGET_KEY_LENGTH..].copy_from_slice(&validator_key(validator_index)?);
        Ok(key)
    }

    fn latest_epoch_pairs(
        &self,
        validator_indices: &[ValidatorIndex],
        epoch: Epoch,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let stored = self
            .latest_epoch_written_for_validators(validator_indices)?
            .into_iter()
            .filter(|(_, stored_epoch)| *stored_epoch >= epoch)
            .map(|(validator_index, _)| validator_index)
            .collect::<HashSet<_>>();

        validator_indices
            .iter()
            .filter(|validator_index| !stored.contains(validator_index))
            .map(|validator_index| {
                let key = latest_epoch_db_key(*validator_index)?;
                Ok((key.to_vec(), epoch.get().to_le_bytes().to_vec()))
            })
            .collect()
    }
}

impl SlasherDatabase for SlasherDb {
    fn load_slasher_chunks(
        &self,
        kind: ChunkKind,
        keys: &[ChunkKey],
    ) -> Result<Vec<Option<Chunk>>> {
        self.databases
            .chunks_db
            .get_batch(keys.iter().map(|key| chunk_db_key(kind, *key)))?
            .into_iter()
            .map(|bytes| {
                bytes
                    .map(|bytes| decode_chunk(kind, self.params, &bytes))
                    .transpose()
            })
            .collect()
    }

    fn save_slasher_chunks(&self, chunks: &[(ChunkKey, Chunk)]) -> Result<()> {
        self.databases.chunks_db.put_batch(chunk_pairs(chunks)?)
    }

    fn check_attester_double_votes(
        &self,
        attestations: &[CompactAttestation],
    ) -> Result<Vec<AttesterDoubleVote>> {
        let candidates = attestations
            .iter()
            .flat_map(|attestation| {
                attestation
                    .attesting_indices
                    .iter()
                    .map(move |validator_index| (*validator_index, attestation))
            })
            .collect_vec();

        let keys = candidates
            .iter()
            .map(|(validator_index, attestation)| {
                self.attestation_key(*validator_index, attestation.target)
            })
            .collect::<Result<Vec<_>>>()?;

        let values = self.databases.attestations_db.get_batch(keys)?;
        let mut double_votes = vec![];

        for ((validator_index, attestation), bytes) in candidates.into_iter().zip(values) {
            let Some(bytes) = bytes else {
                continue;
            };

            let existing = decode_attestation_record(&bytes)?;

            if existing.target() == attestation.target
                && existing.signing_root != attestation.signing_root
            {
                double_votes.push(AttesterDoubleVote {
                    validator_index,
                    target_epoch: attestation.target,
                    existing,
                    attestation: Arc::clone(&attestation.record),
                });
            }
        }

        Ok(double_votes)
    }

    fn attestation_record_for_validator(
        &self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<Option<AttestationRecord>> {
        let key = self.attestation_key(validator_index, target_epoch)?;

        let Some(bytes) = self.databases.attestations_db.get(key)? else {
            return Ok(None);
        };

        // Keys wrap around every `history_length` epochs.
        let record = decode_attestation_record(&bytes)?;
        Ok((record.target() == target_epoch).then_some(record))
    }

    fn save_attestation_records(&self, attestations: &[CompactAttestation]) -> Result<()> {
        let mut pairs = vec![];

        for attestation in attestations {
            let value = encode_attestation_record(&attestation.record)?;

            for validator_index in &attestation.attesting_indices {
                let key = self.attestation_key(*validator_index, attestation.target)?;
                pairs.push((key, value.clone()));
            }
        }

        self.databases.attestations_db.put_batch(pairs)
    }

    fn validators_with_aliased_records(
        &self,
        attestation: &CompactAttestation,
    ) -> Result<Vec<ValidatorIndex>> {
        let keys = attestation
            .attesting_indices
            .iter()
            .map(|validator_index| self.attestation_key(*validator_index, attestation.target))
            .collect::<Result<Vec<_>>>()?;

        let values = self.databases.attestations_db.get_batch(keys)?;
        let mut aliased = vec![];

        for (validator_index, bytes) in attestation.attesting_indices.iter().zip(values) {
            let Some(bytes) = bytes else {
                continue;
            };

            if decode_attestation_record(&bytes)?.target() != attestation.target {
                aliased.push(*validator_index);
            }
        }

        Ok(aliased)
    }

    fn check_double_block_proposals(
        &self,
        proposals: &[CompactBeaconBlock],
    ) -> Result<Vec<DoubleProposal>> {
        let keys = proposals
            .iter()
            .map(|proposal| proposal_key(proposal.slot, proposal.proposer_index))
            .collect::<Result<Vec<_>>>()?;

        let values = self.databases.proposals_db.get_batch(keys)?;
        let mut double_proposals = vec![];

        for (proposal, bytes) in proposals.iter().zip(values) {
            let Some(bytes) = bytes else {
                continue;
            };

            let existing = decode_proposal_record(&bytes)?;

            if existing.signing_root != proposal.signing_root {
                double_proposals.push(DoubleProposal {
                    existing,
                    proposal: Arc::clone(&proposal.record),
                });
            }
        }

        Ok(double_proposals)
    }

    fn save_block_proposals(&self, proposals: &[CompactBeaconBlock]) -> Result<()> {
        let pairs = proposals
            .iter()
            .map(|proposal| {
                let key = proposal_key(proposal.slot, proposal.proposer_index)?;
                let value = encode_proposal_record(&proposal.record)?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>>>()?;

        self.databases.proposals_db.put_batch(pairs)
    }

    fn latest_epoch_written_for_validators(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<(ValidatorIndex, Epoch)>> {
        let keys = validator_indices
            .iter()
            .copied()
            .map(latest_epoch_db_key)
            .collect::<Result<Vec<_>>>()?;

        let values = self.databases.chunks_db.get_batch(keys)?;

        validator_indices
            .iter()
            .zip(values)
            .filter_map(|(validator_index, bytes)| {
                let epoch = bytes.map(|bytes| decode_epoch(&bytes))?;
                Some(epoch.map(|epoch| (*validator_index, epoch)))
            })
            .collect()
    }

    fn save_latest_epoch_written_for_validators(
        &self,
        validator_indices: &[ValidatorIndex],
        epoch: Epoch,
    ) -> Result<()> {
        let pairs = self.latest_epoch_pairs(validator_indices, epoch)?;
        self.databases.chunks_db.put_batch(pairs)
    }

    fn save_span_updates(
        &self,
        chunks: &[(ChunkKey, Chunk)],
        validator_indices: &[ValidatorIndex],
        epoch: Epoch,
    ) -> Result<()> {
        let mut pairs = chunk_pairs(chunks)?;
        pairs.extend(self.latest_epoch_pairs(validator_indices, epoch)?);
        self.databases.chunks_db.put_batch(pairs)
    }

    fn prune_attestations(&self, current_epoch: Epoch, history_length: u64) -> Result<usize> {
        if current_epoch.get() < history_length {
            return Ok(0);
        }

        let oldest_kept = current_epoch.saturating_sub(history_length);

        self.databases.attestations_db.retain(|key, value| {
            match decode_attestation_record(value) {
                Ok(record) => Ok(record.target() >= oldest_kept),
                Err(error) => {
                    warn!("pruning undecodable attestation record (key: {key:?}, error: {error})");
                    Ok(false)
                }
            }
        })
    }

    fn prune_proposals(&self, current_epoch: Epoch, history_length: u64) -> Result<usize> {
        if current_epoch.get() < history_length {
            return Ok(0);
        }

        let oldest_kept = current_epoch
            .saturating_sub(history_length)
            .start_slot(self.slots_per_epoch);

        self.databases
            .proposals_db
            .retain(|key, _| Ok(decode_proposal_slot(key)? >= oldest_kept))
    }

    fn highest_attestations(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<HighestAttestation>> {
        let requested = validator_indices
            .iter()
            .copied()
            .map(validator_key)
            .collect::<Result<HashSet<_>>>()?;

        let mut highest = BTreeMap::<ValidatorIndex, (Epoch, Epoch)>::new();

        for result in self.databases.attestations_db.iterator_ascending([0]..)? {
            let (key, value) = result?;

            ensure!(
                key.len() == ATTESTATION_KEY_LENGTH,
                RecordError::MalformedKey {
                    record: "attestation",
                    length: key.len(),
                    expected: ATTESTATION_KEY_LENGTH,
                },
            );

            let mut validator_bytes = [0; VALIDATOR_KEY_LENGTH];
            validator_bytes.copy_from_slice(&key[TARGET_KEY_LENGTH..]);

            if !requested.contains(&validator_bytes) {
                continue;
            }

            let record = decode_attestation_record(&value)?;
            let validator_index = decode_validator_key(validator_bytes);
            let candidate = (record.target(), record.source());

            highest
                .entry(validator_index)
                .and_modify(|epochs| *epochs = (*epochs).max(candidate))
                .or_insert(candidate);
        }

        let highest_attestations = highest
            .into_iter()
            .map(|(validator_index, (target, source))| HighestAttestation {
                validator_index,
                highest_source_epoch: source,
                highest_target_epoch: target,
            })
            .collect();

        Ok(highest_attestations)
    }
}

fn validator_key(validator_index: ValidatorIndex) -> Result<ValidatorKey> {
    ensure!(
        validator_index.is_storable(),
        RecordError::UnstorableValidatorIndex { validator_index },
    );

    let mut key = [0; VALIDATOR_KEY_LENGTH];
    key.copy_from_slice(&validator_index.get().to_le_bytes()[..VALIDATOR_KEY_LENGTH]);
    Ok(key)
}

fn decode_validator_key(key: ValidatorKey) -> ValidatorIndex {
    let mut bytes = [0; size_of::<u64>()];
    bytes[..VALIDATOR_KEY_LENGTH].copy_from_slice(&key);
    ValidatorIndex::new(u64::from_le_bytes(bytes))
}

fn proposal_key(slot: Slot, proposer_index: ValidatorIndex) -> Result<ProposalKey> {
    let mut key = [0; PROPOSAL_KEY_LENGTH];
    key[..SLOT_KEY_LENGTH].copy_from_slice(&slot.get().to_le_bytes());
    key[SLOT_KEY_LENGTH..].copy_from_slice(&validator_key(proposer_index)?);
    Ok(key)
}

fn decode_proposal_slot(key: &[u8]) -> Result<Slot> {
    let malformed = || RecordError::MalformedKey {
        record: "proposal",
        length: key.len(),
        expected: PROPOSAL_KEY_LENGTH,
    };

    ensure!(key.len() == PROPOSAL_KEY_LENGTH, malformed());

    let slot_bytes = key[..SLOT_KEY_LENGTH].try_into().map_err(|_| malformed())?;
    Ok(Slot::new(u64::from_le_bytes(slot_bytes)))
}

fn chunk_db_key(kind: ChunkKind, key: ChunkKey) -> ChunkDbKey {
    let mut db_key = [0; CHUNK_DB_KEY_LENGTH];
    db_key[0] = kind.key_prefix();
    db_key[1..].copy_from_slice(&key);
    db_key
}

fn latest_epoch_db_key(validator_index: ValidatorIndex) -> Result<LatestEpochDbKey> {
    let mut db_key = [0; LATEST_EPOCH_DB_KEY_LENGTH];
    db_key[0] = LATEST_EPOCH_KEY_PREFIX;
    db_key[1..].copy_from_slice(&validator_key(validator_index)?);
    Ok(db_key)
}

fn chunk_pairs(chunks: &[(ChunkKey, Chunk)]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    chunks
        .iter()
        .map(|(key, chunk)| Ok((chunk_db_key(chunk.kind(), *key).to_vec(), encode_chunk(chunk)?)))
        .collect()
}

fn decode_epoch(bytes: &[u8]) -> Result<Epoch> {
    let bytes = bytes.try_into().map_err(|_| RecordError::Truncated {
        record: "latest epoch",
        length: bytes.len(),
    })?;

    Ok(Epoch::new(u64::from_le_bytes(bytes)))
}

fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>> {
    let bytes = chunk
        .distances()
        .iter()
        .flat_map(|distance| distance.to_le_bytes())
        .collect_vec();

    compress(&bytes)
}

fn decode_chunk(kind: ChunkKind, params: Params, bytes: &[u8]) -> Result<Chunk> {
    let decompressed = decompress(bytes)?;

    ensure!(
        decompressed.len() % size_of::<u16>() == 0,
        RecordError::Truncated {
            record: "chunk",
            length: decompressed.len(),
        },
    );

    let distances = decompressed
        .chunks_exact(size_of::<u16>())
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    Chunk::from_distances(kind, params, distances)
}

fn encode_attestation_record(record: &AttestationRecord) -> Result<Vec<u8>> {
    let payload = compress(&bincode::serialize(&record.indexed_attestation)?)?;
    Ok([record.signing_root.as_bytes(), payload.as_slice()].concat())
}

fn decode_attestation_record(bytes: &[u8]) -> Result<AttestationRecord> {
    let (signing_root, payload) = split_signing_root("attestation", bytes)?;
    let indexed_attestation = bincode::deserialize::<IndexedAttestation>(&decompress(payload)?)?;

    Ok(AttestationRecord {
        indexed_attestation,
        signing_root,
    })
}

fn encode_proposal_record(record: &ProposalRecord) -> Result<Vec<u8>> {
    let payload = compress(&bincode::serialize(&record.signed_header)?)?;
    Ok([record.signing_root.as_bytes(), payload.as_slice()].concat())
}

fn decode_proposal_record(bytes: &[u8]) -> Result<ProposalRecord> {
    let (signing_root, payload) = split_signing_root("proposal", bytes)?;
    let signed_header = bincode::deserialize::<SignedBeaconBlockHeader>(&decompress(payload)?)?;

    Ok(ProposalRecord {
        signed_header,
        signing_root,
    })
}

fn split_signing_root<'bytes>(
    record: &'static str,
    bytes: &'bytes [u8],
) -> Result<(H256, &'bytes [u8])> {
    ensure!(
        bytes.len() > SIGNING_ROOT_LENGTH,
        RecordError::Truncated {
            record,
            length: bytes.len(),
        },
    );

    let (signing_root, payload) = bytes.split_at(SIGNING_ROOT_LENGTH);
    Ok((H256::from_slice(signing_root), payload))
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}
