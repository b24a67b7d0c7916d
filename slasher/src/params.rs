use anyhow::Result;
use derive_more::{Display, From, Into};
use thiserror::Error;

use crate::primitives::{Epoch, ValidatorIndex};

pub const CHUNK_KEY_LENGTH: usize = size_of::<u64>();

/// Little-endian flat slice ID. The chunk kind prefix is added by storage.
pub type ChunkKey = [u8; CHUNK_KEY_LENGTH];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, Into)]
pub struct ValidatorChunkIndex(u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, Into)]
pub struct ChunkIndex(u64);

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("{parameter} must be greater than zero")]
    Zero { parameter: &'static str },
    #[error(
        "epochs_per_chunk ({epochs_per_chunk}) must divide history_length ({history_length})"
    )]
    MisalignedChunks {
        epochs_per_chunk: u64,
        history_length: u64,
    },
    #[error("history_length ({history_length}) must be at most {}", u16::MAX)]
    HistoryTooLong { history_length: u64 },
    #[error(
        "chunk of {validators_per_chunk} validators and {epochs_per_chunk} epochs is too large"
    )]
    ChunkTooLarge {
        validators_per_chunk: u64,
        epochs_per_chunk: u64,
    },
}

/// Geometry of the span chunk grid.
///
/// A chunk covers `validators_per_chunk` consecutive validators and `epochs_per_chunk`
/// consecutive epochs. Epochs wrap around every `history_length` epochs, so all arithmetic that
/// maps validators and epochs to chunks and cells lives here.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Params {
    validators_per_chunk: u64,
    epochs_per_chunk: u64,
    history_length: u64,
    chunk_len: usize,
}

impl Params {
    pub fn new(
        validators_per_chunk: u64,
        epochs_per_chunk: u64,
        history_length: u64,
    ) -> Result<Self, ParamsError> {
        for (parameter, value) in [
            ("validators_per_chunk", validators_per_chunk),
            ("epochs_per_chunk", epochs_per_chunk),
            ("history_length", history_length),
        ] {
            if value == 0 {
                return Err(ParamsError::Zero { parameter });
            }
        }

        if history_length % epochs_per_chunk != 0 {
            return Err(ParamsError::MisalignedChunks {
                epochs_per_chunk,
                history_length,
            });
        }

        // Distances up to `history_length - 1` must fit below the min-span sentinel.
        if history_length > u64::from(u16::MAX) {
            return Err(ParamsError::HistoryTooLong { history_length });
        }

        let chunk_len = validators_per_chunk
            .checked_mul(epochs_per_chunk)
            .and_then(|cells| usize::try_from(cells).ok())
            .ok_or(ParamsError::ChunkTooLarge {
                validators_per_chunk,
                epochs_per_chunk,
            })?;

        Ok(Self {
            validators_per_chunk,
            epochs_per_chunk,
            history_length,
            chunk_len,
        })
    }

    #[must_use]
    pub const fn validators_per_chunk(self) -> u64 {
        self.validators_per_chunk
    }

    #[must_use]
    pub const fn epochs_per_chunk(self) -> u64 {
        self.epochs_per_chunk
    }

    #[must_use]
    pub const fn history_length(self) -> u64 {
        self.history_length
    }

    /// Number of cells in every chunk.
    #[must_use]
    pub const fn chunk_len(self) -> usize {
        self.chunk_len
    }

    #[must_use]
    pub const fn validator_chunk_index(self, validator_index: ValidatorIndex) -> ValidatorChunkIndex {
        ValidatorChunkIndex(validator_index.get() / self.validators_per_chunk)
    }

    #[must_use]
    pub const fn chunk_index(self, epoch: Epoch) -> ChunkIndex {
        ChunkIndex(epoch.get() % self.history_length / self.epochs_per_chunk)
    }

    pub fn cell_index(self, validator_index: ValidatorIndex, epoch: Epoch) -> Result<usize> {
        let validator_offset = validator_index.get() % self.validators_per_chunk;
        let epoch_offset = epoch.get() % self.epochs_per_chunk;
        let index = validator_offset * self.epochs_per_chunk + epoch_offset;
        Ok(usize::try_from(index)?)
    }

    #[must_use]
    pub const fn flat_slice_id(
        self,
        validator_chunk_index: ValidatorChunkIndex,
        chunk_index: ChunkIndex,
    ) -> u64 {
        let chunks_per_validator_chunk = self.history_length / self.epochs_per_chunk;
        validator_chunk_index.0 * chunks_per_validator_chunk + chunk_index.0
    }

    #[must_use]
    pub const fn chunk_key(
        self,
        validator_chunk_index: ValidatorChunkIndex,
        chunk_index: ChunkIndex,
    ) -> ChunkKey {
        self.flat_slice_id(validator_chunk_index, chunk_index)
            .to_le_bytes()
    }

    pub fn validator_indices_in_chunk(
        self,
        validator_chunk_index: ValidatorChunkIndex,
    ) -> impl Iterator<Item = ValidatorIndex> {
        let start = validator_chunk_index.0 * self.validators_per_chunk;
        (start..start + self.validators_per_chunk).map(ValidatorIndex::new)
    }

    #[must_use]
    pub const fn first_epoch_in_chunk(self, epoch: Epoch) -> Epoch {
        Epoch::new(epoch.get() - epoch.get() % self.epochs_per_chunk)
    }

    /// Oldest epoch still covered by the chunks when `current_epoch` is the newest.
    #[must_use]
    pub const fn window_start(self, current_epoch: Epoch) -> Epoch {
        current_epoch.saturating_sub(self.history_length - 1)
    }

    /// Indices of the chunks holding epochs `from..=to`, clamped to the window ending at `to`.
    pub fn chunk_indices_between(self, from: Epoch, to: Epoch) -> Vec<ChunkIndex> {
        let mut indices = vec![];
        let mut epoch = from.max(self.window_start(to));

        while epoch <= to {
            indices.push(self.chunk_index(epoch));
            epoch = self
                .first_epoch_in_chunk(epoch)
                .saturating_add(self.epochs_per_chunk);
        }

        indices
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;

    use super::*;

    fn params() -> Params {
        Params::new(4, 2, 8).expect("parameters are valid")
    }

    #[test_case(0, 2, 8 => matches Err(ParamsError::Zero { parameter: "validators_per_chunk" }))]
    #[test_case(4, 0, 8 => matches Err(ParamsError::Zero { parameter: "epochs_per_chunk" }))]
    #[test_case(4, 3, 8 => matches Err(ParamsError::MisalignedChunks { .. }))]
    #[test_case(4, 1, 65536 => matches Err(ParamsError::HistoryTooLong { .. }))]
    #[test_case(256, 16, 4096 => matches Ok(_))]
    fn params_validation(
        validators_per_chunk: u64,
        epochs_per_chunk: u64,
        history_length: u64,
    ) -> Result<Params, ParamsError> {
        Params::new(validators_per_chunk, epochs_per_chunk, history_length)
    }

    #[test_case(0 => 0)]
    #[test_case(1 => 0)]
    #[test_case(2 => 1)]
    #[test_case(7 => 3)]
    #[test_case(8 => 0; "wraps around after history_length")]
    #[test_case(11 => 1)]
    fn chunk_index(epoch: u64) -> u64 {
        params().chunk_index(Epoch::new(epoch)).into()
    }

    #[test]
    fn cell_index_is_validator_major() -> Result<()> {
        let params = params();

        assert_eq!(params.cell_index(ValidatorIndex::new(0), Epoch::new(0))?, 0);
        assert_eq!(params.cell_index(ValidatorIndex::new(0), Epoch::new(1))?, 1);
        assert_eq!(params.cell_index(ValidatorIndex::new(1), Epoch::new(0))?, 2);
        assert_eq!(params.cell_index(ValidatorIndex::new(5), Epoch::new(3))?, 3);
        assert_eq!(params.cell_index(ValidatorIndex::new(7), Epoch::new(9))?, 7);

        Ok(())
    }

    #[test]
    fn flat_slice_ids_do_not_collide_within_history() {
        let params = params();
        let mut seen = HashSet::new();

        for validator_index in 0..64 {
            let validator_chunk_index =
                params.validator_chunk_index(ValidatorIndex::new(validator_index));

            for epoch in 0..params.history_length() {
                let chunk_index = params.chunk_index(Epoch::new(epoch));
                let id = params.flat_slice_id(validator_chunk_index, chunk_index);
                let expected_id = validator_index / 4 * 4 + epoch / 2;

                assert_eq!(id, expected_id);
                seen.insert((validator_chunk_index, chunk_index, id));
            }
        }

        let ids = seen.iter().map(|(_, _, id)| id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), seen.len());
        assert_eq!(params.chunk_key(ValidatorChunkIndex(1), ChunkIndex(3)), 7_u64.to_le_bytes());
    }

    #[test]
    fn validator_indices_in_chunk() {
        let indices = params()
            .validator_indices_in_chunk(ValidatorChunkIndex(2))
            .map(ValidatorIndex::get)
            .collect::<Vec<_>>();

        assert_eq!(indices, [8, 9, 10, 11]);
    }

    #[test_case(0, 0 => vec![0])]
    #[test_case(0, 5 => vec![0, 1, 2])]
    #[test_case(3, 5 => vec![1, 2])]
    #[test_case(0, 12 => vec![2, 3, 0, 1, 2]; "clamped to history window")]
    #[test_case(6, 5 => Vec::<u64>::new())]
    fn chunk_indices_between(from: u64, to: u64) -> Vec<u64> {
        params()
            .chunk_indices_between(Epoch::new(from), Epoch::new(to))
            .into_iter()
            .map(Into::into)
            .collect()
    }
}
