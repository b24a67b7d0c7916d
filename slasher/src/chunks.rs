use anyhow::Result;
use derive_more::Display;
use thiserror::Error;

use crate::{
    params::{ChunkIndex, Params},
    primitives::{Epoch, ValidatorIndex},
    records::CompactAttestation,
    slasher_db::SlasherDatabase,
    status::{Slashing, SlashingKind},
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum ChunkKind {
    #[display("min-span")]
    MinSpan,
    #[display("max-span")]
    MaxSpan,
}

impl ChunkKind {
    pub const ALL: [Self; 2] = [Self::MinSpan, Self::MaxSpan];

    /// Value of a cell that has never been written.
    #[must_use]
    pub const fn neutral_distance(self) -> u16 {
        match self {
            Self::MinSpan => u16::MAX,
            Self::MaxSpan => 0,
        }
    }

    #[must_use]
    pub const fn key_prefix(self) -> u8 {
        match self {
            Self::MinSpan => 0,
            Self::MaxSpan => 1,
        }
    }

    /// First epoch whose cell an attestation with `source` may update, if any.
    #[must_use]
    pub fn start_epoch(self, params: Params, source: Epoch, current_epoch: Epoch) -> Option<Epoch> {
        if source < params.window_start(current_epoch) {
            return None;
        }

        match self {
            Self::MinSpan => (source > Epoch::GENESIS).then(|| source.saturating_sub(1)),
            Self::MaxSpan => (source < current_epoch).then(|| source.saturating_add(1)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("{kind} chunk has {actual} cells instead of {expected}")]
    WrongLength {
        kind: ChunkKind,
        expected: usize,
        actual: usize,
    },
    #[error("cell {index} is out of bounds for a chunk of {len} cells")]
    CellOutOfBounds { index: usize, len: usize },
    #[error("distance from epoch {epoch} to target epoch {target} cannot be stored in a chunk")]
    DistanceOutOfRange { epoch: Epoch, target: Epoch },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MinSpanChunk(Cells);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MaxSpanChunk(Cells);

/// `validators_per_chunk * epochs_per_chunk` target distances.
///
/// Each cell holds the distance from its epoch to a target epoch. In a min-span chunk that is the
/// lowest target of any attestation with a source after the cell's epoch. In a max-span chunk it
/// is the highest target of any attestation with a source before the cell's epoch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Chunk {
    Min(MinSpanChunk),
    Max(MaxSpanChunk),
}

impl Chunk {
    #[must_use]
    pub fn neutral(kind: ChunkKind, params: Params) -> Self {
        let cells = Cells(vec![kind.neutral_distance(); params.chunk_len()]);
        Self::with_cells(kind, cells)
    }

    pub fn from_distances(kind: ChunkKind, params: Params, distances: Vec<u16>) -> Result<Self> {
        let expected = params.chunk_len();
        let actual = distances.len();

        if actual != expected {
            return Err(ChunkError::WrongLength {
                kind,
                expected,
                actual,
            }
            .into());
        }

        Ok(Self::with_cells(kind, Cells(distances)))
    }

    #[must_use]
    pub const fn kind(&self) -> ChunkKind {
        match self {
            Self::Min(_) => ChunkKind::MinSpan,
            Self::Max(_) => ChunkKind::MaxSpan,
        }
    }

    #[must_use]
    pub fn distances(&self) -> &[u16] {
        &self.cells().0
    }

    pub fn target_at(
        &self,
        params: Params,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<Epoch> {
        self.cells().target_at(params, validator_index, epoch)
    }

    /// Checks `attestation` against the cell at its source epoch.
    ///
    /// A cell only names a target epoch. The record stored for that target is loaded to confirm
    /// the offence, so stale or aliased cells can hide a slashing but never invent one.
    pub fn check_slashable<D: SlasherDatabase + ?Sized>(
        &self,
        params: Params,
        database: &D,
        validator_index: ValidatorIndex,
        attestation: &CompactAttestation,
    ) -> Result<Option<Slashing>> {
        let stored_target = self.target_at(params, validator_index, attestation.source)?;

        let (kind, candidate) = match self {
            Self::Min(_) => (SlashingKind::Surrounding, attestation.target > stored_target),
            Self::Max(_) => (SlashingKind::Surrounded, attestation.target < stored_target),
        };

        if !candidate {
            return Ok(None);
        }

        let Some(existing) =
            database.attestation_record_for_validator(validator_index, stored_target)?
        else {
            return Ok(None);
        };

        let slashable = match self {
            Self::Min(_) => attestation.source < existing.source(),
            Self::Max(_) => existing.source() < attestation.source,
        };

        Ok(slashable.then(|| {
            Slashing::surround_vote(kind, validator_index, &existing, &attestation.record)
        }))
    }

    /// Writes `target` into the cells of `validator_index` starting at `start_epoch`.
    ///
    /// Returns `true` if the update should continue in the next chunk returned by
    /// [`Chunk::next_chunk_start_epoch`].
    pub fn update(
        &mut self,
        params: Params,
        chunk_index: ChunkIndex,
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        target: Epoch,
        current_epoch: Epoch,
    ) -> Result<bool> {
        match self {
            Self::Min(chunk) => chunk.update(
                params,
                chunk_index,
                validator_index,
                start_epoch,
                target,
                current_epoch,
            ),
            Self::Max(chunk) => chunk.update(
                params,
                chunk_index,
                validator_index,
                start_epoch,
                target,
                current_epoch,
            ),
        }
    }

    #[must_use]
    pub const fn next_chunk_start_epoch(&self, params: Params, start_epoch: Epoch) -> Epoch {
        let first_epoch = params.first_epoch_in_chunk(start_epoch);

        match self {
            Self::Min(_) => first_epoch.saturating_sub(1),
            Self::Max(_) => first_epoch.saturating_add(params.epochs_per_chunk()),
        }
    }

    pub fn clear_cell(
        &mut self,
        params: Params,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<()> {
        let neutral_distance = self.kind().neutral_distance();
        let index = params.cell_index(validator_index, epoch)?;
        *self.cells_mut().get_mut(index)? = neutral_distance;
        Ok(())
    }

    fn with_cells(kind: ChunkKind, cells: Cells) -> Self {
        match kind {
            ChunkKind::MinSpan => Self::Min(MinSpanChunk(cells)),
            ChunkKind::MaxSpan => Self::Max(MaxSpanChunk(cells)),
        }
    }

    const fn cells(&self) -> &Cells {
        match self {
            Self::Min(MinSpanChunk(cells)) | Self::Max(MaxSpanChunk(cells)) => cells,
        }
    }

    fn cells_mut(&mut self) -> &mut Cells {
        match self {
            Self::Min(MinSpanChunk(cells)) | Self::Max(MaxSpanChunk(cells)) => cells,
        }
    }
}

impl MinSpanChunk {
    // Walks backwards from `start_epoch` lowering cells to `target` until a cell already holds a
    // lower target or the history window ends.
    fn update(
        &mut self,
        params: Params,
        chunk_index: ChunkIndex,
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        target: Epoch,
        current_epoch: Epoch,
    ) -> Result<bool> {
        let min_epoch = params.window_start(current_epoch);
        let mut epoch = start_epoch;

        while params.chunk_index(epoch) == chunk_index && epoch >= min_epoch {
            if target >= self.0.target_at(params, validator_index, epoch)? {
                return Ok(false);
            }

            self.0
                .set_target_at(params, validator_index, epoch, target, ChunkKind::MinSpan)?;

            if epoch == min_epoch {
                return Ok(false);
            }

            epoch = epoch.saturating_sub(1);
        }

        Ok(epoch >= min_epoch)
    }
}

impl MaxSpanChunk {
    // Walks forwards from `start_epoch` raising cells to `target` until a cell already holds a
    // higher target or the current epoch is passed.
    fn update(
        &mut self,
        params: Params,
        chunk_index: ChunkIndex,
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        target: Epoch,
        current_epoch: Epoch,
    ) -> Result<bool> {
        let mut epoch = start_epoch;

        while params.chunk_index(epoch) == chunk_index && epoch <= current_epoch {
            if target <= self.0.target_at(params, validator_index, epoch)? {
                return Ok(false);
            }

            self.0
                .set_target_at(params, validator_index, epoch, target, ChunkKind::MaxSpan)?;

            epoch = epoch.saturating_add(1);
        }

        Ok(epoch <= current_epoch)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
struct Cells(Vec<u16>);

impl Cells {
    fn get(&self, index: usize) -> Result<u16> {
        self.0.get(index).copied().ok_or_else(|| {
            ChunkError::CellOutOfBounds {
                index,
                len: self.0.len(),
            }
            .into()
        })
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut u16> {
        let len = self.0.len();

        self.0
            .get_mut(index)
            .ok_or_else(|| ChunkError::CellOutOfBounds { index, len }.into())
    }

    fn target_at(
        &self,
        params: Params,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<Epoch> {
        let distance = self.get(params.cell_index(validator_index, epoch)?)?;
        Ok(epoch.saturating_add(distance.into()))
    }

    fn set_target_at(
        &mut self,
        params: Params,
        validator_index: ValidatorIndex,
        epoch: Epoch,
        target: Epoch,
        kind: ChunkKind,
    ) -> Result<()> {
        let distance = target
            .get()
            .checked_sub(epoch.get())
            .and_then(|distance| u16::try_from(distance).ok())
            .filter(|distance| kind != ChunkKind::MinSpan || *distance != kind.neutral_distance())
            .ok_or(ChunkError::DistanceOutOfRange { epoch, target })?;

        *self.get_mut(params.cell_index(validator_index, epoch)?)? = distance;

        Ok(())
    }
}
