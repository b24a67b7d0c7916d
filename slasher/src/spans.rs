use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

use anyhow::Result;
use itertools::Itertools as _;

use crate::{
    chunks::{Chunk, ChunkKind},
    params::{ChunkIndex, ChunkKey, Params, ValidatorChunkIndex},
    primitives::{Epoch, ValidatorIndex},
    records::CompactAttestation,
    slasher_db::SlasherDatabase,
    status::Slashing,
};

/// Checks `attestations` for surround votes and records them in the span chunks of one validator
/// chunk.
///
/// `attestations` must only name validators in `validator_chunk_index` and must not have targets
/// after `current_epoch`. Attestations with sources that have left the history window are ignored.
///
/// All modified chunks are written in one transaction together with the latest epoch of every
/// validator in the chunk. Cells are only cleared for epochs after the stored latest epoch, so the
/// two must never be saved apart.
pub fn update_spans<D: SlasherDatabase + ?Sized>(
    database: &D,
    params: Params,
    validator_chunk_index: ValidatorChunkIndex,
    attestations: &[CompactAttestation],
    current_epoch: Epoch,
    slashings: &mut Vec<Slashing>,
) -> Result<()> {
    let validator_indices = params
        .validator_indices_in_chunk(validator_chunk_index)
        .collect_vec();

    let latest_epochs = database.latest_epoch_written_for_validators(&validator_indices)?;
    let window_start = params.window_start(current_epoch);

    let mut by_source_chunk = BTreeMap::<_, Vec<_>>::new();

    for attestation in attestations {
        if attestation.source >= window_start && attestation.target <= current_epoch {
            by_source_chunk
                .entry(params.chunk_index(attestation.source))
                .or_default()
                .push(attestation);
        }
    }

    let mut chunk_indices = by_source_chunk.keys().copied().collect::<BTreeSet<_>>();

    for (_, latest_epoch) in &latest_epochs {
        if *latest_epoch < current_epoch {
            chunk_indices.extend(
                params.chunk_indices_between(latest_epoch.saturating_add(1), current_epoch),
            );
        }
    }

    let mut min_spans = ChunkCache::load(
        database,
        params,
        ChunkKind::MinSpan,
        validator_chunk_index,
        &chunk_indices,
    )?;

    let mut max_spans = ChunkCache::load(
        database,
        params,
        ChunkKind::MaxSpan,
        validator_chunk_index,
        &chunk_indices,
    )?;

    for (validator_index, latest_epoch) in latest_epochs {
        min_spans.advance_window(validator_index, latest_epoch, current_epoch)?;
        max_spans.advance_window(validator_index, latest_epoch, current_epoch)?;
    }

    for attestation in by_source_chunk.into_values().flatten() {
        for validator_index in attestation.attesting_indices.iter().copied() {
            for spans in [&mut min_spans, &mut max_spans] {
                if let Some(slashing) = spans.apply(validator_index, attestation, current_epoch)? {
                    slashings.push(slashing);
                }
            }
        }
    }

    let modified = min_spans
        .into_modified()
        .chain(max_spans.into_modified())
        .collect_vec();

    database.save_span_updates(&modified, &validator_indices, current_epoch)
}

// Chunks of one kind for one validator chunk, loaded on first use.
struct ChunkCache<'database, D: ?Sized> {
    database: &'database D,
    params: Params,
    kind: ChunkKind,
    validator_chunk_index: ValidatorChunkIndex,
    chunks: BTreeMap<ChunkIndex, Chunk>,
    modified: BTreeSet<ChunkIndex>,
}

impl<'database, D: SlasherDatabase + ?Sized> ChunkCache<'database, D> {
    fn load(
        database: &'database D,
        params: Params,
        kind: ChunkKind,
        validator_chunk_index: ValidatorChunkIndex,
        chunk_indices: &BTreeSet<ChunkIndex>,
    ) -> Result<Self> {
        let keys = chunk_indices
            .iter()
            .map(|chunk_index| params.chunk_key(validator_chunk_index, *chunk_index))
            .collect_vec();

        let chunks = chunk_indices
            .iter()
            .copied()
            .zip(database.load_slasher_chunks(kind, &keys)?)
            .map(|(chunk_index, chunk)| {
                (chunk_index, chunk.unwrap_or_else(|| Chunk::neutral(kind, params)))
            })
            .collect();

        Ok(Self {
            database,
            params,
            kind,
            validator_chunk_index,
            chunks,
            modified: BTreeSet::new(),
        })
    }

    fn chunk(&mut self, chunk_index: ChunkIndex) -> Result<&mut Chunk> {
        match self.chunks.entry(chunk_index) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let key = self.params.chunk_key(self.validator_chunk_index, chunk_index);

                let chunk = self
                    .database
                    .load_slasher_chunks(self.kind, &[key])?
                    .pop()
                    .flatten()
                    .unwrap_or_else(|| Chunk::neutral(self.kind, self.params));

                Ok(entry.insert(chunk))
            }
        }
    }

    fn chunk_mut(&mut self, chunk_index: ChunkIndex) -> Result<&mut Chunk> {
        self.modified.insert(chunk_index);
        self.chunk(chunk_index)
    }

    // Cells for epochs after `latest_epoch` were last written a whole history length ago.
    fn advance_window(
        &mut self,
        validator_index: ValidatorIndex,
        latest_epoch: Epoch,
        current_epoch: Epoch,
    ) -> Result<()> {
        let params = self.params;
        let mut epoch = latest_epoch
            .saturating_add(1)
            .max(params.window_start(current_epoch));

        while epoch <= current_epoch {
            self.chunk_mut(params.chunk_index(epoch))?
                .clear_cell(params, validator_index, epoch)?;

            epoch = epoch.saturating_add(1);
        }

        Ok(())
    }

    fn apply(
        &mut self,
        validator_index: ValidatorIndex,
        attestation: &CompactAttestation,
        current_epoch: Epoch,
    ) -> Result<Option<Slashing>> {
        let params = self.params;
        let database = self.database;

        let source_chunk = self.chunk(params.chunk_index(attestation.source))?;

        if let Some(slashing) =
            source_chunk.check_slashable(params, database, validator_index, attestation)?
        {
            return Ok(Some(slashing));
        }

        let Some(mut start_epoch) =
            self.kind
                .start_epoch(params, attestation.source, current_epoch)
        else {
            return Ok(None);
        };

        loop {
            let chunk_index = params.chunk_index(start_epoch);
            let chunk = self.chunk_mut(chunk_index)?;

            let keep_going = chunk.update(
                params,
                chunk_index,
                validator_index,
                start_epoch,
                attestation.target,
                current_epoch,
            )?;

            if !keep_going {
                return Ok(None);
            }

            start_epoch = chunk.next_chunk_start_epoch(params, start_epoch);
        }
    }

    fn into_modified(self) -> impl Iterator<Item = (ChunkKey, Chunk)> {
        let Self {
            params,
            validator_chunk_index,
            mut chunks,
            modified,
            ..
        } = self;

        modified.into_iter().filter_map(move |chunk_index| {
            let chunk = chunks.remove(&chunk_index)?;
            Some((params.chunk_key(validator_chunk_index, chunk_index), chunk))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        status::SlashingKind,
        test_utils::{compact_attestation, in_memory_db, params},
    };

    use super::*;

    const VALIDATOR: ValidatorIndex = ValidatorIndex::new(1);

    fn process(
        database: &impl SlasherDatabase,
        attestations: &[CompactAttestation],
        current_epoch: u64,
    ) -> Result<Vec<Slashing>> {
        let mut slashings = vec![];

        database.save_attestation_records(attestations)?;

        update_spans(
            database,
            params(),
            ValidatorChunkIndex::from(0),
            attestations,
            Epoch::new(current_epoch),
            &mut slashings,
        )?;

        Ok(slashings)
    }

    fn stored_target(
        database: &impl SlasherDatabase,
        kind: ChunkKind,
        validator_index: ValidatorIndex,
        epoch: u64,
    ) -> Result<u64> {
        let params = params();
        let epoch = Epoch::new(epoch);
        let key = params.chunk_key(
            params.validator_chunk_index(validator_index),
            params.chunk_index(epoch),
        );

        let chunk = database
            .load_slasher_chunks(kind, &[key])?
            .pop()
            .flatten()
            .unwrap_or_else(|| Chunk::neutral(kind, params));

        Ok(chunk.target_at(params, validator_index, epoch)?.get())
    }

    #[test]
    fn surrounding_vote_is_detected() -> Result<()> {
        let database = in_memory_db(params());
        let inner = compact_attestation(4, 8, &[1], 0);
        let outer = compact_attestation(2, 10, &[1], 0);

        assert!(process(&database, &[inner.clone()], 10)?.is_empty());

        let slashings = process(&database, &[outer.clone()], 10)?;

        assert_eq!(slashings.len(), 1);
        assert_eq!(slashings[0].kind, SlashingKind::Surrounding);
        assert_eq!(slashings[0].validator_index, VALIDATOR);
        assert_eq!(slashings[0].prev_signing_root, inner.signing_root);
        assert_eq!(slashings[0].signing_root, outer.signing_root);

        Ok(())
    }

    #[test]
    fn surrounded_vote_is_detected() -> Result<()> {
        let database = in_memory_db(params());
        let outer = compact_attestation(2, 10, &[1], 0);
        let inner = compact_attestation(4, 8, &[1], 0);

        assert!(process(&database, &[outer.clone()], 10)?.is_empty());

        let slashings = process(&database, &[inner.clone()], 10)?;

        assert_eq!(slashings.len(), 1);
        assert_eq!(slashings[0].kind, SlashingKind::Surrounded);
        assert_eq!(slashings[0].prev_signing_root, outer.signing_root);

        Ok(())
    }

    #[test]
    fn surround_vote_within_one_batch_is_detected() -> Result<()> {
        let database = in_memory_db(params());
        let inner = compact_attestation(4, 8, &[1], 0);
        let outer = compact_attestation(2, 10, &[1], 0);

        // Attestations are applied in order of source chunk, so the outer one goes first.
        let slashings = process(&database, &[inner, outer.clone()], 10)?;

        assert_eq!(
            slashings.iter().map(|slashing| slashing.kind).collect_vec(),
            [SlashingKind::Surrounded],
        );
        assert_eq!(slashings[0].prev_signing_root, outer.signing_root);

        Ok(())
    }

    #[test]
    fn consecutive_votes_are_not_slashable() -> Result<()> {
        let database = in_memory_db(params());

        assert!(process(&database, &[compact_attestation(1, 2, &[1, 2], 0)], 4)?.is_empty());
        assert!(process(&database, &[compact_attestation(2, 3, &[1, 2], 0)], 4)?.is_empty());
        assert!(process(&database, &[compact_attestation(3, 4, &[1, 2], 0)], 4)?.is_empty());

        Ok(())
    }

    #[test]
    fn max_span_update_crosses_chunks() -> Result<()> {
        let database = in_memory_db(params());

        process(&database, &[compact_attestation(0, 9, &[1], 0)], 9)?;

        for epoch in 1..=9 {
            assert_eq!(stored_target(&database, ChunkKind::MaxSpan, VALIDATOR, epoch)?, 9);
        }

        assert_eq!(stored_target(&database, ChunkKind::MaxSpan, VALIDATOR, 0)?, 0);

        Ok(())
    }

    #[test]
    fn min_span_update_walks_back_to_genesis() -> Result<()> {
        let database = in_memory_db(params());

        process(&database, &[compact_attestation(7, 9, &[1], 0)], 9)?;

        for epoch in 0..7 {
            assert_eq!(stored_target(&database, ChunkKind::MinSpan, VALIDATOR, epoch)?, 9);
        }

        Ok(())
    }

    #[test]
    fn advancing_the_window_clears_stale_cells() -> Result<()> {
        let database = in_memory_db(params());

        process(&database, &[compact_attestation(2, 10, &[1], 0)], 10)?;

        assert_eq!(stored_target(&database, ChunkKind::MaxSpan, VALIDATOR, 5)?, 10);

        // Epoch 21 shares its cell with epoch 5.
        process(&database, &[], 30)?;

        assert_eq!(stored_target(&database, ChunkKind::MaxSpan, VALIDATOR, 21)?, 21);
        assert_eq!(
            database.latest_epoch_written_for_validators(&[VALIDATOR])?,
            [(VALIDATOR, Epoch::new(30))],
        );

        Ok(())
    }

    #[test]
    fn stale_cells_never_produce_slashings() -> Result<()> {
        let database = in_memory_db(params());

        process(&database, &[compact_attestation(4, 8, &[1], 0)], 10)?;

        // Every cell has been reused by an epoch from 11 to 26.
        let slashings = process(&database, &[compact_attestation(18, 26, &[1], 0)], 26)?;

        assert!(slashings.is_empty());

        Ok(())
    }

    #[test]
    fn latest_epoch_is_written_for_every_validator_in_the_chunk() -> Result<()> {
        let database = in_memory_db(params());

        process(&database, &[compact_attestation(1, 2, &[1], 0)], 3)?;

        let validators = (0..4).map(ValidatorIndex::new).collect_vec();

        assert_eq!(
            database.latest_epoch_written_for_validators(&validators)?,
            validators
                .iter()
                .map(|validator_index| (*validator_index, Epoch::new(3)))
                .collect_vec(),
        );

        Ok(())
    }

    #[test]
    fn reapplying_a_batch_leaves_chunks_unchanged() -> Result<()> {
        let database = in_memory_db(params());
        let params = params();

        let batch = [
            compact_attestation(2, 5, &[1, 2], 0),
            compact_attestation(5, 9, &[1], 0),
            compact_attestation(0, 10, &[3], 0),
        ];

        let keys = (0..params.history_length() / params.epochs_per_chunk())
            .map(|chunk_index| {
                params.chunk_key(ValidatorChunkIndex::from(0), ChunkIndex::from(chunk_index))
            })
            .collect_vec();

        let load_all = || -> Result<_> {
            Ok((
                database.load_slasher_chunks(ChunkKind::MinSpan, &keys)?,
                database.load_slasher_chunks(ChunkKind::MaxSpan, &keys)?,
            ))
        };

        assert!(process(&database, &batch, 10)?.is_empty());

        let chunks_after_first_pass = load_all()?;

        assert!(process(&database, &batch, 10)?.is_empty());
        assert_eq!(load_all()?, chunks_after_first_pass);

        Ok(())
    }

    #[test]
    fn attestation_with_source_outside_the_window_is_ignored() -> Result<()> {
        let database = in_memory_db(params());

        let slashings = process(&database, &[compact_attestation(1, 20, &[1], 0)], 20)?;

        assert!(slashings.is_empty());
        assert_eq!(stored_target(&database, ChunkKind::MaxSpan, VALIDATOR, 10)?, 10);

        Ok(())
    }
}
