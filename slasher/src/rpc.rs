use core::slice;
use std::{collections::HashSet, sync::Arc};

use anyhow::{Error as AnyhowError, Result};
use itertools::Itertools as _;
use log::debug;
use thiserror::Error;

use crate::{
    chunks::ChunkKind,
    params::Params,
    primitives::ValidatorIndex,
    records::{
        AttestationRecord, CompactAttestation, CompactBeaconBlock, InvalidAttestation,
        InvalidProposal, ProposalRecord,
    },
    slasher_db::{HighestAttestation, SlasherDatabase},
    status::Slashing,
};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidAttestation(#[from] InvalidAttestation),
    #[error(transparent)]
    InvalidProposal(#[from] InvalidProposal),
    #[error("slasher could not complete the query: {0:?}")]
    Internal(#[from] AnyhowError),
}

/// Answers slashing queries immediately instead of waiting for the next epoch.
///
/// Shares its database with [`Slasher`](crate::Slasher). Records are saved only for messages
/// that turned out not to be slashable. Queries have no clock, so an attestation record never
/// replaces a stored record for a different target. The slot is freed when the older record is
/// pruned.
pub struct SlashingChecker<D: ?Sized> {
    database: Arc<D>,
    params: Params,
}

impl<D: ?Sized> Clone for SlashingChecker<D> {
    fn clone(&self) -> Self {
        Self {
            database: Arc::clone(&self.database),
            params: self.params,
        }
    }
}

impl<D: SlasherDatabase + ?Sized> SlashingChecker<D> {
    #[must_use]
    pub const fn new(database: Arc<D>, params: Params) -> Self {
        Self { database, params }
    }

    pub fn is_slashable_block(
        &self,
        proposal: ProposalRecord,
    ) -> Result<Option<Slashing>, QueryError> {
        proposal.validate()?;

        let proposal = CompactBeaconBlock::from(Arc::new(proposal));

        let double_proposal = self
            .database
            .check_double_block_proposals(slice::from_ref(&proposal))?
            .into_iter()
            .next();

        if let Some(double_proposal) = double_proposal {
            return Ok(Some(Slashing::double_proposal(
                &double_proposal.existing,
                &double_proposal.proposal,
            )));
        }

        self.database.save_block_proposals(&[proposal])?;

        Ok(None)
    }

    pub fn is_slashable_attestation(
        &self,
        attestation: AttestationRecord,
    ) -> Result<Vec<Slashing>, QueryError> {
        attestation.validate()?;

        let attestation = CompactAttestation::from(Arc::new(attestation));

        let mut slashings = self
            .database
            .check_attester_double_votes(slice::from_ref(&attestation))?
            .into_iter()
            .map(|double_vote| {
                Slashing::double_vote(
                    double_vote.validator_index,
                    &double_vote.existing,
                    &double_vote.attestation,
                )
            })
            .collect_vec();

        slashings.extend(self.surround_votes(&attestation)?);

        let aliased = self.database.validators_with_aliased_records(&attestation)?;

        if !aliased.is_empty() {
            debug!(
                "not recording attestation over records for other targets \
                 (target: {}, validators: {aliased:?})",
                attestation.target,
            );
        }

        let not_recorded = slashings
            .iter()
            .map(|slashing| slashing.validator_index)
            .chain(aliased)
            .collect::<HashSet<_>>();

        let to_record = attestation.restricted_to(|validator_index| {
            !not_recorded.contains(&validator_index)
        });

        if !to_record.attesting_indices.is_empty() {
            self.database.save_attestation_records(&[to_record])?;
        }

        Ok(slashings)
    }

    pub fn highest_attestations(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<HighestAttestation>, QueryError> {
        Ok(self.database.highest_attestations(validator_indices)?)
    }

    // Reads the stored span chunks at the source epoch without updating them. The attestation's
    // target stands in for the current epoch.
    fn surround_votes(&self, attestation: &CompactAttestation) -> Result<Vec<Slashing>> {
        let params = self.params;

        if attestation.source < params.window_start(attestation.target) {
            return Ok(vec![]);
        }

        let chunk_index = params.chunk_index(attestation.source);
        let mut slashings = vec![];

        for (validator_chunk_index, validator_indices) in &attestation
            .attesting_indices
            .iter()
            .copied()
            .chunk_by(|validator_index| params.validator_chunk_index(*validator_index))
        {
            let key = params.chunk_key(validator_chunk_index, chunk_index);
            let validator_indices = validator_indices.collect_vec();

            for kind in ChunkKind::ALL {
                let Some(chunk) = self.database.load_slasher_chunks(kind, &[key])?.pop().flatten()
                else {
                    continue;
                };

                for validator_index in validator_indices.iter().copied() {
                    slashings.extend(chunk.check_slashable(
                        params,
                        &*self.database,
                        validator_index,
                        attestation,
                    )?);
                }
            }
        }

        Ok(slashings)
    }
}
