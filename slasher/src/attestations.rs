use std::collections::{hash_map::Entry, HashMap, HashSet};

use anyhow::Result;
use itertools::Itertools as _;

use crate::{
    primitives::{Epoch, ValidatorIndex},
    records::CompactAttestation,
    slasher_db::SlasherDatabase,
    status::Slashing,
};

/// Finds double votes within `attestations` and against stored records.
///
/// Slashings are pushed as soon as they are found so that a storage failure later on does not
/// lose them. Returns the attestations that should be recorded: for every validator and target
/// epoch the first one in the batch, unless a conflicting record is already stored.
pub fn check_double_votes<D: SlasherDatabase + ?Sized>(
    database: &D,
    attestations: &[CompactAttestation],
    slashings: &mut Vec<Slashing>,
) -> Result<Vec<CompactAttestation>> {
    let mut first_seen = HashMap::<(ValidatorIndex, Epoch), &CompactAttestation>::new();
    let mut first_seen_by = vec![vec![]; attestations.len()];

    for (position, attestation) in attestations.iter().enumerate() {
        for validator_index in attestation.attesting_indices.iter().copied() {
            match first_seen.entry((validator_index, attestation.target)) {
                Entry::Vacant(entry) => {
                    entry.insert(attestation);
                    first_seen_by[position].push(validator_index);
                }
                Entry::Occupied(entry) => {
                    let existing = entry.get();

                    if existing.signing_root != attestation.signing_root {
                        slashings.push(Slashing::double_vote(
                            validator_index,
                            &existing.record,
                            &attestation.record,
                        ));
                    }
                }
            }
        }
    }

    let conflicting = database
        .check_attester_double_votes(attestations)?
        .into_iter()
        .map(|double_vote| {
            slashings.push(Slashing::double_vote(
                double_vote.validator_index,
                &double_vote.existing,
                &double_vote.attestation,
            ));

            (double_vote.validator_index, double_vote.target_epoch)
        })
        .collect::<HashSet<_>>();

    let to_record = attestations
        .iter()
        .zip(first_seen_by)
        .filter_map(|(attestation, validator_indices)| {
            let attesting_indices = validator_indices
                .into_iter()
                .filter(|validator_index| {
                    !conflicting.contains(&(*validator_index, attestation.target))
                })
                .collect_vec();

            (!attesting_indices.is_empty()).then(|| CompactAttestation {
                attesting_indices,
                ..attestation.clone()
            })
        })
        .collect();

    Ok(to_record)
}

#[cfg(test)]
mod tests {
    use crate::{
        slasher_db::SlasherDatabase as _,
        status::SlashingKind,
        test_utils::{compact_attestation, in_memory_db, params},
    };

    use super::*;

    #[test]
    fn double_vote_within_batch_is_reported_once_in_either_order() -> Result<()> {
        let a = compact_attestation(1, 2, &[3], 1);
        let b = compact_attestation(1, 2, &[3], 2);

        for batch in [[a.clone(), b.clone()], [b.clone(), a.clone()]] {
            let database = in_memory_db(params());
            let mut slashings = vec![];

            check_double_votes(&database, &batch, &mut slashings)?;

            assert_eq!(slashings.len(), 1);
            assert_eq!(slashings[0].kind, SlashingKind::DoubleVote);
            assert_eq!(slashings[0].validator_index, ValidatorIndex::new(3));
            assert_eq!(slashings[0].prev_signing_root, batch[0].signing_root);
            assert_eq!(slashings[0].signing_root, batch[1].signing_root);
        }

        Ok(())
    }

    #[test]
    fn identical_attestations_are_not_double_votes() -> Result<()> {
        let database = in_memory_db(params());
        let attestation = compact_attestation(1, 2, &[3, 4], 1);
        let mut slashings = vec![];

        let to_record = check_double_votes(
            &database,
            &[attestation.clone(), attestation.clone()],
            &mut slashings,
        )?;

        assert!(slashings.is_empty());
        assert_eq!(to_record.len(), 1);
        assert_eq!(to_record[0].attesting_indices, attestation.attesting_indices);

        Ok(())
    }

    #[test]
    fn double_vote_against_stored_record_is_reported_and_not_recorded() -> Result<()> {
        let database = in_memory_db(params());
        let stored = compact_attestation(1, 2, &[3], 1);

        database.save_attestation_records(&[stored.clone()])?;

        let conflicting = compact_attestation(1, 2, &[3, 4], 2);
        let mut slashings = vec![];
        let to_record = check_double_votes(&database, &[conflicting], &mut slashings)?;

        assert_eq!(slashings.len(), 1);
        assert_eq!(slashings[0].prev_signing_root, stored.signing_root);
        assert_eq!(to_record.len(), 1);
        assert_eq!(to_record[0].attesting_indices, [ValidatorIndex::new(4)]);

        Ok(())
    }

    #[test]
    fn only_the_first_attestation_per_target_is_recorded() -> Result<()> {
        let database = in_memory_db(params());
        let first = compact_attestation(1, 2, &[3, 4], 1);
        let second = compact_attestation(1, 2, &[4, 5], 2);
        let mut slashings = vec![];

        let to_record = check_double_votes(&database, &[first, second], &mut slashings)?;

        let recorded = to_record
            .iter()
            .map(|attestation| (attestation.signing_root, attestation.attesting_indices.clone()))
            .collect_vec();

        assert_eq!(slashings.len(), 1);
        assert_eq!(
            recorded,
            [
                (to_record[0].signing_root, vec![ValidatorIndex::new(3), ValidatorIndex::new(4)]),
                (to_record[1].signing_root, vec![ValidatorIndex::new(5)]),
            ],
        );

        Ok(())
    }
}
