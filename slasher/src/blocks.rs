use std::collections::{hash_map::Entry, HashMap, HashSet};

use anyhow::Result;
use itertools::Itertools as _;

use crate::{
    primitives::{Slot, ValidatorIndex},
    records::CompactBeaconBlock,
    slasher_db::SlasherDatabase,
    status::Slashing,
};

/// Finds double proposals and records the proposals that are not part of one.
pub fn process_proposals<D: SlasherDatabase + ?Sized>(
    database: &D,
    proposals: &[CompactBeaconBlock],
    slashings: &mut Vec<Slashing>,
) -> Result<()> {
    let mut first_seen = HashMap::<(Slot, ValidatorIndex), &CompactBeaconBlock>::new();
    let mut slashable = HashSet::new();
    let mut unique = vec![];

    for proposal in proposals {
        let key = (proposal.slot, proposal.proposer_index);

        match first_seen.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(proposal);
                unique.push(proposal.clone());
            }
            Entry::Occupied(entry) => {
                let existing = entry.get();

                if existing.signing_root != proposal.signing_root {
                    slashings.push(Slashing::double_proposal(&existing.record, &proposal.record));
                    slashable.insert(key);
                }
            }
        }
    }

    for double_proposal in database.check_double_block_proposals(&unique)? {
        let proposal = &double_proposal.proposal;

        slashings.push(Slashing::double_proposal(&double_proposal.existing, proposal));
        slashable.insert((proposal.slot(), proposal.proposer_index()));
    }

    // A proposal that is part of a double proposal must not become the stored reference.
    let to_record = unique
        .into_iter()
        .filter(|proposal| !slashable.contains(&(proposal.slot, proposal.proposer_index)))
        .collect_vec();

    database.save_block_proposals(&to_record)
}
