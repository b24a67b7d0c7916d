use derive_more::Display;

use crate::{
    primitives::{Epoch, Slot, ValidatorIndex, H256},
    records::{AttestationRecord, AttesterSlashing, ProposalRecord, ProposerSlashing},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum SlashingKind {
    DoubleVote,
    Surrounding,
    Surrounded,
    DoubleProposal,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SlashedAt {
    TargetEpoch(Epoch),
    Slot(Slot),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Evidence {
    Attester(Box<AttesterSlashing>),
    Proposer(Box<ProposerSlashing>),
}

/// A detected offence.
///
/// `prev_signing_root` belongs to the message that was seen first. The evidence lists that
/// message first as well.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Slashing {
    pub kind: SlashingKind,
    pub validator_index: ValidatorIndex,
    pub at: SlashedAt,
    pub signing_root: H256,
    pub prev_signing_root: H256,
    pub evidence: Evidence,
}

/// Identifies an offence independently of the order its two messages were seen in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlashingKey {
    offence: Offence,
    validator_index: ValidatorIndex,
    roots: (H256, H256),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum Offence {
    DoubleVote,
    SurroundVote,
    DoubleProposal,
}

impl Slashing {
    #[must_use]
    pub fn double_vote(
        validator_index: ValidatorIndex,
        existing: &AttestationRecord,
        attestation: &AttestationRecord,
    ) -> Self {
        Self::attester(SlashingKind::DoubleVote, validator_index, existing, attestation)
    }

    #[must_use]
    pub fn surround_vote(
        kind: SlashingKind,
        validator_index: ValidatorIndex,
        existing: &AttestationRecord,
        attestation: &AttestationRecord,
    ) -> Self {
        Self::attester(kind, validator_index, existing, attestation)
    }

    #[must_use]
    pub fn double_proposal(existing: &ProposalRecord, proposal: &ProposalRecord) -> Self {
        Self {
            kind: SlashingKind::DoubleProposal,
            validator_index: proposal.proposer_index(),
            at: SlashedAt::Slot(proposal.slot()),
            signing_root: proposal.signing_root,
            prev_signing_root: existing.signing_root,
            evidence: Evidence::Proposer(Box::new(ProposerSlashing {
                signed_header_1: existing.signed_header,
                signed_header_2: proposal.signed_header,
            })),
        }
    }

    #[must_use]
    pub fn key(&self) -> SlashingKey {
        let offence = match self.kind {
            SlashingKind::DoubleVote => Offence::DoubleVote,
            SlashingKind::Surrounding | SlashingKind::Surrounded => Offence::SurroundVote,
            SlashingKind::DoubleProposal => Offence::DoubleProposal,
        };

        let roots = if self.prev_signing_root <= self.signing_root {
            (self.prev_signing_root, self.signing_root)
        } else {
            (self.signing_root, self.prev_signing_root)
        };

        SlashingKey {
            offence,
            validator_index: self.validator_index,
            roots,
        }
    }

    #[must_use]
    pub const fn epoch(&self, slots_per_epoch: u64) -> Epoch {
        match self.at {
            SlashedAt::TargetEpoch(epoch) => epoch,
            SlashedAt::Slot(slot) => slot.epoch(slots_per_epoch),
        }
    }

    fn attester(
        kind: SlashingKind,
        validator_index: ValidatorIndex,
        existing: &AttestationRecord,
        attestation: &AttestationRecord,
    ) -> Self {
        Self {
            kind,
            validator_index,
            at: SlashedAt::TargetEpoch(attestation.target()),
            signing_root: attestation.signing_root,
            prev_signing_root: existing.signing_root,
            evidence: Evidence::Attester(Box::new(AttesterSlashing {
                attestation_1: existing.indexed_attestation.clone(),
                attestation_2: attestation.indexed_attestation.clone(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{attestation, proposal};

    use super::*;

    #[test]
    fn double_vote_key_does_not_depend_on_order() {
        let validator_index = ValidatorIndex::new(3);
        let first = attestation(1, 2, &[3], 1);
        let second = attestation(1, 2, &[3], 2);

        let forward = Slashing::double_vote(validator_index, &first, &second);
        let backward = Slashing::double_vote(validator_index, &second, &first);

        assert_ne!(forward, backward);
        assert_eq!(forward.key(), backward.key());
    }

    #[test]
    fn surrounding_and_surrounded_reports_of_the_same_pair_share_a_key() {
        let validator_index = ValidatorIndex::new(3);
        let outer = attestation(2, 10, &[3], 0);
        let inner = attestation(4, 8, &[3], 0);

        let surrounding =
            Slashing::surround_vote(SlashingKind::Surrounding, validator_index, &inner, &outer);
        let surrounded =
            Slashing::surround_vote(SlashingKind::Surrounded, validator_index, &outer, &inner);

        assert_eq!(surrounding.key(), surrounded.key());
        assert_eq!(surrounding.at, SlashedAt::TargetEpoch(Epoch::new(10)));
        assert_eq!(surrounded.at, SlashedAt::TargetEpoch(Epoch::new(8)));
    }

    #[test]
    fn double_proposal_evidence_lists_the_existing_header_first() {
        let existing = proposal(4, 1, 1);
        let slashing = Slashing::double_proposal(&existing, &proposal(4, 1, 2));

        let Evidence::Proposer(evidence) = &slashing.evidence else {
            panic!("double proposal should carry proposer evidence");
        };

        assert_eq!(evidence.signed_header_1, existing.signed_header);
        assert_eq!(slashing.epoch(32), Epoch::GENESIS);
        assert_eq!(slashing.validator_index, ValidatorIndex::new(1));
    }
}
