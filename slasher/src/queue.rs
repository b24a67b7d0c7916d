use core::fmt::Display;
use std::sync::Arc;

use log::debug;

use crate::records::{AttestationRecord, InvalidAttestation, InvalidProposal, ProposalRecord};

pub trait Validate {
    type Error: Display;

    fn validate(&self) -> Result<(), Self::Error>;
}

impl Validate for Arc<AttestationRecord> {
    type Error = InvalidAttestation;

    fn validate(&self) -> Result<(), Self::Error> {
        AttestationRecord::validate(self)
    }
}

impl Validate for Arc<ProposalRecord> {
    type Error = InvalidProposal;

    fn validate(&self) -> Result<(), Self::Error> {
        ProposalRecord::validate(self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum QueueState {
    #[default]
    Idle,
    Accumulating,
    Draining,
}

/// Items waiting for the next epoch tick.
///
/// Malformed items are dropped when pushed. A drain takes every queued item at once. Items handed
/// back by [`IngestionQueue::end_drain`] are kept for the next drain ahead of anything pushed in
/// the meantime.
#[derive(Debug)]
pub struct IngestionQueue<T> {
    items: Vec<T>,
    state: QueueState,
}

impl<T> Default for IngestionQueue<T> {
    fn default() -> Self {
        Self {
            items: vec![],
            state: QueueState::Idle,
        }
    }
}

impl<T: Validate> IngestionQueue<T> {
    /// Returns `false` if `item` was malformed and dropped.
    pub fn push(&mut self, item: T) -> bool {
        if let Err(error) = item.validate() {
            debug!("dropping malformed slasher input: {error}");
            return false;
        }

        self.items.push(item);

        if self.state == QueueState::Idle {
            self.state = QueueState::Accumulating;
        }

        true
    }
}

impl<T> IngestionQueue<T> {
    pub fn begin_drain(&mut self) -> Vec<T> {
        self.state = QueueState::Draining;
        core::mem::take(&mut self.items)
    }

    pub fn end_drain(&mut self, deferred: Vec<T>) {
        let pushed = core::mem::replace(&mut self.items, deferred);
        self.items.extend(pushed);

        self.state = if self.items.is_empty() {
            QueueState::Idle
        } else {
            QueueState::Accumulating
        };
    }

    #[must_use]
    pub const fn state(&self) -> QueueState {
        self.state
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
