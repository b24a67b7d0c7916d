use std::sync::Arc;

use async_channel::{Sender, TrySendError};
use futures::channel::mpsc::UnboundedSender;
use log::warn;

use crate::{
    primitives::Epoch,
    records::{AttestationRecord, ProposalRecord},
    status::Slashing,
};

pub enum NetworkToSlasher {
    Attestation(Arc<AttestationRecord>),
    Block(Arc<ProposalRecord>),
}

impl NetworkToSlasher {
    /// Never waits. Messages that do not fit in the channel are dropped.
    pub fn send(self, tx: &Sender<Self>) {
        match tx.try_send(self) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("slasher ingestion channel is full; dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("send to slasher failed because the receiver was dropped");
            }
        }
    }
}

pub enum ValidatorToSlasher {
    Epoch(Epoch),
}

impl ValidatorToSlasher {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to slasher failed because the receiver was dropped");
        }
    }
}

pub enum SlasherToValidator {
    Slashing(Slashing),
}

impl SlasherToValidator {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to validator failed because the receiver was dropped");
        }
    }
}
