use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{Error as AnyhowError, Result};
use async_channel::{Receiver, Sender};
use derive_more::Display;
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
    select,
    stream::StreamExt as _,
};
use itertools::Itertools as _;
use log::{debug, info, warn};
use rayon::iter::{IntoParallelIterator as _, ParallelIterator as _};

use crate::{
    attestations, blocks,
    params::{Params, ParamsError, ValidatorChunkIndex},
    primitives::Epoch,
    queue::IngestionQueue,
    records::{AttestationRecord, CompactAttestation, CompactBeaconBlock, ProposalRecord},
    rpc::SlashingChecker,
    slasher_db::SlasherDatabase,
    spans,
    status::{Slashing, SlashingKey},
    NetworkToSlasher, SlasherConfig, SlasherToValidator, ValidatorToSlasher,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum ProcessingStage {
    #[display("proposals")]
    Proposals,
    #[display("attestations for validator chunk {_0}")]
    Attestations(ValidatorChunkIndex),
    #[display("pruning")]
    Pruning,
}

#[derive(Debug)]
pub struct GroupFailure {
    pub stage: ProcessingStage,
    pub error: AnyhowError,
}

/// Outcome of processing the queues for one epoch.
///
/// Slashings found in a group before it failed are included.
#[derive(Debug)]
pub struct ProcessingReport {
    pub current_epoch: Epoch,
    pub slashings: Vec<Slashing>,
    pub deferred_attestations: usize,
    pub stale_attestations: usize,
    pub failures: Vec<GroupFailure>,
}

pub fn ingestion_channel(
    config: SlasherConfig,
) -> Result<(Sender<NetworkToSlasher>, Receiver<NetworkToSlasher>), ParamsError> {
    config.params()?;
    Ok(async_channel::bounded(config.queue_capacity))
}

pub struct Slasher<D> {
    params: Params,
    slots_per_epoch: u64,
    database: Arc<D>,
    attestation_queue: IngestionQueue<Arc<AttestationRecord>>,
    proposal_queue: IngestionQueue<Arc<ProposalRecord>>,
    reported: HashMap<SlashingKey, Epoch>,
    slasher_to_validator_tx: UnboundedSender<SlasherToValidator>,
    network_to_slasher_rx: Receiver<NetworkToSlasher>,
    validator_to_slasher_rx: UnboundedReceiver<ValidatorToSlasher>,
}

impl<D: SlasherDatabase> Slasher<D> {
    pub fn new(
        config: SlasherConfig,
        database: Arc<D>,
        slasher_to_validator_tx: UnboundedSender<SlasherToValidator>,
        network_to_slasher_rx: Receiver<NetworkToSlasher>,
        validator_to_slasher_rx: UnboundedReceiver<ValidatorToSlasher>,
    ) -> Result<Self> {
        Ok(Self {
            params: config.params()?,
            slots_per_epoch: config.slots_per_epoch,
            database,
            attestation_queue: IngestionQueue::default(),
            proposal_queue: IngestionQueue::default(),
            reported: HashMap::new(),
            slasher_to_validator_tx,
            network_to_slasher_rx,
            validator_to_slasher_rx,
        })
    }

    /// Returns a handle for synchronous queries backed by the same database.
    #[must_use]
    pub fn checker(&self) -> SlashingChecker<D> {
        SlashingChecker::new(Arc::clone(&self.database), self.params)
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            select! {
                network_message = self.network_to_slasher_rx.select_next_some() => {
                    self.accept(network_message);
                },

                validator_message = self.validator_to_slasher_rx.select_next_some() => {
                    match validator_message {
                        ValidatorToSlasher::Epoch(epoch) => {
                            self.accept_pending();

                            let report = self.process_queues(epoch);

                            debug!(
                                "slasher processed epoch {} \
                                 (slashings: {}, deferred attestations: {}, \
                                 stale attestations: {}, failures: {})",
                                report.current_epoch,
                                report.slashings.len(),
                                report.deferred_attestations,
                                report.stale_attestations,
                                report.failures.len(),
                            );
                        }
                    }
                },

                complete => break Ok(()),
            }
        }
    }

    /// Processes everything queued for `current_epoch` and emits new slashings.
    ///
    /// Attestations with targets after `current_epoch` stay queued. Attestations with targets
    /// before the history window are dropped.
    pub fn process_queues(&mut self, current_epoch: Epoch) -> ProcessingReport {
        let database = &*self.database;
        let params = self.params;
        let mut slashings = vec![];
        let mut failures = vec![];

        let proposals = self
            .proposal_queue
            .begin_drain()
            .into_iter()
            .map(CompactBeaconBlock::from)
            .collect_vec();

        if let Err(error) = blocks::process_proposals(database, &proposals, &mut slashings) {
            failures.push(GroupFailure {
                stage: ProcessingStage::Proposals,
                error,
            });
        }

        self.proposal_queue.end_drain(vec![]);

        let window_start = params.window_start(current_epoch);
        let mut deferred = vec![];
        let mut stale_attestations = 0;
        let mut groups = BTreeMap::<_, Vec<_>>::new();

        for record in self.attestation_queue.begin_drain() {
            if record.target() > current_epoch {
                deferred.push(record);
                continue;
            }

            if record.target() < window_start {
                debug!(
                    "dropping attestation outside the history window \
                     (source: {}, target: {}, current epoch: {current_epoch})",
                    record.source(),
                    record.target(),
                );

                stale_attestations += 1;
                continue;
            }

            let attestation = CompactAttestation::from(record);

            let validator_chunk_indices = attestation
                .attesting_indices
                .iter()
                .map(|validator_index| params.validator_chunk_index(*validator_index))
                .dedup()
                .collect_vec();

            for validator_chunk_index in validator_chunk_indices {
                groups.entry(validator_chunk_index).or_default().push(
                    attestation.restricted_to(|validator_index| {
                        params.validator_chunk_index(validator_index) == validator_chunk_index
                    }),
                );
            }
        }

        let group_results = groups
            .into_par_iter()
            .map(|(validator_chunk_index, attestations)| {
                let mut slashings = vec![];

                let result = process_attestation_group(
                    database,
                    params,
                    validator_chunk_index,
                    &attestations,
                    current_epoch,
                    &mut slashings,
                );

                (validator_chunk_index, slashings, result)
            })
            .collect::<Vec<_>>();

        for (validator_chunk_index, group_slashings, result) in group_results {
            slashings.extend(group_slashings);

            if let Err(error) = result {
                failures.push(GroupFailure {
                    stage: ProcessingStage::Attestations(validator_chunk_index),
                    error,
                });
            }
        }

        let deferred_attestations = deferred.len();
        self.attestation_queue.end_drain(deferred);

        match self.prune(current_epoch) {
            Ok((attestations, proposals)) if attestations + proposals > 0 => {
                debug!("pruned {attestations} attestation records and {proposals} proposals");
            }
            Ok(_) => {}
            Err(error) => failures.push(GroupFailure {
                stage: ProcessingStage::Pruning,
                error,
            }),
        }

        for failure in &failures {
            warn!(
                "slasher failed to process {} at epoch {current_epoch}: {:?}",
                failure.stage, failure.error,
            );
        }

        let slashings = self.report_new(slashings, window_start);

        ProcessingReport {
            current_epoch,
            slashings,
            deferred_attestations,
            stale_attestations,
            failures,
        }
    }

    fn accept(&mut self, message: NetworkToSlasher) {
        match message {
            NetworkToSlasher::Attestation(attestation) => {
                self.attestation_queue.push(attestation);
            }
            NetworkToSlasher::Block(proposal) => {
                self.proposal_queue.push(proposal);
            }
        }
    }

    fn accept_pending(&mut self) {
        while let Ok(message) = self.network_to_slasher_rx.try_recv() {
            self.accept(message);
        }
    }

    fn prune(&self, current_epoch: Epoch) -> Result<(usize, usize)> {
        let history_length = self.params.history_length();
        let attestations = self
            .database
            .prune_attestations(current_epoch, history_length)?;
        let proposals = self.database.prune_proposals(current_epoch, history_length)?;
        Ok((attestations, proposals))
    }

    // The same offence can be found twice in one batch or again in a later one.
    fn report_new(&mut self, slashings: Vec<Slashing>, window_start: Epoch) -> Vec<Slashing> {
        let slots_per_epoch = self.slots_per_epoch;

        self.reported.retain(|_, epoch| *epoch >= window_start);

        let new_slashings = slashings
            .into_iter()
            .filter(|slashing| {
                self.reported
                    .insert(slashing.key(), slashing.epoch(slots_per_epoch))
                    .is_none()
            })
            .collect_vec();

        for slashing in &new_slashings {
            info!(
                "{} slashing detected (validator: {}, at: {:?}, signing roots: {:?} and {:?})",
                slashing.kind,
                slashing.validator_index,
                slashing.at,
                slashing.prev_signing_root,
                slashing.signing_root,
            );

            SlasherToValidator::Slashing(slashing.clone()).send(&self.slasher_to_validator_tx);
        }

        new_slashings
    }
}

fn process_attestation_group<D: SlasherDatabase + ?Sized>(
    database: &D,
    params: Params,
    validator_chunk_index: ValidatorChunkIndex,
    attestations: &[CompactAttestation],
    current_epoch: Epoch,
    slashings: &mut Vec<Slashing>,
) -> Result<()> {
    let to_record = attestations::check_double_votes(database, attestations, slashings)?;

    database.save_attestation_records(&to_record)?;

    spans::update_spans(
        database,
        params,
        validator_chunk_index,
        attestations,
        current_epoch,
        slashings,
    )
}
