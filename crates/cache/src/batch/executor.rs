// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::batch::{
    BatchErrorHandler, BatchOp, BatchReport, DefaultErrorHandler, ErrorAction, Partitioner,
};
use crate::config::BatchConfig;
use crate::engine::Engine;
use crate::error::Error;
use crate::notify::{ChangeEvent, EventKind};
use crate::provider::Mutation;
use crate::record::{AsOf, TimeRange, Timestamp, VersionToken, VersionedRecord};
use crate::registry::{EntityCache, EntityName};
use crate::tx::{Isolation, Transaction, TxOptions};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

enum WorkerMsg {
    Unit(Vec<BatchOp>),
}

/// State shared by the submitting thread and every worker.
struct Progress {
    queued: AtomicUsize,
    processed: AtomicUsize,
    /// First fatal failure, by partition.
    failure: Mutex<Option<(usize, Error)>>,
    last_log: Mutex<minstant::Instant>,
}

impl Progress {
    fn record_failure(&self, partition: usize, error: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some((partition, error));
        }
    }

    fn maybe_log(&self, entity: &EntityName, interval: std::time::Duration) {
        let Some(mut last) = self.last_log.try_lock() else {
            return;
        };
        if last.elapsed() < interval {
            return;
        }
        *last = minstant::Instant::now();
        let queued = self.queued.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed);
        info!(
            %entity,
            "Processed {} of {} operations. {} still in queue.",
            processed,
            queued,
            queued.saturating_sub(processed)
        );
    }
}

struct Worker {
    partition: usize,
    engine: Arc<Engine>,
    cache: Arc<EntityCache>,
    config: BatchConfig,
    handler: Arc<dyn BatchErrorHandler>,
    progress: Arc<Progress>,
    report: BatchReport,
    bulk: Vec<VersionedRecord>,
}

impl Worker {
    fn run(mut self, receiver: Receiver<WorkerMsg>) -> BatchReport {
        while let Ok(msg) = receiver.recv() {
            match msg {
                WorkerMsg::Unit(ops) => self.process(ops),
            }
            self.progress
                .maybe_log(self.cache.name(), self.config.log_interval);
        }
        self.flush_bulk();
        debug!(partition = self.partition, units = self.report.units, "Batch worker exiting");
        self.report
    }

    fn process(&mut self, ops: Vec<BatchOp>) {
        if !self.config.bulk_insert {
            self.run_unit(ops);
            return;
        }
        // Inserts go to the bulk buffer, everything else runs transactionally. Switching between
        // the two drains the other side first so the partition still sees submission order.
        let mut run = vec![];
        for op in ops {
            match op {
                BatchOp::Insert(record) => {
                    if !run.is_empty() {
                        self.run_unit(std::mem::take(&mut run));
                    }
                    self.bulk.push(record);
                    if self.bulk.len() >= self.config.bulk_batch_size {
                        self.flush_bulk();
                    }
                }
                op => {
                    self.flush_bulk();
                    run.push(op);
                }
            }
        }
        if !run.is_empty() {
            self.run_unit(run);
        }
    }

    fn options(&self) -> TxOptions {
        TxOptions::default().with_isolation(self.cache.name(), Isolation::OptimisticReadCache)
    }

    /// Run one unit in its own transaction, consulting the error handler until it commits or is
    /// given up on.
    fn run_unit(&mut self, mut ops: Vec<BatchOp>) {
        let entity = self.cache.name().clone();
        let mut attempt = 1;
        loop {
            let result = self
                .engine
                .execute(self.options(), |tx| apply_ops(tx, &entity, &ops));
            let error = match result {
                Ok(()) => {
                    self.report.units += 1;
                    self.report.count(&ops);
                    self.progress.processed.fetch_add(ops.len(), Ordering::Relaxed);
                    return;
                }
                Err(e) => e,
            };
            let action = self.handler.on_error(self.partition, attempt, &ops, &error);
            debug!(partition = self.partition, attempt, %action, %error, "Batch unit failed");
            match action {
                ErrorAction::Requeue => {}
                ErrorAction::RefreshAndRequeue => {
                    if let Err(e) = self.refresh(&mut ops) {
                        warn!(
                            partition = self.partition,
                            error = %e,
                            "Refresh before requeue failed"
                        );
                    }
                }
                ErrorAction::Skip => {
                    warn!(
                        partition = self.partition,
                        ops = ops.len(),
                        %error,
                        "Skipping batch unit"
                    );
                    self.report.skipped += ops.len();
                    self.progress.processed.fetch_add(ops.len(), Ordering::Relaxed);
                    return;
                }
                ErrorAction::Fail => {
                    error!(partition = self.partition, attempt, %error, "Batch unit failed");
                    self.progress.processed.fetch_add(ops.len(), Ordering::Relaxed);
                    self.progress.record_failure(self.partition, error);
                    return;
                }
            }
            attempt += 1;
            self.report.retries += 1;
        }
    }

    /// Reload the unit's keys, then point updates at the records that are current now.
    fn refresh(&self, ops: &mut [BatchOp]) -> Result<(), Error> {
        let entity = self.cache.name();
        let keys: Vec<_> = ops.iter().map(|op| op.key().clone()).collect();
        self.engine.refresh(entity, &keys)?;
        for op in ops.iter_mut() {
            if let BatchOp::Update { old, .. } = op {
                let as_of = AsOf::at(old.business.from);
                if let Some(current) = self.engine.find(entity, &old.primary_key, as_of)? {
                    *old = VersionedRecord::clone(&current);
                }
            }
        }
        Ok(())
    }

    /// Write accumulated inserts straight through, then add them to the index without per-row
    /// overlap checks. Overlaps are collected afterwards and reported.
    fn flush_bulk(&mut self) {
        if self.bulk.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.bulk);
        let count = records.len();
        let entity = self.cache.name().clone();
        let shape = self.cache.shape();
        let tx = self.engine.allocate_tx_id();
        let commit_time = self.engine.clock().tick();
        let records: Vec<VersionedRecord> = records
            .into_iter()
            .map(|mut r| {
                r.system = if shape.tracks_processing() {
                    TimeRange::open(commit_time)
                } else {
                    TimeRange::all()
                };
                if !shape.tracks_business() {
                    r.business = TimeRange::all();
                }
                r.version = VersionToken::initial(self.cache.def().versioning, commit_time);
                r
            })
            .collect();

        let mutations: Vec<_> = records
            .iter()
            .map(|r| (entity.clone(), Mutation::Insert(r.clone())))
            .collect();
        let provider = self.engine.provider();
        if let Err(e) = provider
            .write(tx, &mutations)
            .and_then(|_| provider.commit(tx))
        {
            provider.rollback(tx);
            error!(partition = self.partition, rows = count, error = %e, "Bulk insert failed");
            self.progress.processed.fetch_add(count, Ordering::Relaxed);
            self.progress.record_failure(self.partition, e);
            return;
        }

        let mut index = self.cache.index().write();
        for record in &records {
            index.put_semi_unique(record.clone());
        }
        let overlaps = index.collect_milestoning_overlaps();
        drop(index);
        self.cache.bump_update_count();
        if !overlaps.is_empty() {
            warn!(partition = self.partition, %entity, overlaps = overlaps.len(),
                "Bulk insert produced overlapping rows");
        }

        let source = self.cache.def().source_attribute.clone();
        let events = records
            .into_iter()
            .map(|r| {
                let source = source.as_deref().and_then(|a| r.payload.get(a).cloned());
                ChangeEvent::new(entity.clone(), EventKind::Insert, tx)
                    .with_keys(vec![r.primary_key.clone()])
                    .with_snapshots(vec![r])
                    .with_source(source)
            })
            .collect();
        self.engine.notifications().publish(events);

        self.report.units += 1;
        self.report.inserted += count;
        self.report.overlaps.extend(overlaps);
        self.progress.processed.fetch_add(count, Ordering::Relaxed);
        debug!(partition = self.partition, rows = count, "Bulk inserted");
    }
}

fn apply_ops(tx: &mut Transaction, entity: &EntityName, ops: &[BatchOp]) -> Result<(), Error> {
    for op in ops {
        match op {
            BatchOp::Insert(record) => tx.insert(
                entity,
                &record.primary_key,
                record.business.from,
                record.payload.clone(),
            )?,
            BatchOp::Update { old, new } => {
                tx.observe(entity, old)?;
                tx.update(entity, &old.primary_key, new.business.from, new.payload.clone())?;
            }
            BatchOp::Terminate { record, at } => tx.terminate(entity, &record.primary_key, *at)?,
        }
    }
    Ok(())
}

/// Spreads inserts, updates and terminations of one entity over a pool of workers, one per
/// partition. Operations are grouped per partition and handed over `batch_size` at a time; call
/// [`wait_until_finished`](Self::wait_until_finished) to submit the rest and collect the outcome.
pub struct PartitionedExecutor {
    entity: EntityName,
    partitioner: Partitioner,
    batch_size: usize,
    pending: Vec<Vec<BatchOp>>,
    senders: Vec<Sender<WorkerMsg>>,
    handles: Vec<JoinHandle<BatchReport>>,
    progress: Arc<Progress>,
}

impl PartitionedExecutor {
    /// Hash partitioning with the engine's batch configuration.
    pub fn new(engine: &Arc<Engine>, entity: &EntityName) -> Result<Self, Error> {
        let config = engine.config().batch.clone();
        let handler = Arc::new(DefaultErrorHandler::new(config.max_attempts));
        Self::with_config(engine, entity, Partitioner::Hash, config, handler)
    }

    pub fn with_config(
        engine: &Arc<Engine>,
        entity: &EntityName,
        partitioner: Partitioner,
        config: BatchConfig,
        handler: Arc<dyn BatchErrorHandler>,
    ) -> Result<Self, Error> {
        let cache = engine.registry().get(entity)?;
        let partitions = partitioner.partitions(config.workers);
        let progress = Arc::new(Progress {
            queued: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            failure: Mutex::new(None),
            last_log: Mutex::new(minstant::Instant::now()),
        });
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (sender, receiver) = flume::unbounded();
            let worker = Worker {
                partition,
                engine: engine.clone(),
                cache: cache.clone(),
                config: config.clone(),
                handler: handler.clone(),
                progress: progress.clone(),
                report: BatchReport::default(),
                bulk: vec![],
            };
            let handle = std::thread::Builder::new()
                .name(format!("tempora-batch-{partition}"))
                .spawn(move || worker.run(receiver))
                .map_err(|e| Error::InvalidState(format!("failed to spawn batch worker: {e}")))?;
            senders.push(sender);
            handles.push(handle);
        }
        info!(%entity, partitions, bulk = config.bulk_insert, "Started batch executor");
        Ok(Self {
            entity: entity.clone(),
            partitioner,
            batch_size: config.batch_size.max(1),
            pending: vec![Vec::new(); partitions],
            senders,
            handles,
            progress,
        })
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    fn check_failed(&self) -> Result<(), Error> {
        match &*self.progress.failure.lock() {
            Some((partition, error)) => Err(Error::PartitionWorkerFailure {
                partition: *partition,
                source: Box::new(error.clone()),
            }),
            None => Ok(()),
        }
    }

    fn add(&mut self, op: BatchOp) -> Result<(), Error> {
        self.check_failed()?;
        let partition = self.partitioner.partition_of(op.key(), self.partitions());
        self.progress.queued.fetch_add(1, Ordering::Relaxed);
        self.pending[partition].push(op);
        if self.pending[partition].len() >= self.batch_size {
            self.submit(partition)?;
        }
        Ok(())
    }

    fn submit(&mut self, partition: usize) -> Result<(), Error> {
        let ops = std::mem::take(&mut self.pending[partition]);
        if ops.is_empty() {
            return Ok(());
        }
        self.senders[partition]
            .send(WorkerMsg::Unit(ops))
            .map_err(|_| Error::PartitionWorkerFailure {
                partition,
                source: Box::new(Error::Shutdown),
            })
    }

    pub fn add_for_insert(&mut self, record: VersionedRecord) -> Result<(), Error> {
        self.add(BatchOp::Insert(record))
    }

    /// `old` is the record as read; the unit conflicts if it changed in the meantime.
    pub fn add_for_update(
        &mut self,
        old: VersionedRecord,
        new: VersionedRecord,
    ) -> Result<(), Error> {
        self.add(BatchOp::Update { old, new })
    }

    /// End `record` at its own business start; for entities without a business axis, delete it.
    pub fn add_for_termination(&mut self, record: VersionedRecord) -> Result<(), Error> {
        let at = record.business.from;
        self.add(BatchOp::Terminate { record, at })
    }

    pub fn add_for_termination_at(
        &mut self,
        record: VersionedRecord,
        at: Timestamp,
    ) -> Result<(), Error> {
        self.add(BatchOp::Terminate { record, at })
    }

    /// Submit what is left, wait for every worker to drain, and report. The first fatal failure
    /// is returned once all workers are done.
    pub fn wait_until_finished(mut self) -> Result<BatchReport, Error> {
        for partition in 0..self.partitions() {
            self.submit(partition)?;
        }
        let report = self.join();
        let queued = self.progress.queued.load(Ordering::Relaxed);
        if let Some((partition, error)) = self.progress.failure.lock().take() {
            error!(entity = %self.entity, partition, %error, "Batch finished with failures");
            return Err(Error::PartitionWorkerFailure {
                partition,
                source: Box::new(error),
            });
        }
        info!(
            entity = %self.entity,
            "Finished processing {} operations. Inserted {}, updated {}, terminated {}.",
            queued,
            report.inserted,
            report.updated,
            report.terminated
        );
        Ok(report)
    }

    fn join(&mut self) -> BatchReport {
        self.senders.clear();
        let mut report = BatchReport::default();
        for (partition, handle) in self.handles.drain(..).enumerate() {
            match handle.join() {
                Ok(r) => report.merge(r),
                Err(_) => {
                    error!(partition, "Batch worker panicked");
                    self.progress.record_failure(
                        partition,
                        Error::InvalidState("batch worker panicked".to_string()),
                    );
                }
            }
        }
        report
    }
}

impl Drop for PartitionedExecutor {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.join();
        }
    }
}
