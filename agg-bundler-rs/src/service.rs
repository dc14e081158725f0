use crate::{
    chain::{self, BundleSimulation, ChainAdapter},
    config::AggregationConfig,
    error::Error,
    events::AggregatorEvent,
    query_group::QueryGroup,
    table::BundleTable,
    timer::SubmissionTimer,
};
use agg_rs::{
    signing,
    types::{Bundle, BundleRow, TransactionFailure},
};
use ethers::types::U256;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    future::Future,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch, Notify},
    task::JoinSet,
};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The aggregation engine: admits bundles, batches eligible rows into
/// aggregates, excises bundles whose declared reward does not cover
/// their on-chain cost, submits the rest, and tracks unconfirmed work.
///
/// Cheap to clone; all clones share one engine.
pub struct BundleService<C: ChainAdapter>(Arc<Inner<C>>);

impl<C: ChainAdapter> Clone for BundleService<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<C: ChainAdapter> Deref for BundleService<C> {
    type Target = Inner<C>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct Inner<C> {
    chain: Arc<C>,
    store: QueryGroup,
    config: AggregationConfig,
    events: broadcast::Sender<AggregatorEvent>,
    timer: SubmissionTimer,
    unconfirmed: parking_lot::Mutex<UnconfirmedState>,
    capacity_freed: Notify,
    confirmations: Notify,
    submissions_in_progress: AtomicUsize,
    stopping: watch::Sender<bool>,
    stopping_rx: watch::Receiver<bool>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
}

/// Volatile bookkeeping for aggregates submitted but not yet mined.
/// Rows named here are excluded from new batches, and the action total
/// backs the in-flight resource cap.
#[derive(Default)]
struct UnconfirmedState {
    next_submission_id: u64,
    aggregates: HashMap<u64, UnconfirmedAggregate>,
    row_ids: HashSet<u64>,
    action_count: u64,
}

struct UnconfirmedAggregate {
    row_ids: Vec<u64>,
    action_count: u64,
}

impl UnconfirmedState {
    fn reserve(&mut self, row_ids: Vec<u64>, action_count: u64) -> u64 {
        let submission_id = self.next_submission_id;
        self.next_submission_id += 1;
        self.row_ids.extend(&row_ids);
        self.action_count += action_count;
        self.aggregates.insert(submission_id, UnconfirmedAggregate { row_ids, action_count });
        submission_id
    }

    fn release(&mut self, submission_id: u64) {
        if let Some(aggregate) = self.aggregates.remove(&submission_id) {
            for row_id in aggregate.row_ids {
                self.row_ids.remove(&row_id);
            }
            self.action_count -= aggregate.action_count;
        }
        debug_assert_eq!(
            self.action_count,
            self.aggregates.values().map(|aggregate| aggregate.action_count).sum::<u64>()
        );
    }
}

struct PreparedAggregate {
    bundle: Bundle,
    rows: Vec<BundleRow>,
}

enum Augment {
    /// Every measured candidate pays its way; the aggregate is complete
    /// for this pass.
    Complete { included: Vec<BundleRow> },
    /// The prefix before the culprit was admitted; the culprit must be
    /// excised before anything else happens.
    Failed { included: Vec<BundleRow>, failed: BundleRow },
}

struct PrefixCheck {
    success: bool,
    reward: U256,
    required: U256,
}

impl<C: ChainAdapter> BundleService<C> {
    /// Construct the service and start its background loops: the
    /// submission timer, the submission runner, and the block tick.
    pub fn spawn(chain: Arc<C>, table: BundleTable, config: AggregationConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (stopping, stopping_rx) = watch::channel(false);
        let (fire, fired) = mpsc::channel(1);
        let (timer, timer_task) =
            SubmissionTimer::new(config.max_aggregation_delay(), fire, stopping_rx.clone());
        let store = QueryGroup::new(table, events.clone());

        let service = Self(Arc::new(Inner {
            chain,
            store,
            config,
            events,
            timer,
            unconfirmed: Default::default(),
            capacity_freed: Notify::new(),
            confirmations: Notify::new(),
            submissions_in_progress: AtomicUsize::new(0),
            stopping,
            stopping_rx,
            tasks: parking_lot::Mutex::new(JoinSet::new()),
        }));

        service.spawn_tracked(timer_task);
        let this = service.clone();
        service.spawn_tracked(async move { this.submission_loop(fired).await });
        let this = service.clone();
        service.spawn_tracked(async move { this.block_tick_loop().await });
        service
    }

    /// Admit a bundle. An empty list means the bundle was persisted and
    /// will be considered for the next aggregate; failures are returned
    /// to the caller and nothing is stored.
    pub async fn add_bundle(&self, bundle: Bundle) -> Result<Vec<TransactionFailure>, Error> {
        if *self.stopping_rx.borrow() {
            return Err(Error::Stopping);
        }
        if bundle.operations.is_empty() {
            return Ok(vec![TransactionFailure::InvalidFormat {
                description: "bundle contains no operations".to_string(),
            }]);
        }
        if !bundle.is_well_formed() {
            return Ok(vec![TransactionFailure::InvalidFormat {
                description: format!(
                    "{} operations paired with {} sender keys",
                    bundle.operations.len(),
                    bundle.sender_public_keys.len()
                ),
            }]);
        }
        if signing::verify_bundle(&bundle).is_err() {
            return Ok(vec![TransactionFailure::InvalidSignature]);
        }
        let failures = self.chain.check_nonces(&bundle).await?;
        if !failures.is_empty() {
            return Ok(failures);
        }

        let public_key_shorts = bundle.public_key_shorts();
        let row_id = {
            let group = self.store.lock().await?;
            let block_number = self.chain.block_number().await?;
            let mut row = BundleRow::new(bundle, block_number);
            group.add(&mut row)?;
            group.commit()?;
            row.id
        };
        debug!(row_id, "bundle admitted");
        self.emit(AggregatorEvent::BundleAdded { public_key_shorts });
        self.schedule_try_aggregating();
        Ok(vec![])
    }

    /// Re-evaluate the timer against the current eligible backlog. Cheap
    /// and idempotent between state changes.
    async fn try_aggregating(&self) {
        if self.submissions_in_progress.load(Ordering::SeqCst) > 0 {
            // a fresh pass is scheduled unconditionally after every submission
            return;
        }
        let outcome: Result<(), Error> = async {
            let block_number = self.chain.block_number().await?;
            let eligible = {
                let group = self.store.lock().await?;
                let rows = group.find_eligible(block_number, self.config.bundle_query_limit)?;
                group.commit()?;
                rows
            };
            let action_total: usize = {
                let unconfirmed = self.unconfirmed.lock();
                eligible
                    .iter()
                    .filter(|row| !unconfirmed.row_ids.contains(&row.id))
                    .map(|row| row.bundle.action_count())
                    .sum()
            };
            if action_total >= self.config.max_aggregation_size {
                self.timer.trigger();
            } else if action_total > 0 {
                self.timer.notify_active();
            } else {
                self.timer.clear();
            }
            Ok(())
        }
        .await;
        if let Err(err) = outcome {
            warn!(%err, "aggregation pass failed");
        }
    }

    fn schedule_try_aggregating(&self) {
        let this = self.clone();
        self.spawn_tracked(async move { this.try_aggregating().await });
    }

    /// Consumes timer firings one at a time, so submissions never run
    /// concurrently with each other.
    async fn submission_loop(&self, mut fired: mpsc::Receiver<()>) {
        let mut stopping = self.stopping_rx.clone();
        loop {
            tokio::select! {
                _ = stopping.changed() => break,
                firing = fired.recv() => match firing {
                    Some(()) => self.run_submission().await,
                    None => break,
                },
            }
        }
    }

    async fn run_submission(&self) {
        self.submissions_in_progress.fetch_add(1, Ordering::SeqCst);
        let outcome = self.run_submission_inner().await;
        self.submissions_in_progress.fetch_sub(1, Ordering::SeqCst);
        if let Err(err) = outcome {
            warn!(%err, "submission attempt failed");
        }
        // whether or not anything was submitted, look again
        self.schedule_try_aggregating();
    }

    async fn run_submission_inner(&self) -> Result<(), Error> {
        let prepared = {
            let group = self.store.lock().await?;
            let block_number = self.chain.block_number().await?;
            let eligible = {
                let unconfirmed = self.unconfirmed.lock();
                group
                    .find_eligible(block_number, self.config.bundle_query_limit)?
                    .into_iter()
                    .filter(|row| !unconfirmed.row_ids.contains(&row.id))
                    .collect::<Vec<_>>()
            };
            let prepared = self.create_aggregate_bundle(&group, block_number, eligible).await?;
            group.commit()?;
            prepared
        };
        match prepared {
            Some(prepared) => self.submit_aggregate_bundle(prepared).await,
            None => Ok(()),
        }
    }

    /// Build the largest aggregate the eligible list supports, excising
    /// failing rows along the way. Returns `None` when nothing is worth
    /// submitting.
    async fn create_aggregate_bundle(
        &self,
        table: &BundleTable,
        block_number: u64,
        eligible: Vec<BundleRow>,
    ) -> Result<Option<PreparedAggregate>, Error> {
        let mut accepted: Vec<BundleRow> = vec![];
        let mut remaining = eligible;
        while !remaining.is_empty() {
            match self.augment_aggregate_bundle(&accepted, &remaining).await? {
                Augment::Complete { included } => {
                    accepted.extend(included);
                    break;
                }
                Augment::Failed { included, failed } => {
                    accepted.extend(included);
                    self.handle_failed_row(table, failed.clone(), block_number)?;
                    // Re-derive the remainder by scanning past the failed
                    // row itself, not by prefix-length arithmetic.
                    let failed_position = remaining
                        .iter()
                        .position(|row| row.id == failed.id)
                        .expect("failed row was drawn from the remaining list");
                    remaining.drain(..=failed_position);
                    if !accepted.is_empty() {
                        // Submit the validated prefix now; the rows beyond
                        // the culprit stay eligible for the pass that is
                        // always scheduled after this submission.
                        break;
                    }
                }
            }
        }
        if accepted.is_empty() {
            return Ok(None);
        }
        let bundle = Bundle::aggregate(accepted.iter().map(|row| &row.bundle))?;
        Ok(Some(PreparedAggregate { bundle, rows: accepted }))
    }

    /// Pack a size-bounded prefix of `remaining` on top of the accepted
    /// rows, measure each candidate's staged reward, and locate the first
    /// failure, if any.
    async fn augment_aggregate_bundle(
        &self,
        accepted: &[BundleRow],
        remaining: &[BundleRow],
    ) -> Result<Augment, Error> {
        let mut action_count: usize =
            accepted.iter().map(|row| row.bundle.action_count()).sum();
        let mut candidates: Vec<BundleRow> = vec![];
        {
            let unconfirmed = self.unconfirmed.lock();
            for row in remaining {
                if unconfirmed.row_ids.contains(&row.id) {
                    continue;
                }
                let row_actions = row.bundle.action_count();
                if action_count + row_actions > self.config.max_aggregation_size {
                    // order is preserved: stop rather than skip ahead
                    break;
                }
                action_count += row_actions;
                candidates.push(row.clone());
            }
        }
        if candidates.is_empty() {
            return Ok(Augment::Complete { included: candidates });
        }

        let prior = match accepted.is_empty() {
            true => None,
            false => Some(Bundle::aggregate(accepted.iter().map(|row| &row.bundle))?),
        };
        let bundles = candidates.iter().map(|row| row.bundle.clone()).collect::<Vec<_>>();
        let simulations =
            self.chain.measure_bundle_rewards(prior.as_ref(), &bundles).await?;

        match self.find_first_failure_index(prior.as_ref(), &bundles, &simulations).await? {
            None => Ok(Augment::Complete { included: candidates }),
            Some(index) => {
                let failed = candidates[index].clone();
                candidates.truncate(index);
                Ok(Augment::Failed { included: candidates, failed })
            }
        }
    }

    /// Locate the lowest-index bundle whose cumulative reward fails to
    /// cover the cumulative required reward, layered atop `prior`.
    ///
    /// A linear scan over the per-bundle measurements is free and almost
    /// always finds the culprit, because deficits usually come from
    /// call-data size, which is monotone and locally visible. When it
    /// misses, bisection bounds the number of gas estimations to
    /// `O(log n)`.
    async fn find_first_failure_index(
        &self,
        prior: Option<&Bundle>,
        bundles: &[Bundle],
        simulations: &[BundleSimulation],
    ) -> Result<Option<usize>, Error> {
        debug_assert_eq!(bundles.len(), simulations.len());
        let count = bundles.len();

        let fast_failure = simulations.iter().zip(bundles).position(|(simulation, bundle)| {
            !simulation.success || simulation.reward < self.required_reward_lower_bound(bundle)
        });

        let (mut left, mut right) = match fast_failure {
            Some(index) => {
                let check = self.check_first_n(prior, bundles, simulations, index).await?;
                if check.success {
                    // everything before the hint pays; the hint is the culprit
                    return Ok(Some(index));
                }
                (0, index)
            }
            None => {
                let check = self.check_first_n(prior, bundles, simulations, count).await?;
                if check.success {
                    return Ok(None);
                }
                (0, count)
            }
        };

        // the first failing prefix length stays in (left, right]
        while right - left > 1 {
            let mid = (left + right) / 2;
            let check = self.check_first_n(prior, bundles, simulations, mid).await?;
            debug!(
                prefix = mid,
                reward = %check.reward,
                required = %check.required,
                "bisecting for first failing bundle"
            );
            if check.success {
                left = mid;
            } else {
                right = mid;
            }
        }
        assert_eq!(right - left, 1, "bisection must end on adjacent bounds");
        Ok(Some(left))
    }

    /// Would the first `n` candidates, on top of `prior`, pay for the
    /// aggregate they form?
    async fn check_first_n(
        &self,
        prior: Option<&Bundle>,
        bundles: &[Bundle],
        simulations: &[BundleSimulation],
        n: usize,
    ) -> Result<PrefixCheck, Error> {
        if n == 0 {
            return Ok(PrefixCheck { success: true, reward: U256::zero(), required: U256::zero() });
        }
        let reward = simulations[..n]
            .iter()
            .fold(U256::zero(), |total, simulation| total.saturating_add(simulation.reward));
        let aggregate = Bundle::aggregate(prior.into_iter().chain(&bundles[..n]))?;
        let call_data_len = self.chain.encode_call_data(&aggregate).len();
        let required = match self.chain.estimate_gas(&aggregate).await {
            Ok(gas) => self.config.rewards.required_reward(gas, call_data_len),
            Err(err) => {
                // a reverting prefix cannot be priced; treat it as failing
                debug!(%err, prefix = n, "gas estimation failed for staged prefix");
                return Ok(PrefixCheck { success: false, reward, required: U256::max_value() });
            }
        };
        Ok(PrefixCheck { success: reward >= required, reward, required })
    }

    fn required_reward_lower_bound(&self, bundle: &Bundle) -> U256 {
        let call_data_len = self.chain.encode_call_data(bundle).len();
        self.config.rewards.required_reward_lower_bound(call_data_len)
    }

    /// Back off a failing row, or drop it once the backoff is exhausted.
    fn handle_failed_row(
        &self,
        table: &BundleTable,
        mut row: BundleRow,
        block_number: u64,
    ) -> Result<(), Error> {
        if row.next_eligibility_delay <= self.config.max_eligibility_delay {
            row.eligible_after = block_number + row.next_eligibility_delay;
            row.next_eligibility_delay *= 2;
            table.update(&row)?;
            debug!(
                row_id = row.id,
                eligible_after = row.eligible_after,
                "rescheduled underpaying bundle"
            );
        } else {
            table.remove(&[row.id])?;
            info!(row_id = row.id, "dropped bundle after exhausting its eligibility backoff");
        }
        self.unconfirmed.lock().row_ids.remove(&row.id);
        Ok(())
    }

    /// Reserve unconfirmed capacity for the aggregate, waiting when the
    /// in-flight cap is exhausted, then hand it to a background task that
    /// submits and settles it.
    async fn submit_aggregate_bundle(&self, prepared: PreparedAggregate) -> Result<(), Error> {
        let action_count = prepared.bundle.action_count() as u64;
        let cap = self.config.unconfirmed_action_cap();
        let mut stopping = self.stopping_rx.clone();
        let submission_id = loop {
            let freed = self.capacity_freed.notified();
            {
                let mut unconfirmed = self.unconfirmed.lock();
                if unconfirmed.action_count + action_count <= cap {
                    let row_ids = prepared.rows.iter().map(|row| row.id).collect();
                    break unconfirmed.reserve(row_ids, action_count);
                }
            }
            self.emit(AggregatorEvent::WaitingUnconfirmedSpace);
            debug!(action_count, "waiting for unconfirmed capacity");
            tokio::select! {
                _ = freed => {}
                _ = stopping.changed() => return Err(Error::Stopping),
            }
        };

        let this = self.clone();
        let spawned =
            self.spawn_tracked(async move { this.track_submission(submission_id, prepared).await });
        if !spawned {
            self.unconfirmed.lock().release(submission_id);
            self.capacity_freed.notify_waiters();
            return Err(Error::Stopping);
        }
        Ok(())
    }

    async fn track_submission(&self, submission_id: u64, prepared: PreparedAggregate) {
        let row_ids = prepared.rows.iter().map(|row| row.id).collect::<Vec<_>>();
        match self.chain.submit_bundle(&prepared.bundle, self.config.submission_timeout()).await {
            Ok(receipt) => {
                self.emit(AggregatorEvent::SubmissionConfirmed {
                    row_ids: row_ids.clone(),
                    block_number: receipt.block_number,
                });
                let removal: Result<(), Error> = async {
                    let group = self.store.lock().await?;
                    group.remove(&row_ids)?;
                    group.commit()?;
                    Ok(())
                }
                .await;
                if let Err(err) = removal {
                    warn!(%err, ?row_ids, "could not remove confirmed rows");
                }
                info!(
                    ?row_ids,
                    block_number = receipt.block_number,
                    transaction_hash = %receipt.transaction_hash,
                    "aggregate bundle confirmed"
                );
            }
            Err(err) => {
                // rows keep their eligibility and will be picked up again
                warn!(%err, ?row_ids, "aggregate submission failed");
            }
        }
        self.unconfirmed.lock().release(submission_id);
        self.capacity_freed.notify_waiters();
        self.confirmations.notify_waiters();
    }

    /// Re-check eligibility on every new block, so backoffs expire even
    /// with no admissions arriving.
    async fn block_tick_loop(&self) {
        let mut stopping = self.stopping_rx.clone();
        tokio::select! {
            _ = stopping.changed() => return,
            _ = tokio::time::sleep(self.config.warm_up()) => {}
        }
        let mut last_seen = 0;
        loop {
            tokio::select! {
                _ = stopping.changed() => break,
                block_number = chain::wait_for_new_block(
                    &*self.chain,
                    last_seen,
                    self.config.block_poll_interval(),
                ) => {
                    last_seen = block_number;
                    self.try_aggregating().await;
                }
            }
        }
    }

    /// Tracks a task so `stop` can drain it. Tasks scheduled after the
    /// stop signal are dropped; returns whether the task was accepted.
    fn spawn_tracked<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.stopping_rx.borrow() {
            return false;
        }
        self.tasks.lock().spawn(task);
        true
    }

    fn emit(&self, event: AggregatorEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.events.subscribe()
    }

    pub fn unconfirmed_action_count(&self) -> u64 {
        self.unconfirmed.lock().action_count
    }

    pub fn unconfirmed_row_ids(&self) -> BTreeSet<u64> {
        self.unconfirmed.lock().row_ids.iter().copied().collect()
    }

    /// Snapshot of the whole table, insertion order.
    pub async fn pending_rows(&self) -> Result<Vec<BundleRow>, Error> {
        let group = self.store.lock().await?;
        let rows = group.all()?;
        group.commit()?;
        Ok(rows)
    }

    /// Wait until every aggregate unconfirmed at the time of the call has
    /// settled, by confirmation or by terminal failure.
    pub async fn wait_for_confirmations(&self) {
        let snapshot = {
            let unconfirmed = self.unconfirmed.lock();
            unconfirmed.aggregates.keys().copied().collect::<Vec<_>>()
        };
        loop {
            let settled = self.confirmations.notified();
            {
                let unconfirmed = self.unconfirmed.lock();
                if snapshot.iter().all(|id| !unconfirmed.aggregates.contains_key(id)) {
                    return;
                }
            }
            settled.await;
        }
    }

    /// Cooperative shutdown: loops exit at their next suspension point
    /// and in-flight chain calls are awaited to completion.
    pub async fn stop(&self) {
        let _ = self.stopping.send(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    warn!(%err, "background task failed during drain");
                }
            }
        }
        info!("bundle service stopped");
    }
}
