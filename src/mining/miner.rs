//! CPU miner
//!
//! A supervisor owns one blocking worker per configured thread plus an
//! async speed monitor. Workers report completed hash counts over a
//! channel and exit when their cancellation token fires; the supervisor
//! can grow or shrink the pool while it runs.
//!
//! Template building and block submission share one lock, so a worker
//! never builds on a tip that another worker is about to replace.

use crate::config::MiningConfig;
use crate::core::block::{Block, BlockHash};
use crate::core::chain::{BlockChain, ChainError};
use crate::core::compact::{compact_to_big, hash_to_big};
use crate::core::validation::BehaviorFlags;
use crate::mining::template::{BlkTmplGenerator, BlockTemplate, TemplateError, TxSource};
use num_bigint::BigInt;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Configuration
// =============================================================================

/// Seconds between worker hash count reports
pub const HASH_UPDATE_SECS: u64 = 1;

/// Seconds per hash rate window
pub const HPS_UPDATE_SECS: u64 = 15;

/// A template is abandoned once the tx source changed and it is this old
pub const STALE_TEMPLATE_AGE: Duration = Duration::from_secs(60);

/// Pause after a failed template build
pub const TEMPLATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Nonce attempts per extra nonce at an adjustment factor of 1
pub const BASE_ROUNDS: u32 = 1 << 16;

/// Nonce attempts per extra nonce while the chain is young
pub const BOOTSTRAP_ROUNDS: u32 = 27;

/// Height below which [`BOOTSTRAP_ROUNDS`] applies
pub const BOOTSTRAP_HEIGHT: i32 = 20;

/// Extra nonces tried before a template is rebuilt
pub const EXTRA_NONCE_ROUNDS: u64 = 16;

// =============================================================================
// Errors and outcomes
// =============================================================================

/// Mining errors
#[derive(Error, Debug)]
pub enum MiningError {
    #[error("Miner is already running; stop it before generating blocks")]
    AlreadyMining,
    #[error("No payout address configured")]
    NoPayoutAddress,
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Mining task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What happened to a submitted block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The tip moved before submission
    Stale,
    Orphan,
    /// A consensus rule rejected the block
    Rejected,
}

// =============================================================================
// Worker side
// =============================================================================

/// Fires at most once per period
struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.next {
            self.next = now + self.period;
            true
        } else {
            false
        }
    }
}

/// State shared by the supervisor and every worker
struct MinerCore {
    chain: Arc<BlockChain>,
    generator: BlkTmplGenerator,
    addresses: Vec<String>,
    algo: RwLock<String>,
    submit_lock: Mutex<()>,
}

impl MinerCore {
    /// Build a template under the submission lock
    fn next_template(&self) -> Result<BlockTemplate, MiningError> {
        let _guard = self.submit_lock.lock();
        let address = self
            .addresses
            .choose(&mut OsRng)
            .ok_or(MiningError::NoPayoutAddress)?;
        let algo = self.algo.read().clone();
        Ok(self.generator.new_block_template(address, &algo)?)
    }

    /// Nonce attempts per extra nonce; easier retargets get fewer
    fn rounds(&self, algo: &str, height: i32) -> u32 {
        if height < BOOTSTRAP_HEIGHT {
            return BOOTSTRAP_ROUNDS;
        }
        // No adjustment outside Plan 9 or when the floor applies; budget as
        // if the target were unchanged.
        let adjustment = self.chain.difficulty_adjustment(algo).unwrap_or(1.0);
        ((BASE_ROUNDS as f64 * adjustment) as u32).saturating_add(BOOTSTRAP_ROUNDS)
    }

    fn is_stale(&self, block: &Block, generated_at: Instant, last_tx_update: i64) -> bool {
        if block.header.prev_block != self.chain.best_snapshot().hash {
            return true;
        }
        self.generator.tx_source().last_updated() != last_tx_update
            && generated_at.elapsed() >= STALE_TEMPLATE_AGE
    }

    /// Search extra nonce and nonce space for a solution.
    ///
    /// Returns false when cancelled, when the template goes stale, or when
    /// the search budget runs out.
    fn solve_block(
        &self,
        template: &mut BlockTemplate,
        ticker: &mut Ticker,
        cancel: &CancellationToken,
        updates: &mpsc::UnboundedSender<u64>,
    ) -> bool {
        let height = template.height;
        let algo = template.algo.clone();
        let target = compact_to_big(template.block.header.bits);
        let generated_at = Instant::now();
        let last_tx_update = self.generator.tx_source().last_updated();
        let extra_nonce_offset: u64 = OsRng.gen();
        let mut completed = 0u64;

        for i in 0..EXTRA_NONCE_ROUNDS {
            self.generator.update_extra_nonce(
                &mut template.block,
                height,
                extra_nonce_offset.wrapping_add(i),
            );

            let start: u32 = OsRng.gen();
            let rounds = self.rounds(&algo, height);
            log::trace!("{} rounds of {} at height {}", rounds, algo, height);

            for n in 0..=rounds {
                if cancel.is_cancelled() {
                    return false;
                }

                if ticker.ready() {
                    let _ = updates.send(completed);
                    completed = 0;
                    if self.is_stale(&template.block, generated_at, last_tx_update) {
                        return false;
                    }
                    self.generator.update_block_time(&mut template.block);
                }

                let header = &mut template.block.header;
                header.nonce = start.wrapping_add(n);
                let hash = header.pow_hash(&algo);
                completed += 1;

                if BigInt::from(hash_to_big(&hash)) <= target {
                    let _ = updates.send(completed);
                    return true;
                }
            }
        }

        let _ = updates.send(completed);
        false
    }

    /// Hand a solved block to the chain unless the tip already moved
    fn submit_block(&self, block: Block) -> Result<SubmitOutcome, MiningError> {
        let _guard = self.submit_lock.lock();

        let best = self.chain.best_snapshot();
        if block.header.prev_block != best.hash {
            log::debug!(
                "Block submitted via CPU miner with previous block {} is stale",
                block.header.prev_block
            );
            return Ok(SubmitOutcome::Stale);
        }

        let hash = block.hash();
        let height = best.height + 1;
        let algo = self
            .chain
            .forks()
            .algo_name(block.header.version, height)
            .unwrap_or("unknown")
            .to_string();

        match self.chain.process_block(block, BehaviorFlags::empty()) {
            Ok(outcome) if outcome.is_orphan => Ok(SubmitOutcome::Orphan),
            Ok(_) => {
                log::info!(
                    "Block submitted via CPU miner accepted (algo {}, hash {}, height {})",
                    algo,
                    hash,
                    height
                );
                Ok(SubmitOutcome::Accepted)
            }
            Err(e) if e.is_rule_error() => {
                log::warn!("Block submitted via CPU miner rejected: {}", e);
                Ok(SubmitOutcome::Rejected)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Worker loop: build, solve, submit until cancelled
    fn generate_blocks(&self, cancel: &CancellationToken, updates: &mpsc::UnboundedSender<u64>) {
        let mut ticker = Ticker::new(Duration::from_secs(HASH_UPDATE_SECS));
        while !cancel.is_cancelled() {
            let mut template = match self.next_template() {
                Ok(t) => t,
                Err(e) => {
                    log::error!("Failed to create new block template: {}", e);
                    std::thread::sleep(TEMPLATE_RETRY_DELAY);
                    continue;
                }
            };

            if self.solve_block(&mut template, &mut ticker, cancel, updates) {
                if let Err(e) = self.submit_block(template.block) {
                    log::warn!(
                        "Unexpected error while processing block submitted via CPU miner: {}",
                        e
                    );
                }
            }
        }
    }

    /// Mine until `n` blocks were accepted
    fn generate_discrete(
        &self,
        n: usize,
        cancel: &CancellationToken,
        updates: &mpsc::UnboundedSender<u64>,
    ) -> Result<Vec<BlockHash>, MiningError> {
        let mut ticker = Ticker::new(Duration::from_secs(HASH_UPDATE_SECS));
        let mut hashes = Vec::with_capacity(n);

        while hashes.len() < n && !cancel.is_cancelled() {
            let mut template = match self.next_template() {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Failed to create new block template: {}", e);
                    std::thread::sleep(TEMPLATE_RETRY_DELAY);
                    continue;
                }
            };
            if !self.solve_block(&mut template, &mut ticker, cancel, updates) {
                continue;
            }

            let hash = template.block.hash();
            match self.submit_block(template.block) {
                Ok(SubmitOutcome::Accepted) => hashes.push(hash),
                Ok(outcome) => log::debug!("Generated block {} not accepted: {:?}", hash, outcome),
                Err(e) => log::warn!(
                    "Unexpected error while processing generated block {}: {}",
                    hash,
                    e
                ),
            }
        }

        log::debug!("Generated {} blocks", hashes.len());
        Ok(hashes)
    }
}

/// Aggregate worker reports into a rolling hashes per second estimate
async fn speed_monitor(
    core: Arc<MinerCore>,
    mut updates: mpsc::UnboundedReceiver<u64>,
    rate: watch::Sender<f64>,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(HPS_UPDATE_SECS);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut total = 0u64;
    let mut hashes_per_sec = 0.0f64;

    loop {
        tokio::select! {
            Some(n) = updates.recv() => total += n,
            _ = ticker.tick() => {
                let current = total as f64 / HPS_UPDATE_SECS as f64;
                if hashes_per_sec == 0.0 {
                    hashes_per_sec = current;
                }
                hashes_per_sec = (hashes_per_sec + current) / 2.0;
                total = 0;
                let _ = rate.send(hashes_per_sec);

                if hashes_per_sec != 0.0 {
                    log::info!(
                        "{} hash speed: {:6.4} Kh/s {:0.2} h/s",
                        core.algo.read(),
                        hashes_per_sec / 1000.0,
                        hashes_per_sec
                    );
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A running miner, continuous or discrete
struct Running {
    cancel: CancellationToken,
    workers: Vec<WorkerHandle>,
    monitor: JoinHandle<()>,
    updates: mpsc::UnboundedSender<u64>,
    rate: watch::Receiver<f64>,
    discrete: bool,
}

impl Running {
    /// Start the speed monitor; must be called inside a tokio runtime
    fn spawn(core: &Arc<MinerCore>, discrete: bool) -> Self {
        let cancel = CancellationToken::new();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (rate_tx, rate) = watch::channel(0.0);
        let monitor = tokio::spawn(speed_monitor(
            core.clone(),
            updates_rx,
            rate_tx,
            cancel.clone(),
        ));
        Self {
            cancel,
            workers: Vec::new(),
            monitor,
            updates,
            rate,
            discrete,
        }
    }

    fn spawn_worker(&mut self, core: &Arc<MinerCore>) {
        let cancel = self.cancel.child_token();
        let worker_cancel = cancel.clone();
        let updates = self.updates.clone();
        let core = core.clone();
        let handle = tokio::task::spawn_blocking(move || {
            core.generate_blocks(&worker_cancel, &updates);
        });
        self.workers.push(WorkerHandle { cancel, handle });
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        join_workers(self.workers).await;
        if let Err(e) = self.monitor.await {
            log::error!("Speed monitor failed: {}", e);
        }
    }
}

async fn join_workers(workers: Vec<WorkerHandle>) {
    for worker in workers {
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            log::error!("Mining worker failed: {}", e);
        }
    }
}

struct MinerState {
    running: Option<Running>,
    num_workers: usize,
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn resolve_num_workers(n: i32) -> usize {
    if n < 0 {
        default_num_workers()
    } else {
        n as usize
    }
}

/// Multi-worker CPU miner
pub struct CpuMiner {
    core: Arc<MinerCore>,
    state: Mutex<MinerState>,
}

impl CpuMiner {
    pub fn new(chain: Arc<BlockChain>, tx_source: Arc<dyn TxSource>, config: &MiningConfig) -> Self {
        let generator = BlkTmplGenerator::new(chain.clone(), tx_source);
        Self {
            core: Arc::new(MinerCore {
                chain,
                generator,
                addresses: config.addresses.clone(),
                algo: RwLock::new(config.algo.clone()),
                submit_lock: Mutex::new(()),
            }),
            state: Mutex::new(MinerState {
                running: None,
                num_workers: resolve_num_workers(config.workers),
            }),
        }
    }

    /// Start the worker pool and speed monitor.
    ///
    /// Does nothing if the miner is already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), MiningError> {
        if self.core.addresses.is_empty() {
            return Err(MiningError::NoPayoutAddress);
        }

        let mut state = self.state.lock();
        if state.running.is_some() {
            return Ok(());
        }

        let mut running = Running::spawn(&self.core, false);
        for _ in 0..state.num_workers {
            running.spawn_worker(&self.core);
        }
        log::info!(
            "CPU miner started mining {} with {} workers",
            self.core.algo.read(),
            state.num_workers
        );
        state.running = Some(running);
        Ok(())
    }

    /// Stop every worker and the speed monitor, waiting for them to exit.
    ///
    /// Discrete generation is not interrupted.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            if state.running.as_ref().map_or(true, |r| r.discrete) {
                return;
            }
            state.running.take()
        };

        if let Some(running) = running {
            running.shutdown().await;
            log::info!("CPU miner stopped");
        }
    }

    pub fn is_mining(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// Resize the worker pool.
    ///
    /// Negative values use one worker per CPU; zero stops the miner.
    pub async fn set_num_workers(&self, n: i32) {
        if n == 0 {
            self.stop().await;
        }

        let retired = {
            let mut state = self.state.lock();
            state.num_workers = resolve_num_workers(n);
            let target = state.num_workers;
            match state.running.as_mut() {
                Some(running) if !running.discrete => {
                    let current = running.workers.len();
                    if current < target {
                        for _ in current..target {
                            running.spawn_worker(&self.core);
                        }
                        Vec::new()
                    } else {
                        running.workers.split_off(target)
                    }
                }
                _ => Vec::new(),
            }
        };

        if !retired.is_empty() {
            log::info!("Stopping {} mining workers", retired.len());
        }
        join_workers(retired).await;
    }

    pub fn num_workers(&self) -> i32 {
        self.state.lock().num_workers as i32
    }

    /// Rolling hash rate, 0 when not running
    pub fn hashes_per_second(&self) -> f64 {
        self.state
            .lock()
            .running
            .as_ref()
            .map(|r| *r.rate.borrow())
            .unwrap_or(0.0)
    }

    pub fn algo(&self) -> String {
        self.core.algo.read().clone()
    }

    /// Algorithm used for the next template
    pub fn set_algo(&self, algo: &str) {
        *self.core.algo.write() = algo.to_string();
    }

    /// Mine until `n` blocks are accepted, with a single worker.
    ///
    /// Fails with [`MiningError::AlreadyMining`] while the pool runs.
    pub async fn generate_n_blocks(&self, n: u32) -> Result<Vec<BlockHash>, MiningError> {
        if self.core.addresses.is_empty() {
            return Err(MiningError::NoPayoutAddress);
        }

        let (cancel, updates) = {
            let mut state = self.state.lock();
            if state.running.is_some() {
                return Err(MiningError::AlreadyMining);
            }
            let running = Running::spawn(&self.core, true);
            let handles = (running.cancel.clone(), running.updates.clone());
            state.running = Some(running);
            handles
        };

        log::info!("Generating {} {} blocks", n, self.core.algo.read());
        let core = self.core.clone();
        let result = tokio::task::spawn_blocking(move || {
            core.generate_discrete(n as usize, &cancel, &updates)
        })
        .await;

        let running = self.state.lock().running.take();
        if let Some(running) = running {
            running.shutdown().await;
        }

        result?
    }

    /// Submit a solved block the same way the workers do
    pub fn submit_block(&self, block: Block) -> Result<SubmitOutcome, MiningError> {
        self.core.submit_block(block)
    }

    /// Build a template for the configured algorithm
    pub fn block_template(&self) -> Result<BlockTemplate, MiningError> {
        self.core.next_template()
    }
}
