//! Dispatches epoch-synchronized (rover, base) observation pairs to RTK
//! workers; owns per-baseline filter state; caps baselines per worker
//! (N=64); symmetric dedup.
//!
//! Each [`Solver`] in the pool runs two cooperating OS threads, each driving
//! a small current-thread Tokio runtime, keeping it off the shared
//! multi-threaded pool: a dispatcher that evaluates the sync algorithm and
//! enqueues solve jobs, and a worker that drains the queue, calls the
//! [`RtkEngine`](crate::kernels::RtkEngine) step, and publishes results.

use crate::kernels::RtkEngine;
use crate::store::ObservationStore;
use cors_types::{Ecef, GTime, SourceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const MAX_BASELINES_PER_SOLVER: usize = 64;
const TICK_PERIOD: Duration = Duration::from_millis(20);
const STRICT_AGE_SECS: f64 = 0.010;
const LENIENT_AGE_SECS: f64 = 15.0;
const ALREADY_SOLVED_EPSILON_SECS: f64 = 0.010;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(200);

pub type BaselineId = (SourceId, SourceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Strict,
    Lenient,
    Wait,
}

/// Per-baseline mutable state. `on` is the in-flight-solve reference
/// count; deletion blocks until it reaches zero.
pub struct BaselineState {
    pub base: SourceId,
    pub rover: SourceId,
    pub base_pos: Ecef,
    pub rover_pos: Ecef,
    pub last_solved_epoch: Option<GTime>,
    pub wait_counter: u32,
    pub on: Arc<AtomicU32>,
    pub latest: Option<crate::kernels::RtkSolution>,
    pub pending_deletion: bool,
}

impl BaselineState {
    fn new(base: SourceId, rover: SourceId, base_pos: Ecef, rover_pos: Ecef) -> Self {
        Self {
            base,
            rover,
            base_pos,
            rover_pos,
            last_solved_epoch: None,
            wait_counter: 0,
            on: Arc::new(AtomicU32::new(0)),
            latest: None,
            pending_deletion: false,
        }
    }

    /// The time-sync algorithm. Returns the candidate epoch to solve, or
    /// `None` if this tick should skip the baseline.
    fn evaluate_sync(&mut self, t_base: Option<GTime>, t_rover: Option<GTime>, mode: SyncMode) -> Option<GTime> {
        if t_base.is_none() && t_rover.is_none() {
            return None;
        }
        let t_cur = match (t_base, t_rover) {
            (Some(b), Some(r)) => {
                if r.0 >= b.0 {
                    r
                } else {
                    b
                }
            }
            (Some(b), None) => b,
            (None, Some(r)) => r,
            (None, None) => unreachable!(),
        };

        if let Some(last) = self.last_solved_epoch {
            if t_cur.abs_diff(&last) < ALREADY_SOLVED_EPSILON_SECS {
                return None;
            }
            // Epochs older than the last solved one are dropped, never
            // reprocessed out of order.
            if t_cur.0 < last.0 - ALREADY_SOLVED_EPSILON_SECS {
                return None;
            }
        }

        let age = match mode {
            SyncMode::Strict | SyncMode::Wait => STRICT_AGE_SECS,
            SyncMode::Lenient => LENIENT_AGE_SECS,
        };
        let base_fresh = t_base.map(|t| t_cur.abs_diff(&t) < age).unwrap_or(false);
        let rover_fresh = t_rover.map(|t| t_cur.abs_diff(&t) < age).unwrap_or(false);

        if base_fresh && rover_fresh {
            self.wait_counter = 0;
            return Some(t_cur);
        }

        if mode == SyncMode::Wait {
            self.wait_counter += 1;
            let waited = TICK_PERIOD * self.wait_counter;
            if waited > DEFAULT_WAIT_TIMEOUT {
                self.wait_counter = 0;
                return Some(t_cur);
            }
        }
        None
    }
}

struct SolveJob {
    base: SourceId,
    rover: SourceId,
    base_pos: Ecef,
    rover_pos: Ecef,
    on: Arc<AtomicU32>,
}

enum ControlMsg {
    AddBaseline { base: SourceId, rover: SourceId, base_pos: Ecef, rover_pos: Ecef },
    DelBaseline { base: SourceId, rover: SourceId, ack: oneshot::Sender<()> },
}

/// One dispatcher+worker pair owning up to [`MAX_BASELINES_PER_SOLVER`] baselines.
pub struct Solver {
    baselines: Arc<RwLock<HashMap<BaselineId, BaselineState>>>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    count: Arc<AtomicU32>,
}

impl Solver {
    fn spawn(store: Arc<ObservationStore>, engine: Arc<dyn RtkEngine>, mode: SyncMode, solver_idx: usize) -> Self {
        let baselines: Arc<RwLock<HashMap<BaselineId, BaselineState>>> = Arc::new(RwLock::new(HashMap::new()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (job_tx, job_rx) = mpsc::unbounded_channel::<SolveJob>();
        let count = Arc::new(AtomicU32::new(0));

        let dispatcher_baselines = baselines.clone();
        let dispatcher_store = store.clone();
        std::thread::Builder::new()
            .name(format!("solver-{solver_idx}-dispatcher"))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("build dispatcher runtime");
                rt.block_on(dispatcher_loop(dispatcher_baselines, dispatcher_store, control_rx, job_tx, mode));
            })
            .expect("spawn solver dispatcher thread");

        let worker_baselines = baselines.clone();
        let worker_store = store;
        std::thread::Builder::new()
            .name(format!("solver-{solver_idx}-worker"))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("build worker runtime");
                rt.block_on(worker_loop(worker_baselines, worker_store, job_rx, engine));
            })
            .expect("spawn solver worker thread");

        Self { baselines, control_tx, count }
    }

    fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    async fn add_baseline(&self, base: SourceId, rover: SourceId, base_pos: Ecef, rover_pos: Ecef) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self.control_tx.send(ControlMsg::AddBaseline { base, rover, base_pos, rover_pos });
    }

    async fn del_baseline(&self, base: SourceId, rover: SourceId) {
        let (ack, ack_rx) = oneshot::channel();
        if self.control_tx.send(ControlMsg::DelBaseline { base, rover, ack }).is_ok() {
            let _ = ack_rx.await;
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    async fn has_baseline(&self, base: SourceId, rover: SourceId) -> bool {
        self.baselines.read().await.contains_key(&(base, rover))
    }

    pub async fn latest_solution(&self, base: SourceId, rover: SourceId) -> Option<crate::kernels::RtkSolution> {
        self.baselines.read().await.get(&(base, rover)).and_then(|b| b.latest.clone())
    }
}

async fn dispatcher_loop(
    baselines: Arc<RwLock<HashMap<BaselineId, BaselineState>>>,
    store: Arc<ObservationStore>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    job_tx: mpsc::UnboundedSender<SolveJob>,
    mode: SyncMode,
) {
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut map = baselines.write().await;
                for (&(base, rover), state) in map.iter_mut() {
                    if state.pending_deletion {
                        continue;
                    }
                    let t_base = store.latest_obs(base).await.map(|e| e.time);
                    let t_rover = store.latest_obs(rover).await.map(|e| e.time);
                    if let Some(_candidate) = state.evaluate_sync(t_base, t_rover, mode) {
                        state.on.fetch_add(1, Ordering::SeqCst);
                        let _ = job_tx.send(SolveJob {
                            base,
                            rover,
                            base_pos: state.base_pos,
                            rover_pos: state.rover_pos,
                            on: state.on.clone(),
                        });
                    }
                }
                // drain fully-drained pending deletions
                let done: Vec<BaselineId> = map.iter()
                    .filter(|(_, s)| s.pending_deletion && s.on.load(Ordering::SeqCst) == 0)
                    .map(|(k, _)| *k)
                    .collect();
                for key in done {
                    map.remove(&key);
                }
            }
            msg = control_rx.recv() => {
                match msg {
                    Some(ControlMsg::AddBaseline { base, rover, base_pos, rover_pos }) => {
                        let mut map = baselines.write().await;
                        if map.contains_key(&(base, rover)) || map.contains_key(&(rover, base)) {
                            debug!(%base, %rover, "symmetric duplicate baseline add is a no-op at the filter level");
                            continue;
                        }
                        map.insert((base, rover), BaselineState::new(base, rover, base_pos, rover_pos));
                        info!(%base, %rover, "baseline added to solver");
                    }
                    Some(ControlMsg::DelBaseline { base, rover, ack }) => {
                        let mut map = baselines.write().await;
                        let key = if map.contains_key(&(base, rover)) { Some((base, rover)) } else if map.contains_key(&(rover, base)) { Some((rover, base)) } else { None };
                        match key {
                            Some(k) => {
                                let on_zero = map.get(&k).map(|s| s.on.load(Ordering::SeqCst) == 0).unwrap_or(true);
                                if on_zero {
                                    map.remove(&k);
                                    let _ = ack.send(());
                                } else if let Some(s) = map.get_mut(&k) {
                                    s.pending_deletion = true;
                                    drop(map);
                                    // block until the worker drains in-flight jobs for this baseline
                                    loop {
                                        tokio::time::sleep(TICK_PERIOD).await;
                                        let mut map = baselines.write().await;
                                        if let Some(s) = map.get(&k) {
                                            if s.on.load(Ordering::SeqCst) == 0 {
                                                map.remove(&k);
                                                break;
                                            }
                                        } else {
                                            break;
                                        }
                                    }
                                    let _ = ack.send(());
                                }
                            }
                            None => {
                                let _ = ack.send(());
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

async fn worker_loop(
    baselines: Arc<RwLock<HashMap<BaselineId, BaselineState>>>,
    store: Arc<ObservationStore>,
    mut job_rx: mpsc::UnboundedReceiver<SolveJob>,
    engine: Arc<dyn RtkEngine>,
) {
    while let Some(job) = job_rx.recv().await {
        let base_obs = store.latest_obs(job.base).await;
        let rover_obs = store.latest_obs(job.rover).await;

        let solution = match (base_obs, rover_obs) {
            (Some(b), Some(r)) => {
                let mut sol = engine.step(&b, &r, job.base_pos, job.rover_pos);
                if sol.quality == cors_types::SolutionQuality::None {
                    // One retry for this epoch before flagging NONE.
                    sol = engine.step(&b, &r, job.base_pos, job.rover_pos);
                }
                sol
            }
            _ => crate::kernels::RtkSolution::none(GTime::now()),
        };

        {
            let mut map = baselines.write().await;
            if let Some(state) = map.get_mut(&(job.base, job.rover)) {
                state.last_solved_epoch = Some(solution.time);
                state.latest = Some(solution);
            }
        }
        job.on.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The pool of [`Solver`]s, spawning additional solvers once the active one
/// would exceed `MAX_BASELINES_PER_SOLVER`.
pub struct SolverPool {
    solvers: Mutex<Vec<Solver>>,
    store: Arc<ObservationStore>,
    engine: Arc<dyn RtkEngine>,
    mode: SyncMode,
}

impl SolverPool {
    pub fn new(store: Arc<ObservationStore>, engine: Arc<dyn RtkEngine>, mode: SyncMode) -> Self {
        Self { solvers: Mutex::new(Vec::new()), store, engine, mode }
    }

    /// Adds `base -> rover`; if the reverse `rover -> base` already exists
    /// anywhere in the pool, the existing baseline is reused (symmetric
    /// mode) and this call is a no-op at the filter level.
    pub async fn add_baseline(&self, base: SourceId, rover: SourceId, base_pos: Ecef, rover_pos: Ecef) {
        let mut solvers = self.solvers.lock().await;
        for solver in solvers.iter() {
            if solver.has_baseline(base, rover).await || solver.has_baseline(rover, base).await {
                return;
            }
        }
        let target = solvers.iter().position(|s| s.len() < MAX_BASELINES_PER_SOLVER as u32);
        let idx = match target {
            Some(i) => i,
            None => {
                let idx = solvers.len();
                solvers.push(Solver::spawn(self.store.clone(), self.engine.clone(), self.mode, idx));
                idx
            }
        };
        solvers[idx].add_baseline(base, rover, base_pos, rover_pos).await;
    }

    pub async fn del_baseline(&self, base: SourceId, rover: SourceId) {
        let solvers = self.solvers.lock().await;
        for solver in solvers.iter() {
            if solver.has_baseline(base, rover).await {
                solver.del_baseline(base, rover).await;
                return;
            }
            if solver.has_baseline(rover, base).await {
                solver.del_baseline(rover, base).await;
                return;
            }
        }
        warn!(%base, %rover, "del_baseline: no such baseline (no-op, logged)");
    }

    pub async fn latest_solution(&self, base: SourceId, rover: SourceId) -> Option<crate::kernels::RtkSolution> {
        let solvers = self.solvers.lock().await;
        for solver in solvers.iter() {
            if let Some(sol) = solver.latest_solution(base, rover).await {
                return Some(sol);
            }
            if let Some(sol) = solver.latest_solution(rover, base).await {
                return Some(sol);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_skips_when_only_one_endpoint_fresh() {
        let mut state = BaselineState::new(SourceId(1), SourceId(2), Ecef::ZERO, Ecef::ZERO);
        let t_base = Some(GTime(1.000));
        let t_rover = Some(GTime(1.500)); // 500ms apart, stale under strict 10ms window
        assert!(state.evaluate_sync(t_base, t_rover, SyncMode::Strict).is_none());
    }

    #[test]
    fn strict_mode_accepts_when_both_endpoints_fresh() {
        let mut state = BaselineState::new(SourceId(1), SourceId(2), Ecef::ZERO, Ecef::ZERO);
        let t_base = Some(GTime(1.000));
        let t_rover = Some(GTime(1.002));
        assert_eq!(state.evaluate_sync(t_base, t_rover, SyncMode::Strict), Some(GTime(1.002)));
    }

    #[test]
    fn already_processed_epoch_is_skipped() {
        let mut state = BaselineState::new(SourceId(1), SourceId(2), Ecef::ZERO, Ecef::ZERO);
        state.last_solved_epoch = Some(GTime(1.000));
        let t = Some(GTime(1.001));
        assert!(state.evaluate_sync(t, t, SyncMode::Strict).is_none());
    }

    #[test]
    fn lenient_mode_tolerates_wide_age_window() {
        let mut state = BaselineState::new(SourceId(1), SourceId(2), Ecef::ZERO, Ecef::ZERO);
        let t_base = Some(GTime(1.0));
        let t_rover = Some(GTime(10.0));
        assert_eq!(state.evaluate_sync(t_base, t_rover, SyncMode::Lenient), Some(GTime(10.0)));
    }

    #[test]
    fn wait_mode_accepts_after_timeout_elapses() {
        let mut state = BaselineState::new(SourceId(1), SourceId(2), Ecef::ZERO, Ecef::ZERO);
        let t_base = Some(GTime(1.0));
        let t_rover = Some(GTime(5.0)); // far outside the 10ms strict window
        let ticks_to_timeout = (DEFAULT_WAIT_TIMEOUT.as_millis() / TICK_PERIOD.as_millis()) as u32;
        for _ in 0..ticks_to_timeout {
            assert!(state.evaluate_sync(t_base, t_rover, SyncMode::Wait).is_none());
        }
        assert!(state.evaluate_sync(t_base, t_rover, SyncMode::Wait).is_some());
    }

    #[tokio::test]
    async fn symmetric_add_of_reverse_direction_is_a_no_op() {
        let store = Arc::new(ObservationStore::new());
        let engine: Arc<dyn RtkEngine> = Arc::new(crate::kernels::FloatDdEngine::default());
        let pool = SolverPool::new(store, engine, SyncMode::Strict);
        pool.add_baseline(SourceId(1), SourceId(2), Ecef::ZERO, Ecef::ZERO).await;
        pool.add_baseline(SourceId(2), SourceId(1), Ecef::ZERO, Ecef::ZERO).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let solvers = pool.solvers.lock().await;
        assert_eq!(solvers.len(), 1);
        assert_eq!(solvers[0].len(), 1);
    }
}
