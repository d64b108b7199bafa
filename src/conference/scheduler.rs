//! Conference sender: the mixing tick
//!
//! Every tick runs the same phases in order:
//!
//! ```text
//! Armed ─► Collecting ─► Mixing ─► Dispatching ─► Invalidating ─► Armed
//! ```
//!
//! Before collecting, each conference does its housekeeping and the
//! pending private mixes are applied. Contributions published while
//! collecting are immutable until invalidation, so mixing can fan out over
//! a worker pool without locking the sources against each other. With no
//! members the scheduler parks in [`SenderState::Stopped`] until a join.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::registry::ConferenceRegistry;
use super::MemberHandle;
use crate::mixer::ContributionSource;

/// How long a parked scheduler sleeps before rechecking for members
const PARK_TIMEOUT: Duration = Duration::from_millis(500);

/// Ticks behind schedule before the deadline is reset instead of caught up
const MAX_BEHIND_TICKS: u32 = 5;

/// A late tick is logged on the first overrun and then once per this many
const LATE_TICK_LOG_EVERY: u64 = 50;

/// Which conferences a scheduler drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SenderScope {
    All,
    Conference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SenderState {
    Armed,
    Collecting,
    Mixing,
    Dispatching,
    Invalidating,
    Stopped,
}

/// What one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub conferences: usize,
    pub members: usize,
    pub removed: usize,
    pub private_mixes: usize,
    pub sent: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct SchedulerStats {
    ticks: AtomicU64,
    late_ticks: AtomicU64,
    max_tick_us: AtomicU64,
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub ticks: u64,
    pub late_ticks: u64,
    pub max_tick_us: u64,
}

#[derive(Clone, Copy)]
enum Phase {
    Mix,
    Dispatch,
}

struct Job {
    phase: Phase,
    members: Arc<Vec<MemberHandle>>,
    range: std::ops::Range<usize>,
    done: Sender<usize>,
}

/// Fixed pool of mixing threads fed over a channel
struct MixWorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl MixWorkerPool {
    fn new(threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("mix-worker-{}", i))
                .spawn(move || {
                    for job in rx.iter() {
                        let count = run_phase(job.phase, &job.members[job.range.clone()]);
                        let _ = job.done.send(count);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    /// Split `members` across the workers and wait for all of them
    fn run(&self, phase: Phase, members: &Arc<Vec<MemberHandle>>) -> usize {
        let Some(jobs) = self.jobs.as_ref() else {
            return run_phase(phase, members);
        };
        let chunk = members.len().div_ceil(self.workers.len().max(1)).max(1);
        let (done_tx, done_rx) = bounded(self.workers.len());

        let mut pending = 0;
        let mut start = 0;
        while start < members.len() {
            let end = (start + chunk).min(members.len());
            let job = Job {
                phase,
                members: members.clone(),
                range: start..end,
                done: done_tx.clone(),
            };
            if let Err(e) = jobs.send(job) {
                // Workers gone, run the chunk here
                let job = e.into_inner();
                let _ = done_tx.send(run_phase(phase, &members[job.range]));
            }
            pending += 1;
            start = end;
        }
        drop(done_tx);

        done_rx.iter().take(pending).sum()
    }
}

impl Drop for MixWorkerPool {
    fn drop(&mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_phase(phase: Phase, members: &[MemberHandle]) -> usize {
    let mut count = 0;
    for member in members {
        if member.lifecycle().is_done() {
            continue;
        }
        match phase {
            Phase::Mix => {
                member.mix();
                count += 1;
            }
            Phase::Dispatch => {
                if member.dispatch() {
                    count += 1;
                }
            }
        }
    }
    count
}

pub struct ConferenceSender {
    registry: Arc<ConferenceRegistry>,
    scope: SenderScope,
    period: Duration,
    parallel_threshold: usize,
    pool: Option<MixWorkerPool>,
    state: Mutex<SenderState>,
    stats: SchedulerStats,
}

impl ConferenceSender {
    pub fn new(registry: Arc<ConferenceRegistry>, scope: SenderScope) -> Self {
        let config = registry.config().clone();
        let pool = if config.sender.threads > 1 {
            match MixWorkerPool::new(config.sender.threads) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!("Mixing on one thread, worker pool failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            registry,
            scope,
            period: config.tick(),
            parallel_threshold: config.sender.parallel_threshold,
            pool,
            state: Mutex::new(SenderState::Armed),
            stats: SchedulerStats::default(),
        }
    }

    pub fn state(&self) -> SenderState {
        *self.state.lock()
    }

    fn set_state(&self, state: SenderState) {
        *self.state.lock() = state;
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            late_ticks: self.stats.late_ticks.load(Ordering::Relaxed),
            max_tick_us: self.stats.max_tick_us.load(Ordering::Relaxed),
        }
    }

    /// Run one tick at `now`
    pub fn tick(&self, now: Instant) -> TickReport {
        let started = Instant::now();
        let conferences = self.registry.conferences_in(&self.scope);

        let mut report = TickReport {
            conferences: conferences.len(),
            ..TickReport::default()
        };
        for conference in &conferences {
            report.removed += conference.housekeeping(now);
        }
        report.private_mixes = self.registry.apply_private_mixes(&self.scope);

        let members: Vec<MemberHandle> = conferences
            .iter()
            .flat_map(|c| c.members())
            .filter(|m| !m.lifecycle().is_done())
            .collect();
        let groups: Vec<_> = conferences.iter().flat_map(|c| c.groups()).collect();
        report.members = members.len();

        // Members first, groups sum their whisperers' contributions
        self.set_state(SenderState::Collecting);
        for member in &members {
            member.save_current_contribution();
        }
        for group in &groups {
            group.save_current_contribution();
        }

        let members = Arc::new(members);
        let pool = self
            .pool
            .as_ref()
            .filter(|_| members.len() >= self.parallel_threshold);

        self.set_state(SenderState::Mixing);
        match pool {
            Some(pool) => pool.run(Phase::Mix, &members),
            None => run_phase(Phase::Mix, &members),
        };

        self.set_state(SenderState::Dispatching);
        report.sent = match pool {
            Some(pool) => pool.run(Phase::Dispatch, &members),
            None => run_phase(Phase::Dispatch, &members),
        };

        self.set_state(SenderState::Invalidating);
        for member in members.iter() {
            member.invalidate();
        }
        for group in &groups {
            group.invalidate_current_contribution();
        }

        self.set_state(SenderState::Armed);
        report.elapsed = started.elapsed();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .max_tick_us
            .fetch_max(report.elapsed.as_micros() as u64, Ordering::Relaxed);
        tracing::trace!("Tick {:?}", report);
        report
    }

    /// Count a tick that finished past its deadline. Returns true if it
    /// was logged.
    fn note_overrun(&self, behind: Duration) -> bool {
        let late = self.stats.late_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if late % LATE_TICK_LOG_EVERY != 1 {
            return false;
        }
        tracing::warn!(
            "Conference sender {:?} late by {:?} ({} late ticks)",
            self.scope,
            behind,
            late
        );
        true
    }

    /// Tick every period until `running` is cleared
    pub fn run(&self, running: &AtomicBool) {
        tracing::info!("Conference sender {:?} started, period {:?}", self.scope, self.period);
        let mut deadline = Instant::now() + self.period;

        while running.load(Ordering::Acquire) {
            if self.registry.member_count(&self.scope) == 0 {
                self.set_state(SenderState::Stopped);
                tracing::debug!("Conference sender {:?} parked, no members", self.scope);
                while running.load(Ordering::Acquire)
                    && !self.registry.wait_for_members(&self.scope, PARK_TIMEOUT)
                {}
                self.set_state(SenderState::Armed);
                deadline = Instant::now() + self.period;
                continue;
            }

            self.tick(Instant::now());

            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            } else if now > deadline {
                self.note_overrun(now - deadline);
            }

            deadline += self.period;
            if now > deadline + self.period * MAX_BEHIND_TICKS {
                deadline = now + self.period;
            }
        }

        self.set_state(SenderState::Stopped);
        tracing::info!("Conference sender {:?} stopped", self.scope);
    }

    /// Run on a dedicated thread
    pub fn spawn(self) -> std::io::Result<SenderHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let registry = self.registry.clone();
        let name = match &self.scope {
            SenderScope::All => "conference-sender".to_string(),
            SenderScope::Conference(id) => format!("sender-{}", id),
        };

        let flag = running.clone();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || self.run(&flag))?;

        Ok(SenderHandle {
            running,
            registry,
            thread: Some(thread),
        })
    }
}

/// Stops a spawned sender when dropped
pub struct SenderHandle {
    running: Arc<AtomicBool>,
    registry: Arc<ConferenceRegistry>,
    thread: Option<JoinHandle<()>>,
}

impl SenderHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.registry.wake();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            let _ = thread.join();
        }
    }
}

impl Drop for SenderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
