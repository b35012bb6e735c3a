//! Churn-and-reap process spawning
//!
//! Each worker keeps up to `max_concurrent` clone children alive. Every step
//! either starts one more child or, once the live set is full, reaps the
//! oldest so the next step can start a fresh one. A refused clone (process
//! limit, missing privileges for a namespace flag) is backpressure: the oldest
//! child is reaped to free a slot and the loop carries on.
//!
//! # Clone children
//!
//! Children are started with `clone(2)` on a 32 KiB stack owned by their pool
//! record, with one flag drawn uniformly from [`CLONE_FLAGS`]. No exit signal
//! is requested, so children are reaped with `waitpid(pid, __WCLONE)`. A child
//! only calls `unshare(2)` for each of [`UNSHARE_FLAGS`] and exits.
//!
//! Records are recycled through the pool, so a stack buffer is allocated once
//! per slot and reused by every child that later occupies the slot. A record is
//! only reused after its previous child has been reaped.

use super::{StressArgs, Stressor, StressorKind};
use crate::error::{PoolError, StressError};
use crate::pool::ResourcePool;
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver, WorkerSummary};
use libc::{c_int, pid_t};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::io;

/// Default live clones per worker
pub const DEFAULT_CLONES: u64 = 8192;
pub const MIN_CLONES: u64 = 1;
pub const MAX_CLONES: u64 = 1_000_000;

/// Stack given to each clone child
pub const CLONE_STACK_SIZE: usize = 32 * 1024;

/// Flags a child may be started with, drawn uniformly per clone
pub const CLONE_FLAGS: [c_int; 13] = [
    0,
    libc::CLONE_FILES,
    libc::CLONE_FS,
    libc::CLONE_IO,
    libc::CLONE_NEWIPC,
    libc::CLONE_NEWNET,
    libc::CLONE_NEWNS,
    libc::CLONE_NEWUSER,
    libc::CLONE_NEWUTS,
    libc::CLONE_SIGHAND,
    libc::CLONE_SYSVSEM,
    libc::CLONE_UNTRACED,
    libc::CLONE_VM,
];

/// Resources every child tries to unshare before exiting
pub const UNSHARE_FLAGS: [c_int; 7] = [
    libc::CLONE_FILES,
    libc::CLONE_FS,
    libc::CLONE_NEWIPC,
    libc::CLONE_NEWNET,
    libc::CLONE_NEWNS,
    libc::CLONE_NEWUTS,
    libc::CLONE_SYSVSEM,
];

/// `__WCLONE`: wait for children that deliver no exit signal
const WCLONE: c_int = 0x8000_0000_u32 as c_int;

/// Pool record for one clone child
#[derive(Debug)]
pub struct CloneRecord {
    /// Child pid; `None` if the clone attempt using this record was refused
    pub pid: Option<pid_t>,
    stack: Vec<u8>,
}

impl CloneRecord {
    fn try_new(live: usize) -> Result<Self, PoolError> {
        let mut stack = Vec::new();
        stack
            .try_reserve_exact(CLONE_STACK_SIZE)
            .map_err(|_| PoolError::OutOfMemory { live })?;
        stack.resize(CLONE_STACK_SIZE, 0);
        Ok(Self { pid: None, stack })
    }
}

/// Starts and reaps children
pub trait Spawner {
    /// Start a child running on `stack` with `flags`, returning its pid
    fn spawn(&mut self, stack: &mut [u8], flags: c_int) -> io::Result<pid_t>;

    /// Wait for a child returned by `spawn` to exit
    fn reap(&mut self, pid: pid_t) -> io::Result<()>;
}

/// [`Spawner`] backed by `clone(2)`
#[derive(Debug, Default)]
pub struct CloneSpawner;

#[cfg(target_os = "linux")]
impl Spawner for CloneSpawner {
    fn spawn(&mut self, stack: &mut [u8], flags: c_int) -> io::Result<pid_t> {
        // Stacks grow down on every supported target; keep the top 16-byte aligned
        let top = (stack.as_mut_ptr_range().end as usize) & !0xf;
        let pid = unsafe {
            libc::clone(
                clone_child,
                top as *mut libc::c_void,
                flags,
                std::ptr::null_mut(),
            )
        };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pid)
    }

    fn reap(&mut self, pid: pid_t) -> io::Result<()> {
        loop {
            let mut status: c_int = 0;
            if unsafe { libc::waitpid(pid, &mut status, WCLONE) } >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Already reaped
                Some(libc::ECHILD) => return Ok(()),
                _ => return Err(err),
            }
        }
    }
}

#[cfg(target_os = "linux")]
extern "C" fn clone_child(_arg: *mut libc::c_void) -> c_int {
    for flag in UNSHARE_FLAGS {
        unsafe { libc::unshare(flag) };
    }
    0
}

/// The churn-and-reap [`ContentionStrategy`]
pub struct ChurnAndReap<S: Spawner> {
    spawner: S,
    max_concurrent: usize,
    rng: Xoshiro256PlusPlus,
    peak: usize,
}

impl<S: Spawner> ChurnAndReap<S> {
    pub fn new(spawner: S, max_concurrent: u64, rng: Xoshiro256PlusPlus) -> Self {
        let max_concurrent = max_concurrent.clamp(MIN_CLONES, MAX_CLONES) as usize;
        Self {
            spawner,
            max_concurrent,
            rng,
            peak: 0,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Most children that were alive at once
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    fn reap_oldest(&mut self, pool: &mut ResourcePool<CloneRecord>) -> Result<(), StressError> {
        if let Some(record) = pool.evict_oldest() {
            self.release(record)?;
        }
        Ok(())
    }
}

impl<S: Spawner> ContentionStrategy for ChurnAndReap<S> {
    type Record = CloneRecord;

    fn step(
        &mut self,
        pool: &mut ResourcePool<CloneRecord>,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutcome, StressError> {
        if pool.len() >= self.max_concurrent {
            self.reap_oldest(pool)?;
            return Ok(StepOutcome::Evicted);
        }

        let live = pool.len();
        let handle = pool.try_allocate_with(|| CloneRecord::try_new(live))?;
        let flags = CLONE_FLAGS[self.rng.gen_range(0..CLONE_FLAGS.len())];

        let record = pool.get_mut(handle);
        match self.spawner.spawn(&mut record.stack, flags) {
            Ok(pid) => {
                record.pid = Some(pid);
                ctx.bump();
                self.peak = self.peak.max(pool.len());
                Ok(StepOutcome::Progress)
            }
            Err(err) => {
                record.pid = None;
                tracing::trace!("clone with flags {:#x} refused: {}", flags, err);
                self.reap_oldest(pool)?;
                Ok(StepOutcome::Backpressure)
            }
        }
    }

    fn release(&mut self, record: &mut CloneRecord) -> Result<(), StressError> {
        match record.pid.take() {
            Some(pid) => self
                .spawner
                .reap(pid)
                .map_err(|source| StressError::Operational {
                    what: "waitpid",
                    source,
                }),
            None => Ok(()),
        }
    }

    fn finish(&mut self, name: &str, _summary: &WorkerSummary) {
        tracing::info!("{}: created a maximum of {} clones", name, self.peak);
    }
}

/// The clone stressor
#[derive(Debug, Clone)]
pub struct CloneStressor {
    max_clones: u64,
}

impl CloneStressor {
    pub fn new(max_clones: u64) -> Self {
        Self { max_clones }
    }

    pub fn max_clones(&self) -> u64 {
        self.max_clones
    }
}

impl Stressor for CloneStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Clone
    }

    #[cfg(target_os = "linux")]
    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let mut strategy = ChurnAndReap::new(CloneSpawner, self.max_clones, args.rng());
        let token = args.token();
        let counter = args.counter;
        WorkerDriver::new(args.name)
            .run(&mut strategy, &token, counter, args.sampler_mut())
            .map(|_| ())
    }

    #[cfg(not(target_os = "linux"))]
    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        Err(args.fail(StressError::setup(
            "clone",
            io::Error::new(io::ErrorKind::Unsupported, "clone(2) is Linux only"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CancellationToken, ControlBlock, RunController};
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Hands out sequential pids; refuses every `fail_every`-th spawn
    #[derive(Default)]
    struct FakeSpawner {
        next_pid: pid_t,
        attempts: u64,
        fail_every: Option<u64>,
        live: HashSet<pid_t>,
        reaped: Vec<pid_t>,
        max_live: usize,
    }

    impl Spawner for FakeSpawner {
        fn spawn(&mut self, stack: &mut [u8], flags: c_int) -> io::Result<pid_t> {
            assert_eq!(stack.len(), CLONE_STACK_SIZE);
            assert!(CLONE_FLAGS.contains(&flags));
            self.attempts += 1;
            if let Some(every) = self.fail_every {
                if self.attempts % every == 0 {
                    return Err(io::Error::from_raw_os_error(libc::EAGAIN));
                }
            }
            self.next_pid += 1;
            self.live.insert(self.next_pid);
            self.max_live = self.max_live.max(self.live.len());
            Ok(self.next_pid)
        }

        fn reap(&mut self, pid: pid_t) -> io::Result<()> {
            assert!(self.live.remove(&pid), "pid {} reaped twice or never spawned", pid);
            self.reaped.push(pid);
            Ok(())
        }
    }

    fn run_fake(spawner: FakeSpawner, max: u64, cap: u64) -> (ChurnAndReap<FakeSpawner>, WorkerSummary, u64) {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), cap);
        let counter = AtomicU64::new(0);
        let mut strategy = ChurnAndReap::new(spawner, max, Xoshiro256PlusPlus::seed_from_u64(7));

        let summary = WorkerDriver::new("clone")
            .run(&mut strategy, &token, &counter, None)
            .unwrap();
        let count = counter.load(Ordering::Relaxed);
        (strategy, summary, count)
    }

    #[test]
    fn test_steady_state_churn() {
        let (strategy, summary, count) = run_fake(FakeSpawner::default(), 4, 100);

        assert_eq!(count, 100);
        assert_eq!(strategy.peak(), 4);
        assert_eq!(strategy.spawner().max_live, 4);
        assert_eq!(summary.backed, 4);

        // Every child reaped exactly once, oldest first
        assert!(strategy.spawner().live.is_empty());
        assert_eq!(strategy.spawner().reaped, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn test_refused_clone_reaps_oldest() {
        let spawner = FakeSpawner {
            fail_every: Some(3),
            ..Default::default()
        };
        let (strategy, summary, count) = run_fake(spawner, 16, 60);

        assert_eq!(count, 60);
        assert!(summary.backpressure > 0);
        assert!(strategy.spawner().live.is_empty());

        let reaped = &strategy.spawner().reaped;
        assert_eq!(reaped.len(), 60);
        let mut sorted = reaped.clone();
        sorted.sort_unstable();
        assert_eq!(&sorted, reaped);
    }

    #[test]
    fn test_always_refused_still_terminates() {
        let spawner = FakeSpawner {
            fail_every: Some(1),
            ..Default::default()
        };
        let (strategy, summary, count) = run_fake(spawner, 8, 40);

        assert_eq!(count, 0);
        assert_eq!(summary.iterations, 40);
        assert_eq!(summary.backpressure, 40);
        // Allocate, refuse, evict: the live set never builds up
        assert_eq!(summary.peak_live, 0);
        assert_eq!(summary.backed, 1);
        assert_eq!(strategy.peak(), 0);
        assert!(strategy.spawner().reaped.is_empty());
    }

    #[test]
    fn test_max_concurrent_clamped() {
        let rng = Xoshiro256PlusPlus::seed_from_u64(1);
        assert_eq!(ChurnAndReap::new(FakeSpawner::default(), 0, rng.clone()).max_concurrent(), 1);
        assert_eq!(
            ChurnAndReap::new(FakeSpawner::default(), u64::MAX, rng).max_concurrent(),
            MAX_CLONES as usize
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_clones_are_reaped() {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), 32);
        let counter = AtomicU64::new(0);
        let mut strategy = ChurnAndReap::new(CloneSpawner, 8, Xoshiro256PlusPlus::seed_from_u64(42));

        let summary = WorkerDriver::new("clone")
            .run(&mut strategy, &token, &counter, None)
            .unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 32);
        assert!(strategy.peak() <= 8);
        assert!(summary.backed <= 8);

        // Nothing left to reap
        let mut status = 0;
        let rc = unsafe { libc::waitpid(-1, &mut status, WCLONE | libc::WNOHANG) };
        assert!(rc <= 0);
    }
}
