//! Pin-and-cycle page locking
//!
//! Each step maps three anonymous pages and pins the middle one with
//! `mlock(2)`. Mappings pile up until the mapping budget is reached or the
//! kernel refuses to map or pin another page. The worker then releases every
//! mapping and runs a lock-all round: `mlockall` current and future pages, map
//! single pages until the budget or the kernel runs out, `munlockall`, unmap.
//!
//! A pin refused with `EAGAIN` leaves its mapping in place unpinned.
//!
//! The loop runs in a child process that volunteers for the OOM killer. If the
//! child dies by SIGKILL while the run is still going it is started again.

use super::{StressArgs, Stressor, StressorKind};
use crate::control::CancellationToken;
use crate::error::StressError;
use crate::pool::ResourcePool;
use crate::stats::SensorSampler;
use crate::worker::process::{WorkerExit, EXIT_FAILURE, EXIT_SUCCESS};
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver, WorkerProcess, WorkerSummary};
use std::io;
use std::sync::atomic::AtomicU64;

/// Most mappings a worker holds at once
pub const MLOCK_MAX: usize = 256 * 1024;

/// Pages per mapping; only the middle one is pinned
const MAPPING_PAGES: usize = 3;

/// Mapping budget: [`MLOCK_MAX`], lowered to the system's mapped-files limit
pub fn mapping_limit() -> usize {
    let limit = unsafe { libc::sysconf(libc::_SC_MAPPED_FILES) };
    if limit <= 0 {
        return MLOCK_MAX;
    }
    (limit as usize).min(MLOCK_MAX)
}

/// Maps, pins and releases anonymous pages
pub trait PageLocker {
    fn page_size(&self) -> usize;

    /// Map `pages` anonymous pages, returning the start address
    fn map(&mut self, pages: usize) -> io::Result<usize>;

    fn unmap(&mut self, addr: usize, pages: usize) -> io::Result<()>;

    /// Pin one page
    fn lock(&mut self, addr: usize) -> io::Result<()>;

    fn unlock(&mut self, addr: usize) -> io::Result<()>;

    /// Pin everything mapped now and in future
    fn lock_all(&mut self) -> io::Result<()>;

    fn unlock_all(&mut self) -> io::Result<()>;
}

/// [`PageLocker`] backed by `mmap`/`mlock`
#[derive(Debug)]
pub struct SystemPages {
    page_size: usize,
}

impl SystemPages {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: if page_size > 0 { page_size as usize } else { 4096 },
        }
    }
}

impl Default for SystemPages {
    fn default() -> Self {
        Self::new()
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl PageLocker for SystemPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&mut self, pages: usize) -> io::Result<usize> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                pages * self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(addr as usize)
    }

    fn unmap(&mut self, addr: usize, pages: usize) -> io::Result<()> {
        check(unsafe { libc::munmap(addr as *mut libc::c_void, pages * self.page_size) })
    }

    fn lock(&mut self, addr: usize) -> io::Result<()> {
        check(unsafe { libc::mlock(addr as *const libc::c_void, self.page_size) })
    }

    fn unlock(&mut self, addr: usize) -> io::Result<()> {
        check(unsafe { libc::munlock(addr as *const libc::c_void, self.page_size) })
    }

    fn lock_all(&mut self) -> io::Result<()> {
        check(unsafe { libc::mlockall(libc::MCL_CURRENT) })?;
        check(unsafe { libc::mlockall(libc::MCL_FUTURE) })
    }

    fn unlock_all(&mut self) -> io::Result<()> {
        check(unsafe { libc::munlockall() })
    }
}

/// Pool record for one three-page mapping
#[derive(Debug, Default, Clone, Copy)]
pub struct Mapping {
    pub addr: usize,
    /// The middle page is pinned
    pub locked: bool,
}

fn release_mapping<P: PageLocker>(pager: &mut P, mapping: &mut Mapping) -> Result<(), StressError> {
    let page = pager.page_size();
    if mapping.locked {
        mapping.locked = false;
        pager.unlock(mapping.addr + page).map_err(|source| StressError::Operational {
            what: "munlock",
            source,
        })?;
    }
    pager
        .unmap(mapping.addr, MAPPING_PAGES)
        .map_err(|source| StressError::Operational { what: "munmap", source })
}

/// The pin-and-cycle [`ContentionStrategy`]
pub struct PinAndCycle<P: PageLocker> {
    pager: P,
    max_mappings: usize,
    cycles: u64,
}

impl<P: PageLocker> PinAndCycle<P> {
    pub fn new(pager: P, max_mappings: usize) -> Self {
        Self {
            pager,
            max_mappings: max_mappings.max(1),
            cycles: 0,
        }
    }

    pub fn pager(&self) -> &P {
        &self.pager
    }

    /// Lock-all rounds run so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Release every mapping, then run a lock-all round
    fn cycle(&mut self, pool: &mut ResourcePool<Mapping>, ctx: &StepContext<'_>) -> Result<(), StressError> {
        let pager = &mut self.pager;
        let mut first_error = None;
        pool.drain_all(|mapping| {
            if let Err(e) = release_mapping(pager, mapping) {
                first_error.get_or_insert(e);
            }
        });
        if let Some(e) = first_error {
            return Err(e);
        }

        self.cycles += 1;
        if let Err(e) = self.pager.lock_all() {
            tracing::trace!("mlockall: {}", e);
        }

        let mut pages = Vec::new();
        while pages.len() < self.max_mappings && ctx.is_running() {
            match self.pager.map(1) {
                Ok(addr) => pages.push(addr),
                Err(_) => break,
            }
        }

        if let Err(e) = self.pager.unlock_all() {
            tracing::trace!("munlockall: {}", e);
        }
        for addr in pages {
            self.pager
                .unmap(addr, 1)
                .map_err(|source| StressError::Operational { what: "munmap", source })?;
        }
        Ok(())
    }
}

impl<P: PageLocker> ContentionStrategy for PinAndCycle<P> {
    type Record = Mapping;

    fn step(&mut self, pool: &mut ResourcePool<Mapping>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
        if pool.len() >= self.max_mappings {
            self.cycle(pool, ctx)?;
            return Ok(StepOutcome::Evicted);
        }

        let addr = match self.pager.map(MAPPING_PAGES) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::trace!("mmap refused with {} mappings live: {}", pool.len(), err);
                self.cycle(pool, ctx)?;
                return Ok(StepOutcome::Backpressure);
            }
        };
        let handle = match pool.allocate_with(Mapping::default) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(unmap_err) = self.pager.unmap(addr, MAPPING_PAGES) {
                    tracing::warn!("munmap after failed allocation: {}", unmap_err);
                }
                return Err(e.into());
            }
        };
        *pool.get_mut(handle) = Mapping { addr, locked: false };

        match self.pager.lock(addr + self.pager.page_size()) {
            Ok(()) => {
                pool.get_mut(handle).locked = true;
                ctx.bump();
                Ok(StepOutcome::Progress)
            }
            Err(err) if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) => {
                Ok(StepOutcome::Backpressure)
            }
            Err(err) => {
                tracing::trace!("mlock refused with {} mappings live: {}", pool.len(), err);
                self.cycle(pool, ctx)?;
                Ok(StepOutcome::Backpressure)
            }
        }
    }

    fn release(&mut self, mapping: &mut Mapping) -> Result<(), StressError> {
        release_mapping(&mut self.pager, mapping)
    }

    fn finish(&mut self, name: &str, summary: &WorkerSummary) {
        tracing::debug!(
            "{}: pinned up to {} mappings, {} lock-all rounds",
            name,
            summary.peak_live,
            self.cycles
        );
    }
}

/// Make this process the OOM killer's first choice
fn volunteer_for_oom_killer(name: &str) {
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", "1000") {
        tracing::debug!("{}: can't adjust OOM score: {}", name, e);
    }
}

/// Body of the pinning child
fn pin_pages(
    name: &str,
    max_mappings: usize,
    token: &CancellationToken<'_>,
    counter: &AtomicU64,
    sampler: Option<&mut SensorSampler<'_>>,
) -> i32 {
    volunteer_for_oom_killer(name);
    let mut strategy = PinAndCycle::new(SystemPages::new(), max_mappings);
    match WorkerDriver::new(name).run(&mut strategy, token, counter, sampler) {
        Ok(_) => EXIT_SUCCESS,
        Err(_) => EXIT_FAILURE,
    }
}

/// The mlock stressor
#[derive(Debug, Clone)]
pub struct MlockStressor {
    max_mappings: usize,
}

impl MlockStressor {
    pub fn new(max_mappings: usize) -> Self {
        Self {
            max_mappings: max_mappings.clamp(1, MLOCK_MAX),
        }
    }

    pub fn max_mappings(&self) -> usize {
        self.max_mappings
    }
}

impl Default for MlockStressor {
    fn default() -> Self {
        Self::new(mapping_limit())
    }
}

impl Stressor for MlockStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Mlock
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let name = args.name;
        let controller = args.controller;
        let counter = args.counter;
        let token = args.token();
        let max_mappings = self.max_mappings;

        loop {
            let spawned = {
                let sampler = args.sampler_mut();
                WorkerProcess::spawn(Some(&controller), || pin_pages(name, max_mappings, &token, counter, sampler))
            };
            let mut child = spawned.map_err(|e| {
                args.fail(StressError::setup("fork", io::Error::new(io::ErrorKind::Other, format!("{:#}", e))))
            })?;

            let exit = child.wait().map_err(|e| {
                args.fail(StressError::Operational {
                    what: "waitpid",
                    source: io::Error::new(io::ErrorKind::Other, format!("{:#}", e)),
                })
            })?;
            match exit {
                WorkerExit::Success => return Ok(()),
                WorkerExit::Signaled(libc::SIGKILL) if token.should_continue(counter) => {
                    tracing::debug!("{}: child killed, assuming the OOM killer; restarting", name);
                }
                // The child counted its own failure
                WorkerExit::Failed(code) => {
                    return Err(StressError::Operational {
                        what: "mlock child",
                        source: io::Error::new(io::ErrorKind::Other, format!("exited with status {}", code)),
                    });
                }
                WorkerExit::Signaled(sig) => {
                    if !token.should_continue(counter) {
                        return Ok(());
                    }
                    return Err(args.fail(StressError::Operational {
                        what: "mlock child",
                        source: io::Error::new(io::ErrorKind::Other, format!("killed by signal {}", sig)),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlBlock, RunController};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::Ordering;

    const PAGE: usize = 4096;

    /// Hands out fake addresses and tracks what is mapped and pinned
    #[derive(Default)]
    struct FakePager {
        next: usize,
        mapped: HashMap<usize, usize>,
        locked: HashSet<usize>,
        max_locked: usize,
        /// Refuse pins with this errno once `lock_limit` pages are pinned
        lock_limit: Option<(usize, i32)>,
        /// Refuse maps once this many regions are mapped
        map_limit: Option<usize>,
        lock_all_calls: u64,
        unlock_all_calls: u64,
        all_locked: bool,
        single_pages: usize,
    }

    impl PageLocker for FakePager {
        fn page_size(&self) -> usize {
            PAGE
        }

        fn map(&mut self, pages: usize) -> io::Result<usize> {
            if let Some(limit) = self.map_limit {
                if self.mapped.len() >= limit {
                    return Err(io::Error::from_raw_os_error(libc::ENOMEM));
                }
            }
            self.next += (pages + 1) * PAGE;
            self.mapped.insert(self.next, pages);
            if pages == 1 {
                assert!(self.all_locked, "single pages are only mapped during lock-all");
                self.single_pages += 1;
            }
            Ok(self.next)
        }

        fn unmap(&mut self, addr: usize, pages: usize) -> io::Result<()> {
            assert_eq!(self.mapped.remove(&addr), Some(pages));
            assert!(!self.locked.contains(&(addr + PAGE)), "unmapping a pinned page");
            Ok(())
        }

        fn lock(&mut self, addr: usize) -> io::Result<()> {
            assert!(self.mapped.contains_key(&(addr - PAGE)));
            if let Some((limit, errno)) = self.lock_limit {
                if self.locked.len() >= limit {
                    return Err(io::Error::from_raw_os_error(errno));
                }
            }
            self.locked.insert(addr);
            self.max_locked = self.max_locked.max(self.locked.len());
            Ok(())
        }

        fn unlock(&mut self, addr: usize) -> io::Result<()> {
            assert!(self.locked.remove(&addr), "unlock of a page that is not pinned");
            Ok(())
        }

        fn lock_all(&mut self) -> io::Result<()> {
            self.lock_all_calls += 1;
            self.all_locked = true;
            Ok(())
        }

        fn unlock_all(&mut self) -> io::Result<()> {
            self.unlock_all_calls += 1;
            self.all_locked = false;
            Ok(())
        }
    }

    fn run(pager: FakePager, max_mappings: usize, cap: u64) -> (PinAndCycle<FakePager>, WorkerSummary, u64) {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 1), cap);
        let counter = AtomicU64::new(0);
        let mut strategy = PinAndCycle::new(pager, max_mappings);
        let summary = WorkerDriver::new("mlock")
            .run(&mut strategy, &token, &counter, None)
            .unwrap();
        (strategy, summary, counter.load(Ordering::Relaxed))
    }

    #[test]
    fn test_cycles_at_budget() {
        let (strategy, summary, count) = run(FakePager::default(), 8, 20);

        assert_eq!(count, 20);
        assert_eq!(summary.successes, 20);
        assert_eq!(summary.evictions, 2);
        assert_eq!(summary.peak_live, 8);
        assert_eq!(summary.drained, 4);
        assert_eq!(strategy.cycles(), 2);

        let pager = strategy.pager();
        assert_eq!(pager.max_locked, 8);
        assert_eq!(pager.lock_all_calls, 2);
        assert_eq!(pager.unlock_all_calls, 2);
        assert_eq!(pager.single_pages, 16);
        assert!(pager.mapped.is_empty());
        assert!(pager.locked.is_empty());
    }

    #[test]
    fn test_eagain_leaves_mapping_unpinned() {
        let pager = FakePager {
            lock_limit: Some((3, libc::EAGAIN)),
            ..Default::default()
        };
        let (strategy, summary, count) = run(pager, 6, 5);

        // Three pins, three unpinned mappings, a cycle at the budget, two more pins
        assert_eq!(count, 5);
        assert_eq!(summary.successes, 5);
        assert_eq!(summary.backpressure, 3);
        assert_eq!(summary.evictions, 1);
        assert_eq!(summary.peak_live, 6);
        assert_eq!(summary.drained, 2);
        assert_eq!(strategy.pager().max_locked, 3);
        assert!(strategy.pager().mapped.is_empty());
        assert!(strategy.pager().locked.is_empty());
    }

    #[test]
    fn test_refused_pin_cycles() {
        let pager = FakePager {
            lock_limit: Some((5, libc::ENOMEM)),
            ..Default::default()
        };
        let (strategy, summary, count) = run(pager, 100, 50);

        assert_eq!(count, 50);
        assert_eq!(strategy.pager().max_locked, 5);
        // Every sixth step is refused and cycles
        assert_eq!(summary.backpressure, 9);
        assert_eq!(strategy.cycles(), 9);
        assert!(strategy.pager().mapped.is_empty());
    }

    #[test]
    fn test_refused_map_cycles() {
        let pager = FakePager {
            map_limit: Some(4),
            ..Default::default()
        };
        let (strategy, summary, count) = run(pager, 100, 12);

        assert_eq!(count, 12);
        assert_eq!(summary.peak_live, 4);
        assert_eq!(summary.backpressure, 2);
        assert_eq!(strategy.cycles(), 2);
        assert!(strategy.pager().mapped.is_empty());
    }

    #[test]
    fn test_mapping_limit_in_range() {
        let limit = mapping_limit();
        assert!(limit >= 1 && limit <= MLOCK_MAX);
        assert_eq!(MlockStressor::new(0).max_mappings(), 1);
        assert_eq!(MlockStressor::new(usize::MAX).max_mappings(), MLOCK_MAX);
    }

    #[test]
    fn test_system_pages_map_and_pin() {
        let mut pages = SystemPages::new();
        let page = pages.page_size();
        let addr = pages.map(MAPPING_PAGES).unwrap();
        assert_eq!(addr % page, 0);

        // Unprivileged runs may have no lockable memory at all
        let mut mapping = Mapping {
            addr,
            locked: pages.lock(addr + page).is_ok(),
        };
        release_mapping(&mut pages, &mut mapping).unwrap();
        assert!(!mapping.locked);
    }
}
