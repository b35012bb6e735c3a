//! Acquire-or-evict byte-range locking
//!
//! Two processes (the worker and a forked sibling) hammer the same 64 KiB
//! scratch file with 8-byte advisory locks at random offsets. A granted lock is
//! recorded in the pool; a denied one (conflict, deadlock detected, lock table
//! full) releases the oldest held lock instead of retrying. Once [`LOCK_MAX`]
//! locks are held the oldest is released before every new attempt, so the live
//! set stays bounded whatever the success rate.
//!
//! Lock attempts either block (`F_LOCK`) or fail fast on conflict
//! (`F_TLOCK`), selected by [`LockMode`]. Blocking attempts between the two
//! processes can deadlock; the kernel reports that as `EDEADLK`, which is just
//! another denial here.

use super::{StressArgs, Stressor, StressorKind};
use crate::config::workload::LockMode;
use crate::control::{CancellationToken, RunController};
use crate::error::StressError;
use crate::pool::ResourcePool;
use crate::worker::process::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver, WorkerProcess};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

/// Size of the scratch file
pub const LOCK_FILE_SIZE: u64 = 64 * 1024;
/// Length of each locked range
pub const LOCK_SIZE: u64 = 8;
/// Most locks a process holds at once
pub const LOCK_MAX: usize = 1024;

const FILL_CHUNK: usize = 4096;

/// Result of a lock attempt that did not hit a hard error
#[derive(Debug)]
pub enum LockAttempt {
    Acquired,
    /// The OS refused the lock; the strategy evicts instead of retrying
    Denied(io::Error),
}

/// Takes and releases fixed-length byte-range locks
pub trait RangeLocker {
    /// Try to lock `LOCK_SIZE` bytes at `offset`
    fn try_lock(&mut self, offset: u64) -> Result<LockAttempt, StressError>;

    /// Release the lock at `offset`
    fn unlock(&mut self, offset: u64) -> Result<(), StressError>;
}

/// [`RangeLocker`] backed by `lockf(3)` on an open file
///
/// `lockf` locks from the current file position, so every call seeks first.
/// The descriptor's file position must not be shared with another process.
pub struct LockfLocker<'f> {
    file: &'f File,
    mode: LockMode,
}

impl<'f> LockfLocker<'f> {
    pub fn new(file: &'f File, mode: LockMode) -> Self {
        Self { file, mode }
    }

    fn seek(&self, offset: u64) -> Result<(), StressError> {
        let rc = unsafe { libc::lseek(self.file.as_raw_fd(), offset as libc::off_t, libc::SEEK_SET) };
        if rc < 0 {
            return Err(StressError::last_os("lseek"));
        }
        Ok(())
    }
}

impl RangeLocker for LockfLocker<'_> {
    fn try_lock(&mut self, offset: u64) -> Result<LockAttempt, StressError> {
        self.seek(offset)?;

        let cmd = match self.mode {
            LockMode::Blocking => libc::F_LOCK,
            LockMode::NonBlocking => libc::F_TLOCK,
        };
        if unsafe { libc::lockf(self.file.as_raw_fd(), cmd, LOCK_SIZE as libc::off_t) } == 0 {
            return Ok(LockAttempt::Acquired);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Err(StressError::Interrupted);
        }
        Ok(LockAttempt::Denied(err))
    }

    fn unlock(&mut self, offset: u64) -> Result<(), StressError> {
        self.seek(offset)?;

        let fd = self.file.as_raw_fd();
        retry_interrupted(|| {
            if unsafe { libc::lockf(fd, libc::F_ULOCK, LOCK_SIZE as libc::off_t) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        })
        .map_err(|source| StressError::Operational {
            what: "lockf unlock",
            source,
        })
    }
}

/// Repeat `call` while it fails with `EINTR`
fn retry_interrupted(mut call: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    loop {
        match call() {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            result => return result,
        }
    }
}

/// The acquire-or-evict [`ContentionStrategy`]; records are lock offsets
pub struct AcquireOrEvict<L: RangeLocker> {
    locker: L,
    rng: Xoshiro256PlusPlus,
    lock_max: usize,
}

impl<L: RangeLocker> AcquireOrEvict<L> {
    pub fn new(locker: L, rng: Xoshiro256PlusPlus) -> Self {
        Self::with_lock_max(locker, rng, LOCK_MAX)
    }

    pub fn with_lock_max(locker: L, rng: Xoshiro256PlusPlus, lock_max: usize) -> Self {
        Self {
            locker,
            rng,
            lock_max: lock_max.max(1),
        }
    }

    pub fn locker(&self) -> &L {
        &self.locker
    }

    fn unlock_oldest(&mut self, pool: &mut ResourcePool<u64>) -> Result<(), StressError> {
        if let Some(offset) = pool.evict_oldest() {
            self.locker.unlock(*offset)?;
        }
        Ok(())
    }
}

impl<L: RangeLocker> ContentionStrategy for AcquireOrEvict<L> {
    type Record = u64;

    fn step(&mut self, pool: &mut ResourcePool<u64>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
        if pool.len() >= self.lock_max {
            self.unlock_oldest(pool)?;
        }

        let offset = self.rng.gen_range(0..LOCK_FILE_SIZE - LOCK_SIZE);
        match self.locker.try_lock(offset)? {
            LockAttempt::Acquired => {
                let handle = match pool.allocate_with(|| 0) {
                    Ok(handle) => handle,
                    Err(e) => {
                        // Untracked locks would never be released
                        if let Err(unlock_err) = self.locker.unlock(offset) {
                            tracing::warn!("unlock at {} after failed allocation: {}", offset, unlock_err);
                        }
                        return Err(e.into());
                    }
                };
                *pool.get_mut(handle) = offset;
                ctx.bump();
                Ok(StepOutcome::Progress)
            }
            LockAttempt::Denied(err) => {
                tracing::trace!("lock at {} denied: {}", offset, err);
                self.unlock_oldest(pool)?;
                Ok(StepOutcome::Backpressure)
            }
        }
    }

    fn release(&mut self, offset: &mut u64) -> Result<(), StressError> {
        self.locker.unlock(*offset)
    }
}

/// Scratch directory and zero-filled lock file, removed on drop
pub struct ScratchFile {
    dir: PathBuf,
    path: PathBuf,
    file: File,
}

impl ScratchFile {
    /// Create `<temp_path>/.<name>-<pid>-<instance>/<name>-<pid>-<instance>-<random>`
    pub fn create(
        temp_path: &Path,
        name: &str,
        instance: u32,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self, StressError> {
        let pid = std::process::id();
        let dir = temp_path.join(format!(".{}-{}-{}", name, pid, instance));
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(StressError::setup("mkdir", e)),
        }

        let path = dir.join(format!("{}-{}-{}-{}", name, pid, instance, rng.gen::<u32>()));
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_dir(&dir);
                return Err(StressError::setup("open", e));
            }
        };

        Ok(Self { dir, path, file })
    }

    /// Zero-fill the file to [`LOCK_FILE_SIZE`]
    ///
    /// Returns `Ok(false)` if the run was stopped before the file was full.
    pub fn fill(&mut self, controller: &RunController<'_>) -> Result<bool, StressError> {
        let chunk = [0u8; FILL_CHUNK];
        let mut written = 0u64;

        while written < LOCK_FILE_SIZE {
            if !controller.is_running() {
                return Ok(false);
            }
            match self.file.write(&chunk) {
                Ok(0) => {
                    return Err(StressError::setup("write", io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => written += n as u64,
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
                Err(e) => return Err(StressError::setup("write", e)),
            }
        }

        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            tracing::warn!("Failed to remove {}: {}", self.dir.display(), e);
        }
    }
}

/// The lockf stressor
#[derive(Debug, Clone)]
pub struct LockfStressor {
    mode: LockMode,
}

impl LockfStressor {
    pub fn new(mode: LockMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Stressor for LockfStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Lockf
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let mut rng = args.rng();
        let controller = args.controller;
        let mut scratch = ScratchFile::create(args.temp_path, args.name, args.instance, &mut rng)
            .map_err(|e| args.fail(e))?;
        if !scratch.fill(&controller).map_err(|e| args.fail(e))? {
            return Ok(());
        }

        let name = args.name;
        let counter = args.counter;
        let token = args.token();
        let mode = self.mode;
        let sibling_seed = rng.gen::<u64>();
        let path = scratch.path().to_path_buf();

        let mut sibling = WorkerProcess::spawn(Some(&controller), || {
            run_sibling(&path, mode, sibling_seed, &token, counter, name)
        })
        .map_err(|e| args.fail(StressError::setup("fork", io::Error::new(io::ErrorKind::Other, format!("{:#}", e)))))?;
        tracing::debug!("{}: sibling {} contending on {}", name, sibling.pid(), path.display());

        let mut strategy = AcquireOrEvict::new(LockfLocker::new(scratch.file(), mode), rng);
        let result = WorkerDriver::new(name).run(&mut strategy, &token, counter, args.sampler_mut());

        if let Err(e) = sibling.kill() {
            tracing::warn!("{}: {:#}", name, e);
        }
        match sibling.wait() {
            Ok(exit) => tracing::debug!("{}: sibling exited: {:?}", name, exit),
            Err(e) => tracing::warn!("{}: {:#}", name, e),
        }

        result.map(|_| ())
    }
}

/// Body of the forked sibling: same strategy, own file description
fn run_sibling(
    path: &Path,
    mode: LockMode,
    seed: u64,
    token: &CancellationToken<'_>,
    counter: &AtomicU64,
    name: &str,
) -> i32 {
    // Reopen so the sibling's seeks don't move the worker's file position
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("{}: sibling failed to open {}: {}", name, path.display(), e);
            return EXIT_FAILURE;
        }
    };

    let mut strategy = AcquireOrEvict::new(
        LockfLocker::new(&file, mode),
        Xoshiro256PlusPlus::seed_from_u64(seed),
    );
    match WorkerDriver::new(name).run(&mut strategy, token, counter, None) {
        Ok(_) => EXIT_SUCCESS,
        Err(_) => EXIT_FAILURE,
    }
}
