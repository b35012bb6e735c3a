//! Linux native asynchronous writes
//!
//! Each step fills one 4 KiB buffer per request with a request-specific
//! pattern, submits every buffer as a `pwrite` at a random 4 KiB-aligned
//! offset of a scratch file with one `io_submit(2)`, then collects the
//! completions with `io_getevents(2)` in 1 ms slices so a stop request is
//! noticed promptly. A submit refused with `EAGAIN` is backpressure.
//!
//! The kernel ABI is used directly through `libc::syscall`; there is no
//! libaio dependency.

use super::lockf::ScratchFile;
use super::{StressArgs, Stressor, StressorKind};
use crate::error::StressError;
use crate::pool::ResourcePool;
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver, WorkerSummary};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

pub const DEFAULT_AIO_REQUESTS: u64 = 64;
pub const MIN_AIO_REQUESTS: u64 = 1;
pub const MAX_AIO_REQUESTS: u64 = 4096;

/// Bytes written per request
pub const AIO_BUFFER_SIZE: usize = 4096;

/// How long one `io_getevents` call may block
const COMPLETION_SLICE: Duration = Duration::from_millis(1);

type AioContextId = libc::c_ulong;

const IOCB_CMD_PWRITE: u16 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoControlBlock {
    data: u64,
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

/// An `io_setup` context, destroyed on drop
pub struct AioContext {
    id: AioContextId,
}

impl AioContext {
    /// Context with room for `depth` requests in flight
    pub fn new(depth: usize) -> io::Result<Self> {
        let mut id: AioContextId = 0;
        let rc = unsafe { libc::syscall(libc::SYS_io_setup, depth as libc::c_long, &mut id as *mut AioContextId) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id })
    }

    /// Submit `iocbs`, returning how many the kernel took
    fn submit(&self, iocbs: &mut [*mut IoControlBlock]) -> io::Result<usize> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.id,
                iocbs.len() as libc::c_long,
                iocbs.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Reap between 1 and `events.len()` completions, waiting at most `timeout`
    fn get_events(&self, events: &mut [IoEvent], timeout: Duration) -> io::Result<usize> {
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.id,
                1 as libc::c_long,
                events.len() as libc::c_long,
                events.as_mut_ptr(),
                &mut ts as *mut libc::timespec,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        // Cancels or waits out anything still in flight
        if unsafe { libc::syscall(libc::SYS_io_destroy, self.id) } < 0 {
            tracing::warn!("io_destroy failed: {}", io::Error::last_os_error());
        }
    }
}

/// Fill `buffer` with the pattern for `request`
pub fn fill_buffer(request: usize, buffer: &mut [u8]) {
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = request.wrapping_add(i) as u8;
    }
}

/// Collect `outstanding` completions, one bounded slice at a time
///
/// `reap(max)` reaps up to `max` completions and returns how many it got.
/// `EINTR` is retried; the wait gives up early once `running` reports false.
/// Returns the number of completions collected.
fn wait_for_completions(
    outstanding: usize,
    running: impl Fn() -> bool,
    mut reap: impl FnMut(usize) -> io::Result<usize>,
) -> io::Result<usize> {
    let mut done = 0;
    while done < outstanding && running() {
        match reap(outstanding - done) {
            Ok(n) => done += n,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// The submit-and-reap [`ContentionStrategy`]
pub struct AsyncWrites {
    // Dropped first: io_destroy must finish before the buffers are freed
    aio: AioContext,
    fd: RawFd,
    buffers: Vec<u8>,
    iocbs: Vec<IoControlBlock>,
    iocb_ptrs: Vec<*mut IoControlBlock>,
    events: Vec<IoEvent>,
    rng: Xoshiro256PlusPlus,
    failed_writes: u64,
}

impl AsyncWrites {
    pub fn new(aio: AioContext, fd: RawFd, requests: usize, rng: Xoshiro256PlusPlus) -> Self {
        let requests = requests.max(1);
        let mut buffers = vec![0u8; requests * AIO_BUFFER_SIZE];
        let mut iocbs = vec![IoControlBlock::default(); requests];
        for (i, (iocb, buffer)) in iocbs.iter_mut().zip(buffers.chunks_exact_mut(AIO_BUFFER_SIZE)).enumerate() {
            *iocb = IoControlBlock {
                data: i as u64,
                lio_opcode: IOCB_CMD_PWRITE,
                aio_fildes: fd as u32,
                buf: buffer.as_mut_ptr() as u64,
                nbytes: AIO_BUFFER_SIZE as u64,
                ..Default::default()
            };
        }
        let iocb_ptrs = iocbs.iter_mut().map(|iocb| iocb as *mut IoControlBlock).collect();

        Self {
            aio,
            fd,
            buffers,
            iocbs,
            iocb_ptrs,
            events: vec![IoEvent::default(); requests],
            rng,
            failed_writes: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Completions that reported an error
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }
}

impl ContentionStrategy for AsyncWrites {
    type Record = ();

    fn step(&mut self, _pool: &mut ResourcePool<()>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
        for (i, buffer) in self.buffers.chunks_exact_mut(AIO_BUFFER_SIZE).enumerate() {
            fill_buffer(i, buffer);
        }
        for iocb in &mut self.iocbs {
            iocb.offset = self.rng.gen::<u16>() as i64 * AIO_BUFFER_SIZE as i64;
        }

        let submitted = match self.aio.submit(&mut self.iocb_ptrs) {
            Ok(n) => n,
            Err(err) => {
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) => Ok(StepOutcome::Backpressure),
                    Some(libc::EINTR) => Err(StressError::Interrupted),
                    _ => Err(StressError::Operational {
                        what: "io_submit",
                        source: err,
                    }),
                };
            }
        };

        let aio = &self.aio;
        let events = &mut self.events;
        let failed_writes = &mut self.failed_writes;
        wait_for_completions(submitted, || ctx.is_running(), |max| {
            let n = aio.get_events(&mut events[..max], COMPLETION_SLICE)?;
            *failed_writes += events[..n].iter().filter(|event| event.res < 0).count() as u64;
            Ok(n)
        })
        .map_err(|source| StressError::Operational {
            what: "io_getevents",
            source,
        })?;

        ctx.bump();
        Ok(StepOutcome::Progress)
    }

    fn release(&mut self, _record: &mut ()) -> Result<(), StressError> {
        Ok(())
    }

    fn finish(&mut self, name: &str, _summary: &WorkerSummary) {
        if self.failed_writes > 0 {
            tracing::debug!("{}: {} of the writes failed", name, self.failed_writes);
        }
    }
}

/// The aio-linux stressor
#[derive(Debug, Clone)]
pub struct AioLinuxStressor {
    requests: u64,
}

impl AioLinuxStressor {
    pub fn new(requests: u64) -> Self {
        Self {
            requests: requests.clamp(MIN_AIO_REQUESTS, MAX_AIO_REQUESTS),
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }
}

impl Stressor for AioLinuxStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::AioLinux
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let requests = self.requests as usize;
        let aio = AioContext::new(requests).map_err(|e| args.fail(StressError::setup("io_setup", e)))?;

        let mut rng = args.rng();
        let scratch = ScratchFile::create(args.temp_path, args.name, args.instance, &mut rng)
            .map_err(|e| args.fail(e))?;

        let mut strategy = AsyncWrites::new(aio, scratch.file().as_raw_fd(), requests, rng);
        let token = args.token();
        let counter = args.counter;
        let result = WorkerDriver::new(args.name).run(&mut strategy, &token, counter, args.sampler_mut());

        // The context goes before the file it writes to
        drop(strategy);
        drop(scratch);
        result.map(|_| ())
    }
}
