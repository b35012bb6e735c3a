//! Recursive sysfs reader
//!
//! Each step walks the whole tree under the root (normally `/sys`) and reads
//! every regular file it finds, 4 KiB at a time, stopping at the first short
//! read or after [`MAX_READS`] reads. Directories deeper than [`MAX_DEPTH`]
//! are skipped and symlinks are never followed. Files and directories that
//! can't be opened are skipped silently; plenty of sysfs is unreadable.
//!
//! As root some attribute reads have side effects, so root only walks.

use super::{StressArgs, Stressor, StressorKind};
use crate::error::StressError;
use crate::pool::ResourcePool;
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver, WorkerSummary};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Tree walked by default
pub const SYSFS_ROOT: &str = "/sys";
/// Deepest directory level visited below the root
pub const MAX_DEPTH: usize = 20;
/// Most reads issued against one file
pub const MAX_READS: usize = 4096;

const READ_SIZE: usize = 4096;

/// What one or more walks touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub dirs: u64,
    pub files: u64,
    pub reads: u64,
}

/// The walk-everything [`ContentionStrategy`]
pub struct TreeWalk {
    root: PathBuf,
    read_files: bool,
    buffer: Vec<u8>,
    stats: WalkStats,
}

impl TreeWalk {
    pub fn new(root: impl Into<PathBuf>, read_files: bool) -> Self {
        Self {
            root: root.into(),
            read_files,
            buffer: vec![0; READ_SIZE],
            stats: WalkStats::default(),
        }
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    fn walk(&mut self, dir: &Path, depth: usize, ctx: &StepContext<'_>) {
        if depth > MAX_DEPTH || !ctx.is_running() {
            return;
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        self.stats.dirs += 1;

        for entry in entries.flatten() {
            if !ctx.is_running() {
                break;
            }
            // file_type() does not follow symlinks
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                self.walk(&entry.path(), depth + 1, ctx);
            } else if file_type.is_file() && self.read_files {
                self.read_file(&entry.path(), ctx);
            }
        }
    }

    fn read_file(&mut self, path: &Path, ctx: &StepContext<'_>) {
        let mut file: File = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => file,
            Err(_) => return,
        };
        self.stats.files += 1;

        let mut reads = 0;
        while reads < MAX_READS && ctx.is_running() {
            match file.read(&mut self.buffer) {
                Ok(n) => {
                    reads += 1;
                    self.stats.reads += 1;
                    if n < READ_SIZE {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }
}

impl ContentionStrategy for TreeWalk {
    type Record = ();

    fn step(&mut self, _pool: &mut ResourcePool<()>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
        let root = self.root.clone();
        self.walk(&root, 0, ctx);
        ctx.bump();
        Ok(StepOutcome::Progress)
    }

    fn release(&mut self, _record: &mut ()) -> Result<(), StressError> {
        Ok(())
    }

    fn finish(&mut self, name: &str, _summary: &WorkerSummary) {
        tracing::debug!(
            "{}: {} directories, {} files, {} reads",
            name,
            self.stats.dirs,
            self.stats.files,
            self.stats.reads
        );
    }
}

/// The sysfs stressor
#[derive(Debug, Clone)]
pub struct SysfsStressor {
    root: PathBuf,
}

impl SysfsStressor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SysfsStressor {
    fn default() -> Self {
        Self::new(SYSFS_ROOT)
    }
}

impl Stressor for SysfsStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Sysfs
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        if let Err(e) = fs::read_dir(&self.root) {
            return Err(args.fail(StressError::setup("opendir", e)));
        }

        let read_files = unsafe { libc::geteuid() } != 0;
        if !read_files {
            tracing::info!("{}: running as root, only walking {}", args.name, self.root.display());
        }

        let mut strategy = TreeWalk::new(&self.root, read_files);
        let token = args.token();
        let counter = args.counter;
        WorkerDriver::new(args.name)
            .run(&mut strategy, &token, counter, args.sampler_mut())
            .map(|_| ())
    }
}
