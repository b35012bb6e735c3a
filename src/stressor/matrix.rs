//! CPU-bound matrix kernels
//!
//! Each worker owns three n × n `f32` matrices, two filled from its RNG and
//! one for results, and runs one kernel per step. `all` cycles through every
//! kernel in turn. Kernels check the stop flag once per row so a large matrix
//! never delays shutdown by more than one row of work.
//!
//! The stressor holds no OS resources, so it runs through the worker driver
//! with a pool that never sees a record.

use super::{StressArgs, Stressor, StressorKind};
use crate::config::workload::MatrixMethod;
use crate::error::StressError;
use crate::pool::ResourcePool;
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::hint::black_box;
use std::io;

pub const DEFAULT_MATRIX_SIZE: usize = 128;
pub const MIN_MATRIX_SIZE: usize = 16;
pub const MAX_MATRIX_SIZE: usize = 4096;

/// Scalar used by the `div` and `mult` kernels
const SCALAR: f32 = 3.1415926;

/// A kernel: reads `a` and `b`, writes `r`, stops early when `keep_going` says so
pub type Kernel = fn(&mut Matrices, &dyn Fn() -> bool);

/// Operands and result of the kernels, row-major
#[derive(Debug, Clone)]
pub struct Matrices {
    n: usize,
    a: Vec<f32>,
    b: Vec<f32>,
    r: Vec<f32>,
}

impl Matrices {
    /// Allocate and fill n × n operands; `None` if memory is short
    pub fn new(n: usize, rng: &mut Xoshiro256PlusPlus) -> Option<Self> {
        let len = n.checked_mul(n)?;
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut r = Vec::new();
        a.try_reserve_exact(len).ok()?;
        b.try_reserve_exact(len).ok()?;
        r.try_reserve_exact(len).ok()?;

        let scale = 1.0 / u32::MAX as f32;
        a.extend((0..len).map(|_| rng.gen::<u32>() as f32 * scale));
        b.extend((0..len).map(|_| rng.gen::<u32>() as f32 * scale));
        r.resize(len, 0.0);

        Some(Self { n, a, b, r })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn result(&self) -> &[f32] {
        &self.r
    }

    /// Apply an element-wise operation row by row
    fn elementwise(&mut self, keep_going: &dyn Fn() -> bool, op: impl Fn(f32, f32) -> f32) {
        let n = self.n;
        for i in 0..n {
            if !keep_going() {
                return;
            }
            let row = i * n..(i + 1) * n;
            for ((r, a), b) in self.r[row.clone()].iter_mut().zip(&self.a[row.clone()]).zip(&self.b[row]) {
                *r = op(*a, *b);
            }
        }
    }
}

fn kernel_add(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    m.elementwise(keep_going, |a, b| a + b);
}

fn kernel_sub(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    m.elementwise(keep_going, |a, b| a - b);
}

fn kernel_div(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    m.elementwise(keep_going, |a, _| a / SCALAR);
}

fn kernel_mult(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    m.elementwise(keep_going, |a, _| a * SCALAR);
}

fn kernel_hadamard(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    m.elementwise(keep_going, |a, b| a * b);
}

fn kernel_frobenius(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    let n = m.n;
    let mut sum = 0.0f32;
    for i in 0..n {
        if !keep_going() {
            break;
        }
        let row = i * n..(i + 1) * n;
        sum += m.a[row.clone()].iter().zip(&m.b[row]).map(|(a, b)| a * b).sum::<f32>();
    }
    black_box(sum);
}

fn kernel_prod(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    let n = m.n;
    for i in 0..n {
        if !keep_going() {
            return;
        }
        for j in 0..n {
            let mut sum = 0.0f32;
            for k in 0..n {
                sum += m.a[i * n + k] * m.b[k * n + j];
            }
            m.r[i * n + j] = sum;
        }
    }
}

fn kernel_trans(m: &mut Matrices, keep_going: &dyn Fn() -> bool) {
    let n = m.n;
    for i in 0..n {
        if !keep_going() {
            return;
        }
        for j in 0..n {
            m.r[j * n + i] = m.a[i * n + j];
        }
    }
}

impl MatrixMethod {
    /// Kernel implementing a concrete method; `None` for `All`
    pub fn kernel(&self) -> Option<Kernel> {
        let kernel: Kernel = match self {
            Self::All => return None,
            Self::Add => kernel_add,
            Self::Div => kernel_div,
            Self::Frobenius => kernel_frobenius,
            Self::Hadamard => kernel_hadamard,
            Self::Mult => kernel_mult,
            Self::Prod => kernel_prod,
            Self::Sub => kernel_sub,
            Self::Trans => kernel_trans,
        };
        Some(kernel)
    }
}

/// Runs one kernel per step
pub struct MatrixKernels {
    matrices: Matrices,
    method: MatrixMethod,
    /// Position in the `All` rotation
    next: usize,
}

impl MatrixKernels {
    pub fn new(matrices: Matrices, method: MatrixMethod) -> Self {
        Self {
            matrices,
            method,
            next: 0,
        }
    }

    pub fn matrices(&self) -> &Matrices {
        &self.matrices
    }

    fn next_method(&mut self) -> MatrixMethod {
        match self.method {
            MatrixMethod::All => {
                let method = MatrixMethod::KERNELS[self.next];
                self.next = (self.next + 1) % MatrixMethod::KERNELS.len();
                method
            }
            method => method,
        }
    }
}

impl ContentionStrategy for MatrixKernels {
    type Record = ();

    fn step(&mut self, _pool: &mut ResourcePool<()>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
        let method = self.next_method();
        if let Some(kernel) = method.kernel() {
            kernel(&mut self.matrices, &|| ctx.is_running());
        }
        ctx.bump();
        Ok(StepOutcome::Progress)
    }

    fn release(&mut self, _record: &mut ()) -> Result<(), StressError> {
        Ok(())
    }
}

/// The matrix stressor
#[derive(Debug, Clone)]
pub struct MatrixStressor {
    method: MatrixMethod,
    size: usize,
}

impl MatrixStressor {
    pub fn new(method: MatrixMethod, size: usize) -> Self {
        Self {
            method,
            size: size.clamp(MIN_MATRIX_SIZE, MAX_MATRIX_SIZE),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Stressor for MatrixStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Matrix
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let mut rng = args.rng();
        let matrices = Matrices::new(self.size, &mut rng).ok_or_else(|| {
            args.fail(StressError::setup("matrix allocation", io::Error::from_raw_os_error(libc::ENOMEM)))
        })?;

        tracing::debug!("{}: {}x{} {} kernels", args.name, self.size, self.size, self.method);
        let mut strategy = MatrixKernels::new(matrices, self.method);
        let token = args.token();
        let counter = args.counter;
        WorkerDriver::new(args.name)
            .run(&mut strategy, &token, counter, args.sampler_mut())
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CancellationToken, ControlBlock, RunController};
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn matrices(n: usize) -> Matrices {
        Matrices::new(n, &mut Xoshiro256PlusPlus::seed_from_u64(3)).unwrap()
    }

    fn always() -> bool {
        true
    }

    #[test]
    fn test_fill_in_unit_range() {
        let m = matrices(16);
        assert_eq!(m.a.len(), 256);
        assert!(m.a.iter().chain(&m.b).all(|v| (0.0..=1.0).contains(v)));
        assert!(m.r.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_elementwise_kernels() {
        let mut m = matrices(16);
        kernel_add(&mut m, &always);
        assert_eq!(m.r[5], m.a[5] + m.b[5]);
        kernel_sub(&mut m, &always);
        assert_eq!(m.r[7], m.a[7] - m.b[7]);
        kernel_hadamard(&mut m, &always);
        assert_eq!(m.r[255], m.a[255] * m.b[255]);
        kernel_div(&mut m, &always);
        assert_eq!(m.r[0], m.a[0] / SCALAR);
        kernel_mult(&mut m, &always);
        assert_eq!(m.r[3], m.a[3] * SCALAR);
    }

    #[test]
    fn test_prod_against_identity() {
        let mut m = matrices(16);
        m.b.iter_mut().for_each(|v| *v = 0.0);
        for i in 0..16 {
            m.b[i * 16 + i] = 1.0;
        }
        kernel_prod(&mut m, &always);
        assert_eq!(m.r, m.a);
    }

    #[test]
    fn test_trans() {
        let mut m = matrices(16);
        kernel_trans(&mut m, &always);
        assert_eq!(m.r[3 * 16 + 9], m.a[9 * 16 + 3]);
    }

    #[test]
    fn test_kernel_stops_between_rows() {
        let mut m = matrices(16);
        let never = || false;
        kernel_add(&mut m, &never);
        assert!(m.r.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_all_cycles_every_kernel() {
        let mut kernels = MatrixKernels::new(matrices(16), MatrixMethod::All);
        let seen: Vec<_> = (0..MatrixMethod::KERNELS.len() * 2).map(|_| kernels.next_method()).collect();
        assert_eq!(&seen[..8], &MatrixMethod::KERNELS[..]);
        assert_eq!(&seen[8..], &MatrixMethod::KERNELS[..]);
        assert!(MatrixMethod::All.kernel().is_none());
        assert!(MatrixMethod::KERNELS.iter().all(|m| m.kernel().is_some()));
    }

    #[test]
    fn test_runs_to_cap() {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), 40);
        let counter = AtomicU64::new(0);
        let mut strategy = MatrixKernels::new(matrices(32), MatrixMethod::All);

        let summary = WorkerDriver::new("matrix")
            .run(&mut strategy, &token, &counter, None)
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 40);
        assert_eq!(summary.backed, 0);
    }

    #[test]
    fn test_size_clamped() {
        assert_eq!(MatrixStressor::new(MatrixMethod::Add, 1).size(), MIN_MATRIX_SIZE);
        assert_eq!(MatrixStressor::new(MatrixMethod::Add, 1 << 20).size(), MAX_MATRIX_SIZE);
    }
}
