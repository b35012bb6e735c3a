//! Stressor option types

use serde::{Deserialize, Serialize};
use std::fmt;

/// How aggressively tunables default when not set explicitly
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Use each stressor's default
    Normal,
    /// Pin unset tunables to the top of their range
    Maximize,
    /// Pin unset tunables to the bottom of their range
    Minimize,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl RunMode {
    /// Pick the effective value of a tunable with range `[min, max]`
    ///
    /// An explicit value is clamped into range and always wins over the mode.
    pub fn resolve<T: Ord + Copy>(&self, explicit: Option<T>, default: T, min: T, max: T) -> T {
        match explicit {
            Some(value) => value.clamp(min, max),
            None => match self {
                Self::Normal => default,
                Self::Maximize => max,
                Self::Minimize => min,
            },
        }
    }
}

/// Byte-range lock acquisition mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Wait for a conflicting lock to go away (`F_LOCK`)
    Blocking,
    /// Fail immediately on conflict (`F_TLOCK`)
    NonBlocking,
}

impl Default for LockMode {
    fn default() -> Self {
        Self::Blocking
    }
}

/// Matrix kernel selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatrixMethod {
    /// Cycle through every kernel
    All,
    Add,
    Div,
    Frobenius,
    Hadamard,
    Mult,
    Prod,
    Sub,
    Trans,
}

impl Default for MatrixMethod {
    fn default() -> Self {
        Self::All
    }
}

impl MatrixMethod {
    /// Every concrete kernel, in the order `All` cycles through them
    pub const KERNELS: [MatrixMethod; 8] = [
        Self::Add,
        Self::Div,
        Self::Frobenius,
        Self::Hadamard,
        Self::Mult,
        Self::Prod,
        Self::Sub,
        Self::Trans,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Add => "add",
            Self::Div => "div",
            Self::Frobenius => "frobenius",
            Self::Hadamard => "hadamard",
            Self::Mult => "mult",
            Self::Prod => "prod",
            Self::Sub => "sub",
            Self::Trans => "trans",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Maximize => write!(f, "maximize"),
            Self::Minimize => write!(f, "minimize"),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => write!(f, "blocking"),
            Self::NonBlocking => write!(f, "nonblocking"),
        }
    }
}

impl fmt::Display for MatrixMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_resolve() {
        assert_eq!(RunMode::Normal.resolve(None, 8192u64, 1, 1_000_000), 8192);
        assert_eq!(RunMode::Maximize.resolve(None, 8192u64, 1, 1_000_000), 1_000_000);
        assert_eq!(RunMode::Minimize.resolve(None, 8192u64, 1, 1_000_000), 1);
        // Explicit wins, clamped
        assert_eq!(RunMode::Maximize.resolve(Some(10u64), 8192, 1, 1_000_000), 10);
        assert_eq!(RunMode::Normal.resolve(Some(0u64), 8192, 1, 1_000_000), 1);
        assert_eq!(RunMode::Normal.resolve(Some(5_000_000u64), 8192, 1, 1_000_000), 1_000_000);
    }

    #[test]
    fn test_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RunMode,
            lock: LockMode,
            method: MatrixMethod,
        }
        let w: Wrapper = ::toml::from_str("mode = \"maximize\"\nlock = \"nonblocking\"\nmethod = \"frobenius\"").unwrap();
        assert_eq!(w.mode, RunMode::Maximize);
        assert_eq!(w.lock, LockMode::NonBlocking);
        assert_eq!(w.method, MatrixMethod::Frobenius);
    }

    #[test]
    fn test_display_parses_back() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RunMode,
            lock: LockMode,
            method: MatrixMethod,
        }
        for lock in [LockMode::Blocking, LockMode::NonBlocking] {
            let text = format!(
                "mode = \"{}\"\nlock = \"{}\"\nmethod = \"{}\"",
                RunMode::Minimize,
                lock,
                MatrixMethod::Hadamard
            );
            let w: Wrapper = ::toml::from_str(&text).unwrap();
            assert_eq!(w.mode, RunMode::Minimize);
            assert_eq!(w.lock, lock);
            assert_eq!(w.method, MatrixMethod::Hadamard);
        }
    }
}
