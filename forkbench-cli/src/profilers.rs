//! Profilers
//!
//! Extra measurements attached to every fork of a run.

use crate::RunError;
use forkbench_core::allocation_tracking_installed;

/// Available profilers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profiler {
    /// Heap bytes and allocation calls per operation
    Alloc,
}

impl Profiler {
    /// Every profiler, in listing order
    pub const ALL: [Profiler; 1] = [Profiler::Alloc];

    /// Name accepted by `--prof`
    pub fn name(self) -> &'static str {
        match self {
            Profiler::Alloc => "alloc",
        }
    }

    /// One-line description for `--list-profilers`
    pub fn description(self) -> &'static str {
        match self {
            Profiler::Alloc => {
                "allocated bytes and allocation count per operation (needs TrackingAllocator as #[global_allocator])"
            }
        }
    }

    /// Fail when the profiler cannot work in this binary
    pub fn check(self) -> Result<(), RunError> {
        match self {
            Profiler::Alloc if !allocation_tracking_installed() => Err(RunError::Profiler(
                "alloc: TrackingAllocator is not the #[global_allocator] of this binary".to_string(),
            )),
            Profiler::Alloc => Ok(()),
        }
    }
}

impl std::str::FromStr for Profiler {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Profiler::ALL
            .into_iter()
            .find(|p| p.name() == s.trim())
            .ok_or_else(|| {
                RunError::Profiler(format!(
                    "unknown profiler '{}' (available: {})",
                    s,
                    Profiler::ALL.map(Profiler::name).join(", ")
                ))
            })
    }
}

/// Parse and check every `--prof` name before any fork starts
pub fn resolve_profilers(names: &[String]) -> Result<Vec<Profiler>, RunError> {
    let mut profilers = Vec::with_capacity(names.len());
    for name in names {
        let profiler: Profiler = name.parse()?;
        profiler.check()?;
        if !profilers.contains(&profiler) {
            profilers.push(profiler);
        }
    }
    Ok(profilers)
}
