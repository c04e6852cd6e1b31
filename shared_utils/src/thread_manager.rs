//! Worker budgeting for parallel variant runs
//!
//! CPU cores are treated as a fixed budget split between:
//! 1. Width: how many runs execute in parallel (one run per worker)
//! 2. Depth: how many threads each child ffmpeg process may use
//!
//! `parallel_tasks * child_threads <= available cores`

use std::sync::OnceLock;

/// Environment override for the number of parallel workers
pub const WORKERS_ENV: &str = "VID_VARIANT_WORKERS";

static BALANCED_VIDEO: OnceLock<ThreadAllocation> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAllocation {
    /// Parallel tasks for the rayon pool
    pub parallel_tasks: usize,
    /// Threads handed to each child process (`-threads`)
    pub child_threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadType {
    /// Short filter passes, favors width
    Filter,
    /// Full encodes, favors depth
    Encode,
}

/// Cores left after reserving 20% (1..=2) for the OS.
fn available_cores(total_cores: usize) -> usize {
    let reserved = ((total_cores as f64 * 0.2).ceil() as usize).clamp(1, 2);
    total_cores.saturating_sub(reserved).max(1)
}

fn allocate(total_cores: usize, workload: WorkloadType) -> ThreadAllocation {
    let available = available_cores(total_cores);

    match workload {
        WorkloadType::Filter => {
            let child_threads = 2;
            let parallel_tasks = (available / child_threads).clamp(1, 8);
            ThreadAllocation {
                parallel_tasks,
                child_threads,
            }
        }
        WorkloadType::Encode => {
            let parallel_tasks = if available >= 8 { 2 } else { 1 };
            ThreadAllocation {
                parallel_tasks,
                child_threads: (available / parallel_tasks).max(1),
            }
        }
    }
}

/// Balanced allocation for this machine.
pub fn get_balanced_thread_config(workload: WorkloadType) -> ThreadAllocation {
    allocate(num_cpus::get(), workload)
}

/// Worker count for batch runs: explicit request, then env override,
/// then the cached encode-balanced default.
pub fn resolve_worker_count(requested: Option<usize>) -> usize {
    if let Some(n) = requested.filter(|n| *n > 0) {
        return n;
    }
    if let Some(n) = std::env::var(WORKERS_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        return n;
    }
    BALANCED_VIDEO
        .get_or_init(|| get_balanced_thread_config(WorkloadType::Encode))
        .parallel_tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_cores_reserves_headroom() {
        assert_eq!(available_cores(1), 1);
        assert_eq!(available_cores(4), 3);
        assert_eq!(available_cores(16), 14);
    }

    #[test]
    fn test_filter_allocation_favors_width() {
        let alloc = allocate(10, WorkloadType::Filter);
        assert_eq!(alloc.child_threads, 2);
        assert_eq!(alloc.parallel_tasks, 4);
    }

    #[test]
    fn test_encode_allocation_favors_depth() {
        let small = allocate(4, WorkloadType::Encode);
        assert_eq!(small.parallel_tasks, 1);
        assert_eq!(small.child_threads, 3);

        let large = allocate(16, WorkloadType::Encode);
        assert_eq!(large.parallel_tasks, 2);
        assert_eq!(large.child_threads, 7);
    }

    #[test]
    fn test_budget_never_exceeds_available() {
        for cores in 1..64 {
            for workload in [WorkloadType::Filter, WorkloadType::Encode] {
                let alloc = allocate(cores, workload);
                assert!(alloc.parallel_tasks >= 1);
                assert!(
                    alloc.parallel_tasks * alloc.child_threads <= available_cores(cores).max(2),
                    "cores={} {:?} -> {:?}",
                    cores,
                    workload,
                    alloc
                );
            }
        }
    }

    #[test]
    fn test_explicit_worker_request_wins() {
        assert_eq!(resolve_worker_count(Some(3)), 3);
        assert!(resolve_worker_count(None) >= 1);
    }
}
