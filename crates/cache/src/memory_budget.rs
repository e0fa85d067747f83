//! Process-wide memory budget for eager image caching
//!
//! The budget is advisory: strategy selection reads a snapshot of the
//! remaining bytes, and the chosen strategy then reserves its footprint.
//! Reserve and release never block on I/O and never fail, even when the
//! remaining amount goes negative.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::loader::ImageShape;
use crate::system;

const MB: i64 = 1024 * 1024;

/// Fraction of physical memory the eager-cache ceiling may claim (9/10).
const SYSTEM_MEMORY_NUMERATOR: u64 = 9;
const SYSTEM_MEMORY_DENOMINATOR: u64 = 10;

/// Largest ceiling whose byte count fits the budget counter
const MAX_BUDGET_MB: i64 = i64::MAX / MB;

/// Bytes per stored pixel value
pub const PIXEL_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Shared memory budget for eager ("full" and "cube") caching strategies
///
/// One instance lives for the whole process, from startup to shutdown.
/// It is passed as an `Arc` to every place a plane cache is constructed.
///
/// # Example
///
/// ```
/// use cubeview_cache::MemoryBudget;
///
/// let budget = MemoryBudget::new();
/// budget.initialize_with_system_limit(100, Some(1000));
///
/// budget.reserve(10 * 1024 * 1024);
/// assert_eq!(budget.available_mb(), 90.0);
/// budget.release(10 * 1024 * 1024);
/// assert_eq!(budget.available_mb(), 100.0);
/// ```
#[derive(Debug, Default)]
pub struct MemoryBudget {
    /// Remaining bytes; may go negative
    available: Mutex<i64>,
}

impl MemoryBudget {
    /// Create an empty budget (eager caching disabled until initialized)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a budget that already holds `bytes`
    pub fn with_bytes(bytes: i64) -> Self {
        Self {
            available: Mutex::new(bytes),
        }
    }

    /// Set the live budget from the configured ceiling.
    ///
    /// The request is clamped to 90% of total system memory. Returns the
    /// applied ceiling in megabytes.
    pub fn initialize(&self, requested_mb: i64) -> i64 {
        let total_mb = system::total_system_memory_mb();
        if total_mb.is_none() {
            tracing::warn!("Total system memory is unknown; eager cache ceiling is not clamped");
        }
        self.initialize_with_system_limit(requested_mb, total_mb)
    }

    /// Same as [`initialize`](Self::initialize) with an explicit system memory size.
    pub fn initialize_with_system_limit(&self, requested_mb: i64, total_system_mb: Option<u64>) -> i64 {
        let mut applied_mb = requested_mb.clamp(0, MAX_BUDGET_MB);
        if let Some(total_mb) = total_system_mb {
            let upper_limit = (total_mb.saturating_mul(SYSTEM_MEMORY_NUMERATOR)
                / SYSTEM_MEMORY_DENOMINATOR)
                .min(MAX_BUDGET_MB as u64) as i64;
            if applied_mb > upper_limit {
                tracing::warn!(
                    requested_mb = applied_mb,
                    upper_limit_mb = upper_limit,
                    "Full image cache is greater than the system upper limit, reset it to {} MB",
                    upper_limit
                );
                applied_mb = upper_limit;
            }
        }

        *self.available.lock() = applied_mb * MB;
        tracing::info!(applied_mb, "Total amount of full image cache {} MB", applied_mb);
        applied_mb
    }

    /// Take `bytes` out of the budget
    pub fn reserve(&self, bytes: u64) {
        let remaining = {
            let mut available = self.available.lock();
            *available -= bytes as i64;
            *available
        };
        tracing::info!(
            reserved_bytes = bytes,
            "{:.0} MB of full image cache are available",
            remaining as f64 / MB as f64
        );
    }

    /// Return `bytes` to the budget
    pub fn release(&self, bytes: u64) {
        let remaining = {
            let mut available = self.available.lock();
            *available += bytes as i64;
            *available
        };
        tracing::info!(
            released_bytes = bytes,
            "{:.0} MB of full image cache are available",
            remaining as f64 / MB as f64
        );
    }

    /// Snapshot of the remaining bytes
    pub fn available_bytes(&self) -> i64 {
        *self.available.lock()
    }

    /// Snapshot of the remaining megabytes
    pub fn available_mb(&self) -> f64 {
        self.available_bytes() as f64 / MB as f64
    }

    /// Check whether `bytes` fits under the current snapshot
    pub fn fits(&self, bytes: u64) -> bool {
        self.available_bytes() >= bytes as i64
    }

    /// Reserve `bytes` and return a guard that releases them exactly once
    pub fn reserve_scoped(self: &Arc<Self>, bytes: u64) -> Reservation {
        self.reserve(bytes);
        Reservation {
            budget: Arc::clone(self),
            bytes,
        }
    }
}

/// Bytes held against a [`MemoryBudget`]; released when dropped
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl Reservation {
    /// Number of bytes held
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

/// Number of extra single planes budgeted for derivable polarizations.
///
/// This is a plane-sized allowance per derived type, not a cube. It
/// undercounts what a full cache materializes for multi-channel images.
pub fn derived_plane_allowance(num_stokes: usize) -> u64 {
    match num_stokes {
        0 | 1 => 0,
        2 => 2,
        3 => 4,
        _ => 5,
    }
}

/// Estimated footprint of caching the whole hypercube, in bytes
pub fn full_image_bytes(shape: &ImageShape) -> u64 {
    let plane = shape.plane_len() as u64 * PIXEL_BYTES;
    let storage = plane * shape.depth as u64 * shape.num_stokes as u64;
    storage + plane * derived_plane_allowance(shape.num_stokes)
}

/// Footprint of one polarization's full-depth cube, in bytes
pub fn cube_bytes(shape: &ImageShape) -> u64 {
    shape.cube_len() as u64 * PIXEL_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::thread;

    #[test]
    fn test_initialize_clamps_to_system_limit() {
        let budget = MemoryBudget::new();
        let applied = budget.initialize_with_system_limit(2000, Some(1000));
        assert_eq!(applied, 900);
        assert_eq!(budget.available_bytes(), 900 * MB);
    }

    #[test]
    fn test_initialize_keeps_request_under_limit() {
        let budget = MemoryBudget::new();
        assert_eq!(budget.initialize_with_system_limit(512, Some(16_000)), 512);
        assert_eq!(budget.available_mb(), 512.0);
    }

    #[test]
    fn test_initialize_negative_request() {
        let budget = MemoryBudget::new();
        assert_eq!(budget.initialize_with_system_limit(-5, Some(1000)), 0);
        assert_eq!(budget.available_bytes(), 0);
    }

    #[test]
    fn test_initialize_unknown_system_memory() {
        let budget = MemoryBudget::new();
        assert_eq!(budget.initialize_with_system_limit(1 << 20, None), 1 << 20);
    }

    #[test]
    fn test_initialize_huge_request_saturates() {
        let budget = MemoryBudget::new();
        let applied = budget.initialize_with_system_limit(i64::MAX / 1024, None);
        assert_eq!(applied, MAX_BUDGET_MB);
        assert!(budget.available_bytes() > 0);
        assert_eq!(budget.available_bytes(), MAX_BUDGET_MB * MB);

        let applied = budget.initialize_with_system_limit(i64::MAX, Some(u64::MAX));
        assert_eq!(applied, MAX_BUDGET_MB);
        assert!(budget.available_bytes() > 0);
    }

    #[test]
    fn test_reserve_may_go_negative() {
        let budget = MemoryBudget::with_bytes(100);
        budget.reserve(150);
        assert_eq!(budget.available_bytes(), -50);
        assert!(!budget.fits(1));
        budget.release(150);
        assert_eq!(budget.available_bytes(), 100);
    }

    #[test]
    fn test_reserve_release_random_order_conserves_budget() {
        let mut rng = rand::thread_rng();
        let budget = MemoryBudget::with_bytes(10 * MB);
        let amounts: Vec<u64> = (0..64).map(|_| rng.gen_range(1..5_000_000)).collect();

        let mut ops: Vec<(bool, u64)> = amounts
            .iter()
            .flat_map(|&a| [(true, a), (false, a)])
            .collect();
        ops.shuffle(&mut rng);

        for (is_reserve, amount) in ops {
            if is_reserve {
                budget.reserve(amount);
            } else {
                budget.release(amount);
            }
        }
        assert_eq!(budget.available_bytes(), 10 * MB);
    }

    #[test]
    fn test_concurrent_reserve_release() {
        let budget = Arc::new(MemoryBudget::with_bytes(500 * MB));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || {
                    for j in 0..500u64 {
                        let amount = (i as u64 + 1) * 1024 + j;
                        budget.reserve(amount);
                        budget.release(amount);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(budget.available_bytes(), 500 * MB);
    }

    #[test]
    fn test_reservation_releases_once_on_drop() {
        let budget = Arc::new(MemoryBudget::with_bytes(1000));
        {
            let reservation = budget.reserve_scoped(400);
            assert_eq!(reservation.bytes(), 400);
            assert_eq!(budget.available_bytes(), 600);
        }
        assert_eq!(budget.available_bytes(), 1000);
    }

    #[test]
    fn test_derived_plane_allowance() {
        assert_eq!(derived_plane_allowance(1), 0);
        assert_eq!(derived_plane_allowance(2), 2);
        assert_eq!(derived_plane_allowance(3), 4);
        assert_eq!(derived_plane_allowance(4), 5);
        assert_eq!(derived_plane_allowance(6), 5);
    }

    #[test]
    fn test_footprint_estimates() {
        let shape = ImageShape::new(10, 20, 5, 4);
        let plane = 10 * 20 * 4;
        assert_eq!(cube_bytes(&shape), plane * 5);
        // four cubes plus five single-plane allowances
        assert_eq!(full_image_bytes(&shape), plane * 5 * 4 + plane * 5);

        let single = ImageShape::new(10, 20, 5, 1);
        assert_eq!(full_image_bytes(&single), plane * 5);
    }
}
