//! Plane cache strategies
//!
//! Each open image owns one [`PlaneCacheStrategy`], chosen once when the
//! image is opened from the shape of the image and the remaining
//! [`MemoryBudget`]:
//!
//! - [`FullCache`]: every channel of every stored polarization, plus every
//!   derivable computed polarization, loaded at open time
//! - [`CubeCache`]: every channel of the one real polarization in use
//! - [`ChannelCache`]: only the plane currently in use
//!
//! Read accessors never fail. A lookup that cannot be served from the
//! cache answers `None` (or NaN for single values) and the caller falls
//! back to the loader.

mod channel;
mod cube;
mod full;

pub use channel::ChannelCache;
pub use cube::CubeCache;
pub use full::FullCache;

use std::ops::{Deref, Range, RangeInclusive};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::MappedRwLockReadGuard;
use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::error::{CacheError, CacheResult, LoadError};
use crate::loader::{ImageShape, LoaderHandle};
use crate::memory_budget::{cube_bytes, full_image_bytes, MemoryBudget};
use crate::polarization::{ComputedPolarization, Polarization, StokesPlanes, StokesType};
use crate::stats::{RegionMask, SpectralProfiles};

/// Channels filled between two cancellation checks of a point spectrum
const SPECTRUM_STRIDE: usize = 256;

/// Which variant a strategy is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Full,
    Cube,
    Channel,
}

impl StrategyKind {
    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::Full => "full",
            StrategyKind::Cube => "cube",
            StrategyKind::Channel => "channel",
        }
    }
}

/// Axis of a point spatial profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileAxis {
    /// Along a row, at fixed y
    X,
    /// Along a column, at fixed x
    Y,
}

/// Read-only view of one cached plane
///
/// Views into a lock-guarded cache hold the read lock until dropped.
pub enum PlaneView<'a> {
    Borrowed(&'a [f32]),
    Guarded(MappedRwLockReadGuard<'a, [f32]>),
}

impl Deref for PlaneView<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            PlaneView::Borrowed(data) => *data,
            PlaneView::Guarded(guard) => &**guard,
        }
    }
}

impl std::fmt::Debug for PlaneView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneView").field("len", &self.len()).finish()
    }
}

/// Pixel storage and queries for one open image
pub trait PlaneCacheStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn shape(&self) -> ImageShape;

    /// False after a load failure, until a later refresh succeeds
    fn is_valid(&self) -> bool;

    /// Make `(channel, polarization)` available to the read accessors
    ///
    /// Returns immediately when that selection is already cached. Blocks
    /// for the duration of any load it triggers.
    fn refresh(&self, channel: usize, polarization: Polarization) -> CacheResult<()>;

    /// Drop the current selection so the next refresh reloads it
    fn invalidate(&self);

    /// Plane at `(channel, polarization)`, if cached
    fn plane_data(&self, channel: usize, polarization: Polarization) -> Option<PlaneView<'_>>;

    /// Pixel value; NaN when not cached or undefined
    fn value(&self, x: usize, y: usize, channel: usize, polarization: Polarization) -> f32;

    /// Values at `(x, y)` for every channel, if the cache holds them all
    fn point_spectrum(
        &self,
        x: usize,
        y: usize,
        polarization: Polarization,
        cancel: &CancellationToken,
    ) -> Option<Vec<f32>>;

    /// Per-channel statistics of the masked region, if the cache holds
    /// every channel of the polarization
    fn region_spectral_stats(
        &self,
        channels: RangeInclusive<usize>,
        polarization: Polarization,
        mask: &RegionMask,
        cancel: &CancellationToken,
    ) -> Option<SpectralProfiles>;

    /// Row or column cut through a cached plane
    fn point_spatial_profile(
        &self,
        axis: ProfileAxis,
        x: usize,
        y: usize,
        range: Range<usize>,
        channel: usize,
        polarization: Polarization,
    ) -> Option<Vec<f32>> {
        let shape = self.shape();
        if !shape.contains_pixel(x, y) || range.start > range.end {
            return None;
        }
        let plane = self.plane_data(channel, polarization)?;
        match axis {
            ProfileAxis::X if range.end <= shape.width => {
                let row = y * shape.width;
                Some(plane[row + range.start..row + range.end].to_vec())
            }
            ProfileAxis::Y if range.end <= shape.height => Some(
                range
                    .map(|row| plane[row * shape.width + x])
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Bytes this strategy holds against the memory budget
    fn reserved_bytes(&self) -> u64;
}

/// Choose the strategy for a newly opened image
///
/// Reads a snapshot of the budget; the chosen strategy reserves its own
/// footprint.
pub fn select_strategy(
    handle: &LoaderHandle,
    budget: &Arc<MemoryBudget>,
) -> Box<dyn PlaneCacheStrategy> {
    let shape = handle.shape();
    if shape.depth > 1 && !handle.uses_tile_cache() {
        let full_bytes = full_image_bytes(&shape);
        if shape.num_stokes > 1 && budget.fits(full_bytes) {
            return Box::new(FullCache::new(handle.clone(), budget));
        }
        if budget.fits(cube_bytes(&shape)) {
            return Box::new(CubeCache::new(handle.clone(), budget));
        }
        tracing::info!(
            full_image_mb = full_bytes as f64 / (1024.0 * 1024.0),
            "Cube image too large ({:.0} MB). Not caching the whole image data",
            full_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    Box::new(ChannelCache::new(handle.clone()))
}

/// Check a selection against the image extents
pub(crate) fn check_selection(
    shape: &ImageShape,
    channel: usize,
    polarization: Polarization,
) -> CacheResult<()> {
    if channel >= shape.depth {
        return Err(CacheError::OutOfRange {
            axis: "channel",
            index: channel,
            len: shape.depth,
        });
    }
    if let Polarization::Real(stokes) = polarization {
        if stokes >= shape.num_stokes {
            return Err(CacheError::OutOfRange {
                axis: "stokes",
                index: stokes,
                len: shape.num_stokes,
            });
        }
    }
    Ok(())
}

/// Whether a region request lies inside the image
pub(crate) fn region_in_bounds(
    shape: &ImageShape,
    channels: &RangeInclusive<usize>,
    mask: &RegionMask,
) -> bool {
    !channels.is_empty() && *channels.end() < shape.depth && !mask.is_empty() && mask.fits_within(shape)
}

/// Fill a spectrum in strides, checking for cancellation between strides
pub(crate) fn collect_spectrum<F>(depth: usize, cancel: &CancellationToken, value_at: F) -> Option<Vec<f32>>
where
    F: Fn(usize) -> f32 + Sync,
{
    let mut profile = vec![f32::NAN; depth];
    for (stride, values) in profile.chunks_mut(SPECTRUM_STRIDE).enumerate() {
        if cancel.is_cancelled() {
            return None;
        }
        let start = stride * SPECTRUM_STRIDE;
        values
            .par_iter_mut()
            .enumerate()
            .for_each(|(offset, value)| *value = value_at(start + offset));
    }
    Some(profile)
}

/// Derive one channel of a computed polarization
///
/// Real planes are read from the loader, except the one for stokes index
/// `resident.0`, which is taken from `resident.1`.
pub(crate) fn derive_channel(
    handle: &LoaderHandle,
    channel: usize,
    computed: ComputedPolarization,
    resident: Option<(usize, &[f32])>,
) -> Result<Vec<f32>, LoadError> {
    let indices = handle.stokes_indices();
    let mut loaded: Vec<(StokesType, Vec<f32>)> = Vec::new();
    let mut borrowed: Option<(StokesType, &[f32])> = None;

    for &stokes in computed.required_inputs() {
        let Some(index) = indices.get(stokes) else {
            continue;
        };
        match resident {
            Some((resident_index, plane)) if resident_index == index => {
                borrowed = Some((stokes, plane));
            }
            _ => loaded.push((stokes, handle.read_plane(channel, index)?)),
        }
    }

    let mut planes = StokesPlanes::default();
    if let Some((stokes, plane)) = borrowed {
        planes.set(stokes, Some(plane));
    }
    for (stokes, plane) in &loaded {
        planes.set(*stokes, Some(plane));
    }

    let mut derived = vec![f32::NAN; handle.shape().plane_len()];
    planes.derive_into(computed, &mut derived);
    Ok(derived)
}

pub(crate) fn log_load_throughput(label: &str, pixels: usize, elapsed: Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    let us = elapsed.as_secs_f64() * 1_000_000.0;
    let rate = if us > 0.0 { pixels as f64 / us } else { f64::INFINITY };
    tracing::debug!(
        elapsed_ms = ms,
        "Load {} image to cache in {:.3} ms at {:.3} MPix/s",
        label,
        ms,
        rate
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_loader::InMemoryLoader;

    fn handle(shape: ImageShape) -> LoaderHandle {
        LoaderHandle::new(Arc::new(InMemoryLoader::from_fn(shape, |x, y, z, s| {
            (x + 10 * y + 100 * z + 1000 * s) as f32
        })))
    }

    #[test]
    fn test_select_full_when_everything_fits() {
        let shape = ImageShape::new(10, 10, 5, 2);
        let budget = Arc::new(MemoryBudget::with_bytes(1 << 20));
        let strategy = select_strategy(&handle(shape), &budget);
        assert_eq!(strategy.kind(), StrategyKind::Full);
        assert_eq!(budget.available_bytes(), (1 << 20) - full_image_bytes(&shape) as i64);
    }

    #[test]
    fn test_select_cube_when_single_stokes() {
        let shape = ImageShape::new(10, 10, 5, 1);
        let budget = Arc::new(MemoryBudget::with_bytes(1 << 20));
        let strategy = select_strategy(&handle(shape), &budget);
        assert_eq!(strategy.kind(), StrategyKind::Cube);
        assert_eq!(strategy.reserved_bytes(), cube_bytes(&shape));
    }

    #[test]
    fn test_select_cube_when_only_one_cube_fits() {
        let shape = ImageShape::new(10, 10, 5, 4);
        let budget = Arc::new(MemoryBudget::with_bytes(cube_bytes(&shape) as i64));
        let strategy = select_strategy(&handle(shape), &budget);
        assert_eq!(strategy.kind(), StrategyKind::Cube);
        assert_eq!(budget.available_bytes(), 0);
    }

    #[test]
    fn test_select_channel_fallbacks() {
        let budget = Arc::new(MemoryBudget::with_bytes(0));
        let strategy = select_strategy(&handle(ImageShape::new(10, 10, 5, 2)), &budget);
        assert_eq!(strategy.kind(), StrategyKind::Channel);

        let budget = Arc::new(MemoryBudget::with_bytes(1 << 30));
        let strategy = select_strategy(&handle(ImageShape::new(10, 10, 1, 4)), &budget);
        assert_eq!(strategy.kind(), StrategyKind::Channel);
        assert_eq!(strategy.reserved_bytes(), 0);
        assert_eq!(budget.available_bytes(), 1 << 30);
    }

    #[test]
    fn test_select_channel_for_tile_backed_loader() {
        let shape = ImageShape::new(10, 10, 5, 2);
        let loader = InMemoryLoader::from_fn(shape, |_, _, _, _| 0.0).tile_backed(true);
        let budget = Arc::new(MemoryBudget::with_bytes(1 << 30));
        let strategy = select_strategy(&LoaderHandle::new(Arc::new(loader)), &budget);
        assert_eq!(strategy.kind(), StrategyKind::Channel);
    }

    #[test]
    fn test_reservation_released_when_strategy_dropped() {
        let shape = ImageShape::new(10, 10, 5, 2);
        let budget = Arc::new(MemoryBudget::with_bytes(1 << 20));
        let strategy = select_strategy(&handle(shape), &budget);
        assert!(budget.available_bytes() < 1 << 20);
        drop(strategy);
        assert_eq!(budget.available_bytes(), 1 << 20);
    }

    #[test]
    fn test_check_selection() {
        let shape = ImageShape::new(4, 4, 3, 2);
        assert!(check_selection(&shape, 2, Polarization::Real(1)).is_ok());
        assert!(matches!(
            check_selection(&shape, 3, Polarization::Real(0)),
            Err(CacheError::OutOfRange { axis: "channel", .. })
        ));
        assert!(matches!(
            check_selection(&shape, 0, Polarization::Real(2)),
            Err(CacheError::OutOfRange { axis: "stokes", .. })
        ));
        assert!(check_selection(
            &shape,
            0,
            Polarization::Computed(ComputedPolarization::Pangle)
        )
        .is_ok());
    }

    #[test]
    fn test_collect_spectrum_strides() {
        let token = CancellationToken::new();
        let profile = collect_spectrum(600, &token, |z| z as f32).unwrap();
        assert_eq!(profile.len(), 600);
        assert!(profile.iter().enumerate().all(|(z, &v)| v == z as f32));

        token.cancel();
        assert!(collect_spectrum(600, &token, |z| z as f32).is_none());
    }

    #[test]
    fn test_derive_channel_uses_resident_plane() {
        let shape = ImageShape::new(3, 2, 2, 4);
        let handle = handle(shape);
        let resident_q = vec![3.0f32; 6];

        let derived = derive_channel(
            &handle,
            1,
            ComputedPolarization::Plinear,
            Some((1, &resident_q)),
        )
        .unwrap();

        // U at channel 1 is 2100 + x + 10y
        for y in 0..2 {
            for x in 0..3 {
                let u = (2100 + x + 10 * y) as f32;
                assert_eq!(derived[y * 3 + x], (9.0 + u * u).sqrt());
            }
        }
    }
}
