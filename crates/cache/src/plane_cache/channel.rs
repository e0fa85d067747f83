//! Single-channel plane cache

use std::ops::RangeInclusive;
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard};

use super::{
    check_selection, derive_channel, log_load_throughput, PlaneCacheStrategy, PlaneView,
    StrategyKind,
};
use crate::cancel::CancellationToken;
use crate::error::CacheResult;
use crate::loader::{ImageShape, LoaderHandle, SliceDescriptor};
use crate::polarization::{DerivedChannelSlot, Polarization};
use crate::stats::{RegionMask, SpectralProfiles};

#[derive(Debug, Default)]
struct ChannelState {
    /// (channel, stokes) held in `plane`
    key: Option<(usize, usize)>,
    plane: Vec<f32>,
    derived: DerivedChannelSlot,
    valid: bool,
}

impl ChannelState {
    fn holds(&self, channel: usize, stokes: usize) -> bool {
        self.valid && self.key == Some((channel, stokes))
    }
}

/// Only the plane in use
///
/// Every change of channel or real polarization rereads one plane into
/// the same buffer. Spectral queries are never served from this cache.
pub struct ChannelCache {
    handle: LoaderHandle,
    shape: ImageShape,
    state: RwLock<ChannelState>,
}

impl ChannelCache {
    pub fn new(handle: LoaderHandle) -> Self {
        tracing::info!("Cache single channel image data");
        let shape = handle.shape();
        Self {
            handle,
            shape,
            state: RwLock::new(ChannelState {
                valid: true,
                ..Default::default()
            }),
        }
    }

    /// (channel, stokes) of the cached real plane
    pub fn cached_plane(&self) -> Option<(usize, usize)> {
        let state = self.state.read();
        state.key.filter(|_| state.valid)
    }

    fn load_plane(&self, state: &mut ChannelState, channel: usize, stokes: usize) -> CacheResult<()> {
        state.key = None;
        state.plane.resize(self.shape.plane_len(), f32::NAN);

        let start = Instant::now();
        let slice = SliceDescriptor::plane(&self.shape, channel, stokes);
        match self.handle.read_into(&slice, &mut state.plane) {
            Ok(()) => {
                log_load_throughput(
                    &format!("{}x{}", self.shape.width, self.shape.height),
                    self.shape.plane_len(),
                    start.elapsed(),
                );
                state.key = Some((channel, stokes));
                state.valid = true;
                Ok(())
            }
            Err(e) => {
                tracing::error!(channel, stokes, error = %e, "Loading channel image failed");
                state.valid = false;
                Err(e.into())
            }
        }
    }
}

impl PlaneCacheStrategy for ChannelCache {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Channel
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn is_valid(&self) -> bool {
        self.state.read().valid
    }

    fn refresh(&self, channel: usize, polarization: Polarization) -> CacheResult<()> {
        check_selection(&self.shape, channel, polarization)?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        match polarization {
            Polarization::Real(stokes) => {
                if state.holds(channel, stokes) {
                    return Ok(());
                }
                self.load_plane(state, channel, stokes)
            }
            Polarization::Computed(computed) => {
                if !self.handle.stokes_indices().can_derive(computed) {
                    state.derived.invalidate();
                    return Ok(());
                }
                if state.valid && state.derived.contains(channel, computed) {
                    return Ok(());
                }

                let resident = match state.key {
                    Some((key_channel, stokes)) if state.valid && key_channel == channel => {
                        Some((stokes, state.plane.as_slice()))
                    }
                    _ => None,
                };
                match derive_channel(&self.handle, channel, computed, resident) {
                    Ok(derived) => {
                        state.derived.store(channel, computed, derived);
                        state.valid = true;
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!(
                            channel,
                            stokes = computed.code(),
                            error = %e,
                            "Computing polarization channel failed"
                        );
                        state.derived.invalidate();
                        state.valid = false;
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn invalidate(&self) {
        let mut state = self.state.write();
        state.key = None;
        state.derived.invalidate();
    }

    fn plane_data(&self, channel: usize, polarization: Polarization) -> Option<PlaneView<'_>> {
        let state = self.state.read();
        if !state.valid {
            return None;
        }
        let mapped = match polarization {
            Polarization::Real(stokes) => RwLockReadGuard::try_map(state, |s| {
                (s.key == Some((channel, stokes))).then_some(s.plane.as_slice())
            }),
            Polarization::Computed(computed) => {
                RwLockReadGuard::try_map(state, |s| s.derived.get(channel, computed))
            }
        };
        mapped.ok().map(PlaneView::Guarded)
    }

    fn value(&self, x: usize, y: usize, channel: usize, polarization: Polarization) -> f32 {
        if !self.shape.contains_pixel(x, y) {
            return f32::NAN;
        }
        let idx = y * self.shape.width + x;
        let state = self.state.read();
        if !state.valid {
            return f32::NAN;
        }
        match polarization {
            Polarization::Real(stokes) if state.key == Some((channel, stokes)) => state.plane[idx],
            Polarization::Real(_) => f32::NAN,
            Polarization::Computed(computed) => state
                .derived
                .get(channel, computed)
                .map_or(f32::NAN, |plane| plane[idx]),
        }
    }

    fn point_spectrum(
        &self,
        _x: usize,
        _y: usize,
        _polarization: Polarization,
        _cancel: &CancellationToken,
    ) -> Option<Vec<f32>> {
        None
    }

    fn region_spectral_stats(
        &self,
        _channels: RangeInclusive<usize>,
        _polarization: Polarization,
        _mask: &RegionMask,
        _cancel: &CancellationToken,
    ) -> Option<SpectralProfiles> {
        None
    }

    fn reserved_bytes(&self) -> u64 {
        0
    }
}
