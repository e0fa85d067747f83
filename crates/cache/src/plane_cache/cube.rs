//! Single-cube plane cache
//!
//! Holds all channels of the real polarization in use. Spectral queries
//! are answered for that polarization only.

use std::ops::{Range, RangeInclusive};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard};

use super::{
    check_selection, collect_spectrum, derive_channel, log_load_throughput, region_in_bounds,
    PlaneCacheStrategy, PlaneView, StrategyKind,
};
use crate::cancel::CancellationToken;
use crate::error::CacheResult;
use crate::loader::{ImageShape, LoaderHandle};
use crate::memory_budget::{cube_bytes, MemoryBudget, Reservation};
use crate::polarization::{DerivedChannelSlot, Polarization};
use crate::stats::{compute_spectral_profiles, RegionMask, SpectralProfiles};

#[derive(Debug, Default)]
struct CubeState {
    /// Real polarization whose cube is resident
    stokes: Option<usize>,
    cube: Vec<f32>,
    derived: DerivedChannelSlot,
    valid: bool,
}

impl CubeState {
    fn resident(&self, stokes: usize) -> bool {
        self.valid && self.stokes == Some(stokes)
    }

    fn drop_cube(&mut self) {
        self.stokes = None;
        self.cube = Vec::new();
        self.derived.invalidate();
    }
}

/// Every channel of one real polarization
///
/// Switching to another real polarization releases the resident cube
/// before the new one is read, so at most one cube is alive. Computed
/// polarizations are derived one channel at a time into a single slot.
pub struct CubeCache {
    handle: LoaderHandle,
    shape: ImageShape,
    state: RwLock<CubeState>,
    beam_area: Option<f64>,
    reservation: Reservation,
}

impl CubeCache {
    /// Reserve one cube's worth of budget; nothing is read until the
    /// first refresh
    pub fn new(handle: LoaderHandle, budget: &Arc<MemoryBudget>) -> Self {
        tracing::info!("Cache single cube image data");
        let shape = handle.shape();
        let reservation = budget.reserve_scoped(cube_bytes(&shape));
        Self {
            beam_area: handle.beam_area(),
            handle,
            shape,
            state: RwLock::new(CubeState {
                valid: true,
                ..Default::default()
            }),
            reservation,
        }
    }

    /// Real polarization whose cube is resident
    pub fn cached_polarization(&self) -> Option<usize> {
        let state = self.state.read();
        state.stokes.filter(|_| state.valid)
    }

    /// Bytes held by the resident cube
    pub fn resident_bytes(&self) -> usize {
        self.state.read().cube.len() * std::mem::size_of::<f32>()
    }

    fn load_cube(&self, state: &mut CubeState, stokes: usize) -> CacheResult<()> {
        state.drop_cube();

        let start = Instant::now();
        match self.handle.read_cube(stokes) {
            Ok(cube) => {
                log_load_throughput(
                    &format!("{}x{}x{}", self.shape.width, self.shape.height, self.shape.depth),
                    self.shape.cube_len(),
                    start.elapsed(),
                );
                state.cube = cube;
                state.stokes = Some(stokes);
                state.valid = true;
                Ok(())
            }
            Err(e) => {
                tracing::error!(stokes, error = %e, "Loading cube image failed");
                state.valid = false;
                Err(e.into())
            }
        }
    }

    fn plane_range(&self, channel: usize) -> Range<usize> {
        let plane_len = self.shape.plane_len();
        channel * plane_len..(channel + 1) * plane_len
    }

    fn index(&self, x: usize, y: usize, channel: usize) -> usize {
        (channel * self.shape.height + y) * self.shape.width + x
    }

    /// Read guard on the resident cube of `stokes`
    fn resident_cube(&self, stokes: usize) -> Option<RwLockReadGuard<'_, CubeState>> {
        let state = self.state.read();
        state.resident(stokes).then_some(state)
    }
}

impl PlaneCacheStrategy for CubeCache {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Cube
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
                if state.resident(stokes) {
                    return Ok(());
                }
                self.load_cube(state, stokes)
            }
            Polarization::Computed(computed) => {
                if !self.handle.stokes_indices().can_derive(computed) {
                    state.derived.invalidate();
                    return Ok(());
                }
                if state.valid && state.derived.contains(channel, computed) {
                    return Ok(());
                }

                let range = self.plane_range(channel);
                let resident = state
                    .stokes
                    .filter(|_| state.valid)
                    .map(|stokes| (stokes, &state.cube[range]));
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
        state.drop_cube();
    }

    fn plane_data(&self, channel: usize, polarization: Polarization) -> Option<PlaneView<'_>> {
        if channel >= self.shape.depth {
            return None;
        }
        let state = self.state.read();
        if !state.valid {
            return None;
        }
        let mapped = match polarization {
            Polarization::Real(stokes) => {
                let range = self.plane_range(channel);
                RwLockReadGuard::try_map(state, |s| {
                    (s.stokes == Some(stokes)).then(|| &s.cube[range])
                })
            }
            Polarization::Computed(computed) => {
                RwLockReadGuard::try_map(state, |s| s.derived.get(channel, computed))
            }
        };
        mapped.ok().map(PlaneView::Guarded)
    }

    fn value(&self, x: usize, y: usize, channel: usize, polarization: Polarization) -> f32 {
        if !self.shape.contains_pixel(x, y) || channel >= self.shape.depth {
            return f32::NAN;
        }
        let state = self.state.read();
        if !state.valid {
            return f32::NAN;
        }
        match polarization {
            Polarization::Real(stokes) if state.stokes == Some(stokes) => {
                state.cube[self.index(x, y, channel)]
            }
            Polarization::Real(_) => f32::NAN,
            Polarization::Computed(computed) => state
                .derived
                .get(channel, computed)
                .map_or(f32::NAN, |plane| plane[y * self.shape.width + x]),
        }
    }

    fn point_spectrum(
        &self,
        x: usize,
        y: usize,
        polarization: Polarization,
        cancel: &CancellationToken,
    ) -> Option<Vec<f32>> {
        let Polarization::Real(stokes) = polarization else {
            return None;
        };
        if !self.shape.contains_pixel(x, y) {
            return None;
        }
        let state = self.resident_cube(stokes)?;
        let cube = state.cube.as_slice();
        collect_spectrum(self.shape.depth, cancel, |z| cube[self.index(x, y, z)])
    }

    fn region_spectral_stats(
        &self,
        channels: RangeInclusive<usize>,
        polarization: Polarization,
        mask: &RegionMask,
        cancel: &CancellationToken,
    ) -> Option<SpectralProfiles> {
        let Polarization::Real(stokes) = polarization else {
            return None;
        };
        if !region_in_bounds(&self.shape, &channels, mask) {
            return None;
        }
        let state = self.resident_cube(stokes)?;
        let cube = state.cube.as_slice();
        compute_spectral_profiles(channels, mask, self.beam_area, cancel, |x, y, z| {
            cube[self.index(x, y, z)]
        })
    }

    fn reserved_bytes(&self) -> u64 {
        self.reservation.bytes()
    }
}
