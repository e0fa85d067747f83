//! Whole-image plane cache
//!
//! Every cube of every stored polarization is read once when the image is
//! opened, along with every computed polarization whose inputs exist. The
//! data never changes afterwards, so reads take no lock.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;

use super::{
    check_selection, collect_spectrum, log_load_throughput, region_in_bounds, PlaneCacheStrategy,
    PlaneView, StrategyKind,
};
use crate::cancel::CancellationToken;
use crate::error::{CacheError, CacheResult, LoadError};
use crate::loader::{ImageShape, LoaderHandle};
use crate::memory_budget::{full_image_bytes, MemoryBudget, Reservation};
use crate::polarization::{ComputedPolarization, Polarization, StokesIndices, StokesPlanes, StokesType};
use crate::stats::{compute_spectral_profiles, RegionMask, SpectralProfiles};

/// Whole hypercube held in memory
///
/// Loaded once at construction and never modified afterwards, so reads
/// take no lock. Derived polarizations whose inputs exist are computed as
/// whole cubes right after the load.
pub struct FullCache {
    shape: ImageShape,
    /// One cube per real polarization
    cubes: Vec<Vec<f32>>,
    derived: BTreeMap<ComputedPolarization, Vec<f32>>,
    beam_area: Option<f64>,
    valid: bool,
    reservation: Option<Reservation>,
}

impl FullCache {
    /// Load every cube of the image and reserve the estimated footprint
    ///
    /// A failed load leaves the cache invalid with nothing reserved.
    pub fn new(handle: LoaderHandle, budget: &Arc<MemoryBudget>) -> Self {
        tracing::info!("Cache full cubes image data");
        let shape = handle.shape();

        let start = Instant::now();
        let cubes = match load_cubes(&handle) {
            Ok(cubes) => cubes,
            Err(_) => {
                return Self {
                    shape,
                    cubes: Vec::new(),
                    derived: BTreeMap::new(),
                    beam_area: handle.beam_area(),
                    valid: false,
                    reservation: None,
                }
            }
        };
        log_load_throughput(
            &format!(
                "{}x{}x{}x{}",
                shape.width, shape.height, shape.depth, shape.num_stokes
            ),
            shape.cube_len() * shape.num_stokes,
            start.elapsed(),
        );

        let derived = derive_cubes(&cubes, &handle.stokes_indices(), shape.cube_len());
        let reservation = budget.reserve_scoped(full_image_bytes(&shape));

        Self {
            shape,
            cubes,
            derived,
            beam_area: handle.beam_area(),
            valid: true,
            reservation: Some(reservation),
        }
    }

    fn cube(&self, polarization: Polarization) -> Option<&[f32]> {
        if !self.valid {
            return None;
        }
        match polarization {
            Polarization::Real(stokes) => self.cubes.get(stokes).map(Vec::as_slice),
            Polarization::Computed(computed) => self.derived.get(&computed).map(Vec::as_slice),
        }
    }

    fn index(&self, x: usize, y: usize, channel: usize) -> usize {
        (channel * self.shape.height + y) * self.shape.width + x
    }
}

fn load_cubes(handle: &LoaderHandle) -> Result<Vec<Vec<f32>>, LoadError> {
    (0..handle.shape().num_stokes)
        .map(|stokes| {
            handle.read_cube(stokes).map_err(|e| {
                tracing::error!(stokes, error = %e, "Loading cube image failed");
                e
            })
        })
        .collect()
}

fn derive_cubes(
    cubes: &[Vec<f32>],
    indices: &StokesIndices,
    cube_len: usize,
) -> BTreeMap<ComputedPolarization, Vec<f32>> {
    let mut planes = StokesPlanes::default();
    for stokes in StokesType::ALL {
        planes.set(
            stokes,
            indices
                .get(stokes)
                .and_then(|index| cubes.get(index))
                .map(Vec::as_slice),
        );
    }

    ComputedPolarization::ALL
        .into_iter()
        .filter(|&computed| planes.has_inputs_for(computed))
        .map(|computed| {
            let mut cube = vec![f32::NAN; cube_len];
            planes.derive_into(computed, &mut cube);
            (computed, cube)
        })
        .collect()
}

impl PlaneCacheStrategy for FullCache {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Full
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn refresh(&self, channel: usize, polarization: Polarization) -> CacheResult<()> {
        check_selection(&self.shape, channel, polarization)?;
        if self.valid {
            Ok(())
        } else {
            Err(CacheError::Invalid)
        }
    }

    /// Nothing to drop: the loaded cubes never change
    fn invalidate(&self) {}

    fn plane_data(&self, channel: usize, polarization: Polarization) -> Option<PlaneView<'_>> {
        if channel >= self.shape.depth {
            return None;
        }
        let plane_len = self.shape.plane_len();
        let cube = self.cube(polarization)?;
        let start = channel * plane_len;
        Some(PlaneView::Borrowed(&cube[start..start + plane_len]))
    }

    fn value(&self, x: usize, y: usize, channel: usize, polarization: Polarization) -> f32 {
        if !self.shape.contains_pixel(x, y) || channel >= self.shape.depth {
            return f32::NAN;
        }
        let idx = self.index(x, y, channel);
        self.cube(polarization).map_or(f32::NAN, |cube| cube[idx])
    }

    fn point_spectrum(
        &self,
        x: usize,
        y: usize,
        polarization: Polarization,
        cancel: &CancellationToken,
    ) -> Option<Vec<f32>> {
        if !self.valid || !self.shape.contains_pixel(x, y) {
            return None;
        }
        match (self.cube(polarization), polarization) {
            (Some(cube), _) => {
                collect_spectrum(self.shape.depth, cancel, |z| cube[self.index(x, y, z)])
            }
            // computed without its inputs: defined, but NaN everywhere
            (None, Polarization::Computed(_)) => {
                collect_spectrum(self.shape.depth, cancel, |_| f32::NAN)
            }
            (None, Polarization::Real(_)) => None,
        }
    }

    fn region_spectral_stats(
        &self,
        channels: RangeInclusive<usize>,
        polarization: Polarization,
        mask: &RegionMask,
        cancel: &CancellationToken,
    ) -> Option<SpectralProfiles> {
        if !region_in_bounds(&self.shape, &channels, mask) {
            return None;
        }
        let cube = self.cube(polarization)?;
        compute_spectral_profiles(channels, mask, self.beam_area, cancel, |x, y, z| {
            cube[self.index(x, y, z)]
        })
    }

    fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map_or(0, Reservation::bytes)
    }
}
