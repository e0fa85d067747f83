//! Open image context
//!
//! [`OpenImage`] ties one loader to its plane cache strategy, its tile
//! cache (for tile-backed loaders) and the current channel/polarization
//! selection. Switching the selection goes through the caches first and
//! only reads from the loader when the new selection is not resident.

use std::ops::{Range, RangeInclusive};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::cancel::CancellationToken;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::loader::{FileLoader, ImageShape, LoaderHandle};
use crate::memory_budget::MemoryBudget;
use crate::plane_cache::{
    check_selection, select_strategy, PlaneCacheStrategy, PlaneView, ProfileAxis, StrategyKind,
};
use crate::polarization::{Polarization, StokesIndices};
use crate::pool::Tile;
use crate::stats::{RegionMask, SpectralProfiles};
use crate::tile_cache::{TileCache, TileCacheStats, TileKey};

/// One open image and its caches
pub struct OpenImage {
    handle: LoaderHandle,
    strategy: Box<dyn PlaneCacheStrategy>,
    tile_cache: Option<TileCache>,
    selection: RwLock<(usize, Polarization)>,
}

impl std::fmt::Debug for OpenImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenImage")
            .field("shape", &self.handle.shape())
            .field("strategy", &self.strategy.kind())
            .field("selection", &*self.selection.read())
            .field("tile_cache", &self.tile_cache)
            .finish()
    }
}

impl OpenImage {
    /// Open an image, choose its plane cache and load channel 0 of the
    /// first polarization
    pub fn open(
        loader: Arc<dyn FileLoader>,
        budget: &Arc<MemoryBudget>,
        config: &CacheConfig,
    ) -> CacheResult<Self> {
        let start = Instant::now();
        let handle = LoaderHandle::new(loader);
        let shape = handle.shape();
        if shape.depth == 0 || shape.num_stokes == 0 {
            return Err(CacheError::OutOfRange {
                axis: if shape.depth == 0 { "channel" } else { "stokes" },
                index: 0,
                len: 0,
            });
        }

        let strategy = select_strategy(&handle, budget);
        let tile_cache = handle.uses_tile_cache().then(|| {
            let capacity = TileCache::capacity_for_image(
                shape.width,
                shape.height,
                config.max_tile_cache_capacity,
            );
            TileCache::new(capacity, config.tile_pool_margin)
        });

        let image = Self {
            handle,
            strategy,
            tile_cache,
            selection: RwLock::new((0, Polarization::Real(0))),
        };
        image.strategy.refresh(0, Polarization::Real(0))?;

        tracing::info!(
            width = shape.width,
            height = shape.height,
            depth = shape.depth,
            stokes = shape.num_stokes,
            strategy = image.strategy.kind().name(),
            tiled = image.tile_cache.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened image"
        );
        Ok(image)
    }

    /// Switch to `(channel, polarization)`
    ///
    /// Holds the selection write lock across the tile reset and the plane
    /// refresh. Tiles follow the new selection even when the plane load
    /// fails.
    pub fn set_image_channels(&self, channel: usize, polarization: Polarization) -> CacheResult<()> {
        check_selection(&self.handle.shape(), channel, polarization)?;

        let mut selection = self.selection.write();
        if *selection != (channel, polarization) {
            tracing::debug!(channel, stokes = polarization.index(), "Switching image channel");
        }
        *selection = (channel, polarization);

        if let Some(tiles) = &self.tile_cache {
            if tiles.context() != (channel, polarization) {
                tiles.reset(channel, polarization, None);
            }
        }
        self.strategy.refresh(channel, polarization)
    }

    /// Resolve a polarization name (`I`, `Q`, `Ptotal`, ...) for this image
    pub fn resolve_polarization(&self, name: &str) -> CacheResult<Polarization> {
        Polarization::from_name(name, &self.handle.stokes_indices())
            .ok_or_else(|| CacheError::UnknownPolarization(name.to_string()))
    }

    pub fn shape(&self) -> ImageShape {
        self.handle.shape()
    }

    pub fn stokes_indices(&self) -> StokesIndices {
        self.handle.stokes_indices()
    }

    /// Current (channel, polarization)
    pub fn selection(&self) -> (usize, Polarization) {
        *self.selection.read()
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn strategy(&self) -> &dyn PlaneCacheStrategy {
        self.strategy.as_ref()
    }

    /// Bytes held against the memory budget
    pub fn reserved_bytes(&self) -> u64 {
        self.strategy.reserved_bytes()
    }

    /// Plane of the current selection
    pub fn plane_data(&self) -> Option<PlaneView<'_>> {
        let (channel, polarization) = self.selection();
        self.strategy.plane_data(channel, polarization)
    }

    /// Pixel value in the current selection
    pub fn value(&self, x: usize, y: usize) -> f32 {
        let (channel, polarization) = self.selection();
        self.strategy.value(x, y, channel, polarization)
    }

    /// Spectrum at `(x, y)` in the current polarization
    pub fn point_spectrum(&self, x: usize, y: usize, cancel: &CancellationToken) -> Option<Vec<f32>> {
        let (_, polarization) = self.selection();
        self.strategy.point_spectrum(x, y, polarization, cancel)
    }

    /// Region statistics over `channels` in the current polarization
    pub fn region_spectral_stats(
        &self,
        channels: RangeInclusive<usize>,
        mask: &RegionMask,
        cancel: &CancellationToken,
    ) -> Option<SpectralProfiles> {
        let (_, polarization) = self.selection();
        self.strategy
            .region_spectral_stats(channels, polarization, mask, cancel)
    }

    /// Row or column cut through the current plane
    pub fn point_spatial_profile(
        &self,
        axis: ProfileAxis,
        x: usize,
        y: usize,
        range: Range<usize>,
    ) -> Option<Vec<f32>> {
        let (channel, polarization) = self.selection();
        self.strategy
            .point_spatial_profile(axis, x, y, range, channel, polarization)
    }

    /// Tile at `key` for the current selection, loading its chunk on a miss
    ///
    /// `None` for images without a tile cache.
    pub fn tile(&self, key: TileKey) -> Option<Tile> {
        self.tile_cache.as_ref()?.get(key, &self.handle)
    }

    /// Cached tile at `key`, without loading or touching recency
    pub fn peek_tile(&self, key: TileKey) -> Option<Tile> {
        self.tile_cache.as_ref()?.peek(key)
    }

    pub fn tile_cache(&self) -> Option<&TileCache> {
        self.tile_cache.as_ref()
    }

    pub fn tile_cache_stats(&self) -> Option<TileCacheStats> {
        self.tile_cache.as_ref().map(TileCache::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_loader::InMemoryLoader;
    use crate::polarization::ComputedPolarization;

    fn loader(shape: ImageShape) -> InMemoryLoader {
        InMemoryLoader::from_fn(shape, |x, y, z, s| (x + 10 * y + 100 * z + 1000 * s) as f32)
    }

    #[test]
    fn test_open_selects_first_plane() {
        let budget = Arc::new(MemoryBudget::with_bytes(0));
        let image = OpenImage::open(
            Arc::new(loader(ImageShape::new(4, 4, 3, 2))),
            &budget,
            &CacheConfig::default(),
        )
        .unwrap();

        assert_eq!(image.strategy_kind(), StrategyKind::Channel);
        assert_eq!(image.selection(), (0, Polarization::Real(0)));
        assert_eq!(image.value(2, 1), 12.0);
        assert!(image.tile_cache().is_none());
        assert!(image.tile(TileKey::new(0, 0)).is_none());
    }

    #[test]
    fn test_set_image_channels() {
        let budget = Arc::new(MemoryBudget::with_bytes(0));
        let image = OpenImage::open(
            Arc::new(loader(ImageShape::new(4, 4, 3, 2))),
            &budget,
            &CacheConfig::default(),
        )
        .unwrap();

        image.set_image_channels(2, Polarization::Real(1)).unwrap();
        assert_eq!(image.selection(), (2, Polarization::Real(1)));
        assert_eq!(image.value(3, 3), 1233.0);
        assert_eq!(image.plane_data().unwrap().len(), 16);

        assert!(matches!(
            image.set_image_channels(3, Polarization::Real(0)),
            Err(CacheError::OutOfRange { axis: "channel", .. })
        ));
        assert!(matches!(
            image.set_image_channels(0, Polarization::Real(2)),
            Err(CacheError::OutOfRange { axis: "stokes", .. })
        ));
        assert_eq!(image.selection(), (2, Polarization::Real(1)));
    }

    #[test]
    fn test_resolve_polarization() {
        let budget = Arc::new(MemoryBudget::with_bytes(0));
        let image = OpenImage::open(
            Arc::new(loader(ImageShape::new(4, 4, 1, 2))),
            &budget,
            &CacheConfig::default(),
        )
        .unwrap();

        assert_eq!(image.resolve_polarization("Q").unwrap(), Polarization::Real(1));
        assert_eq!(
            image.resolve_polarization("Plinear").unwrap(),
            Polarization::Computed(ComputedPolarization::Plinear)
        );
        assert!(matches!(
            image.resolve_polarization("V"),
            Err(CacheError::UnknownPolarization(name)) if name == "V"
        ));
        assert!(matches!(
            image.resolve_polarization("RR"),
            Err(CacheError::UnknownPolarization(_))
        ));
    }

    #[test]
    fn test_open_fails_on_unreadable_image() {
        let budget = Arc::new(MemoryBudget::with_bytes(0));
        let failing = loader(ImageShape::new(4, 4, 3, 1));
        failing.set_failing(true);
        assert!(matches!(
            OpenImage::open(Arc::new(failing), &budget, &CacheConfig::default()),
            Err(CacheError::Load(_))
        ));
    }

    #[test]
    fn test_tile_cache_follows_selection() {
        let budget = Arc::new(MemoryBudget::with_bytes(1 << 30));
        let image = OpenImage::open(
            Arc::new(loader(ImageShape::new(600, 300, 2, 1)).tile_backed(true)),
            &budget,
            &CacheConfig::default(),
        )
        .unwrap();

        let tiles = image.tile_cache().unwrap();
        // 3 tile columns, 2 tile rows
        assert_eq!(tiles.capacity(), 10);

        let tile = image.tile(TileKey::new(256, 0)).unwrap();
        assert_eq!(tile[0], 256.0);
        assert!(image.peek_tile(TileKey::new(0, 256)).is_some());

        image.set_image_channels(1, Polarization::Real(0)).unwrap();
        assert!(image.peek_tile(TileKey::new(256, 0)).is_none());
        let tile = image.tile(TileKey::new(256, 0)).unwrap();
        assert_eq!(tile[0], 356.0);
        assert_eq!(image.tile_cache_stats().unwrap().chunk_loads, 2);
    }

    #[test]
    fn test_concurrent_switches_leave_caches_consistent() {
        let shape = ImageShape::new(300, 300, 4, 2);
        let budget = Arc::new(MemoryBudget::with_bytes(0));
        let image = OpenImage::open(
            Arc::new(loader(shape).tile_backed(true)),
            &budget,
            &CacheConfig::default(),
        )
        .unwrap();

        for round in 0..50 {
            std::thread::scope(|scope| {
                for thread in 0..4usize {
                    let image = &image;
                    scope.spawn(move || {
                        for step in 0..10usize {
                            let channel = (thread + step + round) % 4;
                            let stokes = (thread + step) % 2;
                            image
                                .set_image_channels(channel, Polarization::Real(stokes))
                                .unwrap();
                        }
                    });
                }
            });

            let (channel, polarization) = image.selection();
            let Polarization::Real(stokes) = polarization else {
                unreachable!("only real polarizations are selected");
            };
            let expected = (100 * channel + 1000 * stokes) as f32;
            assert_eq!(image.tile_cache().unwrap().context(), (channel, polarization));
            assert_eq!(image.value(0, 0), expected);
            assert_eq!(image.tile(TileKey::new(0, 0)).unwrap()[0], expected);
        }
    }
}
