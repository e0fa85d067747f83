//! Cubeview Pixel Cache Library
//!
//! Pixel caching and tile serving for multi-channel, multi-polarization
//! image cubes. Each opened image gets a plane cache sized to a shared
//! memory budget (whole image, one cube, or one channel), an optional
//! LRU tile cache backed by a buffer pool, and on-the-fly derivation of
//! computed polarization quantities.

pub mod cancel;
pub mod config;
pub mod error;
pub mod image;
pub mod loader;
pub mod memory_budget;
pub mod memory_loader;
pub mod plane_cache;
pub mod polarization;
pub mod pool;
pub mod stats;
pub mod system;
pub mod tile_cache;

pub use cancel::CancellationToken;
pub use config::{CacheConfig, ConfigError};
pub use error::{CacheError, CacheResult, LoadError};
pub use image::OpenImage;
pub use loader::{ChunkExtent, FileLoader, ImageShape, LoaderHandle, SliceDescriptor};
pub use memory_budget::{MemoryBudget, Reservation};
pub use memory_loader::InMemoryLoader;
pub use plane_cache::{
    select_strategy, ChannelCache, CubeCache, FullCache, PlaneCacheStrategy, PlaneView,
    ProfileAxis, StrategyKind,
};
pub use polarization::{ComputedPolarization, Polarization, StokesIndices, StokesType};
pub use pool::{BufferPool, PooledBuffer, Release, Tile};
pub use stats::{RegionMask, SpectralProfiles, StatsType};
pub use tile_cache::{TileCache, TileCacheStats, TileKey, CHUNK_SIZE, TILE_SIZE};
