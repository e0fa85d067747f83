//! Fixed-capacity LRU cache of raster tiles
//!
//! Tiles are keyed by the pixel coordinates of their top-left corner and
//! belong to one (channel, polarization) context at a time. A miss reads
//! the whole 2x2-tile chunk containing the tile and inserts every tile of
//! that chunk that lies inside the image, evicting the least recently used
//! tile before each new insertion so the cache never exceeds capacity.
//!
//! Tile buffers come from a [`BufferPool`] sized slightly above the cache
//! capacity, so a chunk load can pull its buffers before the matching
//! evictions hand theirs back.
//!
//! Chunk loads and resets run one at a time under a chunk mutex. The tile
//! map is locked only briefly, so lookups and hits never wait on a read.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::loader::{ChunkExtent, LoaderHandle};
use crate::polarization::Polarization;
use crate::pool::{BufferPool, Tile};

/// Side length of a tile in pixels
pub const TILE_SIZE: usize = 256;

/// Side length of a chunk in pixels (2x2 tiles)
pub const CHUNK_SIZE: usize = 2 * TILE_SIZE;

/// Top-left pixel of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub x: usize,
    pub y: usize,
}

impl TileKey {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// Statistics about tile cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileCacheStats {
    /// Tiles currently cached
    pub tile_count: usize,
    /// Maximum number of cached tiles
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Tiles evicted to stay within capacity
    pub evictions: u64,
    /// Chunks read from the loader
    pub chunk_loads: u64,
    pub load_failures: u64,
}

impl TileCacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct TileCacheState {
    channel: usize,
    polarization: Polarization,
    tiles: LruCache<TileKey, Tile>,
    capacity: usize,
    stats: TileCacheStats,
}

impl TileCacheState {
    /// Insert a new tile, evicting the least recently used one if full.
    /// An existing key is only touched.
    fn insert(&mut self, key: TileKey, tile: Tile, evicted: &mut Vec<Tile>) {
        if self.tiles.contains(&key) {
            self.tiles.promote(&key);
            return;
        }
        if self.tiles.len() >= self.capacity {
            if let Some((old_key, old_tile)) = self.tiles.pop_lru() {
                tracing::debug!(x = old_key.x, y = old_key.y, "Evicting tile");
                self.stats.evictions += 1;
                evicted.push(old_tile);
            }
        }
        self.tiles.put(key, tile);
    }
}

/// LRU tile cache for one open image
pub struct TileCache {
    state: RwLock<TileCacheState>,
    /// Reused chunk read buffer; held for the whole of a chunk load or reset
    chunk: Mutex<Vec<f32>>,
    pool: Arc<BufferPool>,
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TileCache {
    /// Create a cache holding up to `capacity` tiles, with `pool_margin`
    /// extra pooled buffers
    pub fn new(capacity: usize, pool_margin: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: RwLock::new(TileCacheState {
                channel: 0,
                polarization: Polarization::Real(0),
                tiles: LruCache::unbounded(),
                capacity,
                stats: TileCacheStats {
                    capacity,
                    ..Default::default()
                },
            }),
            chunk: Mutex::new(Vec::new()),
            pool: BufferPool::new(capacity + pool_margin),
        }
    }

    /// Capacity needed to hold two screens' worth of tile rows and columns
    pub fn capacity_for_image(width: usize, height: usize, max_capacity: usize) -> usize {
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        (2 * (tiles_x + tiles_y)).min(max_capacity).max(1)
    }

    /// Key of the chunk containing `tile_key`
    pub fn chunk_key(tile_key: TileKey) -> TileKey {
        TileKey {
            x: (tile_key.x / CHUNK_SIZE) * CHUNK_SIZE,
            y: (tile_key.y / CHUNK_SIZE) * CHUNK_SIZE,
        }
    }

    /// Look up a tile without changing its recency
    ///
    /// Does not wait for a chunk read in progress.
    pub fn peek(&self, key: TileKey) -> Option<Tile> {
        self.state.read().tiles.peek(&key).cloned()
    }

    /// Look up a tile, loading its chunk on a miss
    ///
    /// Returns `None` if the chunk could not be read or the tile lies
    /// outside the image.
    pub fn get(&self, key: TileKey, loader: &LoaderHandle) -> Option<Tile> {
        {
            let mut state = self.state.write();
            if let Some(tile) = state.tiles.get(&key).cloned() {
                state.stats.hits += 1;
                return Some(tile);
            }
            state.stats.misses += 1;
        }

        let mut chunk = self.chunk.lock();
        let (channel, polarization) = {
            let mut state = self.state.write();
            // a concurrent miss may have loaded the same chunk
            if let Some(tile) = state.tiles.get(&key).cloned() {
                return Some(tile);
            }
            (state.channel, state.polarization)
        };

        let chunk_key = Self::chunk_key(key);
        let result = loader.read_chunk(chunk_key.x, chunk_key.y, channel, polarization, &mut chunk);
        let extent = match result {
            Ok(extent) => extent,
            Err(e) => {
                self.state.write().stats.load_failures += 1;
                tracing::error!(
                    x = key.x,
                    y = key.y,
                    channel,
                    stokes = polarization.index(),
                    error = %e,
                    "Loading tile chunk failed"
                );
                return None;
            }
        };

        let mut evicted = Vec::new();
        let tile = {
            let mut state = self.state.write();
            state.stats.chunk_loads += 1;
            self.split_chunk(&mut state, chunk_key, extent, &chunk, &mut evicted);
            state.tiles.peek(&key).cloned()
        };
        drop(chunk);
        // evicted tiles go back to the pool outside the cache lock
        drop(evicted);
        tile
    }

    /// Clear the cache for a new (channel, polarization) context
    ///
    /// Waits for a chunk load in progress. A positive `capacity` replaces
    /// the current one and grows or shrinks the pool by the same amount.
    pub fn reset(&self, channel: usize, polarization: Polarization, capacity: Option<usize>) {
        let _loading = self.chunk.lock();
        let old_tiles = {
            let mut state = self.state.write();
            if let Some(capacity) = capacity.filter(|&c| c > 0) {
                self.pool
                    .grow(capacity as isize - state.capacity as isize);
                state.capacity = capacity;
                state.stats.capacity = capacity;
            }
            state.channel = channel;
            state.polarization = polarization;
            tracing::debug!(
                channel,
                stokes = polarization.index(),
                capacity = state.capacity,
                "Resetting tile cache"
            );
            std::mem::replace(&mut state.tiles, LruCache::unbounded())
        };
        drop(old_tiles);
    }

    /// Current (channel, polarization) context
    pub fn context(&self) -> (usize, Polarization) {
        let state = self.state.read();
        (state.channel, state.polarization)
    }

    pub fn len(&self) -> usize {
        self.state.read().tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.read().capacity
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.state.read().tiles.contains(&key)
    }

    pub fn stats(&self) -> TileCacheStats {
        let state = self.state.read();
        TileCacheStats {
            tile_count: state.tiles.len(),
            ..state.stats
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Split a loaded chunk into up to four tiles
    fn split_chunk(
        &self,
        state: &mut TileCacheState,
        chunk_key: TileKey,
        extent: ChunkExtent,
        chunk: &[f32],
        evicted: &mut Vec<Tile>,
    ) {
        for (col, row) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let tile_x = col * TILE_SIZE;
            let tile_y = row * TILE_SIZE;
            // tiles starting past the data edge do not exist
            if tile_x >= extent.width || tile_y >= extent.height {
                continue;
            }
            let key = TileKey::new(chunk_key.x + tile_x, chunk_key.y + tile_y);
            if state.tiles.contains(&key) {
                state.tiles.promote(&key);
                continue;
            }

            let width = TILE_SIZE.min(extent.width - tile_x);
            let height = TILE_SIZE.min(extent.height - tile_y);
            let mut buffer = self.pool.pull(width, height);
            for y in 0..height {
                let start = (tile_y + y) * extent.width + tile_x;
                buffer[y * width..(y + 1) * width].copy_from_slice(&chunk[start..start + width]);
            }
            state.insert(key, Arc::new(buffer), evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::loader::{FileLoader, ImageShape, SliceDescriptor};
    use crate::memory_loader::InMemoryLoader;
    use crate::polarization::{ComputedPolarization, StokesType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Blocks reads of columns at or past `gate_x` until released
    struct GatedLoader {
        inner: InMemoryLoader,
        gate_x: usize,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        timed_out: AtomicBool,
    }

    impl FileLoader for GatedLoader {
        fn shape(&self) -> ImageShape {
            self.inner.shape()
        }

        fn read_slice(&self, slice: &SliceDescriptor, out: &mut [f32]) -> Result<(), LoadError> {
            if slice.x.start >= self.gate_x {
                let _ = self.entered.lock().send(());
                if self.release.lock().recv_timeout(Duration::from_secs(5)).is_err() {
                    self.timed_out.store(true, Ordering::SeqCst);
                }
            }
            self.inner.read_slice(slice, out)
        }

        fn stokes_index(&self, stokes: StokesType) -> Option<usize> {
            self.inner.stokes_index(stokes)
        }
    }

    fn handle(width: usize, height: usize) -> LoaderHandle {
        let shape = ImageShape::new(width, height, 2, 1);
        LoaderHandle::new(Arc::new(InMemoryLoader::from_fn(shape, |x, y, z, _| {
            (x + y * width) as f32 + (z * 1_000_000) as f32
        })))
    }

    fn dummy_tile(pool: &Arc<BufferPool>) -> Tile {
        Arc::new(pool.pull(1, 1))
    }

    #[test]
    fn test_chunk_key() {
        assert_eq!(TileCache::chunk_key(TileKey::new(0, 0)), TileKey::new(0, 0));
        assert_eq!(TileCache::chunk_key(TileKey::new(256, 256)), TileKey::new(0, 0));
        assert_eq!(TileCache::chunk_key(TileKey::new(768, 256)), TileKey::new(512, 0));
        assert_eq!(TileCache::chunk_key(TileKey::new(1024, 1536)), TileKey::new(1024, 1536));
    }

    #[test]
    fn test_capacity_for_image() {
        assert_eq!(TileCache::capacity_for_image(1000, 600, 4096), 2 * (4 + 3));
        assert_eq!(TileCache::capacity_for_image(100_000, 100_000, 4096), 1564);
        assert_eq!(TileCache::capacity_for_image(100_000, 100_000, 100), 100);
    }

    #[test]
    fn test_lru_evicts_first_inserted() {
        let cache = TileCache::new(3, 4);
        let mut state = cache.state.write();
        let mut evicted = Vec::new();
        for i in 0..4 {
            let tile = dummy_tile(&cache.pool);
            state.insert(TileKey::new(i * TILE_SIZE, 0), tile, &mut evicted);
        }
        assert_eq!(state.tiles.len(), 3);
        assert!(!state.tiles.contains(&TileKey::new(0, 0)));
        assert_eq!(evicted.len(), 1);
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let cache = TileCache::new(2, 4);
        let mut state = cache.state.write();
        let mut evicted = Vec::new();
        let a = TileKey::new(0, 0);
        let b = TileKey::new(256, 0);
        let c = TileKey::new(512, 0);

        state.insert(a, dummy_tile(&cache.pool), &mut evicted);
        state.insert(b, dummy_tile(&cache.pool), &mut evicted);
        state.tiles.get(&a);
        state.insert(c, dummy_tile(&cache.pool), &mut evicted);

        assert!(state.tiles.contains(&a));
        assert!(!state.tiles.contains(&b));
        assert!(state.tiles.contains(&c));
    }

    #[test]
    fn test_get_splits_chunk_into_tiles() {
        let cache = TileCache::new(16, 4);
        let loader = handle(700, 600);
        cache.reset(1, Polarization::Real(0), None);

        let tile = cache.get(TileKey::new(256, 256), &loader).unwrap();
        assert_eq!(cache.len(), 4);
        assert_eq!(tile.width(), 256);
        assert_eq!(tile.height(), 256);
        assert_eq!(tile[0], (256 + 256 * 700) as f32 + 1_000_000.0);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.chunk_loads, 1);

        // remaining tiles of the chunk are hits
        cache.get(TileKey::new(0, 0), &loader).unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().chunk_loads, 1);
    }

    #[test]
    fn test_edge_tiles_are_clamped() {
        let cache = TileCache::new(16, 4);
        let loader = handle(700, 600);
        cache.reset(0, Polarization::Real(0), None);

        let tile = cache.get(TileKey::new(512, 512), &loader).unwrap();
        assert_eq!(tile.width(), 188);
        assert_eq!(tile.height(), 88);
        assert_eq!(tile.len(), 188 * 88);
        assert_eq!(tile.row(1)[0], (512 + 513 * 700) as f32);

        // x=768 and y=768 start beyond the data
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_small_image_inserts_single_tile() {
        let cache = TileCache::new(16, 4);
        let loader = handle(200, 200);
        cache.reset(0, Polarization::Real(0), None);

        cache.get(TileKey::new(0, 0), &loader).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(TileKey::new(256, 0)).is_none());
        assert!(cache.get(TileKey::new(256, 0), &loader).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_partial_chunk_inserts_tiles_inside_data() {
        let cache = TileCache::new(16, 4);
        let loader = handle(300, 300);
        cache.reset(0, Polarization::Real(0), None);

        cache.get(TileKey::new(0, 0), &loader).unwrap();
        assert_eq!(cache.len(), 4);
        let corner = cache.peek(TileKey::new(256, 256)).unwrap();
        assert_eq!((corner.width(), corner.height()), (44, 44));
    }

    #[test]
    fn test_capacity_never_exceeded_during_chunk_load() {
        let cache = TileCache::new(4, 4);
        let loader = handle(1536, 100);
        cache.reset(0, Polarization::Real(0), None);

        cache.get(TileKey::new(0, 0), &loader).unwrap();
        cache.get(TileKey::new(512, 0), &loader).unwrap();
        assert_eq!(cache.len(), 4);

        // touch (0,0), then load a third chunk: the two oldest go
        cache.get(TileKey::new(0, 0), &loader).unwrap();
        cache.get(TileKey::new(1024, 0), &loader).unwrap();
        assert_eq!(cache.len(), 4);
        assert!(cache.contains(TileKey::new(0, 0)));
        assert!(!cache.contains(TileKey::new(256, 0)));
        assert!(!cache.contains(TileKey::new(512, 0)));
        assert!(cache.contains(TileKey::new(768, 0)));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_chunk_reload_promotes_resident_tiles() {
        let cache = TileCache::new(4, 4);
        let loader = handle(700, 600);
        cache.reset(0, Polarization::Real(0), None);

        cache.get(TileKey::new(0, 0), &loader).unwrap();
        cache.get(TileKey::new(0, 0), &loader).unwrap();
        cache.get(TileKey::new(256, 0), &loader).unwrap();
        // the (512, 0) chunk has two tiles; they push out (0,256) and (256,256)
        cache.get(TileKey::new(512, 0), &loader).unwrap();
        assert!(!cache.contains(TileKey::new(0, 256)));
        assert!(!cache.contains(TileKey::new(256, 256)));
        let first = cache.peek(TileKey::new(0, 0)).unwrap();
        let second = cache.peek(TileKey::new(256, 0)).unwrap();

        let reloaded = cache.get(TileKey::new(0, 256), &loader).unwrap();
        assert_eq!(reloaded[0], (256 * 700) as f32);
        assert_eq!(cache.stats().chunk_loads, 3);

        // resident tiles were promoted in place; the other chunk's tiles went
        assert!(Arc::ptr_eq(&cache.peek(TileKey::new(0, 0)).unwrap(), &first));
        assert!(Arc::ptr_eq(&cache.peek(TileKey::new(256, 0)).unwrap(), &second));
        assert!(cache.contains(TileKey::new(256, 256)));
        assert!(!cache.contains(TileKey::new(512, 0)));
        assert!(!cache.contains(TileKey::new(512, 256)));
        assert!(cache.len() <= cache.capacity());
    }

    #[test]
    fn test_chunk_larger_than_capacity_evicts_own_tiles() {
        let cache = TileCache::new(2, 4);
        let loader = handle(700, 600);
        cache.reset(0, Polarization::Real(0), None);

        // per-tile eviction keeps only the last two tiles of the chunk
        assert!(cache.get(TileKey::new(256, 256), &loader).is_some());
        assert!(cache.contains(TileKey::new(0, 256)));
        assert_eq!(cache.len(), 2);

        assert!(cache.get(TileKey::new(0, 0), &loader).is_none());
        assert!(cache.len() <= cache.capacity());
        assert_eq!(cache.stats().load_failures, 0);
    }

    #[test]
    fn test_lookups_do_not_wait_for_chunk_read() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let shape = ImageShape::new(1024, 256, 1, 1);
        let loader = Arc::new(GatedLoader {
            inner: InMemoryLoader::from_fn(shape, |x, _, _, _| x as f32),
            gate_x: CHUNK_SIZE,
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            timed_out: AtomicBool::new(false),
        });
        let handle = LoaderHandle::new(loader.clone());
        let cache = TileCache::new(8, 4);
        cache.get(TileKey::new(0, 0), &handle).unwrap();

        std::thread::scope(|scope| {
            let loading = scope.spawn(|| cache.get(TileKey::new(768, 0), &handle));
            entered_rx.recv().unwrap();

            // second chunk is mid-read
            assert!(cache.peek(TileKey::new(256, 0)).is_some());
            assert!(cache.get(TileKey::new(0, 0), &handle).is_some());
            assert!(cache.peek(TileKey::new(512, 0)).is_none());
            release_tx.send(()).unwrap();

            let tile = loading.join().unwrap().unwrap();
            assert_eq!(tile[0], 768.0);
        });

        assert!(!loader.timed_out.load(Ordering::SeqCst));
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().chunk_loads, 2);
    }

    #[test]
    fn test_peek_does_not_touch() {
        let cache = TileCache::new(2, 4);
        let loader = handle(1536, 100);
        cache.reset(0, Polarization::Real(0), None);

        cache.get(TileKey::new(0, 0), &loader).unwrap();
        assert!(cache.peek(TileKey::new(0, 0)).is_some());
        cache.get(TileKey::new(512, 0), &loader).unwrap();
        assert!(cache.peek(TileKey::new(0, 0)).is_none());
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_reset_clears_and_resizes() {
        let cache = TileCache::new(8, 4);
        let loader = handle(700, 600);
        cache.reset(0, Polarization::Real(0), None);
        cache.get(TileKey::new(0, 0), &loader).unwrap();
        assert!(!cache.is_empty());

        cache.reset(1, Polarization::Real(0), Some(20));
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 20);
        assert_eq!(cache.pool().capacity(), 24);
        assert_eq!(cache.context(), (1, Polarization::Real(0)));

        cache.reset(1, Polarization::Real(0), Some(0));
        assert_eq!(cache.capacity(), 20);
    }

    #[test]
    fn test_evicted_buffers_are_recycled() {
        let cache = TileCache::new(4, 4);
        let loader = handle(1536 * 2, 100);
        cache.reset(0, Polarization::Real(0), None);

        for x in (0..1536 * 2).step_by(CHUNK_SIZE) {
            cache.get(TileKey::new(x, 0), &loader).unwrap();
        }
        let allocations = cache.pool().allocations();

        cache.reset(1, Polarization::Real(0), None);
        for x in (0..1536 * 2).step_by(CHUNK_SIZE) {
            cache.get(TileKey::new(x, 0), &loader).unwrap();
        }
        assert_eq!(cache.pool().allocations(), allocations);
    }

    #[test]
    fn test_failed_load_returns_none() {
        let shape = ImageShape::new(300, 300, 1, 1);
        let loader = Arc::new(InMemoryLoader::from_fn(shape, |_, _, _, _| 1.0));
        loader.set_failing(true);
        let handle = LoaderHandle::new(loader.clone());

        let cache = TileCache::new(8, 4);
        assert!(cache.get(TileKey::new(0, 0), &handle).is_none());
        assert_eq!(cache.stats().load_failures, 1);
        assert!(cache.is_empty());

        loader.set_failing(false);
        assert!(cache.get(TileKey::new(0, 0), &handle).is_some());
    }

    #[test]
    fn test_computed_polarization_tiles() {
        let shape = ImageShape::new(300, 300, 1, 3);
        let loader = InMemoryLoader::from_fn(shape, |_, _, _, s| match s {
            1 => 3.0,
            2 => 4.0,
            _ => 10.0,
        });
        let handle = LoaderHandle::new(Arc::new(loader));

        let cache = TileCache::new(8, 4);
        cache.reset(
            0,
            Polarization::Computed(ComputedPolarization::PFlinear),
            None,
        );
        let tile = cache.get(TileKey::new(256, 0), &handle).unwrap();
        assert!(tile.iter().all(|&v| v == 50.0));
    }
}
