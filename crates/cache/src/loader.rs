//! File loader boundary
//!
//! Concrete image formats live outside this crate. They plug in through
//! [`FileLoader`], which answers bulk slice reads for the plane caches and
//! chunk reads for the tile path. [`LoaderHandle`] wraps a loader with the
//! per-image lock every cache of that image shares, and with the resolved
//! Stokes indices.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::LoadError;
use crate::polarization::{Polarization, StokesIndices, StokesPlanes, StokesType};
use crate::tile_cache::CHUNK_SIZE;

/// Extents of a four-dimensional image (x, y, channel, stokes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub num_stokes: usize,
}

impl ImageShape {
    pub fn new(width: usize, height: usize, depth: usize, num_stokes: usize) -> Self {
        Self {
            width,
            height,
            depth,
            num_stokes,
        }
    }

    /// Pixels in one plane
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// Pixels in one full-depth cube
    pub fn cube_len(&self) -> usize {
        self.plane_len() * self.depth
    }

    pub fn contains_pixel(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }
}

/// Rectangular sub-volume of one stokes plane stack
///
/// Data for a slice is laid out with x varying fastest, then y, then z.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceDescriptor {
    pub x: Range<usize>,
    pub y: Range<usize>,
    pub z: Range<usize>,
    pub stokes: usize,
}

impl SliceDescriptor {
    /// Whole plane at `channel`
    pub fn plane(shape: &ImageShape, channel: usize, stokes: usize) -> Self {
        Self {
            x: 0..shape.width,
            y: 0..shape.height,
            z: channel..channel + 1,
            stokes,
        }
    }

    /// Every channel of one stokes
    pub fn cube(shape: &ImageShape, stokes: usize) -> Self {
        Self {
            x: 0..shape.width,
            y: 0..shape.height,
            z: 0..shape.depth,
            stokes,
        }
    }

    pub fn width(&self) -> usize {
        self.x.len()
    }

    pub fn height(&self) -> usize {
        self.y.len()
    }

    pub fn depth(&self) -> usize {
        self.z.len()
    }

    /// Number of values the slice holds
    pub fn len(&self) -> usize {
        self.width() * self.height() * self.depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the slice lies inside `shape`
    pub fn validate(&self, shape: &ImageShape) -> Result<(), LoadError> {
        let inside = self.x.end <= shape.width
            && self.y.end <= shape.height
            && self.z.end <= shape.depth
            && self.stokes < shape.num_stokes;
        if inside && !self.is_empty() {
            Ok(())
        } else {
            Err(LoadError::InvalidSlice(format!(
                "{:?}x{:?}x{:?} stokes {} outside {}x{}x{}x{}",
                self.x,
                self.y,
                self.z,
                self.stokes,
                shape.width,
                shape.height,
                shape.depth,
                shape.num_stokes
            )))
        }
    }
}

/// Actual size of a chunk returned by [`FileLoader::read_chunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExtent {
    pub width: usize,
    pub height: usize,
}

impl ChunkExtent {
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extent of the chunk at an origin, clamped to the image
pub fn chunk_extent(shape: &ImageShape, origin_x: usize, origin_y: usize) -> ChunkExtent {
    ChunkExtent {
        width: CHUNK_SIZE.min(shape.width.saturating_sub(origin_x)),
        height: CHUNK_SIZE.min(shape.height.saturating_sub(origin_y)),
    }
}

/// Reader of pixel data for one image
pub trait FileLoader: Send + Sync {
    /// Image extents
    fn shape(&self) -> ImageShape;

    /// Fill `out` with the values of `slice`
    ///
    /// `out` holds at least `slice.len()` values; a loader that cannot
    /// supply all of them returns an error.
    fn read_slice(&self, slice: &SliceDescriptor, out: &mut [f32]) -> Result<(), LoadError>;

    /// Read the chunk whose top-left corner is `(origin_x, origin_y)`
    ///
    /// The chunk is up to `CHUNK_SIZE` square, smaller at the image edges.
    /// `out` is resized to exactly the returned extent.
    fn read_chunk(
        &self,
        origin_x: usize,
        origin_y: usize,
        channel: usize,
        stokes: usize,
        out: &mut Vec<f32>,
    ) -> Result<ChunkExtent, LoadError> {
        let shape = self.shape();
        let extent = chunk_extent(&shape, origin_x, origin_y);
        let slice = SliceDescriptor {
            x: origin_x..origin_x + extent.width,
            y: origin_y..origin_y + extent.height,
            z: channel..channel + 1,
            stokes,
        };
        slice.validate(&shape)?;
        out.clear();
        out.resize(slice.len(), f32::NAN);
        self.read_slice(&slice, out)?;
        Ok(extent)
    }

    /// Axis index of a Stokes parameter, if the image stores it
    fn stokes_index(&self, stokes: StokesType) -> Option<usize>;

    /// False when the file carries no Stokes labels on its polarization axis
    fn labels_stokes_axis(&self) -> bool {
        true
    }

    /// True for tiled formats that serve rasters through a tile cache
    fn uses_tile_cache(&self) -> bool {
        false
    }

    /// Beam area in pixels, used for flux density
    fn beam_area(&self) -> Option<f64> {
        None
    }
}

/// Shared access to one image's loader
///
/// Every cache of an open image holds a clone. Reads are serialized by a
/// per-image lock.
#[derive(Clone)]
pub struct LoaderHandle {
    loader: Arc<dyn FileLoader>,
    image_lock: Arc<Mutex<()>>,
    shape: ImageShape,
    stokes: StokesIndices,
}

impl std::fmt::Debug for LoaderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderHandle")
            .field("shape", &self.shape)
            .field("stokes", &self.stokes)
            .finish()
    }
}

impl LoaderHandle {
    pub fn new(loader: Arc<dyn FileLoader>) -> Self {
        let shape = loader.shape();
        let stokes = resolve_stokes_indices(loader.as_ref(), &shape);
        Self {
            loader,
            image_lock: Arc::new(Mutex::new(())),
            shape,
            stokes,
        }
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn stokes_indices(&self) -> StokesIndices {
        self.stokes
    }

    pub fn uses_tile_cache(&self) -> bool {
        self.loader.uses_tile_cache()
    }

    pub fn beam_area(&self) -> Option<f64> {
        self.loader.beam_area()
    }

    /// Read `slice` into `out` under the image lock
    pub fn read_into(&self, slice: &SliceDescriptor, out: &mut [f32]) -> Result<(), LoadError> {
        slice.validate(&self.shape)?;
        if out.len() < slice.len() {
            return Err(LoadError::ShortRead {
                expected: slice.len(),
                actual: out.len(),
            });
        }
        let _guard = self.image_lock.lock();
        self.loader.read_slice(slice, &mut out[..slice.len()])
    }

    /// Read one stokes plane into a fresh buffer
    pub fn read_plane(&self, channel: usize, stokes: usize) -> Result<Vec<f32>, LoadError> {
        let slice = SliceDescriptor::plane(&self.shape, channel, stokes);
        let mut data = vec![f32::NAN; slice.len()];
        self.read_into(&slice, &mut data)?;
        Ok(data)
    }

    /// Read every channel of one stokes into a fresh buffer
    pub fn read_cube(&self, stokes: usize) -> Result<Vec<f32>, LoadError> {
        let slice = SliceDescriptor::cube(&self.shape, stokes);
        let mut data = vec![f32::NAN; slice.len()];
        self.read_into(&slice, &mut data)?;
        Ok(data)
    }

    /// Read the chunk at an origin for a real or computed polarization
    ///
    /// A computed polarization reads the chunk of each real input and
    /// derives the result. Missing inputs give an all-NaN chunk.
    pub fn read_chunk(
        &self,
        origin_x: usize,
        origin_y: usize,
        channel: usize,
        polarization: Polarization,
        out: &mut Vec<f32>,
    ) -> Result<ChunkExtent, LoadError> {
        match polarization {
            Polarization::Real(stokes) => {
                let _guard = self.image_lock.lock();
                let extent = self.loader.read_chunk(origin_x, origin_y, channel, stokes, out)?;
                if out.len() < extent.len() {
                    return Err(LoadError::ShortRead {
                        expected: extent.len(),
                        actual: out.len(),
                    });
                }
                Ok(extent)
            }
            Polarization::Computed(computed) => {
                let extent = chunk_extent(&self.shape, origin_x, origin_y);
                if extent.is_empty() {
                    return Err(LoadError::InvalidSlice(format!(
                        "chunk origin ({}, {}) outside image",
                        origin_x, origin_y
                    )));
                }
                out.clear();
                out.resize(extent.len(), f32::NAN);
                if !self.stokes.can_derive(computed) {
                    return Ok(extent);
                }

                let mut inputs: Vec<(StokesType, Vec<f32>)> = Vec::new();
                for &stokes in computed.required_inputs() {
                    let Some(index) = self.stokes.get(stokes) else {
                        return Ok(extent);
                    };
                    let mut buffer = Vec::new();
                    let read = {
                        let _guard = self.image_lock.lock();
                        self.loader.read_chunk(origin_x, origin_y, channel, index, &mut buffer)?
                    };
                    if read != extent || buffer.len() < extent.len() {
                        return Err(LoadError::ShortRead {
                            expected: extent.len(),
                            actual: buffer.len().min(read.len()),
                        });
                    }
                    inputs.push((stokes, buffer));
                }

                let mut planes = StokesPlanes::default();
                for (stokes, buffer) in &inputs {
                    planes.set(*stokes, Some(&buffer[..extent.len()]));
                }
                planes.derive_into(computed, out);
                Ok(extent)
            }
        }
    }
}

fn resolve_stokes_indices(loader: &dyn FileLoader, shape: &ImageShape) -> StokesIndices {
    let labelled = loader.labels_stokes_axis();
    let mut indices = StokesIndices::default();
    for stokes in StokesType::ALL {
        let index = if labelled {
            loader.stokes_index(stokes)
        } else {
            let assumed = stokes.assumed_index();
            if assumed < shape.num_stokes {
                tracing::warn!(
                    stokes = stokes.name(),
                    index = assumed,
                    "Stokes axis is not labelled, assuming stokes {} is at index {}",
                    stokes.name(),
                    assumed
                );
                Some(assumed)
            } else {
                None
            }
        };
        indices.set(stokes, index.filter(|&i| i < shape.num_stokes));
    }
    indices
}
