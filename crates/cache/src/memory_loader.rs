//! In-memory image loader
//!
//! Holds a whole hypercube in a `Vec<f32>` and serves it through
//! [`FileLoader`]. Used for images generated in memory and as the
//! deterministic loader in tests: it counts reads and can be told to fail.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::LoadError;
use crate::loader::{FileLoader, ImageShape, SliceDescriptor};
use crate::polarization::StokesType;

/// Image data held in memory, stokes-major then channel, row, column
#[derive(Debug)]
pub struct InMemoryLoader {
    shape: ImageShape,
    data: Vec<f32>,
    stokes_labels: Vec<StokesType>,
    labelled: bool,
    tile_backed: bool,
    beam_area: Option<f64>,
    reads: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryLoader {
    /// Wrap `data`, which must hold exactly `width*height*depth*num_stokes` values
    pub fn new(shape: ImageShape, data: Vec<f32>) -> Result<Self, LoadError> {
        let expected = shape.cube_len() * shape.num_stokes;
        if data.len() != expected {
            return Err(LoadError::ShortRead {
                expected,
                actual: data.len(),
            });
        }
        let stokes_labels = StokesType::ALL
            .into_iter()
            .take(shape.num_stokes)
            .collect();
        Ok(Self {
            shape,
            data,
            stokes_labels,
            labelled: true,
            tile_backed: false,
            beam_area: None,
            reads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    /// Build an image from a per-pixel function of `(x, y, channel, stokes)`
    pub fn from_fn<F>(shape: ImageShape, f: F) -> Self
    where
        F: Fn(usize, usize, usize, usize) -> f32,
    {
        let mut data = Vec::with_capacity(shape.cube_len() * shape.num_stokes);
        for s in 0..shape.num_stokes {
            for z in 0..shape.depth {
                for y in 0..shape.height {
                    for x in 0..shape.width {
                        data.push(f(x, y, z, s));
                    }
                }
            }
        }
        Self {
            shape,
            data,
            stokes_labels: StokesType::ALL.into_iter().take(shape.num_stokes).collect(),
            labelled: true,
            tile_backed: false,
            beam_area: None,
            reads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Label the stokes axis positionally
    pub fn with_stokes(mut self, labels: &[StokesType]) -> Self {
        self.stokes_labels = labels.iter().copied().take(self.shape.num_stokes).collect();
        self.labelled = true;
        self
    }

    /// Drop the stokes labels, as for files without a labelled axis
    pub fn without_stokes_labels(mut self) -> Self {
        self.stokes_labels.clear();
        self.labelled = false;
        self
    }

    pub fn tile_backed(mut self, tile_backed: bool) -> Self {
        self.tile_backed = tile_backed;
        self
    }

    pub fn with_beam_area(mut self, beam_area: f64) -> Self {
        self.beam_area = Some(beam_area);
        self
    }

    /// Make every following read fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of slice reads served or attempted
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    fn offset(&self, x: usize, y: usize, z: usize, stokes: usize) -> usize {
        ((stokes * self.shape.depth + z) * self.shape.height + y) * self.shape.width + x
    }
}

impl FileLoader for InMemoryLoader {
    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn read_slice(&self, slice: &SliceDescriptor, out: &mut [f32]) -> Result<(), LoadError> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        if self.failing.load(Ordering::Acquire) {
            return Err(LoadError::Unavailable("in-memory image marked failing".to_string()));
        }
        slice.validate(&self.shape)?;
        if out.len() < slice.len() {
            return Err(LoadError::ShortRead {
                expected: slice.len(),
                actual: out.len(),
            });
        }

        let row_len = slice.width();
        let mut rows = out.chunks_exact_mut(row_len);
        for z in slice.z.clone() {
            for y in slice.y.clone() {
                let start = self.offset(slice.x.start, y, z, slice.stokes);
                if let Some(row) = rows.next() {
                    row.copy_from_slice(&self.data[start..start + row_len]);
                }
            }
        }
        Ok(())
    }

    fn stokes_index(&self, stokes: StokesType) -> Option<usize> {
        self.stokes_labels.iter().position(|&label| label == stokes)
    }

    fn labels_stokes_axis(&self) -> bool {
        self.labelled
    }

    fn uses_tile_cache(&self) -> bool {
        self.tile_backed
    }

    fn beam_area(&self) -> Option<f64> {
        self.beam_area
    }
}
