//! Polarization axis types and computed polarization quantities
//!
//! Real polarizations are stored in the image at an index along the stokes
//! axis. Computed polarizations (total/linear polarized intensity, their
//! fractions, and the polarization angle) are derived per pixel from the
//! real Stokes I, Q, U and V values.
//!
//! The derivations are pure: any missing input or NaN input gives NaN.

use rayon::prelude::*;

/// Real Stokes parameters that can appear on the polarization axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StokesType {
    I,
    Q,
    U,
    V,
}

impl StokesType {
    pub const ALL: [StokesType; 4] = [StokesType::I, StokesType::Q, StokesType::U, StokesType::V];

    /// FITS stokes value (I=1, Q=2, U=3, V=4)
    pub fn fits_value(self) -> i32 {
        match self {
            StokesType::I => 1,
            StokesType::Q => 2,
            StokesType::U => 3,
            StokesType::V => 4,
        }
    }

    /// Axis index assumed when the image does not label its stokes axis
    pub fn assumed_index(self) -> usize {
        ((self.fits_value() - 1) % 4) as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StokesType::I => "I",
            StokesType::Q => "Q",
            StokesType::U => "U",
            StokesType::V => "V",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

/// Polarization quantities derived from the real Stokes parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComputedPolarization {
    /// Total polarized intensity
    Ptotal,
    /// Total polarization fraction (%)
    PFtotal,
    /// Linearly polarized intensity
    Plinear,
    /// Linear polarization fraction (%)
    PFlinear,
    /// Polarization angle (degrees)
    Pangle,
}

impl ComputedPolarization {
    pub const ALL: [ComputedPolarization; 5] = [
        ComputedPolarization::Ptotal,
        ComputedPolarization::PFtotal,
        ComputedPolarization::Plinear,
        ComputedPolarization::PFlinear,
        ComputedPolarization::Pangle,
    ];

    /// Protocol code of this quantity on the polarization axis
    pub fn code(self) -> i32 {
        match self {
            ComputedPolarization::Ptotal => 13,
            ComputedPolarization::PFtotal => 14,
            ComputedPolarization::Plinear => 15,
            ComputedPolarization::PFlinear => 16,
            ComputedPolarization::Pangle => 17,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            ComputedPolarization::Ptotal => "Ptotal",
            ComputedPolarization::PFtotal => "PFtotal",
            ComputedPolarization::Plinear => "Plinear",
            ComputedPolarization::PFlinear => "PFlinear",
            ComputedPolarization::Pangle => "Pangle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Real Stokes parameters this quantity is computed from
    pub fn required_inputs(self) -> &'static [StokesType] {
        match self {
            ComputedPolarization::Ptotal => &[StokesType::Q, StokesType::U, StokesType::V],
            ComputedPolarization::PFtotal => {
                &[StokesType::I, StokesType::Q, StokesType::U, StokesType::V]
            }
            ComputedPolarization::Plinear | ComputedPolarization::Pangle => {
                &[StokesType::Q, StokesType::U]
            }
            ComputedPolarization::PFlinear => &[StokesType::I, StokesType::Q, StokesType::U],
        }
    }

    /// Evaluate this quantity for one pixel
    pub fn evaluate(self, s: StokesSample) -> f32 {
        match self {
            ComputedPolarization::Ptotal => ptotal(s.q, s.u, s.v),
            ComputedPolarization::PFtotal => pftotal(s.i, s.q, s.u, s.v),
            ComputedPolarization::Plinear => plinear(s.q, s.u),
            ComputedPolarization::PFlinear => pflinear(s.i, s.q, s.u),
            ComputedPolarization::Pangle => pangle(s.q, s.u),
        }
    }
}

/// A position on the polarization axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarization {
    /// Index of a stored polarization
    Real(usize),
    /// A derived quantity
    Computed(ComputedPolarization),
}

impl Polarization {
    /// Map a protocol index (real index, or computed code) to a polarization
    pub fn from_index(index: i32) -> Option<Self> {
        if let Some(computed) = ComputedPolarization::from_code(index) {
            Some(Polarization::Computed(computed))
        } else if index >= 0 {
            Some(Polarization::Real(index as usize))
        } else {
            None
        }
    }

    /// Protocol index of this polarization
    pub fn index(self) -> i32 {
        match self {
            Polarization::Real(index) => index as i32,
            Polarization::Computed(computed) => computed.code(),
        }
    }

    pub fn is_computed(self) -> bool {
        matches!(self, Polarization::Computed(_))
    }

    /// Resolve a Stokes or computed quantity name against an image's indices
    pub fn from_name(name: &str, indices: &StokesIndices) -> Option<Self> {
        if let Some(stokes) = StokesType::from_name(name) {
            return indices.get(stokes).map(Polarization::Real);
        }
        ComputedPolarization::from_name(name).map(Polarization::Computed)
    }
}

/// Axis index of each real Stokes parameter; `None` means not present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StokesIndices {
    pub i: Option<usize>,
    pub q: Option<usize>,
    pub u: Option<usize>,
    pub v: Option<usize>,
}

impl StokesIndices {
    pub fn get(&self, stokes: StokesType) -> Option<usize> {
        match stokes {
            StokesType::I => self.i,
            StokesType::Q => self.q,
            StokesType::U => self.u,
            StokesType::V => self.v,
        }
    }

    pub fn set(&mut self, stokes: StokesType, index: Option<usize>) {
        match stokes {
            StokesType::I => self.i = index,
            StokesType::Q => self.q = index,
            StokesType::U => self.u = index,
            StokesType::V => self.v = index,
        }
    }

    /// Whether every input of `computed` is present
    pub fn can_derive(&self, computed: ComputedPolarization) -> bool {
        computed
            .required_inputs()
            .iter()
            .all(|&stokes| self.get(stokes).is_some())
    }
}

/// Stokes values at one pixel; absent parameters are NaN
#[derive(Debug, Clone, Copy)]
pub struct StokesSample {
    pub i: f32,
    pub q: f32,
    pub u: f32,
    pub v: f32,
}

impl Default for StokesSample {
    fn default() -> Self {
        Self {
            i: f32::NAN,
            q: f32::NAN,
            u: f32::NAN,
            v: f32::NAN,
        }
    }
}

pub fn ptotal(q: f32, u: f32, v: f32) -> f32 {
    (q * q + u * u + v * v).sqrt()
}

pub fn plinear(q: f32, u: f32) -> f32 {
    (q * q + u * u).sqrt()
}

pub fn pftotal(i: f32, q: f32, u: f32, v: f32) -> f32 {
    100.0 * ptotal(q, u, v) / i
}

pub fn pflinear(i: f32, q: f32, u: f32) -> f32 {
    100.0 * plinear(q, u) / i
}

pub fn pangle(q: f32, u: f32) -> f32 {
    u.atan2(q).to_degrees() / 2.0
}

/// Borrowed per-Stokes buffers sharing one layout
#[derive(Debug, Clone, Copy, Default)]
pub struct StokesPlanes<'a> {
    pub i: Option<&'a [f32]>,
    pub q: Option<&'a [f32]>,
    pub u: Option<&'a [f32]>,
    pub v: Option<&'a [f32]>,
}

impl<'a> StokesPlanes<'a> {
    pub fn get(&self, stokes: StokesType) -> Option<&'a [f32]> {
        match stokes {
            StokesType::I => self.i,
            StokesType::Q => self.q,
            StokesType::U => self.u,
            StokesType::V => self.v,
        }
    }

    pub fn set(&mut self, stokes: StokesType, data: Option<&'a [f32]>) {
        match stokes {
            StokesType::I => self.i = data,
            StokesType::Q => self.q = data,
            StokesType::U => self.u = data,
            StokesType::V => self.v = data,
        }
    }

    pub fn has_inputs_for(&self, computed: ComputedPolarization) -> bool {
        computed
            .required_inputs()
            .iter()
            .all(|&stokes| self.get(stokes).is_some())
    }

    /// Stokes values at `idx`
    pub fn sample(&self, idx: usize) -> StokesSample {
        let at = |plane: Option<&[f32]>| plane.map_or(f32::NAN, |p| p[idx]);
        StokesSample {
            i: at(self.i),
            q: at(self.q),
            u: at(self.u),
            v: at(self.v),
        }
    }

    /// Derived value at `idx`; NaN when an input is missing
    pub fn derive_value(&self, computed: ComputedPolarization, idx: usize) -> f32 {
        if !self.has_inputs_for(computed) {
            return f32::NAN;
        }
        computed.evaluate(self.sample(idx))
    }

    /// Fill `out` with the derived quantity, element by element
    pub fn derive_into(&self, computed: ComputedPolarization, out: &mut [f32]) {
        if !self.has_inputs_for(computed) {
            out.fill(f32::NAN);
            return;
        }
        out.par_iter_mut()
            .enumerate()
            .for_each(|(idx, value)| *value = computed.evaluate(self.sample(idx)));
    }
}

/// Single-slot cache of one derived channel, keyed by (channel, quantity)
#[derive(Debug, Default)]
pub struct DerivedChannelSlot {
    key: Option<(usize, ComputedPolarization)>,
    data: Vec<f32>,
}

impl DerivedChannelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached plane for `(channel, computed)`, if that is what the slot holds
    pub fn get(&self, channel: usize, computed: ComputedPolarization) -> Option<&[f32]> {
        match self.key {
            Some(key) if key == (channel, computed) => Some(&self.data),
            _ => None,
        }
    }

    pub fn contains(&self, channel: usize, computed: ComputedPolarization) -> bool {
        self.key == Some((channel, computed))
    }

    /// Replace the slot contents
    pub fn store(&mut self, channel: usize, computed: ComputedPolarization, data: Vec<f32>) {
        self.data = data;
        self.key = Some((channel, computed));
    }

    pub fn invalidate(&mut self) {
        self.key = None;
    }

    pub fn key(&self) -> Option<(usize, ComputedPolarization)> {
        self.key
    }
}
