//! Per-channel statistics over a masked region
//!
//! Region spectral profiles are computed from cached cube data, one channel
//! per rayon task. Each task reads only immutable cube data and writes its
//! own result slot.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::loader::ImageShape;

/// Statistic reported per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsType {
    Sum,
    FluxDensity,
    Mean,
    Rms,
    Sigma,
    SumSq,
    Min,
    Max,
    Extrema,
    NumPixels,
}

impl StatsType {
    pub const ALL: [StatsType; 10] = [
        StatsType::Sum,
        StatsType::FluxDensity,
        StatsType::Mean,
        StatsType::Rms,
        StatsType::Sigma,
        StatsType::SumSq,
        StatsType::Min,
        StatsType::Max,
        StatsType::Extrema,
        StatsType::NumPixels,
    ];
}

/// Boolean mask over a rectangle of the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMask {
    pub origin_x: usize,
    pub origin_y: usize,
    pub width: usize,
    pub height: usize,
    /// Row-major, `width * height` entries
    mask: Vec<bool>,
}

impl RegionMask {
    /// Returns `None` when `mask` does not hold `width * height` entries
    pub fn new(
        origin_x: usize,
        origin_y: usize,
        width: usize,
        height: usize,
        mask: Vec<bool>,
    ) -> Option<Self> {
        if mask.len() != width * height {
            return None;
        }
        Some(Self {
            origin_x,
            origin_y,
            width,
            height,
            mask,
        })
    }

    /// Fully selected rectangle
    pub fn rectangle(origin_x: usize, origin_y: usize, width: usize, height: usize) -> Self {
        Self {
            origin_x,
            origin_y,
            width,
            height,
            mask: vec![true; width * height],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Whether the mask rectangle lies inside the image plane
    pub fn fits_within(&self, shape: &ImageShape) -> bool {
        self.origin_x + self.width <= shape.width && self.origin_y + self.height <= shape.height
    }

    /// Mask value at an offset from the origin
    pub fn selected(&self, dx: usize, dy: usize) -> bool {
        self.mask[dy * self.width + dx]
    }

    /// Image coordinates of every selected pixel
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.height).flat_map(move |dy| {
            (0..self.width).filter_map(move |dx| {
                self.selected(dx, dy)
                    .then_some((self.origin_x + dx, self.origin_y + dy))
            })
        })
    }
}

/// One series per statistic, indexed from the first requested channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectralProfiles {
    first_channel: usize,
    series: BTreeMap<StatsType, Vec<f64>>,
}

impl SpectralProfiles {
    pub fn get(&self, stats_type: StatsType) -> Option<&[f64]> {
        self.series.get(&stats_type).map(Vec::as_slice)
    }

    /// Value of one statistic at an absolute channel index
    pub fn at(&self, stats_type: StatsType, channel: usize) -> Option<f64> {
        let offset = channel.checked_sub(self.first_channel)?;
        self.get(stats_type)?.get(offset).copied()
    }

    pub fn first_channel(&self) -> usize {
        self.first_channel
    }

    pub fn num_channels(&self) -> usize {
        self.series.values().next().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelStats {
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    num_pixels: usize,
}

impl ChannelStats {
    fn accumulate<F>(mask: &RegionMask, channel: usize, get_value: &F) -> Self
    where
        F: Fn(usize, usize, usize) -> f32,
    {
        let mut stats = ChannelStats {
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            num_pixels: 0,
        };
        for (x, y) in mask.pixels() {
            let value = get_value(x, y, channel);
            if value.is_nan() {
                continue;
            }
            let value = value as f64;
            stats.sum += value;
            stats.sum_sq += value * value;
            stats.min = stats.min.min(value);
            stats.max = stats.max.max(value);
            stats.num_pixels += 1;
        }
        stats
    }

    fn value(&self, stats_type: StatsType, beam_area: Option<f64>) -> f64 {
        if self.num_pixels == 0 {
            return f64::NAN;
        }
        let n = self.num_pixels as f64;
        match stats_type {
            StatsType::Sum => self.sum,
            StatsType::FluxDensity => beam_area.map_or(f64::NAN, |area| self.sum / area),
            StatsType::Mean => self.sum / n,
            StatsType::Rms => (self.sum_sq / n).sqrt(),
            StatsType::Sigma => {
                if self.num_pixels > 1 {
                    ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).sqrt()
                } else {
                    0.0
                }
            }
            StatsType::SumSq => self.sum_sq,
            StatsType::Min => self.min,
            StatsType::Max => self.max,
            StatsType::Extrema => {
                if self.min.abs() > self.max.abs() {
                    self.min
                } else {
                    self.max
                }
            }
            StatsType::NumPixels => n,
        }
    }
}

/// Statistics of the masked region for every channel in `channels`
///
/// `get_value(x, y, channel)` supplies pixel values; NaN pixels are
/// skipped. The token is polled once per channel and a cancelled
/// computation returns `None`.
pub fn compute_spectral_profiles<F>(
    channels: RangeInclusive<usize>,
    mask: &RegionMask,
    beam_area: Option<f64>,
    cancel: &CancellationToken,
    get_value: F,
) -> Option<SpectralProfiles>
where
    F: Fn(usize, usize, usize) -> f32 + Sync,
{
    let first_channel = *channels.start();
    let per_channel = channels
        .into_par_iter()
        .map(|channel| {
            if cancel.is_cancelled() {
                None
            } else {
                Some(ChannelStats::accumulate(mask, channel, &get_value))
            }
        })
        .collect::<Option<Vec<ChannelStats>>>()?;

    let series = StatsType::ALL
        .into_iter()
        .map(|stats_type| {
            let values = per_channel
                .iter()
                .map(|stats| stats.value(stats_type, beam_area))
                .collect();
            (stats_type, values)
        })
        .collect();

    Some(SpectralProfiles {
        first_channel,
        series,
    })
}
