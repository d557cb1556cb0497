use crate::core::time_series::TimeSeriesReader;
use crate::types::{CountGrid, IndexGrid, StatisticKind, TimeWindow, ValidRange, VegResult};
use ndarray::{s, Array2, ArrayView1, Axis, Zip};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Temporal statistics parameters
#[derive(Debug, Clone)]
pub struct StatisticsParams {
    /// Closed interval separating in-range values from outliers
    pub valid_range: ValidRange,
    /// Edge length of the square spatial chunks
    pub chunk_size: usize,
}

impl Default for StatisticsParams {
    fn default() -> Self {
        Self {
            valid_range: ValidRange::new(-1.0, 1.0),
            chunk_size: 512,
        }
    }
}

/// Reduction of one pixel's time series
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelStats {
    pub in_range_sum: f64,
    pub in_range_count: u32,
    pub outlier_sum: f64,
    pub outlier_count: u32,
    /// Non-finite (masked or failed) observations
    pub excluded: u32,
}

impl PixelStats {
    /// Classify every value of a pixel's series, summing in time order
    pub fn reduce(values: ArrayView1<f32>, range: &ValidRange) -> Self {
        let mut stats = Self::default();
        for &value in values.iter() {
            if !value.is_finite() {
                stats.excluded += 1;
            } else if range.contains(value) {
                stats.in_range_sum += value as f64;
                stats.in_range_count += 1;
            } else {
                stats.outlier_sum += value as f64;
                stats.outlier_count += 1;
            }
        }
        stats
    }

    pub fn mean(&self) -> f32 {
        mean_or_nan(self.in_range_sum, self.in_range_count)
    }

    pub fn outlier_mean(&self) -> f32 {
        mean_or_nan(self.outlier_sum, self.outlier_count)
    }
}

fn mean_or_nan(sum: f64, count: u32) -> f32 {
    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

fn saturate(count: u32) -> u16 {
    count.min(u16::MAX as u32) as u16
}

/// Output cells of one pixel; pixels whose counts do not fit u16 are tallied
fn pixel_outputs(
    lane: ArrayView1<f32>,
    range: &ValidRange,
    clipped: &AtomicUsize,
) -> (f32, u16, f32, u16, u32) {
    let stats = PixelStats::reduce(lane, range);
    if stats.in_range_count > u16::MAX as u32 || stats.outlier_count > u16::MAX as u32 {
        clipped.fetch_add(1, Ordering::Relaxed);
    }
    (
        stats.mean(),
        saturate(stats.in_range_count),
        stats.outlier_mean(),
        saturate(stats.outlier_count),
        stats.excluded,
    )
}

/// Per-pixel temporal reductions of one tile
#[derive(Debug, Clone, PartialEq)]
pub struct TileStatistics {
    pub mean: IndexGrid,
    pub count_valid: CountGrid,
    pub outlier_mean: IndexGrid,
    pub outlier_count: CountGrid,
    /// Non-finite observations per pixel; kept in memory only
    pub excluded: Array2<u32>,
    /// Time steps that entered the reduction
    pub steps: usize,
    /// Pixels whose counts were clipped to `u16::MAX`
    pub clipped_pixels: usize,
}

impl TileStatistics {
    fn empty(rows: usize, cols: usize) -> Self {
        Self {
            mean: IndexGrid::from_elem((rows, cols), f32::NAN),
            count_valid: CountGrid::zeros((rows, cols)),
            outlier_mean: IndexGrid::from_elem((rows, cols), f32::NAN),
            outlier_count: CountGrid::zeros((rows, cols)),
            excluded: Array2::zeros((rows, cols)),
            steps: 0,
            clipped_pixels: 0,
        }
    }

    /// Float grid of a mean statistic
    pub fn float_grid(&self, kind: StatisticKind) -> Option<&IndexGrid> {
        match kind {
            StatisticKind::Mean => Some(&self.mean),
            StatisticKind::OutlierMean => Some(&self.outlier_mean),
            _ => None,
        }
    }

    /// Integer grid of a count statistic
    pub fn count_grid(&self, kind: StatisticKind) -> Option<&CountGrid> {
        match kind {
            StatisticKind::CountValid => Some(&self.count_valid),
            StatisticKind::OutlierCount => Some(&self.outlier_count),
            _ => None,
        }
    }
}

/// Computes temporal statistics chunk by chunk.
///
/// Only one chunk's full time series is resident at a time. Each pixel is
/// reduced on its own in time order, so results do not depend on the chunk
/// size.
pub struct ChunkedStatisticsEngine {
    params: StatisticsParams,
}

impl ChunkedStatisticsEngine {
    pub fn new() -> Self {
        Self {
            params: StatisticsParams::default(),
        }
    }

    pub fn with_params(params: StatisticsParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StatisticsParams {
        &self.params
    }

    /// Reduce the whole time axis
    pub fn compute(&self, series: &dyn TimeSeriesReader) -> VegResult<TileStatistics> {
        let steps = series.shape().0;
        self.compute_range(series, 0..steps)
    }

    /// Reduce only the time steps inside `window`
    pub fn compute_window(
        &self,
        series: &dyn TimeSeriesReader,
        window: &TimeWindow,
    ) -> VegResult<TileStatistics> {
        let times = window_steps(series.time_days(), window);
        log::debug!(
            "Window {} covers {} of {} time steps",
            window.label,
            times.len(),
            series.shape().0
        );
        self.compute_range(series, times)
    }

    fn compute_range(
        &self,
        series: &dyn TimeSeriesReader,
        times: Range<usize>,
    ) -> VegResult<TileStatistics> {
        let (_, rows, cols) = series.shape();
        let mut out = TileStatistics::empty(rows, cols);
        out.steps = times.len();
        if times.is_empty() || rows == 0 || cols == 0 {
            return Ok(out);
        }

        let edge = self.params.chunk_size.max(1);
        let range = self.params.valid_range;
        log::info!(
            "Temporal statistics over {} steps, {}x{} pixels, chunk {}",
            times.len(),
            rows,
            cols,
            edge
        );

        let clipped = AtomicUsize::new(0);
        for row0 in (0..rows).step_by(edge) {
            let row1 = (row0 + edge).min(rows);
            for col0 in (0..cols).step_by(edge) {
                let col1 = (col0 + edge).min(cols);
                let block = series.read(times.clone(), row0..row1, col0..col1)?;

                let cells = Zip::from(out.mean.slice_mut(s![row0..row1, col0..col1]))
                    .and(out.count_valid.slice_mut(s![row0..row1, col0..col1]))
                    .and(out.outlier_mean.slice_mut(s![row0..row1, col0..col1]))
                    .and(out.outlier_count.slice_mut(s![row0..row1, col0..col1]))
                    .and(out.excluded.slice_mut(s![row0..row1, col0..col1]))
                    .and(block.lanes(Axis(0)));

                #[cfg(feature = "parallel")]
                cells.par_for_each(|mean, count, o_mean, o_count, excluded, lane| {
                    (*mean, *count, *o_mean, *o_count, *excluded) = pixel_outputs(lane, &range, &clipped);
                });
                #[cfg(not(feature = "parallel"))]
                cells.for_each(|mean, count, o_mean, o_count, excluded, lane| {
                    (*mean, *count, *o_mean, *o_count, *excluded) = pixel_outputs(lane, &range, &clipped);
                });
            }
        }

        out.clipped_pixels = clipped.into_inner();
        if out.clipped_pixels > 0 {
            log::warn!(
                "{} pixels have more than {} observations; their counts are clipped",
                out.clipped_pixels,
                u16::MAX
            );
        }
        Ok(out)
    }
}

impl Default for ChunkedStatisticsEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Contiguous time steps whose day offsets fall inside the window
pub fn window_steps(days: &[i32], window: &TimeWindow) -> Range<usize> {
    let (first, last) = window.day_bounds();
    let start = days.partition_point(|&d| d < first);
    let end = days.partition_point(|&d| d <= last);
    start..end.max(start)
}
