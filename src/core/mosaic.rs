use crate::io::geotiff::{GdalRasterSource, GeoTiffOptions, GeoTiffSink};
use crate::types::{GeoRaster, GeoTransform, RasterValue, VegError, VegResult};
use ndarray::{s, Array2, Zip};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Fraction of a pixel tolerated when aligning inputs on the output lattice
const ALIGN_TOLERANCE: f64 = 1e-3;

/// Placement of a raster without its pixels
#[derive(Debug, Clone, PartialEq)]
pub struct RasterLayout {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub crs_wkt: String,
}

/// A single-band input that can be read a few rows at a time
pub trait RasterSource<T> {
    fn name(&self) -> String;

    fn layout(&self) -> &RasterLayout;

    /// Full-width rows `rows` as a `(rows.len(), width)` grid
    fn read_rows(&self, rows: Range<usize>) -> VegResult<Array2<T>>;
}

/// Destination of merged windows
pub trait RasterSink<T> {
    /// Write `data` at (row, col) of 1-based `band`
    fn write_window(&mut self, band: usize, row: usize, col: usize, data: &Array2<T>) -> VegResult<()>;
}

/// A raster held in memory is its own source
pub struct MemorySource<T> {
    name: String,
    layout: RasterLayout,
    data: Array2<T>,
}

impl<T: Clone> MemorySource<T> {
    pub fn new(name: impl Into<String>, raster: GeoRaster<T>) -> Self {
        let (height, width) = raster.shape();
        Self {
            name: name.into(),
            layout: RasterLayout {
                transform: raster.transform,
                width,
                height,
                crs_wkt: raster.crs_wkt,
            },
            data: raster.data,
        }
    }
}

impl<T: Clone> RasterSource<T> for MemorySource<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn layout(&self) -> &RasterLayout {
        &self.layout
    }

    fn read_rows(&self, rows: Range<usize>) -> VegResult<Array2<T>> {
        if rows.end > self.layout.height {
            return Err(VegError::Processing(format!(
                "rows {:?} outside {} ({} rows)",
                rows, self.name, self.layout.height
            )));
        }
        Ok(self.data.slice(s![rows, ..]).to_owned())
    }
}

/// Collects merged bands in memory
#[derive(Debug, Clone)]
pub struct MemorySink<T> {
    pub bands: Vec<Array2<T>>,
}

impl<T: RasterValue> MemorySink<T> {
    pub fn new(layout: &RasterLayout, bands: usize) -> Self {
        Self {
            bands: vec![Array2::from_elem((layout.height, layout.width), T::nodata()); bands],
        }
    }
}

impl<T: RasterValue> RasterSink<T> for MemorySink<T> {
    fn write_window(&mut self, band: usize, row: usize, col: usize, data: &Array2<T>) -> VegResult<()> {
        let target = self
            .bands
            .get_mut(band.wrapping_sub(1))
            .ok_or_else(|| VegError::Processing(format!("no band {}", band)))?;
        let (rows, cols) = data.dim();
        target
            .slice_mut(s![row..row + rows, col..col + cols])
            .assign(data);
        Ok(())
    }
}

/// Counters of one merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeSummary {
    pub sources: usize,
    pub pixels_written: usize,
}

/// Merges aligned rasters window by window, first writer wins.
///
/// Peak memory is one output window plus the overlapping rows of one input.
/// Inputs are visited in the order given, so callers sort them for
/// reproducible overlaps.
pub struct StreamingMosaicMerger {
    window_rows: usize,
}

impl StreamingMosaicMerger {
    pub fn new(window_rows: usize) -> Self {
        Self {
            window_rows: window_rows.max(1),
        }
    }

    /// Union extent of the inputs on their shared lattice
    pub fn layout<T>(&self, sources: &[&dyn RasterSource<T>]) -> VegResult<RasterLayout> {
        let first = sources
            .first()
            .ok_or_else(|| VegError::NoObservations("no rasters to mosaic".to_string()))?
            .layout();
        let res_x = first.transform.pixel_width;
        let res_y = first.transform.pixel_height;

        let (mut left, mut bottom, mut right, mut top) = first.transform.bounds(first.width, first.height);
        for source in sources.iter().skip(1) {
            let layout = source.layout();
            if layout.crs_wkt != first.crs_wkt {
                return Err(VegError::ShapeMismatch(format!(
                    "{} has a different CRS than {}",
                    source.name(),
                    sources[0].name()
                )));
            }
            if (layout.transform.pixel_width - res_x).abs() > res_x.abs() * ALIGN_TOLERANCE
                || (layout.transform.pixel_height - res_y).abs() > res_y.abs() * ALIGN_TOLERANCE
            {
                return Err(VegError::ShapeMismatch(format!(
                    "{} has a different resolution than {}",
                    source.name(),
                    sources[0].name()
                )));
            }
            let (l, b, r, t) = layout.transform.bounds(layout.width, layout.height);
            left = left.min(l);
            bottom = bottom.min(b);
            right = right.max(r);
            top = top.max(t);
        }

        let width = ((right - left) / res_x.abs()).round() as usize;
        let height = ((top - bottom) / res_y.abs()).round() as usize;
        Ok(RasterLayout {
            transform: GeoTransform {
                top_left_x: left,
                pixel_width: res_x,
                rotation_x: 0.0,
                top_left_y: top,
                rotation_y: 0.0,
                pixel_height: res_y,
            },
            width,
            height,
            crs_wkt: first.crs_wkt.clone(),
        })
    }

    /// Pixel offset (row, col) of an input inside the output
    fn offset<T>(&self, layout: &RasterLayout, source: &dyn RasterSource<T>) -> VegResult<(usize, usize)> {
        let src = source.layout();
        let col = (src.transform.top_left_x - layout.transform.top_left_x) / layout.transform.pixel_width;
        let row = (src.transform.top_left_y - layout.transform.top_left_y) / layout.transform.pixel_height;
        if (col - col.round()).abs() > ALIGN_TOLERANCE || (row - row.round()).abs() > ALIGN_TOLERANCE {
            return Err(VegError::ShapeMismatch(format!(
                "{} is not aligned with the mosaic grid",
                source.name()
            )));
        }
        if col < -ALIGN_TOLERANCE || row < -ALIGN_TOLERANCE {
            return Err(VegError::ShapeMismatch(format!(
                "{} lies outside the mosaic extent",
                source.name()
            )));
        }
        Ok((row.round() as usize, col.round() as usize))
    }

    /// Stream `sources` into `band` of `sink`
    pub fn merge_into<T: RasterValue>(
        &self,
        sources: &[&dyn RasterSource<T>],
        layout: &RasterLayout,
        sink: &mut dyn RasterSink<T>,
        band: usize,
    ) -> VegResult<MergeSummary> {
        let offsets = sources
            .iter()
            .map(|source| self.offset(layout, *source))
            .collect::<VegResult<Vec<_>>>()?;
        log::info!(
            "Mosaicking {} rasters into {}x{} (band {})",
            sources.len(),
            layout.width,
            layout.height,
            band
        );

        let mut summary = MergeSummary {
            sources: sources.len(),
            pixels_written: 0,
        };

        for win0 in (0..layout.height).step_by(self.window_rows) {
            let win1 = (win0 + self.window_rows).min(layout.height);
            let mut window = Array2::from_elem((win1 - win0, layout.width), T::nodata());

            for (source, &(row_off, col_off)) in sources.iter().zip(offsets.iter()) {
                let src = source.layout();
                let first = win0.max(row_off);
                let last = win1.min(row_off + src.height);
                if first >= last {
                    continue;
                }
                let cols = src.width.min(layout.width.saturating_sub(col_off));
                if cols == 0 {
                    continue;
                }

                let rows = source.read_rows(first - row_off..last - row_off)?;
                let mut target = window.slice_mut(s![first - win0..last - win0, col_off..col_off + cols]);
                let mut written = 0usize;
                Zip::from(&mut target)
                    .and(&rows.slice(s![.., ..cols]))
                    .for_each(|out, &value| {
                        if out.is_nodata() && !value.is_nodata() {
                            *out = value;
                            written += 1;
                        }
                    });
                summary.pixels_written += written;
            }

            sink.write_window(band, win0, 0, &window)?;
        }

        Ok(summary)
    }
}

/// Merge single-band GeoTIFFs, in the order given, into a new GeoTIFF
pub fn mosaic_geotiffs<T: RasterValue>(
    inputs: &[PathBuf],
    output: &Path,
    options: &GeoTiffOptions,
) -> VegResult<MergeSummary> {
    let sources = inputs
        .iter()
        .map(|path| GdalRasterSource::open(path))
        .collect::<VegResult<Vec<_>>>()?;
    let refs: Vec<&dyn RasterSource<T>> = sources.iter().map(|s| s as &dyn RasterSource<T>).collect();

    let merger = StreamingMosaicMerger::new(options.block_size);
    let layout = merger.layout(&refs)?;
    let mut sink = GeoTiffSink::create::<T>(output, &layout, 1, options)?;
    let summary = merger.merge_into(&refs, &layout, &mut sink, 1)?;
    sink.finish()?;
    Ok(summary)
}
