//! Seasonal composites
//!
//! For every named time window the windowed mean and valid count of each
//! tile are reprojected and mosaicked into one band of two multi-band
//! stacks, `HLS_TimeSeries_{VI}_Mean_{CRS}.tif` and
//! `HLS_TimeSeries_{VI}_CountValid_{CRS}.tif`. Band `b` holds window `b` and
//! carries its label as band description and `label` metadata.
//!
//! Reprojected tile windows are staged as GeoTIFFs in a scratch directory
//! next to the outputs, so the merge streams from disk like any mosaic.

use crate::config::PipelineConfig;
use crate::core::mosaic::{RasterSource, StreamingMosaicMerger};
use crate::core::reproject::{GdalWarp, Reprojector, Warp};
use crate::core::temporal_stats::{ChunkedStatisticsEngine, StatisticsParams};
use crate::io::geotiff::{write_raster_atomic, GdalRasterSource, GeoTiffOptions, GeoTiffSink};
use crate::io::netcdf_store::TimeSeriesStore;
use crate::types::{
    GeoRaster, RasterValue, StatisticKind, TimeWindow, ValidRange, VegError, VegResult, VegetationIndex,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of a composite stack; only mean and valid count are stacked
pub fn composite_file_name(index: VegetationIndex, kind: StatisticKind, crs_tag: &str) -> String {
    let kind = if kind.is_count() { "CountValid" } else { "Mean" };
    format!("HLS_TimeSeries_{}_{}_{}.tif", index.name(), kind, crs_tag)
}

/// What one composite build produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeSummary {
    pub mean_path: PathBuf,
    pub count_path: PathBuf,
    pub tiles: usize,
    /// Labels of windows no tile covered; their bands stay nodata
    pub empty_windows: Vec<String>,
}

/// Staged per-tile rasters of one window
#[derive(Default)]
struct WindowInputs {
    mean: Vec<PathBuf>,
    count: Vec<PathBuf>,
}

pub struct CompositeBuilder<W: Warp = GdalWarp> {
    windows: Vec<TimeWindow>,
    chunk_size: usize,
    reprojector: Reprojector<W>,
    options: GeoTiffOptions,
    crs_tag: String,
    output_dir: PathBuf,
    ranges: BTreeMap<VegetationIndex, ValidRange>,
}

impl CompositeBuilder<GdalWarp> {
    pub fn new(config: &PipelineConfig) -> VegResult<Self> {
        Ok(Self::with_reprojector(config, Reprojector::new(config)?))
    }
}

impl<W: Warp> CompositeBuilder<W> {
    pub fn with_reprojector(config: &PipelineConfig, reprojector: Reprojector<W>) -> Self {
        Self {
            windows: config.windows.clone(),
            chunk_size: config.chunk_size,
            reprojector,
            options: GeoTiffOptions::from_output(&config.output),
            crs_tag: config.crs_tag(),
            output_dir: config.dirs.composite_dir.clone(),
            ranges: VegetationIndex::ALL
                .iter()
                .map(|&vi| (vi, config.valid_range(vi)))
                .collect(),
        }
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    /// (mean stack, count stack) of an index
    pub fn output_paths(&self, index: VegetationIndex) -> (PathBuf, PathBuf) {
        (
            self.output_dir
                .join(composite_file_name(index, StatisticKind::Mean, &self.crs_tag)),
            self.output_dir
                .join(composite_file_name(index, StatisticKind::CountValid, &self.crs_tag)),
        )
    }

    /// Build both stacks of `index` from the given series files
    pub fn build(&self, index: VegetationIndex, series: &[PathBuf]) -> VegResult<CompositeSummary> {
        if self.windows.is_empty() {
            return Err(VegError::Config("No time windows configured".to_string()));
        }
        std::fs::create_dir_all(&self.output_dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(".composite_")
            .tempdir_in(&self.output_dir)?;

        let mut series = series.to_vec();
        series.sort();

        let engine = ChunkedStatisticsEngine::with_params(StatisticsParams {
            valid_range: self
                .ranges
                .get(&index)
                .copied()
                .unwrap_or_else(|| index.default_valid_range()),
            chunk_size: self.chunk_size,
        });

        let mut staged: Vec<WindowInputs> = self.windows.iter().map(|_| WindowInputs::default()).collect();
        let mut tiles = 0usize;
        for (tile_no, path) in series.iter().enumerate() {
            match self.stage_tile(&engine, path, tile_no, scratch.path(), &mut staged) {
                Ok(()) => tiles += 1,
                Err(e) if e.is_input_fault() => {
                    log::warn!("Composite {}: skipping {}: {}", index, path.display(), e)
                }
                Err(e) => return Err(e),
            }
        }

        let all_means: Vec<PathBuf> = staged.iter().flat_map(|w| w.mean.iter().cloned()).collect();
        if all_means.is_empty() {
            return Err(VegError::NoObservations(format!(
                "no {} observations inside any time window",
                index
            )));
        }

        let (mean_path, count_path) = self.output_paths(index);
        let layout = {
            let sources = open_sources(&all_means)?;
            let refs = as_sources::<f32>(&sources);
            StreamingMosaicMerger::new(self.options.block_size).layout(&refs)?
        };

        let bands = self.windows.len();
        let mut mean_sink = GeoTiffSink::create::<f32>(&mean_path, &layout, bands, &self.options)?;
        let mut count_sink = GeoTiffSink::create::<u16>(&count_path, &layout, bands, &self.options)?;
        let merger = StreamingMosaicMerger::new(self.options.block_size);
        let mut empty_windows = Vec::new();

        for (i, (window, inputs)) in self.windows.iter().zip(staged.iter()).enumerate() {
            let band = i + 1;
            mean_sink.set_label(band, &window.label)?;
            count_sink.set_label(band, &window.label)?;
            if inputs.mean.is_empty() {
                log::warn!(
                    "Composite {}: window {} ({} to {}) has no data; band {} left empty",
                    index,
                    window.label,
                    window.start,
                    window.end,
                    band
                );
                empty_windows.push(window.label.clone());
                continue;
            }

            let sources = open_sources(&inputs.mean)?;
            merger.merge_into(&as_sources::<f32>(&sources), &layout, &mut mean_sink, band)?;
            let sources = open_sources(&inputs.count)?;
            merger.merge_into(&as_sources::<u16>(&sources), &layout, &mut count_sink, band)?;
        }

        mean_sink.finish()?;
        count_sink.finish()?;
        log::info!(
            "Composite {}: {} windows from {} tiles ({} empty)",
            index,
            bands,
            tiles,
            empty_windows.len()
        );

        Ok(CompositeSummary {
            mean_path,
            count_path,
            tiles,
            empty_windows,
        })
    }

    /// Windowed statistics of one tile, reprojected and written to scratch
    fn stage_tile(
        &self,
        engine: &ChunkedStatisticsEngine,
        path: &Path,
        tile_no: usize,
        scratch: &Path,
        staged: &mut [WindowInputs],
    ) -> VegResult<()> {
        let store = TimeSeriesStore::open(path)?;
        let grid = store.grid().clone();

        for (i, window) in self.windows.iter().enumerate() {
            let stats = engine.compute_window(&store, window)?;
            if stats.steps == 0 {
                log::debug!("{}: no steps in window {}", path.display(), window.label);
                continue;
            }

            let mean = self.reprojector.reproject(
                &store,
                GeoRaster::new(stats.mean, grid.transform, grid.crs_wkt.clone()),
            )?;
            let count = self.reprojector.reproject(
                &store,
                GeoRaster::new(stats.count_valid, grid.transform, grid.crs_wkt.clone()),
            )?;

            staged[i].mean.push(stage(scratch, &format!("w{}_t{}_mean.tif", i, tile_no), &mean, &self.options)?);
            staged[i].count.push(stage(scratch, &format!("w{}_t{}_count.tif", i, tile_no), &count, &self.options)?);
        }
        Ok(())
    }
}

fn stage<T: RasterValue>(
    scratch: &Path,
    name: &str,
    raster: &GeoRaster<T>,
    options: &GeoTiffOptions,
) -> VegResult<PathBuf> {
    write_raster_atomic(&scratch.join(name), raster, options, None)
}

fn open_sources(paths: &[PathBuf]) -> VegResult<Vec<GdalRasterSource>> {
    paths.iter().map(|p| GdalRasterSource::open(p)).collect()
}

fn as_sources<T: RasterValue>(sources: &[GdalRasterSource]) -> Vec<&dyn RasterSource<T>> {
    sources.iter().map(|s| s as &dyn RasterSource<T>).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_file_names() {
        assert_eq!(
            composite_file_name(VegetationIndex::NDVI, StatisticKind::Mean, "EPSG6350"),
            "HLS_TimeSeries_NDVI_Mean_EPSG6350.tif"
        );
        assert_eq!(
            composite_file_name(VegetationIndex::EVI2, StatisticKind::CountValid, "EPSG4326"),
            "HLS_TimeSeries_EVI2_CountValid_EPSG4326.tif"
        );
    }

    #[test]
    fn test_no_windows_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.dirs = crate::config::DirectoryLayout::under(dir.path());
        config.target_crs = "EPSG:32734".to_string();
        let builder = CompositeBuilder::new(&config).unwrap();
        assert!(matches!(
            builder.build(VegetationIndex::NDVI, &[]),
            Err(VegError::Config(_))
        ));
    }
}
