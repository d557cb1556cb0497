//! Stage orchestration
//!
//! `index -> series` run per tile inside the [`TileLoop`]; statistics,
//! mosaics, composites and outlier points then run over the tiles that
//! finished. Every unit of work goes through the [`WorkerPool`], which skips
//! artifacts already on disk, so an interrupted run resumes where it stopped.

use crate::config::PipelineConfig;
use crate::core::composite::CompositeBuilder;
use crate::core::mosaic::mosaic_geotiffs;
use crate::core::outlier_points::{OutlierPointExtractor, OutlierPointSink};
use crate::core::quality_mask::QualityMaskDecoder;
use crate::core::reproject::{detect_crs, Reprojector};
use crate::core::temporal_stats::{ChunkedStatisticsEngine, StatisticsParams};
use crate::core::tile_loop::{TileLoop, TileLoopReport, TileStage, TileStages};
use crate::core::time_series::{AssemblyOutcome, TimeSeriesAssembler};
use crate::core::vegetation_index::{IndexCalculator, ReflectanceBands};
use crate::core::worker_pool::{RunSummary, SkipReason, UnitOutcome, UnitReport, WorkUnit, WorkerPool};
use crate::io::geotiff::{write_raster_atomic, GeoTiffOptions};
use crate::io::granule::{index_raster_path, LocalGranuleSource, ObservationQuery, ObservationSource};
use crate::io::netcdf_store::{series_file_name, TimeSeriesStore};
use crate::types::{
    Band, GeoRaster, Observation, RasterValue, StatisticKind, TileId, VegError, VegResult,
    VegetationIndex,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Time steps read at once when extracting outlier points
const OUTLIER_TIME_CHUNK: usize = 16;

/// `T{tile}_{VI}_{kind}_{VI}_{CRS}.tif`
pub fn statistic_file_name(
    tile: &TileId,
    index: VegetationIndex,
    kind: StatisticKind,
    crs_tag: &str,
) -> String {
    format!(
        "{}_{}_{}_{}_{}.tif",
        tile.prefixed(),
        index.name(),
        kind.file_token(),
        index.name(),
        crs_tag
    )
}

/// `HLS_Mosaic_{token}{VI}_{CRS}.tif`
pub fn mosaic_file_name(index: VegetationIndex, kind: StatisticKind, crs_tag: &str) -> String {
    format!("HLS_Mosaic_{}{}_{}.tif", kind.mosaic_token(), index.name(), crs_tag)
}

/// Where a reprojected tile statistic lives; outliers have their own directory
pub fn statistic_path(
    config: &PipelineConfig,
    tile: &TileId,
    index: VegetationIndex,
    kind: StatisticKind,
) -> PathBuf {
    let dir = match kind {
        StatisticKind::Mean | StatisticKind::CountValid => &config.dirs.reprojected_dir,
        StatisticKind::OutlierMean | StatisticKind::OutlierCount => &config.dirs.outlier_dir,
    };
    dir.join(statistic_file_name(tile, index, kind, &config.crs_tag()))
}

pub fn series_path(config: &PipelineConfig, tile: &TileId, index: VegetationIndex) -> PathBuf {
    config.dirs.netcdf_dir.join(series_file_name(tile, index))
}

pub fn mosaic_path(config: &PipelineConfig, index: VegetationIndex, kind: StatisticKind) -> PathBuf {
    config
        .dirs
        .mosaic_dir
        .join(mosaic_file_name(index, kind, &config.crs_tag()))
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub tiles: TileLoopReport,
    /// Summaries in stage order
    pub stages: Vec<RunSummary>,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&RunSummary> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn failed(&self) -> usize {
        self.stages.iter().map(RunSummary::failed).sum::<usize>() + self.tiles.failed_tiles().len()
    }

    pub fn log_summary(&self) {
        log::info!("========== Pipeline summary ==========");
        for (tile, stage, message) in self.tiles.failed_tiles() {
            log::error!("Tile {} failed at {}: {}", tile, stage, message);
        }
        log::info!("{} tiles done", self.tiles.done_tiles().len());
        for summary in &self.stages {
            log::info!(
                "{:<12} {:>5} ok {:>5} skipped {:>5} failed",
                summary.stage,
                summary.succeeded(),
                summary.skipped(),
                summary.failed()
            );
        }
    }
}

/// Shared, read-only state handed to every unit of work
struct StageContext<'a> {
    config: &'a PipelineConfig,
    source: &'a (dyn ObservationSource + Send + Sync),
    decoder: QualityMaskDecoder,
    calculator: IndexCalculator,
    assembler: TimeSeriesAssembler,
    reprojector: Reprojector,
    options: GeoTiffOptions,
    pool: WorkerPool,
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn ObservationSource + Send + Sync>,
}

impl Pipeline {
    /// Pipeline over granules already present in `config.dirs.raw_dir`
    pub fn new(config: PipelineConfig) -> Self {
        let source = LocalGranuleSource::new(config.dirs.raw_dir.clone());
        Self::with_source(config, Box::new(source))
    }

    pub fn with_source(config: PipelineConfig, source: Box<dyn ObservationSource + Send + Sync>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage; outlier points go to `outliers` when given.
    ///
    /// Only setup problems (unusable target CRS, unwritable directories,
    /// unlistable inputs) return an error. Unit and tile failures are
    /// reported in the [`PipelineReport`].
    pub fn run(&self, outliers: Option<&mut dyn OutlierPointSink>) -> VegResult<PipelineReport> {
        let config = &self.config;
        config.dirs.create_all()?;
        let ctx = StageContext {
            config,
            source: self.source.as_ref(),
            decoder: QualityMaskDecoder::new(&config.mask),
            calculator: IndexCalculator::new(&config.indices),
            assembler: TimeSeriesAssembler::new(config),
            reprojector: Reprojector::new(config)?,
            options: GeoTiffOptions::from_output(&config.output),
            pool: WorkerPool::new(config.workers),
        };
        log::info!(
            "Pipeline: indices {:?}, target {} at {} m, {} workers",
            config.indices,
            config.target_crs,
            config.resolution_m,
            ctx.pool.workers()
        );

        let query = ObservationQuery {
            tiles: config.tiles.clone(),
            start: config.start_date,
            end: config.end_date,
            bands: vec![Band::Red, Band::Nir],
        };
        let mut by_tile: BTreeMap<TileId, Vec<Observation>> = config
            .tiles
            .iter()
            .map(|tile| (tile.clone(), Vec::new()))
            .collect();
        for observation in self.source.list(&query)? {
            by_tile
                .entry(observation.tile.clone())
                .or_default()
                .push(observation);
        }
        let tiles: Vec<TileId> = by_tile.keys().cloned().collect();

        let stages = PipelineTileStages {
            ctx: &ctx,
            observations: &by_tile,
        };
        let tile_report = TileLoop::new().run(&stages, &tiles);
        let done = tile_report.done_tiles();

        let mut report = PipelineReport {
            stages: TileStage::ORDER
                .iter()
                .filter_map(|stage| tile_report.summaries.get(stage).cloned())
                .collect(),
            tiles: tile_report,
        };

        report.stages.push(run_statistics(&ctx, &done));
        report.stages.push(run_mosaics(&ctx, &done));
        if config.windows.is_empty() {
            log::info!("No time windows configured; skipping composites");
        } else {
            report.stages.push(run_composites(&ctx, &done)?);
        }
        if let Some(sink) = outliers {
            report.stages.push(run_outlier_points(&ctx, &done, sink));
        }

        report.log_summary();
        Ok(report)
    }
}

struct PipelineTileStages<'a> {
    ctx: &'a StageContext<'a>,
    observations: &'a BTreeMap<TileId, Vec<Observation>>,
}

impl PipelineTileStages<'_> {
    fn observations(&self, tile: &TileId) -> &[Observation] {
        self.observations.get(tile).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl TileStages for PipelineTileStages<'_> {
    fn run_stage(&self, stage: TileStage, tile: &TileId) -> VegResult<Option<RunSummary>> {
        match stage {
            TileStage::Download => {
                let found = self.observations(tile).len();
                if found == 0 {
                    return Err(VegError::NoObservations(format!("no granules for tile {}", tile)));
                }
                log::info!("Tile {}: {} granules available", tile, found);
                Ok(None)
            }
            TileStage::Index => {
                let mut unavailable = Vec::new();
                let mut units = Vec::new();
                for observation in self.observations(tile) {
                    let unit = IndexUnit {
                        ctx: self.ctx,
                        observation,
                    };
                    unavailable.extend(unit.unavailable().into_iter().map(|vi| UnitReport {
                        unit: format!("{}.{}", observation.granule_id, vi),
                        outcome: UnitOutcome::Skipped(SkipReason::InputUnavailable(format!(
                            "{} needs band {:?}",
                            vi,
                            Band::Blue
                        ))),
                    }));
                    if !unit.producible().is_empty() {
                        units.push(unit);
                    }
                }
                let total = units.len();
                let mut summary = self.ctx.pool.run("index", units);
                if !unavailable.is_empty() {
                    log::warn!(
                        "Tile {}: {} index rasters cannot be produced without a blue band",
                        tile,
                        unavailable.len()
                    );
                    summary.reports.extend(unavailable);
                }
                if total > 0 && summary.failed() == total {
                    return Err(VegError::Processing(format!(
                        "all {} granules of tile {} failed",
                        total, tile
                    )));
                }
                Ok(Some(summary))
            }
            TileStage::BuildSeries => {
                let units = self
                    .ctx
                    .config
                    .indices
                    .iter()
                    .map(|&index| SeriesUnit {
                        ctx: self.ctx,
                        tile: tile.clone(),
                        index,
                    })
                    .collect::<Vec<_>>();
                let summary = self.ctx.pool.run("series", units);
                if let Some(failure) = summary.failures().next() {
                    return Err(VegError::Processing(format!(
                        "{}: {}",
                        failure.unit, failure.outcome
                    )));
                }
                let built = summary.reports.iter().any(|report| {
                    matches!(
                        report.outcome,
                        UnitOutcome::Success(_) | UnitOutcome::Skipped(SkipReason::AlreadyExists)
                    )
                });
                if !built {
                    return Err(VegError::NoObservations(format!(
                        "no time series could be built for tile {}",
                        tile
                    )));
                }
                Ok(Some(summary))
            }
        }
    }
}

/// Mask, index and write the rasters of one granule
struct IndexUnit<'a> {
    ctx: &'a StageContext<'a>,
    observation: &'a Observation,
}

impl IndexUnit<'_> {
    fn offers_blue(&self) -> bool {
        self.observation.band_paths.contains_key(&Band::Blue)
    }

    /// Requested indices this granule's bands can support
    fn producible(&self) -> Vec<VegetationIndex> {
        let blue = self.offers_blue();
        self.ctx
            .calculator
            .indices()
            .iter()
            .copied()
            .filter(|vi| blue || !vi.needs_blue())
            .collect()
    }

    /// Requested indices that need a band the granule does not have
    fn unavailable(&self) -> Vec<VegetationIndex> {
        if self.offers_blue() {
            return Vec::new();
        }
        self.ctx
            .calculator
            .indices()
            .iter()
            .copied()
            .filter(VegetationIndex::needs_blue)
            .collect()
    }
}

impl WorkUnit for IndexUnit<'_> {
    fn id(&self) -> String {
        self.observation.granule_id.clone()
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        self.producible()
            .into_iter()
            .map(|vi| index_raster_path(&self.ctx.config.dirs.vi_dir, &self.observation.granule_id, vi))
            .collect()
    }

    fn run(&self) -> VegResult<String> {
        let ctx = self.ctx;
        let observation = self.observation;
        let pending: Vec<VegetationIndex> = self
            .producible()
            .into_iter()
            .filter(|&vi| !index_raster_path(&ctx.config.dirs.vi_dir, &observation.granule_id, vi).exists())
            .collect();

        let quality = ctx.source.fetch_quality(observation)?;
        let red = ctx.source.fetch_band(observation, Band::Red)?;
        let nir = ctx.source.fetch_band(observation, Band::Nir)?;
        let blue = if pending.iter().any(VegetationIndex::needs_blue) {
            match ctx.source.fetch_band(observation, Band::Blue) {
                Ok(blue) => Some(blue.data),
                Err(e) if e.is_input_fault() => {
                    log::warn!("{}: {}; skipping blue-band indices", observation.granule_id, e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        if quality.shape() != red.shape() {
            return Err(VegError::ShapeMismatch(format!(
                "{}: Fmask {:?} vs bands {:?}",
                observation.granule_id,
                quality.shape(),
                red.shape()
            )));
        }

        let (computable, dropped): (Vec<VegetationIndex>, Vec<VegetationIndex>) = pending
            .into_iter()
            .partition(|vi| blue.is_some() || !vi.needs_blue());
        if computable.is_empty() && !dropped.is_empty() {
            return Err(VegError::MissingBand {
                granule: observation.granule_id.clone(),
                band: Band::Blue,
            });
        }
        let usable = ctx.decoder.decode(&quality.data);
        let bands = ReflectanceBands::from_scaled(red.data, nir.data, blue, ctx.config.scale_factor);
        let grids = IndexCalculator::new(&computable).compute(&bands, &usable)?;

        for (vi, grid) in grids {
            let path = index_raster_path(&ctx.config.dirs.vi_dir, &observation.granule_id, vi);
            let raster = GeoRaster::new(grid, red.transform, red.crs_wkt.clone());
            write_raster_atomic(&path, &raster, &ctx.options, Some(vi.name()))?;
        }
        if dropped.is_empty() {
            Ok(format!("{} indices written", computable.len()))
        } else {
            Ok(format!(
                "{} indices written, {:?} skipped: unreadable blue band",
                computable.len(),
                dropped
            ))
        }
    }
}

/// Stack the index rasters of one (tile, index) pair
struct SeriesUnit<'a> {
    ctx: &'a StageContext<'a>,
    tile: TileId,
    index: VegetationIndex,
}

impl WorkUnit for SeriesUnit<'_> {
    fn id(&self) -> String {
        series_file_name(&self.tile, self.index)
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        vec![series_path(self.ctx.config, &self.tile, self.index)]
    }

    fn run(&self) -> VegResult<String> {
        let config = self.ctx.config;
        let inputs: Vec<_> = TimeSeriesAssembler::collect_inputs(&config.dirs.vi_dir, &self.tile, self.index)?
            .into_iter()
            .filter(|input| config.date_selected(input.step.date))
            .collect();
        if inputs.is_empty() {
            return Err(VegError::NoObservations(format!(
                "no {} rasters for tile {}",
                self.index, self.tile
            )));
        }
        let output = series_path(config, &self.tile, self.index);
        match self.ctx.assembler.assemble(&self.tile, self.index, inputs, &output)? {
            AssemblyOutcome::AlreadyExists => Ok("already exists".to_string()),
            AssemblyOutcome::Built { steps, skipped } => {
                Ok(format!("{} time steps ({} inputs skipped)", steps, skipped))
            }
        }
    }
}

/// Temporal statistics of one series, reprojected and written per kind
struct StatisticsUnit<'a> {
    ctx: &'a StageContext<'a>,
    tile: TileId,
    index: VegetationIndex,
}

impl StatisticsUnit<'_> {
    fn write<T: RasterValue>(
        &self,
        store: &TimeSeriesStore,
        kind: StatisticKind,
        grid: ndarray::Array2<T>,
    ) -> VegResult<()> {
        let path = statistic_path(self.ctx.config, &self.tile, self.index, kind);
        if path.exists() {
            return Ok(());
        }
        let native = GeoRaster::new(grid, store.grid().transform, store.grid().crs_wkt.clone());
        let reprojected = self.ctx.reprojector.reproject(store, native)?;
        write_raster_atomic(&path, &reprojected, &self.ctx.options, Some(kind.file_token()))?;
        Ok(())
    }
}

impl WorkUnit for StatisticsUnit<'_> {
    fn id(&self) -> String {
        format!("{}_{}", self.tile.prefixed(), self.index)
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        StatisticKind::ALL
            .iter()
            .map(|&kind| statistic_path(self.ctx.config, &self.tile, self.index, kind))
            .collect()
    }

    fn run(&self) -> VegResult<String> {
        let config = self.ctx.config;
        let path = series_path(config, &self.tile, self.index);
        if !path.exists() {
            return Err(VegError::NoObservations(format!("{} not found", path.display())));
        }
        let store = TimeSeriesStore::open(&path)?;
        let engine = ChunkedStatisticsEngine::with_params(StatisticsParams {
            valid_range: config.valid_range(self.index),
            chunk_size: config.chunk_size,
        });
        let stats = engine.compute(&store)?;

        for kind in StatisticKind::ALL {
            if let Some(grid) = stats.float_grid(kind) {
                self.write(&store, kind, grid.clone())?;
            } else if let Some(grid) = stats.count_grid(kind) {
                self.write(&store, kind, grid.clone())?;
            }
        }
        Ok(format!("{} time steps reduced", stats.steps))
    }
}

fn run_statistics(ctx: &StageContext<'_>, tiles: &[TileId]) -> RunSummary {
    let units = tiles
        .iter()
        .flat_map(|tile| {
            ctx.config.indices.iter().map(move |&index| StatisticsUnit {
                ctx,
                tile: tile.clone(),
                index,
            })
        })
        .collect();
    ctx.pool.run("statistics", units)
}

/// One study-area mosaic per (index, statistic)
struct MosaicUnit<'a> {
    ctx: &'a StageContext<'a>,
    tiles: &'a [TileId],
    index: VegetationIndex,
    kind: StatisticKind,
}

impl WorkUnit for MosaicUnit<'_> {
    fn id(&self) -> String {
        mosaic_file_name(self.index, self.kind, &self.ctx.config.crs_tag())
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        vec![mosaic_path(self.ctx.config, self.index, self.kind)]
    }

    fn run(&self) -> VegResult<String> {
        let mut inputs: Vec<PathBuf> = self
            .tiles
            .iter()
            .map(|tile| statistic_path(self.ctx.config, tile, self.index, self.kind))
            .filter(|path| path.exists())
            .collect();
        inputs.sort();
        if inputs.is_empty() {
            return Err(VegError::NoObservations(format!(
                "no {} {} rasters to mosaic",
                self.index,
                self.kind.file_token()
            )));
        }

        let output = mosaic_path(self.ctx.config, self.index, self.kind);
        let summary = if self.kind.is_count() {
            mosaic_geotiffs::<u16>(&inputs, &output, &self.ctx.options)?
        } else {
            mosaic_geotiffs::<f32>(&inputs, &output, &self.ctx.options)?
        };
        Ok(format!(
            "{} tiles, {} pixels written",
            summary.sources, summary.pixels_written
        ))
    }
}

fn run_mosaics(ctx: &StageContext<'_>, tiles: &[TileId]) -> RunSummary {
    let units = ctx
        .config
        .indices
        .iter()
        .flat_map(|&index| {
            StatisticKind::ALL.iter().map(move |&kind| MosaicUnit {
                ctx,
                tiles,
                index,
                kind,
            })
        })
        .collect();
    ctx.pool.run("mosaic", units)
}

/// Both composite stacks of one index
struct CompositeUnit<'a> {
    builder: &'a CompositeBuilder,
    series: Vec<PathBuf>,
    index: VegetationIndex,
}

impl WorkUnit for CompositeUnit<'_> {
    fn id(&self) -> String {
        format!("composite_{}", self.index)
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        let (mean, count) = self.builder.output_paths(self.index);
        vec![mean, count]
    }

    fn run(&self) -> VegResult<String> {
        let summary = self.builder.build(self.index, &self.series)?;
        Ok(format!(
            "{} windows from {} tiles, {} empty",
            self.builder.windows().len(),
            summary.tiles,
            summary.empty_windows.len()
        ))
    }
}

fn run_composites(ctx: &StageContext<'_>, tiles: &[TileId]) -> VegResult<RunSummary> {
    let builder = CompositeBuilder::new(ctx.config)?;
    let units = ctx
        .config
        .indices
        .iter()
        .map(|&index| CompositeUnit {
            builder: &builder,
            series: tiles
                .iter()
                .map(|tile| series_path(ctx.config, tile, index))
                .filter(|path| path.exists())
                .collect(),
            index,
        })
        .collect();
    Ok(ctx.pool.run("composites", units))
}

/// Outlier points go to a single sink, so series are visited one at a time
fn run_outlier_points(
    ctx: &StageContext<'_>,
    tiles: &[TileId],
    sink: &mut dyn OutlierPointSink,
) -> RunSummary {
    let mut summary = RunSummary::new("outliers");
    for tile in tiles {
        for &index in &ctx.config.indices {
            let path = series_path(ctx.config, tile, index);
            let outcome = match extract_outliers(ctx, tile, index, &path, sink) {
                Ok(points) => UnitOutcome::Success(format!("{} points", points)),
                Err(e) if e.is_input_fault() => UnitOutcome::Skipped(SkipReason::InputUnavailable(e.to_string())),
                Err(e) => UnitOutcome::Failed(e.to_string()),
            };
            summary.reports.push(UnitReport {
                unit: series_file_name(tile, index),
                outcome,
            });
        }
    }
    summary.log_summary();
    summary
}

fn extract_outliers(
    ctx: &StageContext<'_>,
    tile: &TileId,
    index: VegetationIndex,
    path: &Path,
    sink: &mut dyn OutlierPointSink,
) -> VegResult<usize> {
    if !path.exists() {
        return Err(VegError::NoObservations(format!("{} not found", path.display())));
    }
    let store = TimeSeriesStore::open(path)?;
    let extractor = OutlierPointExtractor::new(ctx.config.valid_range(index), OUTLIER_TIME_CHUNK);
    let extractor = match detect_crs(&store) {
        Ok(crs) => extractor.with_geographic(&crs)?,
        Err(e) => {
            log::warn!("{}; outlier points will carry native coordinates only", e);
            extractor
        }
    };
    extractor.extract(&store, &store.grid().transform, tile, index, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_names() {
        let tile = TileId::new("34HBH");
        assert_eq!(
            statistic_file_name(&tile, VegetationIndex::NDVI, StatisticKind::Mean, "EPSG6350"),
            "T34HBH_NDVI_average_NDVI_EPSG6350.tif"
        );
        assert_eq!(
            statistic_file_name(&tile, VegetationIndex::EVI2, StatisticKind::OutlierCount, "EPSG6350"),
            "T34HBH_EVI2_outlier_count_EVI2_EPSG6350.tif"
        );
        assert_eq!(
            mosaic_file_name(VegetationIndex::NDVI, StatisticKind::Mean, "EPSG6350"),
            "HLS_Mosaic_NDVI_EPSG6350.tif"
        );
        assert_eq!(
            mosaic_file_name(VegetationIndex::NIRv, StatisticKind::CountValid, "EPSG6350"),
            "HLS_Mosaic_CountValid_NIRv_EPSG6350.tif"
        );
    }

    #[test]
    fn test_outlier_statistics_use_their_own_directory() {
        let config = PipelineConfig::default();
        let tile = TileId::new("34HBH");
        assert!(statistic_path(&config, &tile, VegetationIndex::NDVI, StatisticKind::OutlierMean)
            .starts_with(&config.dirs.outlier_dir));
        assert!(statistic_path(&config, &tile, VegetationIndex::NDVI, StatisticKind::CountValid)
            .starts_with(&config.dirs.reprojected_dir));
    }
}
