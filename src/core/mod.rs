//! Core vegetation-index processing modules

pub mod composite;
pub mod mosaic;
pub mod outlier_points;
pub mod quality_mask;
pub mod reproject;
pub mod temporal_stats;
pub mod tile_loop;
pub mod time_series;
pub mod vegetation_index;
pub mod worker_pool;

// Re-export main types
pub use composite::{composite_file_name, CompositeBuilder, CompositeSummary};
pub use mosaic::{mosaic_geotiffs, MemorySink, MemorySource, MergeSummary, RasterLayout, RasterSink, RasterSource, StreamingMosaicMerger};
pub use outlier_points::{OutlierPoint, OutlierPointExtractor, OutlierPointSink};
pub use quality_mask::{AerosolMode, QualityMaskConfig, QualityMaskDecoder, FMASK_NODATA};
pub use reproject::{detect_crs, CrsProbe, GdalWarp, Reprojector, SpatialReferenceBearing, TargetGrid, Warp};
pub use temporal_stats::{ChunkedStatisticsEngine, PixelStats, StatisticsParams, TileStatistics};
pub use tile_loop::{TileLoop, TileLoopReport, TileStage, TileStages, TileState};
pub use time_series::{AssemblyOutcome, InMemorySeries, SeriesInput, TimeSeriesAssembler, TimeSeriesReader};
pub use vegetation_index::{index_value, IndexCalculator, ReflectanceBands};
pub use worker_pool::{RunSummary, SkipReason, UnitOutcome, UnitReport, WorkUnit, WorkerPool};
