//! hlsvi: vegetation-index time series and mosaics from HLS surface reflectance
//!
//! Per-granule quality masking and index computation, per-tile NetCDF time
//! series, chunked temporal statistics, reprojection to a common CRS and
//! streaming mosaics of the tile results.

pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use config::{parse_windows, DirectoryLayout, OutputOptions, PipelineConfig};
pub use pipeline::{Pipeline, PipelineReport};
pub use types::{
    GeoRaster, GeoTransform, Observation, Sensor, StatisticKind, TileId, TimeWindow, ValidRange,
    VegError, VegResult, VegetationIndex,
};
