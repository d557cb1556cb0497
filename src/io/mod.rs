//! I/O modules for HLS granules, GeoTIFF rasters and NetCDF time series

pub mod atomic;
pub mod geotiff;
pub mod granule;
pub mod netcdf_store;

pub use atomic::AtomicFile;
pub use geotiff::{read_header, read_raster, write_raster_atomic, GeoTiffOptions, RasterHeader};
pub use granule::{
    tile_id_from_path, GranuleName, LocalGranuleSource, ObservationQuery, ObservationSource,
};
pub use netcdf_store::{series_file_name, SeriesGrid, TimeSeriesStore, TimeSeriesWriter, TimeStep};
