use crate::config::PipelineConfig;
use crate::types::{GeoRaster, GeoTransform, RasterValue, VegError, VegResult};
use gdal::raster::Buffer;
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use std::ptr;

/// Metres per degree of latitude, used to express metre resolutions in degrees
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Points sampled along each edge when projecting a footprint
const EDGE_SAMPLES: usize = 21;

/// Fraction of a pixel treated as round-off when snapping to the lattice
const SNAP_TOLERANCE: f64 = 1e-6;

/// Something that may carry a coordinate reference in several places
pub trait SpatialReferenceBearing {
    /// Name used in log and error messages
    fn source_name(&self) -> String;

    /// CRS attached to the data array itself
    fn grid_mapping_crs(&self) -> Option<String>;

    /// Dataset-level CRS attribute
    fn dataset_crs(&self) -> Option<String>;

    /// First `crs_wkt` / `spatial_ref` attribute on any variable
    fn variable_crs(&self) -> Option<String>;
}

impl<T> SpatialReferenceBearing for GeoRaster<T> {
    fn source_name(&self) -> String {
        format!("raster {:?}", self.shape())
    }

    fn grid_mapping_crs(&self) -> Option<String> {
        Some(self.crs_wkt.clone()).filter(|wkt| !wkt.trim().is_empty())
    }

    fn dataset_crs(&self) -> Option<String> {
        None
    }

    fn variable_crs(&self) -> Option<String> {
        None
    }
}

/// One place to look for a CRS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrsProbe {
    GridMapping,
    DatasetAttribute,
    VariableAttribute,
}

impl CrsProbe {
    pub const ORDER: [CrsProbe; 3] = [
        CrsProbe::GridMapping,
        CrsProbe::DatasetAttribute,
        CrsProbe::VariableAttribute,
    ];

    pub fn probe(&self, source: &dyn SpatialReferenceBearing) -> Option<String> {
        match self {
            CrsProbe::GridMapping => source.grid_mapping_crs(),
            CrsProbe::DatasetAttribute => source.dataset_crs(),
            CrsProbe::VariableAttribute => source.variable_crs(),
        }
    }
}

/// First CRS found by the probes in [`CrsProbe::ORDER`]
pub fn detect_crs(source: &dyn SpatialReferenceBearing) -> VegResult<String> {
    for probe in CrsProbe::ORDER {
        if let Some(crs) = probe.probe(source) {
            log::debug!("CRS of {} found via {:?}", source.source_name(), probe);
            return Ok(crs);
        }
    }
    Err(VegError::CrsUndetermined(source.source_name()))
}

pub(crate) fn spatial_ref(definition: &str) -> VegResult<SpatialRef> {
    let srs = if definition.trim_start().starts_with(|c: char| c.is_ascii_uppercase())
        && definition.contains('[')
    {
        SpatialRef::from_wkt(definition)?
    } else {
        SpatialRef::from_definition(definition)?
    };
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Target coordinate reference and pixel size in its own units
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGrid {
    pub crs_wkt: String,
    pub resolution: f64,
}

impl TargetGrid {
    /// Express a metre resolution in the linear unit of `target_crs`.
    ///
    /// Geographic targets get the approximate degree equivalent; a metre
    /// value handed to a degree grid collapses the output to a pixel or two.
    pub fn resolve(target_crs: &str, resolution_m: f64) -> VegResult<Self> {
        if !(resolution_m.is_finite() && resolution_m > 0.0) {
            return Err(VegError::Config(format!(
                "Target resolution must be positive, got {}",
                resolution_m
            )));
        }
        let srs = spatial_ref(target_crs)?;
        let resolution = if srs.is_geographic() {
            let degrees = resolution_m / METRES_PER_DEGREE;
            log::warn!(
                "{} is geographic; using {:.8} degrees for a {} m resolution",
                target_crs,
                degrees,
                resolution_m
            );
            degrees
        } else {
            let unit = srs.linear_units();
            if unit > 0.0 && (unit - 1.0).abs() > 1e-12 {
                log::info!("{} linear unit is {} m", target_crs, unit);
                resolution_m / unit
            } else {
                resolution_m
            }
        };
        Ok(Self {
            crs_wkt: srs.to_wkt()?,
            resolution,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> VegResult<Self> {
        Self::resolve(&config.target_crs, config.resolution_m)
    }
}

/// The "reproject(grid, src_crs, dst_crs, resolution) -> grid" capability
pub trait Warp {
    fn warp<T: RasterValue>(&self, source: &GeoRaster<T>, target: &TargetGrid) -> VegResult<GeoRaster<T>>;
}

/// Nearest-neighbour warping through GDAL onto a resolution-snapped grid
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalWarp;

impl GdalWarp {
    /// Target-CRS extent of a source footprint, snapped outward to the resolution
    fn output_grid(
        &self,
        source: &GeoRaster<impl Sized>,
        src_srs: &SpatialRef,
        dst_srs: &SpatialRef,
        resolution: f64,
    ) -> VegResult<(GeoTransform, usize, usize)> {
        let (rows, cols) = source.shape();
        let (min_x, min_y, max_x, max_y) = source.transform.bounds(cols, rows);

        let mut xs = Vec::with_capacity(EDGE_SAMPLES * 4);
        let mut ys = Vec::with_capacity(EDGE_SAMPLES * 4);
        for i in 0..EDGE_SAMPLES {
            let f = i as f64 / (EDGE_SAMPLES - 1) as f64;
            let x = min_x + f * (max_x - min_x);
            let y = min_y + f * (max_y - min_y);
            xs.extend_from_slice(&[x, x, min_x, max_x]);
            ys.extend_from_slice(&[min_y, max_y, y, y]);
        }
        let mut zs = vec![0.0; xs.len()];
        CoordTransform::new(src_srs, dst_srs)?.transform_coords(&mut xs, &mut ys, &mut zs)?;

        let fold = |values: &[f64]| {
            values
                .iter()
                .filter(|v| v.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
        };
        let (x0, x1) = fold(xs.as_slice());
        let (y0, y1) = fold(ys.as_slice());
        if !(x0.is_finite() && x1.is_finite() && y0.is_finite() && y1.is_finite()) {
            return Err(VegError::Processing(
                "Footprint does not project into the target CRS".to_string(),
            ));
        }

        let left = (x0 / resolution + SNAP_TOLERANCE).floor() * resolution;
        let right = (x1 / resolution - SNAP_TOLERANCE).ceil() * resolution;
        let bottom = (y0 / resolution + SNAP_TOLERANCE).floor() * resolution;
        let top = (y1 / resolution - SNAP_TOLERANCE).ceil() * resolution;
        let width = (((right - left) / resolution).round() as usize).max(1);
        let height = (((top - bottom) / resolution).round() as usize).max(1);

        Ok((GeoTransform::north_up(left, top, resolution), width, height))
    }
}

fn mem_dataset<T: RasterValue>(
    width: usize,
    height: usize,
    transform: &GeoTransform,
    srs: &SpatialRef,
) -> VegResult<Dataset> {
    let driver = DriverManager::get_driver_by_name("MEM")?;
    let mut dataset = driver.create_with_band_type::<T, _>("", width as isize, height as isize, 1)?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    dataset.set_spatial_ref(srs)?;
    {
        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(T::nodata_tag()))?;
        band.fill(T::nodata_tag(), None)?;
    }
    Ok(dataset)
}

impl Warp for GdalWarp {
    fn warp<T: RasterValue>(&self, source: &GeoRaster<T>, target: &TargetGrid) -> VegResult<GeoRaster<T>> {
        let src_srs = spatial_ref(&source.crs_wkt)?;
        let dst_srs = spatial_ref(&target.crs_wkt)?;
        let (transform, width, height) =
            self.output_grid(source, &src_srs, &dst_srs, target.resolution)?;
        log::debug!(
            "Warping {:?} onto {}x{} at {}",
            source.shape(),
            width,
            height,
            target.resolution
        );

        let (rows, cols) = source.shape();
        let src = mem_dataset::<T>(cols, rows, &source.transform, &src_srs)?;
        {
            let mut band = src.rasterband(1)?;
            let buffer = Buffer::new((cols, rows), source.data.iter().copied().collect());
            band.write((0, 0), (cols, rows), &buffer)?;
        }
        let dst = mem_dataset::<T>(width, height, &transform, &dst_srs)?;

        let status = unsafe {
            gdal_sys::GDALReprojectImage(
                src.c_dataset(),
                ptr::null(),
                dst.c_dataset(),
                ptr::null(),
                gdal_sys::GDALResampleAlg::GRA_NearestNeighbour,
                0.0,
                0.0,
                None,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if status != gdal_sys::CPLErr::CE_None {
            return Err(VegError::Processing(format!(
                "GDALReprojectImage failed with status {}",
                status
            )));
        }

        let band = dst.rasterband(1)?;
        let buffer = band.read_as::<T>((0, 0), (width, height), (width, height), None)?;
        let data = ndarray::Array2::from_shape_vec((height, width), buffer.data)
            .map_err(|e| VegError::Processing(format!("Failed to reshape warped grid: {}", e)))?;

        Ok(GeoRaster::new(data, transform, target.crs_wkt.clone()))
    }
}

/// Moves tile results onto the configured target grid
pub struct Reprojector<W: Warp = GdalWarp> {
    target: TargetGrid,
    warp: W,
}

impl Reprojector<GdalWarp> {
    pub fn new(config: &PipelineConfig) -> VegResult<Self> {
        Ok(Self {
            target: TargetGrid::from_config(config)?,
            warp: GdalWarp,
        })
    }
}

impl<W: Warp> Reprojector<W> {
    pub fn with_warp(target: TargetGrid, warp: W) -> Self {
        Self { target, warp }
    }

    pub fn target(&self) -> &TargetGrid {
        &self.target
    }

    /// Reproject a raster whose CRS is read from `source`
    pub fn reproject<T: RasterValue>(
        &self,
        source: &dyn SpatialReferenceBearing,
        mut raster: GeoRaster<T>,
    ) -> VegResult<GeoRaster<T>> {
        raster.crs_wkt = detect_crs(source)?;
        self.warp.warp(&raster, &self.target)
    }
}
