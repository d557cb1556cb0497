//! Synthetic HLS granules for integration tests

#![allow(dead_code)]

use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::DriverManager;
use hlsvi::config::{DirectoryLayout, PipelineConfig};
use hlsvi::types::{Sensor, VegetationIndex};
use ndarray::Array2;
use std::path::{Path, PathBuf};

pub const EPSG: u32 = 32734;
pub const PIXEL: f64 = 30.0;
pub const TOP: f64 = 6_199_980.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn write_band<T: GdalType + Copy>(path: &Path, data: &Array2<T>, left: f64, top: f64) {
    let driver = DriverManager::get_driver_by_name("GTiff").expect("GTiff driver");
    let (rows, cols) = data.dim();
    let mut dataset = driver
        .create_with_band_type::<T, _>(path, cols as isize, rows as isize, 1)
        .expect("Failed to create band file");
    dataset
        .set_geo_transform(&[left, PIXEL, 0.0, top, 0.0, -PIXEL])
        .expect("Failed to set transform");
    dataset
        .set_spatial_ref(&SpatialRef::from_epsg(EPSG).expect("EPSG lookup"))
        .expect("Failed to set CRS");
    let mut band = dataset.rasterband(1).expect("band 1");
    let buffer = Buffer::new((cols, rows), data.iter().copied().collect());
    band.write((0, 0), (cols, rows), &buffer).expect("Failed to write band");
}

/// One granule with uniform reflectance, optionally overridden per pixel
pub struct Granule {
    pub sensor: Sensor,
    pub tile: &'static str,
    /// `YYYYDDD`
    pub date: &'static str,
    pub left: f64,
    pub red: Array2<i16>,
    pub nir: Array2<i16>,
    pub fmask: Array2<u8>,
}

impl Granule {
    pub fn uniform(sensor: Sensor, tile: &'static str, date: &'static str, left: f64, red: i16, nir: i16) -> Self {
        Self {
            sensor,
            tile,
            date,
            left,
            red: Array2::from_elem((4, 4), red),
            nir: Array2::from_elem((4, 4), nir),
            fmask: Array2::zeros((4, 4)),
        }
    }

    pub fn id(&self) -> String {
        format!("HLS.{}.T{}.{}T082000.v2.0", self.sensor, self.tile, self.date)
    }

    /// Path of one band file, e.g. `B04` or `Fmask`
    pub fn band_path(&self, raw_dir: &Path, token: &str) -> PathBuf {
        raw_dir
            .join(self.sensor.to_string())
            .join(self.id())
            .join(format!("{}.{}.tif", self.id(), token))
    }

    /// Write the Fmask, red and NIR files under `raw_dir/{sensor}/{id}/`
    pub fn write(&self, raw_dir: &Path) {
        let folder = raw_dir.join(self.sensor.to_string()).join(self.id());
        std::fs::create_dir_all(&folder).expect("Failed to create granule folder");
        let name = |token: &str| self.band_path(raw_dir, token);
        write_band(&name("Fmask"), &self.fmask, self.left, TOP);
        write_band(&name("B04"), &self.red, self.left, TOP);
        let nir = match self.sensor {
            Sensor::L30 => "B05",
            Sensor::S30 => "B8A",
        };
        write_band(&name(nir), &self.nir, self.left, TOP);
    }
}

pub fn test_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.dirs = DirectoryLayout::under(root);
    config.target_crs = format!("EPSG:{}", EPSG);
    config.resolution_m = PIXEL;
    config.indices = vec![VegetationIndex::NDVI];
    config.workers = 2;
    config.chunk_size = 3;
    config
}
