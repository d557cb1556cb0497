use crate::config::OutputOptions;
use crate::core::mosaic::{RasterLayout, RasterSink, RasterSource};
use crate::io::atomic::AtomicFile;
use crate::types::{GeoRaster, GeoTransform, RasterValue, VegError, VegResult};
use gdal::raster::{Buffer, GdalType, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Creation options for tiled, compressed GeoTIFFs
#[derive(Debug, Clone)]
pub struct GeoTiffOptions {
    pub compress: String,
    pub block_size: usize,
}

impl GeoTiffOptions {
    pub fn from_output(output: &OutputOptions) -> Self {
        Self {
            compress: output.geotiff_compress.clone(),
            block_size: output.geotiff_block_size,
        }
    }
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self::from_output(&OutputOptions::default())
    }
}

/// Size and placement of a raster without its pixels
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub transform: GeoTransform,
    pub crs_wkt: String,
    pub nodata: Option<f64>,
}

fn dataset_crs_wkt(dataset: &Dataset) -> String {
    dataset
        .spatial_ref()
        .and_then(|srs| srs.to_wkt())
        .unwrap_or_default()
}

/// Read size, transform and CRS of a raster file
pub fn read_header<P: AsRef<Path>>(path: P) -> VegResult<RasterHeader> {
    header_of(&Dataset::open(path.as_ref())?)
}

fn header_of(dataset: &Dataset) -> VegResult<RasterHeader> {
    let (width, height) = dataset.raster_size();
    let nodata = dataset.rasterband(1)?.no_data_value();
    Ok(RasterHeader {
        width,
        height,
        bands: dataset.raster_count() as usize,
        transform: GeoTransform::from_gdal(dataset.geo_transform()?),
        crs_wkt: dataset_crs_wkt(dataset),
        nodata,
    })
}

/// Read band 1 of a raster file
pub fn read_raster<T, P>(path: P) -> VegResult<GeoRaster<T>>
where
    T: GdalType + Copy,
    P: AsRef<Path>,
{
    log::debug!("Reading raster: {}", path.as_ref().display());
    let dataset = Dataset::open(path.as_ref())?;
    let (width, height) = dataset.raster_size();
    let band = dataset.rasterband(1)?;
    let buffer = band.read_as::<T>((0, 0), (width, height), (width, height), None)?;

    let data = Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| VegError::InvalidFormat(format!("Failed to reshape raster: {}", e)))?;

    Ok(GeoRaster::new(
        data,
        GeoTransform::from_gdal(dataset.geo_transform()?),
        dataset_crs_wkt(&dataset),
    ))
}

/// Create an N-band tiled GeoTIFF at `path` with the type's nodata sentinel.
///
/// Every band starts out filled with nodata.
pub fn create_geotiff<T: RasterValue>(
    path: &Path,
    width: usize,
    height: usize,
    bands: usize,
    transform: &GeoTransform,
    crs_wkt: &str,
    options: &GeoTiffOptions,
) -> VegResult<Dataset> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let block = options.block_size.to_string();
    let creation = [
        RasterCreationOption { key: "TILED", value: "YES" },
        RasterCreationOption { key: "BLOCKXSIZE", value: &block },
        RasterCreationOption { key: "BLOCKYSIZE", value: &block },
        RasterCreationOption { key: "COMPRESS", value: &options.compress },
        RasterCreationOption { key: "PREDICTOR", value: T::predictor() },
        RasterCreationOption { key: "BIGTIFF", value: "IF_SAFER" },
    ];

    let mut dataset = driver.create_with_band_type_with_options::<T, _>(
        path,
        width as isize,
        height as isize,
        bands as isize,
        &creation,
    )?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    if !crs_wkt.is_empty() {
        dataset.set_spatial_ref(&SpatialRef::from_wkt(crs_wkt)?)?;
    }

    for index in 1..=bands {
        let mut band = dataset.rasterband(index as isize)?;
        band.set_no_data_value(Some(T::nodata_tag()))?;
        band.fill(T::nodata_tag(), None)?;
    }

    Ok(dataset)
}

/// Write `data` into a band of an open dataset at pixel offset (col, row)
pub fn write_window<T: RasterValue>(
    dataset: &Dataset,
    band_index: usize,
    col: usize,
    row: usize,
    data: &Array2<T>,
) -> VegResult<()> {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    let mut band = dataset.rasterband(band_index as isize)?;
    let flat: Vec<T> = data.iter().copied().collect();
    let buffer = Buffer::new((cols, rows), flat);
    band.write((col as isize, row as isize), (cols, rows), &buffer)?;
    Ok(())
}

/// Label a band through its description and a `label` metadata item
pub fn set_band_label(dataset: &Dataset, band_index: usize, label: &str) -> VegResult<()> {
    let mut band = dataset.rasterband(band_index as isize)?;
    band.set_description(label)?;
    band.set_metadata_item("label", label, "")?;
    Ok(())
}

/// Write a single-band raster so the target only ever appears complete
pub fn write_raster_atomic<T: RasterValue>(
    path: &Path,
    raster: &GeoRaster<T>,
    options: &GeoTiffOptions,
    description: Option<&str>,
) -> VegResult<PathBuf> {
    log::info!("Writing GeoTIFF: {}", path.display());
    let file = AtomicFile::new(path)?;
    {
        let (height, width) = raster.shape();
        let dataset = create_geotiff::<T>(
            file.path(),
            width,
            height,
            1,
            &raster.transform,
            &raster.crs_wkt,
            options,
        )?;
        write_window(&dataset, 1, 0, 0, &raster.data)?;
        if let Some(label) = description {
            set_band_label(&dataset, 1, label)?;
        }
    }
    file.commit()
}

/// A GeoTIFF band read row window by row window; the file stays open
pub struct GdalRasterSource {
    path: PathBuf,
    dataset: Dataset,
    layout: RasterLayout,
}

impl fmt::Debug for GdalRasterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GdalRasterSource")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .finish()
    }
}

impl GdalRasterSource {
    pub fn open(path: &Path) -> VegResult<Self> {
        let dataset = Dataset::open(path)?;
        let header = header_of(&dataset)?;
        Ok(Self {
            path: path.to_path_buf(),
            dataset,
            layout: RasterLayout {
                transform: header.transform,
                width: header.width,
                height: header.height,
                crs_wkt: header.crs_wkt,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: RasterValue> RasterSource<T> for GdalRasterSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn layout(&self) -> &RasterLayout {
        &self.layout
    }

    fn read_rows(&self, rows: Range<usize>) -> VegResult<Array2<T>> {
        let band = self.dataset.rasterband(1)?;
        let width = self.layout.width;
        let buffer = band.read_as::<T>(
            (0, rows.start as isize),
            (width, rows.len()),
            (width, rows.len()),
            None,
        )?;
        Array2::from_shape_vec((rows.len(), width), buffer.data)
            .map_err(|e| VegError::InvalidFormat(format!("Failed to reshape rows: {}", e)))
    }
}

/// Multi-band GeoTIFF that appears at its target path only on [`finish`]
///
/// [`finish`]: GeoTiffSink::finish
pub struct GeoTiffSink {
    dataset: Option<Dataset>,
    file: AtomicFile,
}

impl GeoTiffSink {
    pub fn create<T: RasterValue>(
        path: &Path,
        layout: &RasterLayout,
        bands: usize,
        options: &GeoTiffOptions,
    ) -> VegResult<Self> {
        let file = AtomicFile::new(path)?;
        let dataset = create_geotiff::<T>(
            file.path(),
            layout.width,
            layout.height,
            bands,
            &layout.transform,
            &layout.crs_wkt,
            options,
        )?;
        Ok(Self {
            dataset: Some(dataset),
            file,
        })
    }

    fn dataset(&self) -> VegResult<&Dataset> {
        self.dataset
            .as_ref()
            .ok_or_else(|| VegError::Processing("GeoTIFF sink already closed".to_string()))
    }

    pub fn set_label(&self, band: usize, label: &str) -> VegResult<()> {
        set_band_label(self.dataset()?, band, label)
    }

    /// Close the dataset and move the file into place
    pub fn finish(mut self) -> VegResult<PathBuf> {
        drop(self.dataset.take());
        let path = self.file.commit()?;
        log::info!("Wrote {}", path.display());
        Ok(path)
    }
}

impl<T: RasterValue> RasterSink<T> for GeoTiffSink {
    fn write_window(&mut self, band: usize, row: usize, col: usize, data: &Array2<T>) -> VegResult<()> {
        write_window(self.dataset()?, band, col, row, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    const UTM34S: &str = "EPSG:32734";

    fn wkt() -> String {
        SpatialRef::from_definition(UTM34S).unwrap().to_wkt().unwrap()
    }

    #[test]
    fn test_float_roundtrip_keeps_nan_and_placement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mean.tif");
        let raster = GeoRaster::new(
            array![[0.25f32, f32::NAN], [0.5, -0.75]],
            GeoTransform::north_up(300000.0, 6200000.0, 30.0),
            wkt(),
        );

        write_raster_atomic(&path, &raster, &GeoTiffOptions::default(), Some("mean")).unwrap();
        let back = read_raster::<f32, _>(&path).unwrap();

        assert_eq!(back.shape(), (2, 2));
        assert_eq!(back.data[[0, 0]], 0.25);
        assert!(back.data[[0, 1]].is_nan());
        assert!(back.transform.approx_eq(&raster.transform));

        let header = read_header(&path).unwrap();
        assert!(header.nodata.map_or(false, f64::is_nan));
        assert_eq!(header.bands, 1);
    }

    #[test]
    fn test_count_raster_nodata_is_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("count.tif");
        let raster = GeoRaster::new(
            array![[0u16, 3], [7, 0]],
            GeoTransform::north_up(0.0, 0.0, 30.0),
            wkt(),
        );
        write_raster_atomic(&path, &raster, &GeoTiffOptions::default(), None).unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.nodata, Some(0.0));
        assert_eq!(read_raster::<u16, _>(&path).unwrap().data, raster.data);
    }

    #[test]
    fn test_sink_and_source_stream_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.tif");
        let layout = RasterLayout {
            transform: GeoTransform::north_up(0.0, 90.0, 30.0),
            width: 3,
            height: 3,
            crs_wkt: wkt(),
        };

        let mut sink = GeoTiffSink::create::<f32>(&path, &layout, 2, &GeoTiffOptions::default()).unwrap();
        RasterSink::<f32>::write_window(&mut sink, 2, 1, 0, &array![[1.0f32, 2.0, 3.0]]).unwrap();
        sink.set_label(2, "dry_2022").unwrap();
        assert!(!path.exists());
        sink.finish().unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.bands, 2);

        let dataset = Dataset::open(&path).unwrap();
        let band = dataset.rasterband(2).unwrap();
        assert_eq!(band.description().unwrap(), "dry_2022");
        assert_eq!(band.metadata_item("label", "").as_deref(), Some("dry_2022"));

        let source = GdalRasterSource::open(&path).unwrap();
        let first = RasterSource::<f32>::read_rows(&source, 0..1).unwrap();
        assert!(first.iter().all(|v| v.is_nan()));

        // Later windows come from the dataset opened once
        std::fs::remove_file(&path).unwrap();
        let rest = RasterSource::<f32>::read_rows(&source, 1..3).unwrap();
        assert_eq!(rest.dim(), (2, 3));
    }
}
