use crate::core::reproject::spatial_ref;
use crate::core::time_series::TimeSeriesReader;
use crate::types::{date_from_days, GeoTransform, Sensor, TileId, ValidRange, VegError, VegResult, VegetationIndex};
use chrono::NaiveDate;
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use serde::{Deserialize, Serialize};

/// One finite observation outside its index's valid range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierPoint {
    /// Pixel centre in the series' native CRS
    pub x: f64,
    pub y: f64,
    /// WGS84 position when the extractor was given a geographic transform
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub date: NaiveDate,
    pub value: f32,
    pub tile: TileId,
    pub sensor: Sensor,
    pub index: VegetationIndex,
}

/// Consumer of outlier points, e.g. a vector file writer
pub trait OutlierPointSink {
    fn accept(&mut self, point: OutlierPoint) -> VegResult<()>;
}

impl OutlierPointSink for Vec<OutlierPoint> {
    fn accept(&mut self, point: OutlierPoint) -> VegResult<()> {
        self.push(point);
        Ok(())
    }
}

/// Streams a series in time chunks and reports every outlier observation
pub struct OutlierPointExtractor {
    range: ValidRange,
    time_chunk: usize,
    to_wgs84: Option<CoordTransform>,
}

impl OutlierPointExtractor {
    pub fn new(range: ValidRange, time_chunk: usize) -> Self {
        Self {
            range,
            time_chunk: time_chunk.max(1),
            to_wgs84: None,
        }
    }

    /// Also report lon/lat, transforming from `source_crs`
    pub fn with_geographic(mut self, source_crs: &str) -> VegResult<Self> {
        let src = spatial_ref(source_crs)?;
        let wgs84 = SpatialRef::from_epsg(4326)?;
        wgs84.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        self.to_wgs84 = Some(CoordTransform::new(&src, &wgs84)?);
        Ok(self)
    }

    /// Emit every outlier of `series` into `sink`, in time then row-major order
    pub fn extract(
        &self,
        series: &dyn TimeSeriesReader,
        transform: &GeoTransform,
        tile: &TileId,
        index: VegetationIndex,
        sink: &mut dyn OutlierPointSink,
    ) -> VegResult<usize> {
        let (steps, rows, cols) = series.shape();
        let days = series.time_days();
        let sensors = series.sensors();
        if days.len() != steps || sensors.len() != steps {
            return Err(VegError::ShapeMismatch(format!(
                "{} time steps but {} days and {} sensors",
                steps,
                days.len(),
                sensors.len()
            )));
        }

        let mut emitted = 0usize;
        for t0 in (0..steps).step_by(self.time_chunk) {
            let t1 = (t0 + self.time_chunk).min(steps);
            let block = series.read(t0..t1, 0..rows, 0..cols)?;

            for ((dt, row, col), &value) in block.indexed_iter() {
                if !value.is_finite() || self.range.contains(value) {
                    continue;
                }
                let t = t0 + dt;
                let (x, y) = transform.pixel_center(col, row);
                let (lon, lat) = self.geographic(x, y)?;
                sink.accept(OutlierPoint {
                    x,
                    y,
                    lon,
                    lat,
                    date: date_from_days(days[t]),
                    value,
                    tile: tile.clone(),
                    sensor: sensors[t],
                    index,
                })?;
                emitted += 1;
            }
        }

        log::info!("T{} {}: {} outlier points", tile, index, emitted);
        Ok(emitted)
    }

    fn geographic(&self, x: f64, y: f64) -> VegResult<(Option<f64>, Option<f64>)> {
        match &self.to_wgs84 {
            Some(transform) => {
                let mut xs = [x];
                let mut ys = [y];
                let mut zs = [0.0];
                transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
                Ok((Some(xs[0]), Some(ys[0])))
            }
            None => Ok((None, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time_series::InMemorySeries;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn series() -> InMemorySeries {
        let mut values = Array3::from_elem((3, 2, 2), 0.3f32);
        values[[0, 0, 1]] = 1.5;
        values[[1, 1, 0]] = f32::NAN;
        values[[2, 1, 1]] = -4.0;
        values[[2, 0, 0]] = f32::INFINITY;
        InMemorySeries::new(values, vec![19358, 19360, 19370], vec![Sensor::L30, Sensor::S30, Sensor::S30]).unwrap()
    }

    #[test]
    fn test_only_finite_out_of_range_values_are_emitted() {
        let transform = GeoTransform::north_up(500000.0, 6200000.0, 30.0);
        let mut points: Vec<OutlierPoint> = Vec::new();

        let emitted = OutlierPointExtractor::new(ValidRange::new(-1.0, 1.0), 2)
            .extract(&series(), &transform, &TileId::new("34HBH"), VegetationIndex::NDVI, &mut points)
            .unwrap();

        assert_eq!(emitted, 2);
        assert_eq!(points[0].value, 1.5);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert_eq!(points[0].sensor, Sensor::L30);
        assert_eq!((points[0].x, points[0].y), (500045.0, 6199985.0));
        assert_eq!(points[1].value, -4.0);
        assert_eq!(points[1].sensor, Sensor::S30);
        assert!(points[1].lon.is_none());
    }

    #[test]
    fn test_time_chunking_does_not_change_output() {
        let transform = GeoTransform::north_up(0.0, 0.0, 30.0);
        let run = |chunk| {
            let mut points: Vec<OutlierPoint> = Vec::new();
            OutlierPointExtractor::new(ValidRange::new(-1.0, 1.0), chunk)
                .extract(&series(), &transform, &TileId::new("34HBH"), VegetationIndex::NDVI, &mut points)
                .unwrap();
            points
        };
        assert_eq!(run(1), run(100));
    }

    #[test]
    fn test_geographic_coordinates() {
        let transform = GeoTransform::north_up(500000.0, 0.0, 30.0);
        let mut points: Vec<OutlierPoint> = Vec::new();
        OutlierPointExtractor::new(ValidRange::new(-1.0, 1.0), 8)
            .with_geographic("EPSG:32634")
            .unwrap()
            .extract(&series(), &transform, &TileId::new("34HBH"), VegetationIndex::NDVI, &mut points)
            .unwrap();

        // UTM 34N central meridian is 21 E; the first outlier sits 45 m east of it on the equator
        assert_abs_diff_eq!(points[0].lon.unwrap(), 21.0, epsilon = 0.001);
        assert_abs_diff_eq!(points[0].lat.unwrap(), 0.0, epsilon = 0.001);
    }
}
