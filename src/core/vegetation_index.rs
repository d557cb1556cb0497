use crate::types::{IndexGrid, UsableMask, VegError, VegResult, VegetationIndex};
use ndarray::{Array2, Zip};

/// EVI coefficients (MODIS ATBD)
const EVI_GAIN: f32 = 2.5;
const EVI_C1: f32 = 6.0;
const EVI_C2: f32 = 7.5;
const EVI_L: f32 = 1.0;

/// Band grids of one observation, already scaled to reflectance
#[derive(Debug, Clone)]
pub struct ReflectanceBands {
    pub red: Array2<f32>,
    pub nir: Array2<f32>,
    pub blue: Option<Array2<f32>>,
}

impl ReflectanceBands {
    /// Scale stored integers (as f32) to reflectance in place
    pub fn from_scaled(
        mut red: Array2<f32>,
        mut nir: Array2<f32>,
        mut blue: Option<Array2<f32>>,
        scale_factor: f32,
    ) -> Self {
        red.mapv_inplace(|v| v * scale_factor);
        nir.mapv_inplace(|v| v * scale_factor);
        if let Some(blue) = blue.as_mut() {
            blue.mapv_inplace(|v| v * scale_factor);
        }
        Self { red, nir, blue }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.red.dim()
    }
}

/// Evaluate one index formula for a single pixel.
///
/// Zero denominators yield inf/NaN; those are filtered by range logic
/// downstream and are never errors.
#[inline]
pub fn index_value(index: VegetationIndex, red: f32, nir: f32, blue: f32) -> f32 {
    match index {
        VegetationIndex::NDVI => (nir - red) / (nir + red),
        VegetationIndex::EVI2 => 2.5 * (nir - red) / (nir + 2.4 * red + 1.0),
        VegetationIndex::NIRv => (nir - red) / (nir + red) * nir,
        VegetationIndex::EVI => {
            EVI_GAIN * (nir - red) / (nir + EVI_C1 * red - EVI_C2 * blue + EVI_L)
        }
    }
}

/// Computes the requested index grids from masked reflectance
pub struct IndexCalculator {
    indices: Vec<VegetationIndex>,
}

impl IndexCalculator {
    pub fn new(indices: &[VegetationIndex]) -> Self {
        Self {
            indices: indices.to_vec(),
        }
    }

    pub fn indices(&self) -> &[VegetationIndex] {
        &self.indices
    }

    /// True when any requested index reads the blue band
    pub fn needs_blue(&self) -> bool {
        self.indices.iter().any(|vi| vi.needs_blue())
    }

    /// One grid per requested index; masked pixels are NaN
    pub fn compute(
        &self,
        bands: &ReflectanceBands,
        usable: &UsableMask,
    ) -> VegResult<Vec<(VegetationIndex, IndexGrid)>> {
        let dim = bands.dim();
        if bands.nir.dim() != dim || usable.dim() != dim {
            return Err(VegError::ShapeMismatch(format!(
                "red {:?}, nir {:?}, mask {:?}",
                dim,
                bands.nir.dim(),
                usable.dim()
            )));
        }
        if let Some(blue) = &bands.blue {
            if blue.dim() != dim {
                return Err(VegError::ShapeMismatch(format!(
                    "red {:?}, blue {:?}",
                    dim,
                    blue.dim()
                )));
            }
        }

        self.indices
            .iter()
            .map(|&index| Ok((index, self.compute_one(index, bands, usable)?)))
            .collect()
    }

    fn compute_one(
        &self,
        index: VegetationIndex,
        bands: &ReflectanceBands,
        usable: &UsableMask,
    ) -> VegResult<IndexGrid> {
        log::debug!("Computing {} over {:?}", index, bands.dim());
        let mut out = IndexGrid::from_elem(bands.dim(), f32::NAN);

        match (&bands.blue, index.needs_blue()) {
            (Some(blue), true) => {
                let cells = Zip::from(&mut out)
                    .and(&bands.red)
                    .and(&bands.nir)
                    .and(blue)
                    .and(usable);
                let kernel = |o: &mut f32, &r: &f32, &n: &f32, &b: &f32, &ok: &bool| {
                    if ok {
                        *o = index_value(index, r, n, b);
                    }
                };
                #[cfg(feature = "parallel")]
                cells.par_for_each(kernel);
                #[cfg(not(feature = "parallel"))]
                cells.for_each(kernel);
            }
            (None, true) => {
                return Err(VegError::Processing(format!(
                    "{} requires a blue band",
                    index
                )));
            }
            (_, false) => {
                let cells = Zip::from(&mut out).and(&bands.red).and(&bands.nir).and(usable);
                let kernel = |o: &mut f32, &r: &f32, &n: &f32, &ok: &bool| {
                    if ok {
                        *o = index_value(index, r, n, 0.0);
                    }
                };
                #[cfg(feature = "parallel")]
                cells.par_for_each(kernel);
                #[cfg(not(feature = "parallel"))]
                cells.for_each(kernel);
            }
        }

        Ok(out)
    }
}
