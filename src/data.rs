//! Measurement tables consumed read-only by the sampler.
//!
//! Every table is laid out `[n_channel, n_int]`: one row per spectral channel
//! (bandpass), one column per integration.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    /// Wavelength of each point.
    pub wavelength: Array2<f64>,
    /// Mid-integration time.
    pub time: Array2<f64>,
    /// Integration duration.
    pub itime: Array2<f64>,
    pub flux: Array2<f64>,
    pub flux_err: Array2<f64>,
    /// Spectral order of each point.
    pub orders: Array2<i32>,
    /// `[n_channel, 2]` start and end of each channel's bin.
    pub bin_limits: Array2<f64>,
}

impl InputData {
    /// Checks that every table agrees on `[n_channel, n_int]`.
    pub fn new(
        wavelength: Array2<f64>,
        time: Array2<f64>,
        itime: Array2<f64>,
        flux: Array2<f64>,
        flux_err: Array2<f64>,
        orders: Array2<i32>,
        bin_limits: Array2<f64>,
    ) -> Result<Self> {
        let dim = flux.dim();
        let tables = [
            ("wavelength", wavelength.dim()),
            ("time", time.dim()),
            ("itime", itime.dim()),
            ("flux_err", flux_err.dim()),
            ("orders", orders.dim()),
        ];
        for (name, other) in tables {
            if other != dim {
                return Err(Error::Shape(format!(
                    "{name} has shape {other:?}, flux has shape {dim:?}"
                )));
            }
        }
        if bin_limits.dim() != (dim.0, 2) {
            return Err(Error::Shape(format!(
                "bin_limits has shape {:?}, expected ({}, 2)",
                bin_limits.dim(),
                dim.0
            )));
        }
        if dim.0 == 0 || dim.1 == 0 {
            return Err(Error::Shape("input data has no channels or no points".into()));
        }
        Ok(Self {
            wavelength,
            time,
            itime,
            flux,
            flux_err,
            orders,
            bin_limits,
        })
    }

    /// Builds tables for synthetic data sharing one time axis and with a
    /// constant wavelength per channel. Integration time defaults to zero and
    /// every point belongs to order 1.
    pub fn from_flux(
        time: ArrayView1<f64>,
        channel_wavelengths: ArrayView1<f64>,
        flux: Array2<f64>,
        flux_err: Array2<f64>,
    ) -> Result<Self> {
        let n_channel = channel_wavelengths.len();
        let n_int = time.len();
        let time = time
            .broadcast((n_channel, n_int))
            .ok_or_else(|| Error::Shape("cannot broadcast time axis".into()))?
            .to_owned();
        let wavelength = channel_wavelengths
            .insert_axis(Axis(1))
            .broadcast((n_channel, n_int))
            .ok_or_else(|| Error::Shape("cannot broadcast wavelengths".into()))?
            .to_owned();
        let bin_limits = Array2::from_shape_fn((n_channel, 2), |(c, _)| channel_wavelengths[c]);
        Self::new(
            wavelength,
            time,
            Array2::zeros((n_channel, n_int)),
            flux,
            flux_err,
            Array2::ones((n_channel, n_int)),
            bin_limits,
        )
    }

    pub fn n_channel(&self) -> usize {
        self.flux.nrows()
    }

    pub fn n_int(&self) -> usize {
        self.flux.ncols()
    }

    /// Total number of data points across channels.
    pub fn npt(&self) -> usize {
        self.flux.len()
    }

    /// Mean wavelength of each channel, used to label per-channel results.
    pub fn wave_centers(&self) -> Array1<f64> {
        self.wavelength
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(self.n_channel()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    #[test]
    fn rejects_mismatched_tables() {
        let ok = Array2::<f64>::zeros((2, 5));
        let err = InputData::new(
            ok.clone(),
            ok.clone(),
            ok.clone(),
            ok.clone(),
            Array2::zeros((2, 4)),
            Array2::zeros((2, 5)),
            Array2::zeros((2, 2)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Shape(msg) if msg.contains("flux_err")));
    }

    #[test]
    fn synthetic_tables_broadcast() {
        let time = arr1(&[0.0, 1.0, 2.0]);
        let waves = arr1(&[0.9, 1.4]);
        let data = InputData::from_flux(
            time.view(),
            waves.view(),
            Array2::ones((2, 3)),
            Array2::from_elem((2, 3), 0.01),
        )
        .unwrap();
        assert_eq!(data.n_channel(), 2);
        assert_eq!(data.n_int(), 3);
        assert_eq!(data.npt(), 6);
        assert_eq!(data.time.row(1), time);
        assert_eq!(data.wave_centers(), waves);
    }
}
