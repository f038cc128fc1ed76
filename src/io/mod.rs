/*!
Export of chains and result tables. Enable via the `csv` feature.
*/

#[cfg(feature = "csv")]
pub mod csv;
