/*!
# CSV export of chains and result tables

Walker chains are written one row per recorded iteration, merged chains the
same way with a single walker index, and result tables one row per
[`ResultRow`] with empty fields for columns the result mode left out.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::results::ResultsTable;

/**
Saves walker chains as a CSV file.

The resulting CSV file will have:
- A header row containing `"walker"`, `"sample"`, one column per free entry
  named after `names`, then `"log_likelihood"` and `"accepted"`.
- Each subsequent row corresponds to one recorded iteration of one walker.

# Errors

[`Error::Shape`] if a chain's width differs from `names`, and
[`Error::Persistence`] for any I/O or CSV failure.
*/
pub fn save_chains<P: AsRef<Path>>(chains: &[Chain], names: &[String], path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path.as_ref())?);

    let mut header: Vec<String> = vec!["walker".to_string(), "sample".to_string()];
    header.extend(names.iter().cloned());
    header.push("log_likelihood".to_string());
    header.push("accepted".to_string());
    wtr.write_record(&header)?;

    for (walker, chain) in chains.iter().enumerate() {
        if !chain.is_empty() && chain.n_free() != names.len() {
            return Err(Error::Shape(format!(
                "walker {walker} has {} free values, {} names given",
                chain.n_free(),
                names.len()
            )));
        }
        for (sample, state) in chain.states.rows().into_iter().enumerate() {
            let mut row = vec![walker.to_string(), sample.to_string()];
            row.extend(state.iter().map(|v| v.to_string()));
            row.push(chain.log_likelihoods[sample].to_string());
            row.push(chain.moves[sample].accepted.to_string());
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Saves a merged chain, written as walker 0.
pub fn save_chain<P: AsRef<Path>>(chain: &Chain, names: &[String], path: P) -> Result<()> {
    save_chains(std::slice::from_ref(chain), names, path)
}

/// Saves a result table with one column per [`ResultRow`](crate::results::ResultRow) field.
pub fn save_results<P: AsRef<Path>>(table: &ResultsTable, path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path.as_ref())?);
    for row in &table.rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultMode;
    use crate::proposal::MoveRecord;
    use crate::results::ResultRow;
    use crate::state::MoveIndex;
    use csv::Reader;
    use ndarray::{arr1, arr2};
    use std::fs;
    use tempfile::NamedTempFile;

    fn chain(states: ndarray::Array2<f64>, ll: &[f64]) -> Chain {
        Chain {
            moves: (0..states.nrows())
                .map(|i| MoveRecord {
                    accepted: i % 2 == 0,
                    index: MoveIndex::Gibbs(0),
                })
                .collect(),
            states,
            log_likelihoods: arr1(ll),
            truncated: false,
        }
    }

    fn names() -> Vec<String> {
        vec!["RP".to_string(), "T0".to_string()]
    }

    #[test]
    fn test_save_chains_empty() {
        let file = NamedTempFile::new().expect("Could not create temp file");
        save_chains(&[], &names(), file.path()).unwrap();
        let contents = fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents.trim(), "walker,sample,RP,T0,log_likelihood,accepted");
    }

    #[test]
    fn test_save_chains_multi_walker() {
        let a = chain(arr2(&[[1.0, 2.0], [3.0, 4.0]]), &[-1.0, -2.0]);
        let b = chain(arr2(&[[10.0, 20.0]]), &[-3.5]);
        let file = NamedTempFile::new().expect("Could not create temp file");
        save_chains(&[a, b], &names(), file.path()).unwrap();

        let contents = fs::read_to_string(file.path()).unwrap();
        let expected = "\
walker,sample,RP,T0,log_likelihood,accepted
0,0,1,2,-1,true
0,1,3,4,-2,false
1,0,10,20,-3.5,true";
        assert_eq!(contents.trim(), expected);
    }

    #[test]
    fn test_save_chain_width_mismatch() {
        let c = chain(arr2(&[[1.0, 2.0, 3.0]]), &[0.0]);
        let file = NamedTempFile::new().expect("Could not create temp file");
        assert!(matches!(
            save_chain(&c, &names(), file.path()),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_save_results_rows() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let table = ResultsTable {
            rows: vec![ResultRow {
                name: "planet radius".into(),
                short_name: "RP".into(),
                wave_center: Some(1.5),
                mode: None,
                mode_upper: None,
                mode_lower: None,
                p50: Some(0.1),
                p16: Some(0.09),
                p84: Some(0.12),
                p50_upper: Some(0.02),
                p50_lower: Some(0.01),
            }],
            mode: ResultMode::Percentile,
        };
        let file = NamedTempFile::new()?;
        save_results(&table, file.path())?;

        let contents = fs::read_to_string(file.path())?;
        let mut rdr = Reader::from_reader(contents.as_bytes());
        let headers = rdr.headers()?.clone();
        assert_eq!(&headers[0], "name");
        assert_eq!(&headers[3], "mode");
        let records: Vec<_> = rdr.records().collect::<std::result::Result<_, _>>()?;
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][1], "RP");
        assert_eq!(&records[0][3], "");
        assert_eq!(&records[0][6], "0.1");
        Ok(())
    }
}
