use csv::Writer;

use crate::block::Block;
use crate::error::ModelResult;

#[derive(serde::Serialize)]
struct ConstraintSummaryOutput {
    family: &'static str,
    index: usize,
    lhs: f64,
    rhs: f64,
    nonzeros: usize,
}

/// Writes one line per generated constraint of `block` and its
/// sub-blocks.
pub fn write_constraint_summary(block: &dyn Block, path: &str) -> ModelResult<()> {
    let mut wtr = Writer::from_path(path)?;
    let mut result = Ok(());
    block.for_each_constraint(&mut |family, index, c| {
        if result.is_ok() {
            let (lhs, rhs) = c.bounds();
            result = wtr.serialize(ConstraintSummaryOutput {
                family,
                index,
                lhs,
                rhs,
                nonzeros: c.nonzeros(),
            });
        }
    });
    result?;
    wtr.flush()?;
    Ok(())
}

#[derive(serde::Serialize)]
struct VariableOutput {
    block: String,
    slot: usize,
    lower: f64,
    upper: f64,
    value: f64,
}

/// Writes the bounds and current value of every variable
pub fn write_variable_values(block: &dyn Block, path: &str) -> ModelResult<()> {
    let mut wtr = Writer::from_path(path)?;
    let mut result = Ok(());
    block.for_each_variable(&mut |var, v| {
        if result.is_ok() {
            result = wtr.serialize(VariableOutput {
                block: var.block.to_string(),
                slot: var.slot,
                lower: v.lower,
                upper: v.upper,
                value: v.value,
            });
        }
    });
    result?;
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::unit::{UnitBlock, UnitData};

    fn unit() -> UnitBlock {
        let data = UnitData::new(1, 2, &[1.0], &[4.0]).unwrap();
        let mut unit = UnitBlock::new(data);
        unit.generate_all().unwrap();
        unit
    }

    #[test]
    fn test_constraint_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constraints.csv");
        let path = path.to_str().unwrap();
        write_constraint_summary(&unit(), path).unwrap();
        let mut rdr = csv::Reader::from_path(path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["family", "index", "lhs", "rhs", "nonzeros"]
        );
        let records: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[1][0], "power_bounds");
        assert_eq!(&records[1][1], "1");
        assert_eq!(&records[1][2], "1.0");
        assert_eq!(&records[1][3], "4.0");
    }

    #[test]
    fn test_variable_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.csv");
        let path = path.to_str().unwrap();
        write_variable_values(&unit(), path).unwrap();
        let mut rdr = csv::Reader::from_path(path).unwrap();
        assert_eq!(rdr.records().count(), 2);
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("constraints.csv");
        assert!(write_constraint_summary(&unit(), path.to_str().unwrap()).is_err());
    }
}
