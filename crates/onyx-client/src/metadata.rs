use std::collections::BTreeMap;

use crate::Error;

/// Parse a metadata CSV into its single data row, keyed by header. Files
/// with zero or multiple data rows are rejected: only the first row is
/// ever consumed downstream, so accepting more would silently drop data.
pub fn parse_metadata(csv: &[u8]) -> Result<BTreeMap<String, String>, Error> {
    let mut reader = csv::ReaderBuilder::new().from_reader(csv);
    let headers = reader.headers()?.clone();

    let mut rows = reader.records();
    let first = rows.next().ok_or(Error::EmptyMetadata)??;
    if rows.next().is_some() {
        return Err(Error::MultilineMetadata);
    }

    Ok(headers
        .iter()
        .zip(first.iter())
        .map(|(header, value)| (header.to_string(), value.to_string()))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_row_parses() {
        let metadata = parse_metadata(
            b"sample_id,run_id,adm1\ns1,r1,GB-ENG\n",
        )
        .unwrap();
        assert_eq!(metadata["sample_id"], "s1");
        assert_eq!(metadata["run_id"], "r1");
        assert_eq!(metadata["adm1"], "GB-ENG");
    }

    #[test]
    fn multiple_rows_are_rejected() {
        assert!(matches!(
            parse_metadata(b"sample_id,run_id\ns1,r1\ns2,r2\n"),
            Err(Error::MultilineMetadata),
        ));
    }

    #[test]
    fn header_only_is_rejected() {
        assert!(matches!(
            parse_metadata(b"sample_id,run_id\n"),
            Err(Error::EmptyMetadata),
        ));
    }
}
