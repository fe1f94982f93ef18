//! Codec for passing environment variables to the wrapper as a single
//! `--env` flag value.
//!
//! The map is rendered as one CSV record of `NAME=value` fields with keys
//! sorted, so the same environment always produces the same string. CSV
//! quoting lets values contain commas, quotes and newlines; empty values
//! round-trip as `NAME=`.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvStringError {
    #[error("malformed env string: {0}")]
    Csv(#[from] csv::Error),
    #[error("env entry without '=': {0}")]
    MissingSeparator(String),
}

/// Render an environment map as a deterministic CSV record.
///
/// Returns an empty string for an empty map.
pub fn encode(env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return String::new();
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    let record: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    // Writing a Vec<String> record to a Vec<u8> sink cannot fail.
    writer.write_record(&record).expect("csv write to memory");
    let bytes = writer.into_inner().expect("csv flush to memory");
    let mut text = String::from_utf8(bytes).expect("csv output is utf-8");
    while text.ends_with('\n') || text.ends_with('\r') {
        text.pop();
    }
    text
}

/// Parse an `--env` flag value back into name/value pairs.
pub fn decode(text: &str) -> Result<Vec<(String, String)>, EnvStringError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(text.as_bytes());
    let mut pairs = Vec::new();
    for record in reader.records() {
        let record = record?;
        for field in record.iter() {
            let (name, value) = field
                .split_once('=')
                .ok_or_else(|| EnvStringError::MissingSeparator(field.to_string()))?;
            pairs.push((name.to_string(), value.to_string()));
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn encodes_sorted_and_comma_separated() {
        let env = map(&[("FOO", "bar"), ("A", "1")]);
        assert_eq!(encode(&env), "A=1,FOO=bar");
    }

    #[test]
    fn empty_map_encodes_to_empty_string() {
        assert_eq!(encode(&BTreeMap::new()), "");
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn values_with_commas_are_quoted() {
        let env = map(&[("LIST", "a,b,c")]);
        let encoded = encode(&env);
        assert_eq!(encoded, "\"LIST=a,b,c\"");
        assert_eq!(
            decode(&encoded).unwrap(),
            vec![("LIST".to_string(), "a,b,c".to_string())]
        );
    }

    #[test]
    fn empty_values_round_trip() {
        let env = map(&[("EMPTY", ""), ("SET", "x")]);
        let encoded = encode(&env);
        assert_eq!(
            decode(&encoded).unwrap(),
            vec![
                ("EMPTY".to_string(), String::new()),
                ("SET".to_string(), "x".to_string())
            ]
        );
    }

    #[test]
    fn values_containing_equals_keep_everything_after_first() {
        let env = map(&[("URL", "http://x/?a=b")]);
        let encoded = encode(&env);
        assert_eq!(
            decode(&encoded).unwrap(),
            vec![("URL".to_string(), "http://x/?a=b".to_string())]
        );
    }

    #[test]
    fn entry_without_separator_is_rejected() {
        assert!(matches!(
            decode("NOEQUALS"),
            Err(EnvStringError::MissingSeparator(_))
        ));
    }
}
