//! Calorimeter telegrams: one newline-terminated line of tab-separated
//! numbers per sample.

use serde::{Deserialize, Serialize};

use crate::error::TelegramError;

/// Fields in a complete telegram.
pub const TELEGRAM_FIELDS: usize = 29;

/// Leading fields kept as a [`SensorRow`].
pub const ROW_FIELDS: usize = 11;

/// Longest partial line kept while waiting for its newline.
const MAX_LINE: usize = 4096;

/// The leading, evaluated part of one telegram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorRow {
    pub elapsed_s: f64,
    /// Set temperature the calorimeter reports back.
    pub t_set: f64,
    pub t_pre: f64,
    pub t_r1: f64,
    pub t_r2: f64,
    pub t_a: f64,
    pub t_b: f64,
    pub t_out: f64,
    pub u_pre: f64,
    pub u_r1: f64,
    pub u_r2: f64,
}

impl SensorRow {
    pub fn from_fields(f: [f64; ROW_FIELDS]) -> Self {
        Self {
            elapsed_s: f[0],
            t_set: f[1],
            t_pre: f[2],
            t_r1: f[3],
            t_r2: f[4],
            t_a: f[5],
            t_b: f[6],
            t_out: f[7],
            u_pre: f[8],
            u_r1: f[9],
            u_r2: f[10],
        }
    }

    /// Fields in telegram order.
    pub fn fields(&self) -> [f64; ROW_FIELDS] {
        [
            self.elapsed_s,
            self.t_set,
            self.t_pre,
            self.t_r1,
            self.t_r2,
            self.t_a,
            self.t_b,
            self.t_out,
            self.u_pre,
            self.u_r1,
            self.u_r2,
        ]
    }

    /// Field by telegram column.
    pub fn column(&self, idx: usize) -> Option<f64> {
        self.fields().get(idx).copied()
    }
}

/// Parse one line (newline already removed, a trailing `\r` is tolerated).
pub fn parse(line: &str) -> Result<SensorRow, TelegramError> {
    let line = line.trim_end_matches('\r');
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < TELEGRAM_FIELDS {
        return Err(TelegramError::FieldCount(fields.len()));
    }

    let mut values = [0.0; ROW_FIELDS];
    for (idx, field) in fields.iter().take(TELEGRAM_FIELDS).enumerate() {
        let value: f64 = field
            .trim()
            .parse()
            .map_err(|_| TelegramError::NotNumeric(idx))?;
        if let Some(slot) = values.get_mut(idx) {
            *slot = value;
        }
    }
    Ok(SensorRow::from_fields(values))
}

/// Splits a byte stream into lines across reads.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    pending: Vec<u8>,
}

impl LineAccumulator {
    /// Append `bytes` and return every line they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.pending);
                lines.push(String::from_utf8_lossy(&line).into_owned());
            } else if self.pending.len() < MAX_LINE {
                self.pending.push(byte);
            }
        }
        lines
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_with(fields: usize) -> String {
        (0..fields).map(|i| format!("{}.5", i)).collect::<Vec<_>>().join("\t")
    }

    #[test]
    fn parses_leading_columns() {
        let row = parse(&line_with(29)).unwrap();
        assert_eq!(row.elapsed_s, 0.5);
        assert_eq!(row.t_set, 1.5);
        assert_eq!(row.u_r2, 10.5);
        assert_eq!(row.column(4), Some(4.5));
        assert_eq!(row.column(11), None);
    }

    #[test]
    fn tolerates_carriage_return() {
        let line = format!("{}\r", line_with(29));
        assert!(parse(&line).is_ok());
    }

    #[test]
    fn rejects_short_and_non_numeric_lines() {
        assert_eq!(parse(&line_with(28)), Err(TelegramError::FieldCount(28)));
        assert_eq!(parse(""), Err(TelegramError::FieldCount(1)));
        let mut fields: Vec<String> = (0..29).map(|i| i.to_string()).collect();
        fields[20] = "n/a".into();
        assert_eq!(parse(&fields.join("\t")), Err(TelegramError::NotNumeric(20)));
    }

    #[test]
    fn accumulator_joins_partial_reads() {
        let mut acc = LineAccumulator::default();
        assert!(acc.feed(b"1\t2").is_empty());
        assert_eq!(acc.feed(b"\t3\r\n4\n5"), vec!["1\t2\t3\r", "4"]);
        acc.clear();
        assert_eq!(acc.feed(b"\n"), vec![""]);
    }
}
