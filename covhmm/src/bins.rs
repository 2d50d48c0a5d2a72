//! Size bins for stratifying summary tables by segment length.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Half-open `[start, end)` length intervals with one name per bin, read
/// from a tab-delimited file with rows `start<TAB>end<TAB>name`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SizeBins {
    starts: Vec<u64>,
    ends: Vec<u64>,
    names: Vec<String>,
}

impl Default for SizeBins {
    /// One catch-all bin `[0, 1e9)` named `ALL`.
    fn default() -> Self {
        Self {
            starts: vec![0],
            ends: vec![1_000_000_000],
            names: vec!["ALL".to_string()],
        }
    }
}

impl SizeBins {
    /// Parses bins from a tab-delimited file; malformed rows are fatal.
    pub fn from_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut bins = Self {
            starts: Vec::new(),
            ends: Vec::new(),
            names: Vec::new(),
        };
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parse_err = |reason: String| Error::Parse {
                path: path.display().to_string(),
                line: line_no + 1,
                reason,
            };
            let fields: Vec<&str> = line.split('\t').collect();
            let [start, end, name] = fields.as_slice() else {
                return Err(parse_err(format!(
                    "expected 3 columns, found {}",
                    fields.len()
                )));
            };
            let start: u64 = start
                .trim()
                .parse()
                .map_err(|_| parse_err(format!("bad start `{start}`")))?;
            let end: u64 = end
                .trim()
                .parse()
                .map_err(|_| parse_err(format!("bad end `{end}`")))?;
            if end <= start {
                return Err(parse_err(format!("empty bin [{start}, {end})")));
            }
            bins.starts.push(start);
            bins.ends.push(end);
            bins.names.push((*name).to_string());
        }
        if bins.names.is_empty() {
            return Err(Error::Config(format!(
                "bin file {} contains no bins",
                path.display()
            )));
        }
        Ok(bins)
    }

    /// Returns the number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns whether there are no bins; a constructed value never is.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns the bin names.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns the first bin containing `length`, or `None` when no bin
    /// does.
    #[must_use]
    pub fn bin_index(&self, length: u64) -> Option<usize> {
        self.starts
            .iter()
            .zip(&self.ends)
            .position(|(&start, &end)| start <= length && length < end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_covers_everything_reasonable() {
        let bins = SizeBins::default();
        assert_eq!(bins.len(), 1);
        assert_eq!(bins.names()[0], "ALL");
        assert_eq!(bins.bin_index(0), Some(0));
        assert_eq!(bins.bin_index(999_999_999), Some(0));
        assert_eq!(bins.bin_index(1_000_000_000), None);
    }

    #[test]
    fn half_open_bins_from_file() {
        let dir = std::env::temp_dir().join("covhmm-bin-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bins.tsv");
        std::fs::write(&path, "0\t100\t[0-100)\n100\t1000\t[100-1000)\n").unwrap();

        let bins = SizeBins::from_file(&path).unwrap();
        assert_eq!(bins.len(), 2);
        assert_eq!(bins.bin_index(99), Some(0));
        assert_eq!(bins.bin_index(100), Some(1));
        assert_eq!(bins.bin_index(1000), None);
    }

    #[test]
    fn malformed_rows_are_fatal() {
        let dir = std::env::temp_dir().join("covhmm-bin-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad_bins.tsv");
        std::fs::write(&path, "0\tabc\tname\n").unwrap();
        assert!(SizeBins::from_file(&path).is_err());
    }
}
