//! Error types for the coverage-model crate.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A required input is missing or has an unsupported format.
    #[error("configuration error: {0}")]
    Config(String),
    /// A probability or parameter became non-finite or left its domain.
    #[error("numeric error: {0}")]
    Numeric(String),
    /// A line of an input file could not be parsed.
    #[error("parse error in {path} line {line}: {reason}")]
    Parse {
        /// Path of the offending file.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        reason: String,
    },
    /// Model parameters left their feasible domain and could not be recovered.
    #[error("infeasible parameters: {0}")]
    Infeasible(String),
    /// A failure inside a parallel chunk task. Task statuses are recorded
    /// per task and drained only after the whole batch has finished, then
    /// the iteration fails with the first recorded failure.
    #[error("worker task on {contig} failed: {source}")]
    Worker {
        /// Contig of the failing chunk.
        contig: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// An I/O error raised by a reader or writer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shorthand for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;
