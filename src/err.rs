/// Errors that abort a load run.
///
/// Parsing and reconciliation errors are raised before anything is written.
/// Errors raised by the writer roll back the whole transaction.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    /// Structurally invalid line in the variant file.
    #[error("malformed record at line {line}: {message}")]
    MalformedRecord { line: usize, message: String },
    /// Pseudodata entry without a usable identifier.
    #[error("pseudodata entry #{index} has no usable identifier in field {key:?}")]
    MissingIdentifier { index: usize, key: String },
    /// Sample column without a matching individual.
    #[error("sample {sample:?} has no matching individual in pseudodata")]
    UnlinkedSample { sample: String },
    /// A parent row was absent when writing a child row.
    #[error("{entity} {key:?} references missing {parent} {parent_key:?}")]
    ReferentialViolation {
        entity: &'static str,
        key: String,
        parent: &'static str,
        parent_key: String,
    },
    /// The target store could not be opened.
    #[error("store at {path} unavailable: {source}")]
    StoreUnavailable {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid pseudodata document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl LoadError {
    /// Shortcut for building a `MalformedRecord`.
    pub fn malformed(line: usize, message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            message: message.into(),
        }
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            LoadError::MalformedRecord { .. } => 2,
            LoadError::MissingIdentifier { .. } => 3,
            LoadError::UnlinkedSample { .. } => 4,
            LoadError::ReferentialViolation { .. } => 5,
            LoadError::StoreUnavailable { .. } => 6,
            LoadError::InvalidDocument(_) => 7,
            LoadError::Io(_) => 8,
            LoadError::Store(_) => 9,
        }
    }
}
