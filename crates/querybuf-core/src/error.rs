//! Error types for query buffer operations.

use std::fmt;

/// The primary error type for all query buffer operations.
#[derive(Debug)]
pub enum Error {
    /// A row's key columns were null where a non-null identity was demanded
    NullKey(NullKeyError),
    /// A shadow-field read or key comparison found neither a row association
    /// nor a tracked entry for an entity
    AssociationMissing(AssociationMissingError),
    /// The related-row stream failed while being advanced
    Stream(StreamError),
    /// Type mismatch while reading a row or downcasting an entity
    Type(TypeError),
    /// Mapping metadata cannot support the requested operation
    Metadata(MetadataError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct NullKeyError {
    /// Entity type owning the key
    pub entity_type: &'static str,
    /// Key property names, in key order
    pub properties: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct AssociationMissingError {
    /// What the buffer was doing when the association was needed
    pub operation: &'static str,
    /// Property being read, if any
    pub property: Option<&'static str>,
}

#[derive(Debug)]
pub struct StreamError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    /// Row field the value was read from, if any
    pub index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    /// Navigation or key the error concerns
    pub element: &'static str,
    pub message: String,
}

impl Error {
    /// Is this a caller-contract violation rather than a data condition?
    ///
    /// Contract violations indicate a bug in the caller (e.g. a shadow-field
    /// read on an entity that never went through the buffer) and are not
    /// meant to be retried or recovered from.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::AssociationMissing(_) | Error::Metadata(_))
    }

    /// Is this a null-key rejection?
    pub fn is_null_key(&self) -> bool {
        matches!(self, Error::NullKey(_))
    }

    /// Wrap a foreign error raised by a related-row stream.
    pub fn stream<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Stream(StreamError {
            message: message.into(),
            source: Some(Box::new(source)),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NullKey(e) => write!(f, "Null key: {}", e),
            Error::AssociationMissing(e) => write!(f, "Missing row association: {}", e),
            Error::Stream(e) => write!(f, "Related stream error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Stream(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for NullKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key ({}) of entity type '{}' is null where a value is required",
            self.properties.join(", "),
            self.entity_type
        )
    }
}

impl fmt::Display for AssociationMissingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.property {
            Some(property) => write!(
                f,
                "{} of '{}' on an entity that is neither tracked nor materialized by this buffer",
                self.operation, property
            ),
            None => write!(
                f,
                "{} on an entity that is neither tracked nor materialized by this buffer",
                self.operation
            ),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(index) = self.index {
            write!(
                f,
                "expected {} at field {}, found {}",
                self.expected, index, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.element, self.message)
    }
}

impl From<NullKeyError> for Error {
    fn from(err: NullKeyError) -> Self {
        Error::NullKey(err)
    }
}

impl From<AssociationMissingError> for Error {
    fn from(err: AssociationMissingError) -> Self {
        Error::AssociationMissing(err)
    }
}

impl From<StreamError> for Error {
    fn from(err: StreamError) -> Self {
        Error::Stream(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

/// Result type alias for query buffer operations.
pub type Result<T> = std::result::Result<T, Error>;
