//! Error types for descriptor construction, marshalling and native calls.

use std::fmt;

use thiserror::Error;

/// Malformed type descriptors. Always a bug in a binding definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("duplicate field '{field}' in {owner}")]
    DuplicateField { owner: String, field: String },

    #[error("unknown field '{field}' in {owner}")]
    UnknownField { owner: String, field: String },

    #[error("unresolved forward reference to '{name}'")]
    UnresolvedForward { name: String },

    #[error("type {what} has no native size")]
    Unsized { what: String },

    #[error("type {what} is larger than the address space")]
    Oversized { what: String },

    #[error("opaque type '{name}' refined inconsistently: {reason}")]
    ConflictingRefinement { name: String, reason: String },

    #[error("invalid counted extent in {owner}: {reason}")]
    InvalidExtent { owner: String, reason: String },
}

/// Errors raised while encoding, decoding or invoking native functions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalError {
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: FieldPath,
        expected: String,
        found: String,
    },

    #[error("unsupported discriminant {discriminant} for {table}")]
    UnsupportedDiscriminant { table: String, discriminant: u32 },

    #[error("native call '{symbol}' reported failure (returned {returned})")]
    NativeCallFailure { symbol: String, returned: String },

    #[error("failed to load library '{name}': {reason}")]
    Load { name: String, reason: String },

    #[error("symbol '{symbol}' unavailable in '{library}': {reason}")]
    Symbol {
        library: String,
        symbol: String,
        reason: String,
    },

    #[error("buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall { required: usize, available: usize },

    #[error("unsupported signature: {0}")]
    UnsupportedSignature(String),

    #[error("all {capacity} callback slots are in use")]
    CallbackSlotsExhausted { capacity: usize },

    #[error("cannot read native memory at {addr:#x}")]
    InvalidAddress { addr: usize },
}

impl MarshalError {
    pub(crate) fn mismatch(
        path: &FieldPath,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        MarshalError::TypeMismatch {
            path: path.clone(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type MarshalResult<T> = Result<T, MarshalError>;

/// Location of a value inside a managed value tree, e.g. `Groups[1].Sid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    Index(usize),
    Param(usize),
    Deref,
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn param(index: usize) -> Self {
        Self {
            segments: vec![PathSegment::Param(index)],
        }
    }

    pub fn field(&self, name: &str) -> Self {
        self.with(PathSegment::Field(name.to_string()))
    }

    pub fn index(&self, index: usize) -> Self {
        self.with(PathSegment::Index(index))
    }

    pub fn deref(&self) -> Self {
        self.with(PathSegment::Deref)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    fn with(&self, segment: PathSegment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "<root>");
        }
        let mut first = true;
        for segment in &self.segments {
            match segment {
                PathSegment::Field(name) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", name)?;
                }
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
                PathSegment::Param(i) => write!(f, "arg{}", i)?,
                PathSegment::Deref => write!(f, "*")?,
            }
            first = false;
        }
        Ok(())
    }
}
