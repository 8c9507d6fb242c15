//! Error types for the parloop-codegen crate.
//!
//! This module defines the various error types that can occur while building
//! index expressions, marshaling kernel arguments and assembling wrapper
//! functions. The main error types are:
//!
//! - `AlgebraError`: Errors in the symbolic index algebra (type rules)
//! - `WrapperError`: Errors while marshaling arguments and assembling wrappers
//! - `VectoriseError`: Errors in the outer-product vectoriser
//!
//! All of these are programmer/configuration errors discovered at
//! wrapper-generation time, never at data-processing time. The policy is
//! fail-fast with no recovery: either a complete, self-consistent wrapper
//! function is produced, or nothing is.

use thiserror::Error;

/// Errors that can occur in the symbolic index algebra.
///
/// These represent violations of the typing rules of the index expression
/// operations: adding sequences of incompatible value types, or
/// dereferencing a sequence that does not hold pointers.
#[derive(Error, Debug)]
pub enum AlgebraError {
    /// Error when two sequences with incompatible value types are combined
    #[error("type mismatch: '{lhs}' and '{rhs}'")]
    TypeMismatch { lhs: String, rhs: String },
    /// Error when two non-broadcast sequences of different lengths are
    /// combined elementwise
    #[error("length mismatch: {lhs} elements vs {rhs}")]
    LengthMismatch { lhs: usize, rhs: usize },
    /// Error when dereferencing a sequence of non-pointer values
    #[error("can only dereference pointer types, not '{0}'")]
    InvalidDereference(String),
}

/// Errors that can occur while marshaling kernel arguments into a wrapper.
///
/// This enum wraps the lower-level algebra errors and adds the failure modes
/// of the per-argument marshaling protocol and the layer-access strategies.
#[derive(Error, Debug)]
pub enum WrapperError {
    /// Error when a map's arity disagrees with its layer-offset table length
    #[error("shape mismatch: offset table has {got} entries, expected {expected}")]
    ShapeMismatch { expected: usize, got: usize },
    /// Error when an access mode is not implemented for an argument kind
    #[error("access descriptor {access} not implemented for {kind} arguments")]
    UnsupportedAccess { access: String, kind: String },
    /// Error when an argument's kind matches none of the recognized shapes
    #[error("no marshaling rule for argument kind: {0}")]
    UnhandledArgumentKind(String),
    /// Error propagated from the index algebra
    #[error("index algebra error")]
    Algebra(#[from] AlgebraError),
}

/// Errors that can occur while vectorising an outer-product loop nest.
#[derive(Error, Debug)]
pub enum VectoriseError {
    /// Error when a named outer-product loop is not present in the nest
    #[error("loop over '{0}' not found in nest")]
    MissingLoop(String),
    /// Error when the nest holds no accumulation statement to vectorise
    #[error("no accumulation statement found under the outer-product loops")]
    MissingStatement,
}
