//! Symbolic index algebra for wrapper code generation.
//!
//! This module defines the core sequence types used to represent index and
//! pointer computations symbolically, so that the same map-offset arithmetic
//! can be reused unchanged whether the consuming context wants a read, a
//! write, a batch of pointers for a vector kernel argument, or an lvalue
//! list for increment write-back. The main types are:
//!
//! - `CType`: the value type of a sequence (an integer type or a pointer)
//! - `IndexSeq`: a one-dimensional sequence of emittable C expressions
//!
//! An `IndexSeq` comes in four shapes:
//!
//! - `Singleton`: a single value, broadcast on demand
//! - `Range`: consecutive offsets from a base expression, e.g. `p + 0..4`
//! - `List`: an explicit list of independent expressions
//! - `Slice`: an array in memory, i.e. consecutive lvalues
//!
//! `Range` and `Singleton` are compact representations materialized to
//! `List` only on demand. Every element of a realized `List` or `Slice` is
//! a syntactically valid standalone C expression.
//!
//! The algebra offers four operations: `add`, `concat`, `deref` and
//! `as_slice`. Only `as_slice` has a side effect (it requests a fresh buffer
//! name); everything else is a pure transformation.

use crate::emit::Stmt;
use crate::errors::AlgebraError;

/// The value type of an index sequence: an integer type, a named element
/// type, or a pointer to either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CType {
    /// The C `int` type, the only recognised integer type
    Int,
    /// Any other element type, by C type name (e.g. `double`)
    Named(String),
    /// Pointer to another type
    Ptr(Box<CType>),
}

impl CType {
    /// Named element type from a C type name.
    pub fn named(name: &str) -> CType {
        CType::Named(name.to_string())
    }

    /// Pointer to this type.
    pub fn ptr(self) -> CType {
        CType::Ptr(Box::new(self))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, CType::Int)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Ptr(_))
    }

    /// The pointee type, or `InvalidDereference` for non-pointers.
    pub fn deref(&self) -> Result<CType, AlgebraError> {
        match self {
            CType::Ptr(inner) => Ok((**inner).clone()),
            other => Err(AlgebraError::InvalidDereference(other.to_string())),
        }
    }
}

impl std::fmt::Display for CType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CType::Int => write!(f, "int"),
            CType::Named(name) => write!(f, "{name}"),
            CType::Ptr(inner) => write!(f, "{inner}*"),
        }
    }
}

/// A one-dimensional sequence of emittable C expressions, all of one value
/// type.
///
/// Constructed ephemerally per wrapper argument during code generation and
/// consumed immediately; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexSeq {
    /// A single value with type
    Singleton { ty: CType, value: String },
    /// An array of consecutive integral values, e.g. `[p, p+1, p+2, p+3]`
    /// represented as `(expr = p, size = 4)`
    Range {
        ty: CType,
        expr: String,
        size: usize,
    },
    /// An array of unrelated expressions of the same type
    List { ty: CType, values: Vec<String> },
    /// An array in memory: an array of lvalues with consecutive locations
    Slice {
        ty: CType,
        expr: String,
        size: usize,
    },
}

impl IndexSeq {
    pub fn singleton(ty: CType, value: impl Into<String>) -> IndexSeq {
        IndexSeq::Singleton {
            ty,
            value: value.into(),
        }
    }

    pub fn range(ty: CType, expr: impl Into<String>, size: usize) -> IndexSeq {
        IndexSeq::Range {
            ty,
            expr: expr.into(),
            size,
        }
    }

    pub fn list(ty: CType, values: Vec<String>) -> IndexSeq {
        IndexSeq::List { ty, values }
    }

    pub fn slice(ty: CType, expr: impl Into<String>, size: usize) -> IndexSeq {
        IndexSeq::Slice {
            ty,
            expr: expr.into(),
            size,
        }
    }

    /// Sequence length; a `Singleton` has length 1.
    pub fn size(&self) -> usize {
        match self {
            IndexSeq::Singleton { .. } => 1,
            IndexSeq::Range { size, .. } | IndexSeq::Slice { size, .. } => *size,
            IndexSeq::List { values, .. } => values.len(),
        }
    }

    pub fn ty(&self) -> &CType {
        match self {
            IndexSeq::Singleton { ty, .. }
            | IndexSeq::Range { ty, .. }
            | IndexSeq::List { ty, .. }
            | IndexSeq::Slice { ty, .. } => ty,
        }
    }

    /// The expression naming this sequence in memory.
    ///
    /// Meaningful for `Slice` (the buffer expression) and `Singleton` (the
    /// value itself); materialized shapes have no single expression.
    pub fn expr(&self) -> &str {
        match self {
            IndexSeq::Singleton { value, .. } => value,
            IndexSeq::Range { expr, .. } | IndexSeq::Slice { expr, .. } => expr,
            IndexSeq::List { .. } => "",
        }
    }

    /// Materializes every element as a standalone expression.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            IndexSeq::Singleton { value, .. } => vec![value.clone()],
            IndexSeq::Range { expr, size, .. } => {
                (0..*size).map(|n| format!("{expr} + {n}")).collect()
            }
            IndexSeq::List { values, .. } => values.clone(),
            IndexSeq::Slice { expr, size, .. } => {
                (0..*size).map(|n| format!("({expr})[{n}]")).collect()
            }
        }
    }

    /// Broadcast a `Singleton` to a `List` of length `n`.
    fn repeat(&self, n: usize) -> IndexSeq {
        match self {
            IndexSeq::Singleton { ty, value } => IndexSeq::List {
                ty: ty.clone(),
                values: vec![value.clone(); n],
            },
            other => other.clone(),
        }
    }

    /// Realizes this sequence into a named, declared local buffer.
    ///
    /// Returns the statements that declare and fill the buffer, and a
    /// `Slice` handle over it. A `Slice` is already in memory, so this is a
    /// no-op for it: zero statements, and `name_thunk` is not called.
    pub fn as_slice(&self, name_thunk: impl FnOnce() -> String) -> (Vec<Stmt>, IndexSeq) {
        match self {
            IndexSeq::Slice { .. } => (vec![], self.clone()),
            other => {
                let values = other.as_list();
                let ty = other.ty().clone();
                let buf = name_thunk();
                let mut statements = vec![Stmt::decl_buf(&ty.to_string(), &buf, values.len())];
                for (i, expr) in values.iter().enumerate() {
                    statements.push(Stmt::assign(format!("{buf}[{i}]"), expr.clone()));
                }
                let size = values.len();
                (statements, IndexSeq::slice(ty, buf, size))
            }
        }
    }
}

/// Adds two sequences elementwise, broadcasting a `Singleton` operand.
///
/// The value types must be compatible: both the same integer type, or one
/// pointer and one integer (the result takes the pointer type). Two
/// non-singleton operands must be the same length. Returns the most compact
/// representable form: singleton + singleton stays a singleton, singleton +
/// range stays a range, anything else materializes.
pub fn add(x: &IndexSeq, y: &IndexSeq) -> Result<IndexSeq, AlgebraError> {
    let ty = if x.ty() == y.ty() && x.ty().is_integer() {
        x.ty().clone()
    } else if x.ty().is_pointer() && y.ty().is_integer() {
        x.ty().clone()
    } else if y.ty().is_pointer() && x.ty().is_integer() {
        y.ty().clone()
    } else {
        return Err(AlgebraError::TypeMismatch {
            lhs: x.ty().to_string(),
            rhs: y.ty().to_string(),
        });
    };

    if let (IndexSeq::Singleton { value: a, .. }, IndexSeq::Singleton { value: b, .. }) = (x, y) {
        return Ok(IndexSeq::singleton(ty, format!("{a} + {b}")));
    }

    // Put a lone singleton on the left, so singleton + range is one case.
    let (x, y) = if matches!(y, IndexSeq::Singleton { .. }) {
        (y, x)
    } else {
        (x, y)
    };

    if let (IndexSeq::Singleton { value, .. }, IndexSeq::Range { expr, size, .. }) = (x, y) {
        return Ok(IndexSeq::range(ty, format!("{value} + {expr}"), *size));
    }

    if !matches!(x, IndexSeq::Singleton { .. }) && x.size() != y.size() {
        return Err(AlgebraError::LengthMismatch {
            lhs: x.size(),
            rhs: y.size(),
        });
    }

    let xs = x.repeat(y.size()).as_list();
    let ys = y.repeat(x.size()).as_list();
    let values = xs
        .iter()
        .zip(ys.iter())
        .map(|(a, b)| format!("{a} + {b}"))
        .collect();
    Ok(IndexSeq::list(ty, values))
}

/// Concatenates sequences of a common value type into a `List`.
pub fn concat(first: &IndexSeq, rest: &[&IndexSeq]) -> Result<IndexSeq, AlgebraError> {
    if rest.is_empty() {
        return Ok(first.clone());
    }
    let ty = first.ty().clone();
    let mut values = first.as_list();
    for seq in rest {
        if *seq.ty() != ty {
            return Err(AlgebraError::TypeMismatch {
                lhs: ty.to_string(),
                rhs: seq.ty().to_string(),
            });
        }
        values.extend(seq.as_list());
    }
    Ok(IndexSeq::list(ty, values))
}

/// Dereferences each element of a pointer sequence.
///
/// A `Range` of pointers dereferences to a `Slice`, enabling later direct
/// lvalue use without materializing a temporary. Any other shape
/// dereferences to a `List` of individually dereferenced expressions.
pub fn deref(seq: &IndexSeq) -> Result<IndexSeq, AlgebraError> {
    let ty = seq.ty().deref()?;
    match seq {
        IndexSeq::Range { expr, size, .. } => Ok(IndexSeq::slice(ty, expr.clone(), *size)),
        other => {
            let values = other.as_list().iter().map(|e| format!("*({e})")).collect();
            Ok(IndexSeq::list(ty, values))
        }
    }
}
