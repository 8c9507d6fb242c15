//! Kernel argument descriptors.
//!
//! Read-only metadata describing each kernel parameter: the underlying
//! value kind, declared access mode, map arity and layer offsets, and the
//! boundary-condition mask tables. Descriptors are supplied by the
//! surrounding set/map/dat storage layer and treated as immutable input;
//! the marshaling dispatcher matches exhaustively on the closed set of
//! argument kinds.

use std::collections::HashMap;

/// Declared access discipline of a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    Inc,
    Min,
    Max,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Access::Read => "READ",
            Access::Write => "WRITE",
            Access::ReadWrite => "RW",
            Access::Inc => "INC",
            Access::Min => "MIN",
            Access::Max => "MAX",
        };
        write!(f, "{name}")
    }
}

/// Mesh boundary named by an implicit boundary condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcLocation {
    Bottom,
    Top,
}

/// Metadata of an indirection map.
#[derive(Debug, Clone, Default)]
pub struct MapDesc {
    /// Entries per iteration-set element
    pub arity: usize,
    /// Per-entry layer offsets for extruded meshes; `None` on flat meshes
    pub offset: Option<Vec<i64>>,
    /// Implicit boundary conditions: which named mask applies at which
    /// mesh boundary
    pub implicit_bcs: Vec<(BcLocation, String)>,
    /// Named bottom-boundary masks; negative entries mark rows to drop
    pub bottom_masks: HashMap<String, Vec<i64>>,
    /// Named top-boundary masks; negative entries mark rows to drop
    pub top_masks: HashMap<String, Vec<i64>>,
    /// Vector component the boundary conditions apply to, if the mapped
    /// field is vector-valued and only one component is constrained
    pub vector_index: Option<usize>,
}

impl MapDesc {
    pub fn new(arity: usize) -> MapDesc {
        MapDesc {
            arity,
            ..MapDesc::default()
        }
    }

    pub fn with_offset(arity: usize, offset: Vec<i64>) -> MapDesc {
        MapDesc {
            arity,
            offset: Some(offset),
            ..MapDesc::default()
        }
    }

    /// Accumulated mask for one boundary over all implicit BCs, or `None`
    /// when no entry is marked (the "nothing to do" fast path).
    pub fn accumulated_mask(&self, location: BcLocation) -> Option<Vec<i64>> {
        let mut mask = vec![0i64; self.arity];
        for (loc, name) in &self.implicit_bcs {
            if *loc != location {
                continue;
            }
            let table = match location {
                BcLocation::Bottom => self.bottom_masks.get(name),
                BcLocation::Top => self.top_masks.get(name),
            };
            if let Some(entries) = table {
                for (m, e) in mask.iter_mut().zip(entries) {
                    *m += e;
                }
            }
        }
        if mask.iter().any(|&m| m != 0) {
            Some(mask)
        } else {
            None
        }
    }
}

/// Metadata of a flat data array associated with a set.
#[derive(Debug, Clone)]
pub struct DatDesc {
    /// Element C type name, e.g. `double`
    pub ctype: String,
    /// Components per set element (1 for scalar fields)
    pub cdim: usize,
    /// For views into a larger field: the fixed sub-component index.
    /// `cdim` then refers to the parent field's component count.
    pub view_index: Option<usize>,
}

impl DatDesc {
    pub fn new(ctype: &str, cdim: usize) -> DatDesc {
        DatDesc {
            ctype: ctype.to_string(),
            cdim,
            view_index: None,
        }
    }
}

/// The closed set of kernel argument shapes.
#[derive(Debug, Clone)]
pub enum ArgKind {
    /// Plain array accessed by iteration index, no indirection
    Direct { dat: DatDesc },
    /// Array accessed through a map. `idx` selects one map row for the
    /// kernel, or `None` to pass the whole mapped row; `flatten` requests
    /// struct-of-arrays component ordering.
    Indirect {
        dat: DatDesc,
        map: MapDesc,
        idx: Option<usize>,
        flatten: bool,
    },
    /// Sparse-matrix local assembly buffer with a row and a column map.
    /// `dims` are the block sizes per axis.
    Matrix {
        dims: (usize, usize),
        rmap: MapDesc,
        cmap: MapDesc,
        flatten: bool,
    },
    /// Global scalar or vector, passed through unchanged
    Global { ctype: String, dim: usize },
}

/// One kernel parameter: its shape plus the declared access mode.
#[derive(Debug, Clone)]
pub struct KernelArg {
    pub kind: ArgKind,
    pub access: Access,
}

impl KernelArg {
    pub fn new(kind: ArgKind, access: Access) -> KernelArg {
        KernelArg { kind, access }
    }

    /// C type names of the wrapper parameters this argument contributes,
    /// in declaration order: data buffers first, then map arrays.
    pub fn param_typenames(&self) -> Vec<String> {
        match &self.kind {
            ArgKind::Direct { dat } => vec![dat.ctype.clone()],
            ArgKind::Indirect { dat, .. } => vec![dat.ctype.clone(), "int".to_string()],
            ArgKind::Matrix { .. } => {
                vec!["Mat".to_string(), "int".to_string(), "int".to_string()]
            }
            ArgKind::Global { ctype, .. } => vec![ctype.clone()],
        }
    }

    /// Whether this argument goes through a map (forces a layer loop on
    /// extruded meshes).
    pub fn is_indirect(&self) -> bool {
        matches!(
            self.kind,
            ArgKind::Indirect { .. } | ArgKind::Matrix { .. }
        )
    }
}

/// A kernel: its name and ordered parameter descriptors. The kernel body
/// itself is opaque text linked in by the external compilation layer.
#[derive(Debug, Clone)]
pub struct KernelDesc {
    pub name: String,
    pub args: Vec<KernelArg>,
}

impl KernelDesc {
    pub fn new(name: &str, args: Vec<KernelArg>) -> KernelDesc {
        KernelDesc {
            name: name.to_string(),
            args,
        }
    }
}
