//! Wrapper code generation for parallel loops over unstructured meshes and graphs.
//!
//! This crate generates the C glue that iterates a numerical kernel over the
//! elements of a set: gathering indirectly accessed data through maps into
//! kernel-shaped buffers, running the kernel, and scattering results back.
//! Extruded (layered) meshes are supported by nesting a layer loop inside the
//! element loop and folding per-layer offsets into each access. A separate
//! pass vectorises outer-product assembly loop nests with AVX intrinsics.
//!
//! # Features
//!
//! - Range and single-element (per-cell) wrapper generation
//! - Direct, indirect, matrix-assembly and global kernel arguments
//! - Extruded iteration regions with implicit boundary-condition masks
//! - Symbolic index algebra that keeps gathers as pointer arithmetic
//!   whenever the accessed entries are contiguous
//! - Outer-product vectorisation with register-level layout restoration
//!
//! # Example
//!
//! ```rust
//! use parloop_codegen::prelude::*;
//!
//! // A kernel taking one direct, read-write, 2-component double argument.
//! let kernel = KernelDesc::new(
//!     "scale",
//!     vec![KernelArg::new(
//!         ArgKind::Direct {
//!             dat: DatDesc::new("double", 2),
//!         },
//!         Access::ReadWrite,
//!     )],
//! );
//!
//! let wrapper = generate_wrapper(&kernel, &IterSpace::direct()).unwrap();
//! assert!(wrapper.code().contains("scale(arg0_0 + i * 2);"));
//! ```

pub use assemble::{generate_cell_wrapper, generate_wrapper, IterSpace, Region, Wrapper};
pub use descriptor::{Access, ArgKind, DatDesc, KernelArg, KernelDesc, MapDesc};

pub mod prelude {
    pub use crate::assemble::{
        generate_cell_wrapper, generate_wrapper, IterSpace, Region, Wrapper,
    };
    pub use crate::descriptor::{
        Access, ArgKind, BcLocation, DatDesc, KernelArg, KernelDesc, MapDesc,
    };
    pub use crate::vectorise::{outer_product, InstrSet, Mode, VectOpts, Vectorised};
}

/// Symbolic index sequences and the algebra combining them
pub mod algebra;
/// Wrapper assembly from kernel descriptors
pub mod assemble;
/// Loop-nest AST consumed and produced by the vectoriser
pub mod ast;
/// Kernel argument descriptors
pub mod descriptor;
/// C statement representation and rendering
pub mod emit;
/// Error types for the various failure modes
pub mod errors;
/// Layer access strategies and the four-phase argument wrapper
pub mod layers;
/// Per-argument marshaling: gather, call expression, scatter
pub mod marshal;
/// Indirection resolution through maps
pub mod resolve;
/// Outer-product AVX vectorisation
pub mod vectorise;

#[cfg(test)]
pub(crate) mod testutil;
