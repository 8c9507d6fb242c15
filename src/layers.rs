//! Four-phase argument fragments and layer-access strategies.
//!
//! Wrapper code for one kernel argument is a set of four ordered statement
//! lists (`ArgWrapper`): `init` runs before any layer loop, `init_layer`
//! once per layer, `writeback` after the kernel call, and `post_writeback`
//! after the per-layer write-back to undo layer-loop pointer perturbation.
//! Lists compose strictly in that phase order across all arguments.
//!
//! The two layer-access strategies decide when and how a layer offset is
//! folded into the index algebra:
//!
//! - `Direct` folds `layer * offset[i]` into the base sequence at the point
//!   of use. Valid only where "per layer" and "once" coincide (single-shot
//!   access), so it mechanically relabels the `init` fragments produced by
//!   the consumer as `init_layer`.
//! - `Incremental` materializes the base sequence once into a named buffer,
//!   lets the consumer reuse that buffer every layer, and appends
//!   `post_writeback` bumps that advance the stored values by `offset[i]`
//!   in place. An enclosing layer loop then sees correctly incremented
//!   values at O(1) amortized cost instead of an O(layers) recomputation.

use crate::algebra::{add, CType, IndexSeq};
use crate::assemble::Namer;
use crate::emit::Stmt;
use crate::errors::WrapperError;

/// The four-phase statement fragments for one kernel argument.
///
/// Statement order within a list matters (declare before use); across
/// arguments, lists are concatenated per phase and never interleaved.
#[derive(Debug, Default, Clone)]
pub struct ArgWrapper {
    pub init: Vec<Stmt>,
    pub init_layer: Vec<Stmt>,
    pub writeback: Vec<Stmt>,
    pub post_writeback: Vec<Stmt>,
}

impl ArgWrapper {
    pub fn new() -> ArgWrapper {
        ArgWrapper::default()
    }

    /// Appends another argument's fragments phase by phase.
    pub fn extend(&mut self, other: ArgWrapper) {
        self.init.extend(other.init);
        self.init_layer.extend(other.init_layer);
        self.writeback.extend(other.writeback);
        self.post_writeback.extend(other.post_writeback);
    }
}

/// A layer-access strategy, selected by the kind of mesh iteration.
#[derive(Debug, Clone)]
pub enum LayerAccess {
    /// Substitute the layer index once at the point of use. `layer` is the
    /// layer variable expression, e.g. `j_0`.
    Direct { layer: String },
    /// Materialize once, bump in `post_writeback`. `start` is the first
    /// layer of the enclosing loop, e.g. `0` or `(nlayers - 1)`.
    Incremental { start: String },
}

impl LayerAccess {
    /// Threads `base` (offset by the current layer as this strategy
    /// dictates) through `consume`, which builds the argument fragments for
    /// a single access.
    ///
    /// `offset` absent or all-zero means the argument is layer-irrelevant
    /// and `consume` sees `base` untouched. Fails fast with `ShapeMismatch`
    /// when the offset table length disagrees with `base.size()`.
    pub fn apply<P>(
        &self,
        namer: &mut Namer,
        prefix: &str,
        base: IndexSeq,
        offset: Option<&[i64]>,
        consume: impl FnOnce(IndexSeq) -> Result<(ArgWrapper, P), WrapperError>,
    ) -> Result<(ArgWrapper, P), WrapperError> {
        let offset = match offset {
            Some(off) if off.iter().any(|&o| o != 0) => off,
            _ => return consume(base),
        };
        if offset.len() != base.size() {
            return Err(WrapperError::ShapeMismatch {
                expected: base.size(),
                got: offset.len(),
            });
        }

        match self {
            LayerAccess::Direct { layer } => {
                let column = IndexSeq::list(
                    CType::Int,
                    offset.iter().map(|off| format!("{layer}*{off}")).collect(),
                );
                let (mut wrapper, payload) = consume(add(&base, &column)?)?;
                // The consumer's "once" is really "per layer" here.
                debug_assert!(wrapper.init_layer.is_empty());
                wrapper.init_layer = std::mem::take(&mut wrapper.init);
                Ok((wrapper, payload))
            }
            LayerAccess::Incremental { start } => {
                let name_thunk = || namer.name(&format!("{prefix}direct"));
                let (init, direct) = if start == "0" {
                    // Force a copy even if base is already in memory; the
                    // bumps below must not touch the caller's buffer.
                    IndexSeq::list(base.ty().clone(), base.as_list()).as_slice(name_thunk)
                } else {
                    let shift = IndexSeq::list(
                        CType::Int,
                        offset.iter().map(|off| format!("{start}*{off}")).collect(),
                    );
                    add(&base, &shift)?.as_slice(name_thunk)
                };

                let (wrapper, payload) = consume(direct.clone())?;
                debug_assert!(wrapper.init_layer.is_empty());

                let mut post_writeback = wrapper.post_writeback;
                for (i, off) in offset.iter().enumerate() {
                    post_writeback.push(Stmt::add_assign(
                        format!("{}[{i}]", direct.expr()),
                        off.to_string(),
                    ));
                }
                Ok((
                    ArgWrapper {
                        init,
                        init_layer: wrapper.init,
                        writeback: wrapper.writeback,
                        post_writeback,
                    },
                    payload,
                ))
            }
        }
    }
}
