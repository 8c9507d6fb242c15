//! Per-argument marshaling protocol.
//!
//! For each kernel argument shape this module emits the four-phase fragment
//! set that moves data between the opaque wrapper parameters and the buffer
//! the kernel actually sees:
//!
//! - plain arrays need only a pointer expression
//! - globals pass their buffer straight through
//! - mapped arrays gather into (and scatter from) a local value or pointer
//!   buffer according to the declared access discipline
//! - matrix arguments assemble into a zeroed local element buffer that is
//!   inserted into the sparse matrix after the kernel call, with optional
//!   layout flattening and boundary-condition masking of the local row and
//!   column index buffers
//!
//! Dispatch is a static match over the closed set of argument kinds.

use itertools::iproduct;

use crate::algebra::{add, deref, CType, IndexSeq};
use crate::assemble::Namer;
use crate::descriptor::{Access, ArgKind, BcLocation, DatDesc, KernelArg, MapDesc};
use crate::emit::{AssignOp, Stmt};
use crate::errors::WrapperError;
use crate::layers::{ArgWrapper, LayerAccess};
use crate::resolve;

/// Builds the four-phase fragments and the kernel call-site expression for
/// one argument.
///
/// `arg_names` are the wrapper parameter names allocated for this argument
/// (data buffers first, then map arrays), `elem` the current element index
/// expression and `col` the layer variable on extruded meshes.
pub fn init_and_writeback(
    arg: &KernelArg,
    arg_names: &[String],
    elem: &str,
    col: Option<&str>,
    namer: &mut Namer,
    prefix: &str,
    layer: &LayerAccess,
    is_facet: bool,
) -> Result<(ArgWrapper, String), WrapperError> {
    match &arg.kind {
        ArgKind::Matrix {
            dims,
            rmap,
            cmap,
            flatten,
        } => matrix_arg(
            arg.access, *dims, rmap, cmap, *flatten, arg_names, elem, col, namer, prefix, layer,
            is_facet,
        ),
        ArgKind::Indirect {
            dat,
            map,
            idx,
            flatten,
        } => indirect_arg(
            arg.access, dat, map, *idx, *flatten, arg_names, elem, namer, prefix, layer, is_facet,
        ),
        ArgKind::Direct { dat } => {
            let dat_name = &arg_names[0];
            let kernel_arg = match dat.view_index {
                Some(component) => {
                    format!("{dat_name} + {elem} * {} + {component}", dat.cdim)
                }
                None => format!("{dat_name} + {elem} * {}", dat.cdim),
            };
            Ok((ArgWrapper::new(), kernel_arg))
        }
        // Read/increment/reduce semantics of globals are finalized by the
        // caller at the reduction point, outside the wrapper.
        ArgKind::Global { .. } => Ok((ArgWrapper::new(), arg_names[0].clone())),
    }
}

/// Array accessed through a map.
#[allow(clippy::too_many_arguments)]
fn indirect_arg(
    access: Access,
    dat: &DatDesc,
    map: &MapDesc,
    idx: Option<usize>,
    flatten: bool,
    arg_names: &[String],
    elem: &str,
    namer: &mut Namer,
    prefix: &str,
    layer: &LayerAccess,
    is_facet: bool,
) -> Result<(ArgWrapper, String), WrapperError> {
    let dat_name = &arg_names[0];
    let map_name = &arg_names[1];
    let buf_name = namer.name(&format!("{prefix}vec"));

    let (map_vec, offset) =
        resolve::map_vec(map_name, map.arity, map.offset.as_deref(), idx, elem, is_facet)?;

    // Scale the per-row offsets by the component count and expand them to
    // match the component expansion of the index list.
    let offsets: Option<Vec<i64>> = offset.map(|off| {
        let off: Vec<i64> = off.iter().map(|o| o * dat.cdim as i64).collect();
        if idx.is_some() || flatten {
            if flatten {
                (0..dat.cdim).flat_map(|_| off.iter().copied()).collect()
            } else {
                off.iter()
                    .flat_map(|o| std::iter::repeat(*o).take(dat.cdim))
                    .collect()
            }
        } else {
            off
        }
    });

    let mut ix = resolve::indices(dat.cdim, &map_vec, flatten);
    if idx.is_none() && !flatten {
        // Reduced buffer: one pointer per map entry, not per component.
        ix = IndexSeq::list(
            ix.ty().clone(),
            ix.as_list().into_iter().step_by(dat.cdim).collect(),
        );
    }

    let g_dat = IndexSeq::singleton(CType::named(&dat.ctype).ptr(), dat_name.as_str());
    let pointers = add(&g_dat, &ix)?;

    if idx.is_none() {
        // Vector-map case: the kernel sees one pointer per map entry and
        // mutates through them directly; no write-back needed.
        let consume = move |direct: IndexSeq| {
            let (init, kernel_buf) = direct.as_slice(|| buf_name);
            let payload = kernel_buf.expr().to_string();
            Ok((
                ArgWrapper {
                    init,
                    ..ArgWrapper::new()
                },
                payload,
            ))
        };
        return layer.apply(namer, prefix, pointers, offsets.as_deref(), consume);
    }

    let ctype = dat.ctype.clone();
    let consume = move |direct: IndexSeq| {
        let lvalues = deref(&direct)?;

        if let IndexSeq::Slice { .. } = lvalues {
            // Consecutive lvalues in memory: pass the pointer straight
            // through, nothing to stage or restore.
            return Ok((ArgWrapper::new(), lvalues.expr().to_string()));
        }

        let init = match access {
            Access::Read | Access::ReadWrite => {
                let (init, _) = lvalues.as_slice(|| buf_name.clone());
                init
            }
            Access::Write | Access::Inc => {
                // Downstream form compilers expect a zeroed buffer for
                // WRITE as well.
                vec![Stmt::Decl {
                    ty: ctype.clone(),
                    name: buf_name.clone(),
                    dims: vec![lvalues.size()],
                    align: None,
                    init: Some("{0.0}".to_string()),
                }]
            }
            other => {
                return Err(WrapperError::UnsupportedAccess {
                    access: other.to_string(),
                    kind: "Dat".to_string(),
                })
            }
        };

        let mut writeback = vec![];
        if matches!(access, Access::ReadWrite | Access::Write | Access::Inc) {
            let op = if access == Access::Inc {
                AssignOp::Add
            } else {
                AssignOp::Set
            };
            for (i, lvalue) in lvalues.as_list().iter().enumerate() {
                writeback.push(Stmt::Assign {
                    lhs: lvalue.clone(),
                    op,
                    rhs: format!("{buf_name}[{i}]"),
                });
            }
        }

        Ok((
            ArgWrapper {
                init,
                writeback,
                ..ArgWrapper::new()
            },
            buf_name.clone(),
        ))
    };
    layer.apply(namer, prefix, pointers, offsets.as_deref(), consume)
}

/// Sparse-matrix local assembly.
#[allow(clippy::too_many_arguments)]
fn matrix_arg(
    access: Access,
    dims: (usize, usize),
    rmap: &MapDesc,
    cmap: &MapDesc,
    flatten: bool,
    arg_names: &[String],
    elem: &str,
    col: Option<&str>,
    namer: &mut Namer,
    prefix: &str,
    layer: &LayerAccess,
    is_facet: bool,
) -> Result<(ArgWrapper, String), WrapperError> {
    let mode = match access {
        Access::Write => "INSERT_VALUES",
        Access::Inc => "ADD_VALUES",
        other => {
            return Err(WrapperError::UnsupportedAccess {
                access: other.to_string(),
                kind: "Mat".to_string(),
            })
        }
    };
    let mat_name = &arg_names[0];
    let map_names = &arg_names[1..3];
    let buf_name = namer.name(&format!("{prefix}buf"));
    let (rdim, cdim) = dims;
    let maps = [rmap, cmap];

    let mut map_vecs = Vec::with_capacity(2);
    let mut offsets = Vec::with_capacity(2);
    for (m, name) in maps.iter().zip(map_names) {
        let (mv, off) = resolve::map_vec(name, m.arity, m.offset.as_deref(), None, elem, is_facet)?;
        map_vecs.push(mv);
        offsets.push(off);
    }
    let arity = [map_vecs[0].size(), map_vecs[1].size()];
    let size = [arity[0] * rdim, arity[1] * cdim];

    let init = vec![Stmt::Decl {
        ty: "double".to_string(),
        name: buf_name.clone(),
        dims: vec![size[0], size[1]],
        align: Some(16),
        init: Some("{{0.0}}".to_string()),
    }];
    let mut writeback: Vec<Stmt> = vec![];

    let mut threaded = ArgWrapper::new();
    let mut local_maps: Vec<IndexSeq> = Vec::with_capacity(2);
    for (r, mv) in map_vecs.iter().enumerate() {
        let m = maps[r];
        let lm_name = namer.name(&format!("{prefix}local_map{r}"));
        let bottom = m.accumulated_mask(BcLocation::Bottom);
        let top = m.accumulated_mask(BcLocation::Top);
        let map_arity = m.arity;

        let consume = move |direct: IndexSeq| -> Result<(ArgWrapper, IndexSeq), WrapperError> {
            let (mut wb, local_map) = direct.as_slice(|| lm_name);
            let mut post = vec![];

            if let (Some(col), Some(mask)) = (col, bottom.as_ref()) {
                let (mark, undo) = mask_statements(local_map.expr(), mask, 0);
                wb.push(Stmt::If {
                    cond: format!("{col} == 0"),
                    body: mark,
                    orelse: vec![],
                });
                post.push(Stmt::If {
                    cond: format!("{col} == 0"),
                    body: undo,
                    orelse: vec![],
                });
            }
            if let (Some(col), Some(mask)) = (col, top.as_ref()) {
                // Which physical layer is "top" is known only at run time.
                let top_layer = if is_facet { "(nlayers - 1)" } else { "nlayers" };
                let shift = if is_facet { map_arity } else { 0 };
                let (mark, undo) = mask_statements(local_map.expr(), mask, shift);
                wb.push(Stmt::If {
                    cond: format!("{col} == {top_layer} - 1"),
                    body: mark,
                    orelse: vec![],
                });
                post.push(Stmt::If {
                    cond: format!("{col} == {top_layer} - 1"),
                    body: undo,
                    orelse: vec![],
                });
            }

            Ok((
                ArgWrapper {
                    writeback: wb,
                    post_writeback: post,
                    ..ArgWrapper::new()
                },
                local_map,
            ))
        };
        let (wrapper, local_map) =
            layer.apply(namer, prefix, mv.clone(), offsets[r].as_deref(), consume)?;
        threaded.extend(wrapper);
        local_maps.push(local_map);
    }

    // Kernels produce row-major-of-blocks entries; the scalar insertion
    // primitive expects block-major-of-rows. Shuffle when they differ.
    let ins_name = if flatten && ((arity[0] > 1 && rdim > 1) || (arity[1] > 1 && cdim > 1)) {
        let ins = namer.name(&format!("{prefix}ins"));
        writeback.push(Stmt::Decl {
            ty: "double".to_string(),
            name: ins.clone(),
            dims: vec![size[0], size[1]],
            align: Some(16),
            init: None,
        });
        for (j, k, l, m) in iproduct!(0..arity[0], 0..rdim, 0..arity[1], 0..cdim) {
            writeback.push(Stmt::assign(
                format!("{ins}[{}][{}]", rdim * j + k, cdim * l + m),
                format!("{buf_name}[{}][{}]", arity[0] * k + j, arity[1] * m + l),
            ));
        }
        ins
    } else {
        buf_name.clone()
    };

    let local_maps: [IndexSeq; 2] = [local_maps.remove(0), local_maps.remove(0)];
    let (bcs_ops, mat_func, local_maps) =
        vfs_component_bcs(rmap, cmap, dims, &local_maps, namer, prefix);
    writeback.extend(bcs_ops);

    writeback.push(Stmt::Call {
        func: mat_func.to_string(),
        args: vec![
            mat_name.clone(),
            local_maps[0].size().to_string(),
            local_maps[0].expr().to_string(),
            local_maps[1].size().to_string(),
            local_maps[1].expr().to_string(),
            format!("(const PetscScalar *){ins_name}"),
            mode.to_string(),
        ],
    });

    // The local buffer must be rezeroed per layer when any map is layered.
    let wrapper = if offsets.iter().all(|o| o.is_none()) {
        ArgWrapper {
            init: [init, threaded.init].concat(),
            init_layer: threaded.init_layer,
            writeback: [threaded.writeback, writeback].concat(),
            post_writeback: threaded.post_writeback,
        }
    } else {
        ArgWrapper {
            init: threaded.init,
            init_layer: [init, threaded.init_layer].concat(),
            writeback: [threaded.writeback, writeback].concat(),
            post_writeback: threaded.post_writeback,
        }
    };
    Ok((wrapper, buf_name))
}

/// Mark/undo statement pairs for one boundary mask. Entries marked negative
/// are pushed out of the valid row range before insertion and restored
/// afterwards.
fn mask_statements(lmap: &str, mask: &[i64], shift: usize) -> (Vec<Stmt>, Vec<Stmt>) {
    let mut mark = vec![];
    let mut undo = vec![];
    for (i, neg) in mask.iter().enumerate() {
        if *neg < 0 {
            let slot = format!("{lmap}[{}]", shift + i);
            mark.push(Stmt::sub_assign(slot.clone(), "10000000"));
            undo.push(Stmt::add_assign(slot, "10000000"));
        }
    }
    (mark, undo)
}

/// Component-wise boundary conditions on vector fields.
///
/// Components to drop are encoded in the high bits of a negative map value,
/// `-(row + 1 + sum_i 2^(30 - i))` for dropped components `i`. The decode
/// loop recovers the row as `(~value) & ~0x70000000`, rewrites dropped
/// slots to the `-1` sentinel and expands the remaining rows to scalar
/// indices, switching from blocked to scalar insertion.
fn vfs_component_bcs(
    rmap: &MapDesc,
    cmap: &MapDesc,
    dims: (usize, usize),
    local_maps: &[IndexSeq; 2],
    namer: &mut Namer,
    prefix: &str,
) -> (Vec<Stmt>, &'static str, [IndexSeq; 2]) {
    if rmap.vector_index.is_none() && cmap.vector_index.is_none() {
        // Nothing to do here
        return (
            vec![],
            "MatSetValuesBlockedLocal",
            [local_maps[0].clone(), local_maps[1].clone()],
        );
    }

    let (rdim, cdim) = dims;
    let rowmap = namer.name(&format!("{prefix}rowmap"));
    let colmap = namer.name(&format!("{prefix}colmap"));
    // Scratch names go through the namer too; several matrix arguments may
    // decode in the same wrapper scope.
    let discard = namer.name("discard");
    let tmp = namer.name("tmp");
    let block_row = namer.name("block_row");
    let block_col = namer.name("block_col");
    let drop_full_row = i64::from(rmap.vector_index.is_none());
    let drop_full_col = i64::from(cmap.vector_index.is_none());

    let mut ops = vec![
        Stmt::decl_buf("int", &rowmap, rmap.arity * rdim),
        Stmt::decl_buf("int", &colmap, cmap.arity * cdim),
        Stmt::decl("int", &discard),
        Stmt::decl("int", &tmp),
        Stmt::decl("int", &block_row),
        Stmt::decl("int", &block_col),
    ];
    ops.push(decode_loop(
        &rowmap,
        local_maps[0].expr(),
        &block_row,
        &discard,
        &tmp,
        rmap.arity,
        rdim,
        drop_full_row,
    ));
    ops.push(decode_loop(
        &colmap,
        local_maps[1].expr(),
        &block_col,
        &discard,
        &tmp,
        cmap.arity,
        cdim,
        drop_full_col,
    ));

    let rmap_ = IndexSeq::slice(CType::Int, rowmap, rmap.arity * rdim);
    let cmap_ = IndexSeq::slice(CType::Int, colmap, cmap.arity * cdim);
    (ops, "MatSetValuesLocal", [rmap_, cmap_])
}

#[allow(clippy::too_many_arguments)]
fn decode_loop(
    out: &str,
    lmap: &str,
    block: &str,
    discard: &str,
    tmp: &str,
    nrows: usize,
    dim: usize,
    drop_full: i64,
) -> Stmt {
    Stmt::For {
        var: "j".to_string(),
        start: "0".to_string(),
        end: nrows.to_string(),
        body: vec![
            Stmt::assign(block, format!("({lmap})[j]")),
            Stmt::assign(discard, "0"),
            Stmt::If {
                cond: format!("{block} < 0"),
                body: vec![
                    Stmt::assign(tmp, format!("-({block} + 1)")),
                    Stmt::assign(discard, "1"),
                    Stmt::assign(block, format!("{tmp} & ~0x70000000")),
                ],
                orelse: vec![],
            },
            Stmt::For {
                var: "k".to_string(),
                start: "0".to_string(),
                end: dim.to_string(),
                body: vec![Stmt::If {
                    cond: format!(
                        "{discard} && ({drop_full} || (({tmp} & (1 << (30 - k))) != 0))"
                    ),
                    body: vec![Stmt::assign(format!("{out}[j*{dim} + k]"), "-1")],
                    orelse: vec![Stmt::assign(
                        format!("{out}[j*{dim} + k]"),
                        format!("({block})*{dim} + k"),
                    )],
                }],
            },
        ],
    }
}
