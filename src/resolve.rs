//! Indirection resolution: from a map to the array slots an argument touches.
//!
//! Given a map buffer name, its arity and optional per-entry layer offsets,
//! `map_vec` produces the index sequence identifying the target-array rows a
//! kernel argument touches at the current iteration point, plus the offset
//! table handed to whichever layer-access strategy is active. `indices`
//! expands row indices by a field's component count.

use crate::algebra::{add, concat, deref, CType, IndexSeq};
use crate::errors::WrapperError;

/// Resolves map entries for the current iteration point.
///
/// Returns a sequence of length `arity` (or 1 when `iteration_index`
/// selects a single row) holding row indices into the mapped target array,
/// and the layer-offset table for the active layer-access strategy. A map
/// with absent or all-zero offsets is layer-irrelevant, signalled by a
/// `None` offset component so the layer strategies take their no-op path.
///
/// When `is_facet` is set, the argument sees both sides of an interior
/// facet: the row indices are doubled (original rows, then the same rows
/// shifted by their offsets) and the offset table is doubled accordingly.
pub fn map_vec(
    map_name: &str,
    arity: usize,
    offset: Option<&[i64]>,
    iteration_index: Option<usize>,
    element_index: &str,
    is_facet: bool,
) -> Result<(IndexSeq, Option<Vec<i64>>), WrapperError> {
    let g_map = IndexSeq::singleton(CType::Int.ptr(), map_name);
    let row = IndexSeq::range(CType::Int, format!("{element_index}*{arity}"), arity);
    let mut l_map = deref(&add(&g_map, &row)?)?;

    if let Some(k) = iteration_index {
        l_map = IndexSeq::list(l_map.ty().clone(), vec![l_map.as_list()[k].clone()]);
    }

    let offset = match offset {
        Some(off) if off.iter().any(|&o| o != 0) => off,
        _ => return Ok((l_map, None)),
    };

    if arity != offset.len() {
        return Err(WrapperError::ShapeMismatch {
            expected: arity,
            got: offset.len(),
        });
    }

    let offset: Vec<i64> = match iteration_index {
        Some(k) => vec![offset[k]],
        None => offset.to_vec(),
    };

    if !is_facet {
        Ok((l_map, Some(offset)))
    } else {
        let shift = IndexSeq::list(
            CType::Int,
            offset.iter().map(|o| o.to_string()).collect(),
        );
        let far_side = add(&l_map, &shift)?;
        let doubled = concat(&l_map, &[&far_side])?;
        let mut off2 = offset.clone();
        off2.extend(offset);
        Ok((doubled, Some(off2)))
    }
}

/// Expands row indices by a field's component count.
///
/// A single row expands to a `Range` of `dim` consecutive slots; for
/// multiple rows the expansion order depends on `flatten` (component-major
/// when flattened, row-major otherwise).
pub fn indices(dim: usize, map_vec: &IndexSeq, flatten: bool) -> IndexSeq {
    if map_vec.size() == 1 {
        let start = format!("({})*{dim}", map_vec.as_list()[0]);
        return IndexSeq::range(map_vec.ty().clone(), start, dim);
    }
    if dim == 1 {
        return map_vec.clone();
    }

    let items = map_vec.as_list();
    let ordering: Vec<(usize, usize)> = if flatten {
        (0..dim)
            .flat_map(|d| (0..items.len()).map(move |i| (i, d)))
            .collect()
    } else {
        (0..items.len())
            .flat_map(|i| (0..dim).map(move |d| (i, d)))
            .collect()
    };
    IndexSeq::list(
        map_vec.ty().clone(),
        ordering
            .into_iter()
            .map(|(i, d)| format!("({})*{dim} + {d}", items[i]))
            .collect(),
    )
}
