//! Outer-product vectorisation of bilinear-form accumulation loops.
//!
//! Rewrites a scalar loop nest whose leaf is `A[j][k] += expr` into AVX
//! intrinsic statements, treating the trip count of the `j` loop as the
//! lane dimension. The transformation proceeds in row groups of the vector
//! width: each group computes one register of products per row, and between
//! groups the registers holding `k`-dependent operands are permuted so the
//! next group's rows land in the right lanes. Accumulation is lane-permuted
//! until a final unpack/permute sequence restores the tensor's row-major
//! layout.
//!
//! Two accumulation modes exist, selected by where the leaf sits:
//!
//! - `Stores`: the outer-product loops are the innermost of the nest, so
//!   each group loads, adds and stores its tensor slots directly; a
//!   separate layout pass after the whole nest undoes the permutation.
//! - `LocalIncrements`: deeper loops run under the outer-product loops, so
//!   partial sums stay live in one register per row across those loops and
//!   are flushed (with inline layout restoration) at the end of the inner
//!   outer-product loop body, avoiding a memory round trip per iteration.
//!
//! Rows beyond a multiple of the vector width are handled by peeling a
//! scalar remainder loop, or left to array padding when peeling is off.

use std::collections::{HashMap, VecDeque};

use crate::ast::{ForLoop, Index, Node, ScalarExpr, Symbol, VExpr, VStmt};
use crate::errors::VectoriseError;

/// Instruction-set parameters of the vector unit.
#[derive(Debug, Clone)]
pub struct InstrSet {
    /// Doubles per vector register
    pub vect_len: usize,
    /// Architectural register count
    pub avail_reg: usize,
    /// Load/store alignment in bytes
    pub alignment: usize,
}

impl InstrSet {
    pub fn avx() -> InstrSet {
        InstrSet {
            vect_len: 4,
            avail_reg: 16,
            alignment: 32,
        }
    }

    fn reg(n: usize) -> String {
        format!("ymm{n}")
    }
}

/// How vectorised groups accumulate into the tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stores,
    LocalIncrements,
}

/// Vectorisation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectOpts {
    /// Peel a scalar remainder loop when the row count is not a multiple
    /// of the vector width; otherwise rely on padded arrays.
    pub peel: bool,
}

/// The transformed program: the rewritten nest, with the peeled remainder
/// spliced in and the layout-restoration nest appended where applicable.
#[derive(Debug, Clone)]
pub struct Vectorised {
    pub nodes: Vec<Node>,
    pub mode: Mode,
}

/// Register pool: a fixed block of tensor registers and a growable scratch
/// pool handed out front-first and freed back to the front, so release
/// order mirrors allocation order.
struct RegAlloc {
    tensor: Vec<String>,
    scratch: VecDeque<String>,
    ntot: usize,
}

impl RegAlloc {
    fn new(isa: &InstrSet) -> RegAlloc {
        RegAlloc {
            tensor: (0..isa.vect_len).map(InstrSet::reg).collect(),
            scratch: (isa.vect_len..isa.avail_reg).map(InstrSet::reg).collect(),
            ntot: isa.avail_reg,
        }
    }

    fn get_reg(&mut self) -> String {
        if self.scratch.is_empty() {
            // Spilling is the compiler's problem; just keep naming.
            let grown = self.ntot * 2;
            self.scratch.extend((self.ntot..grown).map(InstrSet::reg));
            self.ntot = grown;
        }
        self.scratch.pop_front().unwrap_or_default()
    }

    fn free_reg(&mut self, reg: String) {
        self.scratch.push_front(reg);
    }
}

/// Vectorises the outer-product loops `outer_var`/`inner_var` of `nest`.
///
/// The leaf statement must be a single accumulation into a tensor whose
/// first subscript follows `outer_var`. Returns the complete transformed
/// program; the input nest is not modified.
pub fn outer_product(
    nest: &ForLoop,
    outer_var: &str,
    inner_var: &str,
    isa: &InstrSet,
    opts: VectOpts,
) -> Result<Vectorised, VectoriseError> {
    let outer = find_loop(nest, outer_var)
        .ok_or_else(|| VectoriseError::MissingLoop(outer_var.to_string()))?;
    let inner = find_loop(outer, inner_var)
        .filter(|l| l.var != outer.var)
        .ok_or_else(|| VectoriseError::MissingLoop(inner_var.to_string()))?;
    let (tensor, expr) = find_incr(&inner.body).ok_or(VectoriseError::MissingStatement)?;
    let mode = if inner.body.iter().any(|n| matches!(n, Node::Incr { .. })) {
        Mode::Stores
    } else {
        Mode::LocalIncrements
    };

    let rows = outer.size();
    let vect_len = isa.vect_len;
    let width = rows.min(vect_len);
    let peel = opts.peel && rows > vect_len && rows % vect_len != 0;
    let main_bound = if peel { rows - rows % vect_len } else { rows };

    let mut gen = Generator {
        isa,
        outer_var,
        inner_var,
        inner_bound: inner.bound,
        tensor: tensor.clone(),
        expr: expr.clone(),
        regs: RegAlloc::new(isa),
        decls: HashMap::new(),
        vrs: vec![],
    };
    let (group_stmts, accs) = gen.generate(width, mode);

    // Rebuild the nest around the generated statements.
    let mut root = nest.clone();
    {
        let outer = find_loop_mut(&mut root, outer_var).ok_or_else(|| {
            VectoriseError::MissingLoop(outer_var.to_string())
        })?;
        outer.incr = width;
        outer.bound = main_bound;
        let inner = find_loop_mut(outer, inner_var)
            .ok_or_else(|| VectoriseError::MissingLoop(inner_var.to_string()))?;
        inner.incr = vect_len;
        match mode {
            Mode::Stores => inner.body = group_stmts,
            Mode::LocalIncrements => {
                replace_incr(&mut inner.body, group_stmts);
                let mut body: Vec<Node> = accs
                    .iter()
                    .map(|(_, reg)| {
                        Node::Vector(VStmt::Decl {
                            reg: reg.clone(),
                            init: VExpr::SetZero,
                        })
                    })
                    .collect();
                body.append(&mut inner.body);
                body.extend(gen.flush(&accs, width));
                inner.body = body;
            }
        }
    }

    // Scalar remainder, spliced right after the vectorised outer loop.
    if peel {
        let mut remainder = find_loop(nest, outer_var)
            .ok_or_else(|| VectoriseError::MissingLoop(outer_var.to_string()))?
            .clone();
        remainder.start = main_bound;
        if root.var == outer_var {
            let mut nodes = vec![Node::Loop(root), Node::Loop(remainder)];
            nodes.extend(gen.layout(mode, main_bound));
            return Ok(Vectorised { nodes, mode });
        }
        let parent = parent_body(&mut root.body, outer_var)
            .ok_or_else(|| VectoriseError::MissingLoop(outer_var.to_string()))?;
        let at = parent
            .iter()
            .position(|n| matches!(n, Node::Loop(l) if l.var == outer_var))
            .unwrap_or(parent.len());
        parent.insert(at + 1, Node::Loop(remainder));
    }

    let mut nodes = vec![Node::Loop(root)];
    nodes.extend(gen.layout(mode, main_bound));
    Ok(Vectorised { nodes, mode })
}

/// The loop with this variable, searching `nest` itself and its subtree.
fn find_loop<'a>(nest: &'a ForLoop, var: &str) -> Option<&'a ForLoop> {
    if nest.var == var {
        return Some(nest);
    }
    nest.body.iter().find_map(|n| match n {
        Node::Loop(l) => find_loop(l, var),
        _ => None,
    })
}

fn find_loop_mut<'a>(nest: &'a mut ForLoop, var: &str) -> Option<&'a mut ForLoop> {
    if nest.var == var {
        return Some(nest);
    }
    nest.body.iter_mut().find_map(|n| match n {
        Node::Loop(l) => find_loop_mut(l, var),
        _ => None,
    })
}

/// The body directly containing the loop over `var`.
fn parent_body<'a>(body: &'a mut Vec<Node>, var: &str) -> Option<&'a mut Vec<Node>> {
    if body
        .iter()
        .any(|n| matches!(n, Node::Loop(l) if l.var == var))
    {
        return Some(body);
    }
    body.iter_mut().find_map(|n| match n {
        Node::Loop(l) => parent_body(&mut l.body, var),
        _ => None,
    })
}

/// The single accumulation leaf under `body`.
fn find_incr(body: &[Node]) -> Option<(&Symbol, &ScalarExpr)> {
    body.iter().find_map(|n| match n {
        Node::Incr { tensor, expr } => Some((tensor, expr)),
        Node::Loop(l) => find_incr(&l.body),
        Node::Vector(_) => None,
    })
}

/// Replaces the accumulation leaf in place with the given statements.
fn replace_incr(body: &mut Vec<Node>, stmts: Vec<Node>) -> bool {
    if let Some(at) = body.iter().position(|n| matches!(n, Node::Incr { .. })) {
        body.splice(at..=at, stmts);
        return true;
    }
    for n in body.iter_mut() {
        if let Node::Loop(l) = n {
            if replace_incr(&mut l.body, stmts.clone()) {
                return true;
            }
        }
    }
    false
}

struct Generator<'a> {
    isa: &'a InstrSet,
    outer_var: &'a str,
    inner_var: &'a str,
    inner_bound: usize,
    tensor: Symbol,
    expr: ScalarExpr,
    regs: RegAlloc,
    /// Symbol text to register, for operands already loaded
    decls: HashMap<String, String>,
    /// Allocation order of operand registers, with their symbols
    vrs: Vec<(Symbol, String)>,
}

impl Generator<'_> {
    /// Emits the grouped vector statements covering `width` tensor rows.
    /// For `LocalIncrements` also returns the accumulator register per row.
    fn generate(&mut self, width: usize, mode: Mode) -> (Vec<Node>, Vec<(usize, String)>) {
        let cols = self.isa.vect_len;
        let rows_per_group = width / cols;
        let extra = width % cols;
        let mut granted = 0;
        let mut out = vec![];
        let mut accs = vec![];

        for i in 0..cols {
            // Round-robin the leftover rows over the leading groups.
            let nrows = if granted < extra {
                granted += 1;
                rows_per_group + 1
            } else {
                rows_per_group
            };
            for j in 0..nrows {
                let ofs = j * cols;
                let expr = self.expr.clone();
                let value = self.vect_expr(&expr, ofs);
                self.emit_loads(&mut out);
                let row = i + ofs;
                match mode {
                    Mode::Stores => {
                        let target = self.tensor_row(row);
                        out.push(Node::Vector(VStmt::Store {
                            dst: target.clone(),
                            src: VExpr::add(VExpr::Load(target), value),
                        }));
                    }
                    Mode::LocalIncrements => {
                        let reg = self.regs.get_reg();
                        accs.push((row, reg.clone()));
                        out.push(Node::Vector(VStmt::Assign {
                            rhs: VExpr::add(VExpr::reg(&reg), value),
                            reg,
                        }));
                    }
                }
            }
            if rows_per_group + (extra - granted) > 0 {
                self.swap_regs(i, &mut out);
            }
        }
        (out, accs)
    }

    /// The tensor reference for one group row: first subscript displaced.
    fn tensor_row(&self, row: usize) -> Symbol {
        let mut rank = self.tensor.rank.clone();
        if let Some(first) = rank.first_mut() {
            *first = first.displaced(row);
        }
        Symbol {
            name: self.tensor.name.clone(),
            rank,
        }
    }

    /// Maps a scalar expression to its vector equivalent, allocating one
    /// register per distinct operand text. Operands following the outer
    /// loop variable are displaced by the row offset first.
    fn vect_expr(&mut self, expr: &ScalarExpr, ofs: usize) -> VExpr {
        match expr {
            ScalarExpr::Sym(s) => {
                let mut s = s.clone();
                if ofs > 0 && s.last_var() == Some(self.outer_var) {
                    let last = s.rank.len() - 1;
                    s.rank[last] = s.rank[last].displaced(ofs);
                }
                let key = s.to_string();
                if let Some(reg) = self.decls.get(&key) {
                    return VExpr::reg(reg);
                }
                if let Some((_, reg)) = self.vrs.iter().find(|(sym, _)| sym.to_string() == key) {
                    return VExpr::reg(reg);
                }
                let reg = self.regs.get_reg();
                self.vrs.push((s, reg.clone()));
                VExpr::Reg(reg)
            }
            ScalarExpr::Par(e) => self.vect_expr(e, ofs),
            ScalarExpr::Add(a, b) => {
                VExpr::Add(Box::new(self.vect_expr(a, ofs)), Box::new(self.vect_expr(b, ofs)))
            }
            ScalarExpr::Sub(a, b) => {
                VExpr::Sub(Box::new(self.vect_expr(a, ofs)), Box::new(self.vect_expr(b, ofs)))
            }
            ScalarExpr::Mul(a, b) => {
                VExpr::Mul(Box::new(self.vect_expr(a, ofs)), Box::new(self.vect_expr(b, ofs)))
            }
            ScalarExpr::Div(a, b) => {
                VExpr::Div(Box::new(self.vect_expr(a, ofs)), Box::new(self.vect_expr(b, ofs)))
            }
        }
    }

    /// Declares loads for operand registers not yet materialized.
    fn emit_loads(&mut self, out: &mut Vec<Node>) {
        for (sym, reg) in &self.vrs {
            let key = sym.to_string();
            if !self.decls.contains_key(&key) {
                self.decls.insert(key, reg.clone());
                out.push(Node::Vector(VStmt::Decl {
                    reg: reg.clone(),
                    init: VExpr::Load(sym.clone()),
                }));
            }
        }
    }

    /// Realigns lanes of the inner-variable operands for the next group.
    fn swap_regs(&mut self, step: usize, out: &mut Vec<Node>) {
        let regs: Vec<String> = self
            .vrs
            .iter()
            .filter(|(sym, _)| sym.last_var() == Some(self.inner_var))
            .map(|(_, reg)| reg.clone())
            .collect();
        for reg in regs {
            let rhs = match step % 4 {
                0 | 2 => VExpr::Permute(Box::new(VExpr::reg(&reg)), 5),
                1 => VExpr::Perm2f128(Box::new(VExpr::reg(&reg)), Box::new(VExpr::reg(&reg)), 1),
                _ => continue,
            };
            out.push(Node::Vector(VStmt::Assign { reg, rhs }));
        }
    }

    /// The fixed unpack/permute sequence inverting the group interleaving.
    /// `t` are the four live registers in group order; returns statements
    /// leaving row `base + i` restored in `t[i]`.
    fn restore_sequence(&mut self, t: &[String; 4], out: &mut Vec<Node>) -> [String; 4] {
        let tmp: Vec<String> = (0..4).map(|_| self.regs.get_reg()).collect();
        let decl = |reg: &str, init: VExpr| {
            Node::Vector(VStmt::Decl {
                reg: reg.to_string(),
                init,
            })
        };
        let assign = |reg: &str, rhs: VExpr| {
            Node::Vector(VStmt::Assign {
                reg: reg.to_string(),
                rhs,
            })
        };
        let r = |name: &str| VExpr::reg(name);

        out.push(decl(&tmp[0], VExpr::Unpackhi(Box::new(r(&t[1])), Box::new(r(&t[0])))));
        out.push(decl(&tmp[1], VExpr::Unpacklo(Box::new(r(&t[0])), Box::new(r(&t[1])))));
        out.push(decl(&tmp[2], VExpr::Unpackhi(Box::new(r(&t[2])), Box::new(r(&t[3])))));
        out.push(decl(&tmp[3], VExpr::Unpacklo(Box::new(r(&t[3])), Box::new(r(&t[2])))));
        out.push(assign(&t[0], VExpr::Perm2f128(Box::new(r(&tmp[1])), Box::new(r(&tmp[3])), 32)));
        out.push(assign(&t[1], VExpr::Perm2f128(Box::new(r(&tmp[0])), Box::new(r(&tmp[2])), 32)));
        out.push(assign(&t[2], VExpr::Perm2f128(Box::new(r(&tmp[3])), Box::new(r(&tmp[1])), 49)));
        out.push(assign(&t[3], VExpr::Perm2f128(Box::new(r(&tmp[2])), Box::new(r(&tmp[0])), 49)));
        for reg in tmp.into_iter().rev() {
            self.regs.free_reg(reg);
        }
        t.clone()
    }

    /// `LocalIncrements` epilogue: restore the layout of the live
    /// accumulators chunk by chunk and store them, padding short chunks
    /// with zeroed registers.
    fn flush(&mut self, accs: &[(usize, String)], width: usize) -> Vec<Node> {
        let cols = self.isa.vect_len;
        let chunks = width.div_ceil(cols);
        let by_row: HashMap<usize, &String> = accs.iter().map(|(r, reg)| (*r, reg)).collect();
        let mut out = vec![];
        for c in 0..chunks {
            let mut t: Vec<String> = vec![];
            let mut pads = vec![];
            for i in 0..cols {
                match by_row.get(&(c * cols + i)) {
                    Some(reg) => t.push((*reg).clone()),
                    None => {
                        let pad = self.regs.get_reg();
                        out.push(Node::Vector(VStmt::Decl {
                            reg: pad.clone(),
                            init: VExpr::SetZero,
                        }));
                        t.push(pad.clone());
                        pads.push(pad);
                    }
                }
            }
            let t: [String; 4] = match t.try_into() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let t = self.restore_sequence(&t, &mut out);
            for (i, reg) in t.iter().enumerate() {
                let row = c * cols + i;
                if row < width {
                    out.push(Node::Vector(VStmt::Store {
                        dst: self.tensor_row(row),
                        src: VExpr::reg(reg),
                    }));
                }
            }
            for pad in pads.into_iter().rev() {
                self.regs.free_reg(pad);
            }
        }
        out
    }

    /// `Stores` epilogue: a fresh copy of the outer-product loops stepping
    /// a whole register block at a time, loading each block, restoring its
    /// layout and storing it back.
    fn layout(&mut self, mode: Mode, bound: usize) -> Vec<Node> {
        if mode != Mode::Stores {
            return vec![];
        }
        let cols = self.isa.vect_len;
        let regs = RegAlloc::new(self.isa);
        let t: [String; 4] = match regs.tensor.clone().try_into() {
            Ok(t) => t,
            Err(_) => return vec![],
        };
        self.regs = regs;

        let mut body = vec![];
        for (i, reg) in t.iter().enumerate() {
            body.push(Node::Vector(VStmt::Decl {
                reg: reg.clone(),
                init: VExpr::Load(self.tensor_row(i)),
            }));
        }
        let t = self.restore_sequence(&t, &mut body);
        for (i, reg) in t.iter().enumerate() {
            body.push(Node::Vector(VStmt::Store {
                dst: self.tensor_row(i),
                src: VExpr::reg(reg),
            }));
        }

        let inner = ForLoop {
            var: self.inner_var.to_string(),
            start: 0,
            bound: self.inner_bound,
            incr: cols,
            body,
        };
        vec![Node::Loop(ForLoop {
            var: self.outer_var.to_string(),
            start: 0,
            bound,
            incr: cols,
            body: vec![Node::Loop(inner)],
        })]
    }
}
