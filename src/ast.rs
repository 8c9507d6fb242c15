//! Loop-nest AST for the outer-product vectoriser.
//!
//! The vectoriser rewrites a small scalar loop nest, so unlike the wrapper
//! assembler it needs real structure to pattern-match on: loop variables,
//! bounds and increments, subscripted symbols, and an expression tree for
//! the accumulation leaf. Subscripts are `(variable, constant offset)`
//! pairs, which makes "this row, displaced by its position in the group"
//! an addition instead of string surgery.
//!
//! Vector statements (`VStmt`) and expressions (`VExpr`) model the AVX
//! double-precision subset the vectoriser emits; `Display` renders the
//! `_mm256_*` intrinsic forms.

use std::fmt;

/// A subscript: a loop variable plus constant offset, or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Index {
    Var { name: String, offset: usize },
    Lit(usize),
}

impl Index {
    pub fn var(name: &str) -> Index {
        Index::Var {
            name: name.to_string(),
            offset: 0,
        }
    }

    /// Same subscript displaced by `n`.
    pub fn displaced(&self, n: usize) -> Index {
        match self {
            Index::Var { name, offset } => Index::Var {
                name: name.clone(),
                offset: offset + n,
            },
            Index::Lit(i) => Index::Lit(i + n),
        }
    }

    /// The loop variable this subscript follows, if any.
    pub fn variable(&self) -> Option<&str> {
        match self {
            Index::Var { name, .. } => Some(name),
            Index::Lit(_) => None,
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Var { name, offset: 0 } => write!(f, "{name}"),
            Index::Var { name, offset } => write!(f, "{name} + {offset}"),
            Index::Lit(i) => write!(f, "{i}"),
        }
    }
}

/// A subscripted array reference, `name[i][j]...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub rank: Vec<Index>,
}

impl Symbol {
    pub fn new(name: &str, rank: Vec<Index>) -> Symbol {
        Symbol {
            name: name.to_string(),
            rank,
        }
    }

    /// The variable of the innermost (fastest-varying) subscript.
    pub fn last_var(&self) -> Option<&str> {
        self.rank.last().and_then(|i| i.variable())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for i in &self.rank {
            write!(f, "[{i}]")?;
        }
        Ok(())
    }
}

/// Scalar expression tree of an accumulation leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Sym(Symbol),
    Par(Box<ScalarExpr>),
    Add(Box<ScalarExpr>, Box<ScalarExpr>),
    Sub(Box<ScalarExpr>, Box<ScalarExpr>),
    Mul(Box<ScalarExpr>, Box<ScalarExpr>),
    Div(Box<ScalarExpr>, Box<ScalarExpr>),
}

impl ScalarExpr {
    pub fn sym(name: &str, rank: Vec<Index>) -> ScalarExpr {
        ScalarExpr::Sym(Symbol::new(name, rank))
    }

    pub fn mul(a: ScalarExpr, b: ScalarExpr) -> ScalarExpr {
        ScalarExpr::Mul(Box::new(a), Box::new(b))
    }

    pub fn add(a: ScalarExpr, b: ScalarExpr) -> ScalarExpr {
        ScalarExpr::Add(Box::new(a), Box::new(b))
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Sym(s) => write!(f, "{s}"),
            ScalarExpr::Par(e) => write!(f, "({e})"),
            ScalarExpr::Add(a, b) => write!(f, "{a} + {b}"),
            ScalarExpr::Sub(a, b) => write!(f, "{a} - {b}"),
            ScalarExpr::Mul(a, b) => write!(f, "{a} * {b}"),
            ScalarExpr::Div(a, b) => write!(f, "{a} / {b}"),
        }
    }
}

/// A counted loop, `for (int var = start; var < bound; var += incr)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub var: String,
    pub start: usize,
    pub bound: usize,
    pub incr: usize,
    pub body: Vec<Node>,
}

impl ForLoop {
    pub fn new(var: &str, bound: usize, body: Vec<Node>) -> ForLoop {
        ForLoop {
            var: var.to_string(),
            start: 0,
            bound,
            incr: 1,
            body,
        }
    }

    pub fn size(&self) -> usize {
        self.bound - self.start
    }
}

/// One node of a loop-nest body.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Loop(ForLoop),
    /// Accumulation leaf, `tensor += expr;`
    Incr { tensor: Symbol, expr: ScalarExpr },
    Vector(VStmt),
}

/// A vector (intrinsic-level) statement.
#[derive(Debug, Clone, PartialEq)]
pub enum VStmt {
    /// `__m256d reg = init;`
    Decl { reg: String, init: VExpr },
    /// `reg = rhs;`
    Assign { reg: String, rhs: VExpr },
    /// `_mm256_store_pd (&dst, src);`
    Store { dst: Symbol, src: VExpr },
}

/// A vector expression over 4-lane double registers.
#[derive(Debug, Clone, PartialEq)]
pub enum VExpr {
    Reg(String),
    Load(Symbol),
    SetZero,
    Add(Box<VExpr>, Box<VExpr>),
    Sub(Box<VExpr>, Box<VExpr>),
    Mul(Box<VExpr>, Box<VExpr>),
    Div(Box<VExpr>, Box<VExpr>),
    Unpackhi(Box<VExpr>, Box<VExpr>),
    Unpacklo(Box<VExpr>, Box<VExpr>),
    /// `_mm256_permute2f128_pd`, cross-lane 128-bit selection
    Perm2f128(Box<VExpr>, Box<VExpr>, u8),
    /// `_mm256_permute_pd`, in-lane element permutation
    Permute(Box<VExpr>, u8),
}

impl VExpr {
    pub fn reg(name: &str) -> VExpr {
        VExpr::Reg(name.to_string())
    }

    pub fn add(a: VExpr, b: VExpr) -> VExpr {
        VExpr::Add(Box::new(a), Box::new(b))
    }

    pub fn mul(a: VExpr, b: VExpr) -> VExpr {
        VExpr::Mul(Box::new(a), Box::new(b))
    }
}

impl fmt::Display for VExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VExpr::Reg(r) => write!(f, "{r}"),
            VExpr::Load(s) => write!(f, "_mm256_load_pd (&{s})"),
            VExpr::SetZero => write!(f, "_mm256_setzero_pd ()"),
            VExpr::Add(a, b) => write!(f, "_mm256_add_pd ({a}, {b})"),
            VExpr::Sub(a, b) => write!(f, "_mm256_sub_pd ({a}, {b})"),
            VExpr::Mul(a, b) => write!(f, "_mm256_mul_pd ({a}, {b})"),
            VExpr::Div(a, b) => write!(f, "_mm256_div_pd ({a}, {b})"),
            VExpr::Unpackhi(a, b) => write!(f, "_mm256_unpackhi_pd ({a}, {b})"),
            VExpr::Unpacklo(a, b) => write!(f, "_mm256_unpacklo_pd ({a}, {b})"),
            VExpr::Perm2f128(a, b, imm) => {
                write!(f, "_mm256_permute2f128_pd ({a}, {b}, {imm})")
            }
            VExpr::Permute(a, imm) => write!(f, "_mm256_permute_pd ({a}, {imm})"),
        }
    }
}

impl fmt::Display for VStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VStmt::Decl { reg, init } => write!(f, "__m256d {reg} = {init};"),
            VStmt::Assign { reg, rhs } => write!(f, "{reg} = {rhs};"),
            VStmt::Store { dst, src } => write!(f, "_mm256_store_pd (&{dst}, {src});"),
        }
    }
}

fn render_into(node: &Node, out: &mut String, depth: usize) {
    let pad = "\t".repeat(depth);
    match node {
        Node::Loop(l) => {
            let step = if l.incr == 1 {
                format!("{}++", l.var)
            } else {
                format!("{} += {}", l.var, l.incr)
            };
            out.push_str(&format!(
                "{pad}for (int {var} = {start}; {var} < {bound}; {step}) {{\n",
                var = l.var,
                start = l.start,
                bound = l.bound,
            ));
            for n in &l.body {
                render_into(n, out, depth + 1);
            }
            out.push_str(&format!("{pad}}}\n"));
        }
        Node::Incr { tensor, expr } => {
            out.push_str(&format!("{pad}{tensor} += {expr};\n"));
        }
        Node::Vector(v) => {
            out.push_str(&format!("{pad}{v}\n"));
        }
    }
}

/// Renders nodes as C source text.
pub fn render(nodes: &[Node], depth: usize) -> String {
    let mut out = String::new();
    for n in nodes {
        render_into(n, &mut out, depth);
    }
    out
}
