//! A tiny interpreter for emitted wrapper statements, test-only.
//!
//! Generated code is data until something executes it. Rather than shelling
//! out to a C compiler, tests run statement lists on `Machine`: a heap of
//! named buffers, a scalar environment and a recursive-descent evaluator
//! for the expression subset the index algebra emits (arithmetic, pointer
//! offset and dereference, indexing, comparisons, bit operations). Kernels
//! are plain functions registered by name and invoked by `Call` statements
//! with their evaluated arguments.

use std::collections::HashMap;

use crate::ast::{Index, Node, ScalarExpr, Symbol, VExpr, VStmt};
use crate::emit::{AssignOp, Stmt};

/// A runtime value: an integer, a double, or a pointer into a named buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Int(i64),
    F64(f64),
    Ptr(String, i64),
}

impl Val {
    pub fn as_int(&self) -> Result<i64, String> {
        match self {
            Val::Int(i) => Ok(*i),
            other => Err(format!("expected int, got {other:?}")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, String> {
        match self {
            Val::F64(x) => Ok(*x),
            Val::Int(i) => Ok(*i as f64),
            other => Err(format!("expected double, got {other:?}")),
        }
    }

    /// Pointer displaced by `i` slots.
    pub fn offset(&self, i: i64) -> Result<Val, String> {
        match self {
            Val::Ptr(name, off) => Ok(Val::Ptr(name.clone(), off + i)),
            other => Err(format!("cannot offset {other:?}")),
        }
    }
}

pub type KernelFn = fn(&mut Machine, &[Val]) -> Result<(), String>;

/// An assignable location: a scalar variable or a heap slot.
enum Place {
    Scalar(String),
    Heap(String, i64),
}

#[derive(Default)]
pub struct Machine {
    heap: HashMap<String, Vec<Val>>,
    scalars: HashMap<String, Val>,
    kernels: HashMap<String, KernelFn>,
}

impl Machine {
    pub fn new() -> Machine {
        Machine::default()
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.scalars.insert(name.to_string(), Val::Int(value));
    }

    pub fn alloc_int(&mut self, name: &str, values: Vec<i64>) {
        self.heap
            .insert(name.to_string(), values.into_iter().map(Val::Int).collect());
    }

    pub fn alloc_f64(&mut self, name: &str, values: Vec<f64>) {
        self.heap
            .insert(name.to_string(), values.into_iter().map(Val::F64).collect());
    }

    pub fn register(&mut self, name: &str, kernel: KernelFn) {
        self.kernels.insert(name.to_string(), kernel);
    }

    pub fn load(&self, ptr: &Val) -> Result<Val, String> {
        match ptr {
            Val::Ptr(name, off) => self
                .heap
                .get(name)
                .and_then(|buf| buf.get(*off as usize))
                .cloned()
                .ok_or_else(|| format!("load out of bounds: {name}[{off}]")),
            other => Err(format!("load through non-pointer {other:?}")),
        }
    }

    pub fn store(&mut self, ptr: &Val, value: Val) -> Result<(), String> {
        match ptr {
            Val::Ptr(name, off) => {
                let slot = self
                    .heap
                    .get_mut(name)
                    .and_then(|buf| buf.get_mut(*off as usize))
                    .ok_or_else(|| format!("store out of bounds: {name}[{off}]"))?;
                *slot = value;
                Ok(())
            }
            other => Err(format!("store through non-pointer {other:?}")),
        }
    }

    /// Evaluates a C expression in the current environment.
    pub fn eval(&self, src: &str) -> Result<Val, String> {
        let expr = parse(src)?;
        self.eval_expr(&expr)
    }

    /// Reads slot `i` of the buffer an expression points at, as an integer.
    pub fn read_int(&self, src: &str, i: usize) -> i64 {
        self.read(src, i).and_then(|v| v.as_int()).unwrap()
    }

    /// Reads slot `i` of the buffer an expression points at, as a double.
    pub fn read_f64(&self, src: &str, i: usize) -> f64 {
        self.read(src, i).and_then(|v| v.as_f64()).unwrap()
    }

    fn read(&self, src: &str, i: usize) -> Result<Val, String> {
        let base = self.eval(src)?;
        let slot = add_vals(&base, &Val::Int(i as i64))?;
        self.load(&slot)
    }

    pub fn exec_all(&mut self, stmts: &[Stmt]) -> Result<(), String> {
        for s in stmts {
            self.exec(s)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), String> {
        match stmt {
            Stmt::Decl {
                ty,
                name,
                dims,
                init,
                ..
            } => {
                if dims.is_empty() {
                    let value = match init {
                        Some(src) => self.eval(src)?,
                        None => zero_of(ty),
                    };
                    self.scalars.insert(name.clone(), value);
                } else {
                    // Aggregate initializers only ever zero-fill.
                    let len = dims.iter().product();
                    self.heap.insert(name.clone(), vec![zero_of(ty); len]);
                }
                Ok(())
            }
            Stmt::Assign { lhs, op, rhs } => {
                let rhs = self.eval(rhs)?;
                let place = self.eval_place(lhs)?;
                let old = match &place {
                    Place::Scalar(name) => self
                        .scalars
                        .get(name)
                        .cloned()
                        .ok_or_else(|| format!("unknown scalar {name}"))?,
                    Place::Heap(name, off) => self.load(&Val::Ptr(name.clone(), *off))?,
                };
                let new = match op {
                    AssignOp::Set => rhs,
                    AssignOp::Add => add_vals(&old, &rhs)?,
                    AssignOp::Sub => sub_vals(&old, &rhs)?,
                };
                match place {
                    Place::Scalar(name) => {
                        self.scalars.insert(name, new);
                    }
                    Place::Heap(name, off) => self.store(&Val::Ptr(name, off), new)?,
                }
                Ok(())
            }
            Stmt::Call { func, args } => {
                let kernel = *self
                    .kernels
                    .get(func)
                    .ok_or_else(|| format!("unknown kernel {func}"))?;
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a)?);
                }
                kernel(self, &values)
            }
            Stmt::If { cond, body, orelse } => {
                if truthy(&self.eval(cond)?) {
                    self.exec_all(body)
                } else {
                    self.exec_all(orelse)
                }
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                let start = self.eval(start)?.as_int()?;
                let end = self.eval(end)?.as_int()?;
                for n in start..end {
                    self.scalars.insert(var.clone(), Val::Int(n));
                    self.exec_all(body)?;
                }
                Ok(())
            }
        }
    }

    fn eval_expr(&self, expr: &Expr) -> Result<Val, String> {
        match expr {
            Expr::Int(i) => Ok(Val::Int(*i)),
            Expr::Float(x) => Ok(Val::F64(*x)),
            Expr::Ident(name) => {
                if self.heap.contains_key(name) {
                    Ok(Val::Ptr(name.clone(), 0))
                } else {
                    self.scalars
                        .get(name)
                        .cloned()
                        .ok_or_else(|| format!("unknown identifier {name}"))
                }
            }
            Expr::Unary(op, inner) => {
                let v = self.eval_expr(inner)?;
                match op {
                    UnOp::Neg => match v {
                        Val::Int(i) => Ok(Val::Int(-i)),
                        Val::F64(x) => Ok(Val::F64(-x)),
                        other => Err(format!("cannot negate {other:?}")),
                    },
                    UnOp::Deref => self.load(&v),
                    UnOp::BitNot => Ok(Val::Int(!v.as_int()?)),
                    UnOp::Not => Ok(Val::Int(i64::from(!truthy(&v)))),
                }
            }
            Expr::Index(base, idx) => {
                let base = self.eval_expr(base)?;
                let idx = self.eval_expr(idx)?;
                self.load(&add_vals(&base, &idx)?)
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval_expr(lhs)?;
                let b = self.eval_expr(rhs)?;
                binary(*op, &a, &b)
            }
        }
    }

    /// Resolves an lvalue expression to an assignable location.
    fn eval_place(&self, src: &str) -> Result<Place, String> {
        let expr = parse(src)?;
        self.place_of(&expr)
    }

    fn place_of(&self, expr: &Expr) -> Result<Place, String> {
        match expr {
            Expr::Ident(name) => Ok(Place::Scalar(name.clone())),
            Expr::Unary(UnOp::Deref, inner) => match self.eval_expr(inner)? {
                Val::Ptr(name, off) => Ok(Place::Heap(name, off)),
                other => Err(format!("cannot assign through {other:?}")),
            },
            Expr::Index(base, idx) => {
                let base = self.eval_expr(base)?;
                let idx = self.eval_expr(idx)?.as_int()?;
                match base {
                    Val::Ptr(name, off) => Ok(Place::Heap(name, off + idx)),
                    other => Err(format!("cannot index {other:?}")),
                }
            }
            other => Err(format!("not an lvalue: {other:?}")),
        }
    }
}

fn zero_of(ty: &str) -> Val {
    if ty.trim_end_matches('*') == "int" && !ty.contains('*') {
        Val::Int(0)
    } else if ty.contains('*') {
        // Pointer buffers start unset; any slot must be assigned before use.
        Val::Int(0)
    } else {
        Val::F64(0.0)
    }
}

fn truthy(v: &Val) -> bool {
    match v {
        Val::Int(i) => *i != 0,
        Val::F64(x) => *x != 0.0,
        Val::Ptr(..) => true,
    }
}

fn add_vals(a: &Val, b: &Val) -> Result<Val, String> {
    match (a, b) {
        (Val::Int(x), Val::Int(y)) => Ok(Val::Int(x + y)),
        (Val::Ptr(name, off), Val::Int(i)) | (Val::Int(i), Val::Ptr(name, off)) => {
            Ok(Val::Ptr(name.clone(), off + i))
        }
        (x, y) => Ok(Val::F64(x.as_f64()? + y.as_f64()?)),
    }
}

fn sub_vals(a: &Val, b: &Val) -> Result<Val, String> {
    match (a, b) {
        (Val::Int(x), Val::Int(y)) => Ok(Val::Int(x - y)),
        (Val::Ptr(name, off), Val::Int(i)) => Ok(Val::Ptr(name.clone(), off - i)),
        (x, y) => Ok(Val::F64(x.as_f64()? - y.as_f64()?)),
    }
}

fn binary(op: BinOp, a: &Val, b: &Val) -> Result<Val, String> {
    use BinOp::*;
    match op {
        Add => return add_vals(a, b),
        Sub => return sub_vals(a, b),
        _ => {}
    }
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        let (x, y) = (*x, *y);
        return Ok(Val::Int(match op {
            Mul => x * y,
            Div => x / y,
            Rem => x % y,
            Shl => x << y,
            Shr => x >> y,
            BitAnd => x & y,
            BitOr => x | y,
            BitXor => x ^ y,
            Eq => i64::from(x == y),
            Ne => i64::from(x != y),
            Lt => i64::from(x < y),
            Gt => i64::from(x > y),
            Le => i64::from(x <= y),
            Ge => i64::from(x >= y),
            And => i64::from(x != 0 && y != 0),
            Or => i64::from(x != 0 || y != 0),
            Add | Sub => unreachable!(),
        }));
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    Ok(match op {
        Mul => Val::F64(x * y),
        Div => Val::F64(x / y),
        Eq => Val::Int(i64::from(x == y)),
        Ne => Val::Int(i64::from(x != y)),
        Lt => Val::Int(i64::from(x < y)),
        Gt => Val::Int(i64::from(x > y)),
        Le => Val::Int(i64::from(x <= y)),
        Ge => Val::Int(i64::from(x >= y)),
        other => return Err(format!("{other:?} needs integer operands")),
    })
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Neg,
    Deref,
    BitNot,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug)]
enum Expr {
    Int(i64),
    Float(f64),
    Ident(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Ident(String),
    Op(&'static str),
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let mut toks = vec![];
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            let mut hex = false;
            if c == '0' && i + 1 < bytes.len() && (bytes[i + 1] as char) == 'x' {
                hex = true;
                i += 2;
            }
            while i < bytes.len() {
                let d = bytes[i] as char;
                if d.is_ascii_hexdigit() && (hex || d.is_ascii_digit()) {
                    i += 1;
                } else if d == '.' && !hex {
                    is_float = true;
                    i += 1;
                } else {
                    break;
                }
            }
            let text = &src[start..i];
            if is_float {
                toks.push(Tok::Float(
                    text.parse().map_err(|_| format!("bad float {text}"))?,
                ));
            } else if hex {
                toks.push(Tok::Int(
                    i64::from_str_radix(&text[2..], 16).map_err(|_| format!("bad int {text}"))?,
                ));
            } else {
                toks.push(Tok::Int(
                    text.parse().map_err(|_| format!("bad int {text}"))?,
                ));
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let d = bytes[i] as char;
                if d.is_ascii_alphanumeric() || d == '_' {
                    i += 1;
                } else {
                    break;
                }
            }
            toks.push(Tok::Ident(src[start..i].to_string()));
        } else {
            let two = if i + 1 < bytes.len() { &src[i..i + 2] } else { "" };
            let op = match two {
                "==" | "!=" | "<=" | ">=" | "&&" | "||" | "<<" | ">>" => two,
                _ => &src[i..i + 1],
            };
            let known = [
                "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "(", ")", "[", "]", "+", "-",
                "*", "/", "%", "<", ">", "&", "|", "^", "~", "!",
            ];
            let op = known
                .iter()
                .find(|k| **k == op)
                .ok_or_else(|| format!("unknown token {op:?} in {src:?}"))?;
            i += op.len();
            toks.push(Tok::Op(op));
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

fn parse(src: &str) -> Result<Expr, String> {
    let mut p = Parser {
        toks: tokenize(src)?,
        pos: 0,
    };
    let expr = p.or_expr()?;
    if p.pos != p.toks.len() {
        return Err(format!("trailing tokens in {src:?}"));
    }
    Ok(expr)
}

impl Parser {
    fn eat(&mut self, op: &str) -> bool {
        if let Some(Tok::Op(o)) = self.toks.get(self.pos) {
            if *o == op {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect(&mut self, op: &str) -> Result<(), String> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(format!("expected {op:?} at token {}", self.pos))
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.eat("||") {
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(self.and_expr()?));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.bitor()?;
        while self.eat("&&") {
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(self.bitor()?));
        }
        Ok(lhs)
    }

    fn bitor(&mut self) -> Result<Expr, String> {
        let mut lhs = self.bitxor()?;
        while self.eat("|") {
            lhs = Expr::Binary(BinOp::BitOr, Box::new(lhs), Box::new(self.bitxor()?));
        }
        Ok(lhs)
    }

    fn bitxor(&mut self) -> Result<Expr, String> {
        let mut lhs = self.bitand()?;
        while self.eat("^") {
            lhs = Expr::Binary(BinOp::BitXor, Box::new(lhs), Box::new(self.bitand()?));
        }
        Ok(lhs)
    }

    fn bitand(&mut self) -> Result<Expr, String> {
        let mut lhs = self.equality()?;
        while self.eat("&") {
            lhs = Expr::Binary(BinOp::BitAnd, Box::new(lhs), Box::new(self.equality()?));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut lhs = self.relational()?;
        loop {
            if self.eat("==") {
                lhs = Expr::Binary(BinOp::Eq, Box::new(lhs), Box::new(self.relational()?));
            } else if self.eat("!=") {
                lhs = Expr::Binary(BinOp::Ne, Box::new(lhs), Box::new(self.relational()?));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn relational(&mut self) -> Result<Expr, String> {
        let mut lhs = self.shift()?;
        loop {
            let op = if self.eat("<=") {
                BinOp::Le
            } else if self.eat(">=") {
                BinOp::Ge
            } else if self.eat("<") {
                BinOp::Lt
            } else if self.eat(">") {
                BinOp::Gt
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.shift()?));
        }
    }

    fn shift(&mut self) -> Result<Expr, String> {
        let mut lhs = self.additive()?;
        loop {
            let op = if self.eat("<<") {
                BinOp::Shl
            } else if self.eat(">>") {
                BinOp::Shr
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.additive()?));
        }
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat("+") {
                BinOp::Add
            } else if self.eat("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.multiplicative()?));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat("*") {
                BinOp::Mul
            } else if self.eat("/") {
                BinOp::Div
            } else if self.eat("%") {
                BinOp::Rem
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        let op = if self.eat("-") {
            UnOp::Neg
        } else if self.eat("*") {
            UnOp::Deref
        } else if self.eat("~") {
            UnOp::BitNot
        } else if self.eat("!") {
            UnOp::Not
        } else {
            return self.postfix();
        };
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        while self.eat("[") {
            let idx = self.or_expr()?;
            self.expect("]")?;
            expr = Expr::Index(Box::new(expr), Box::new(idx));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.toks.get(self.pos).cloned() {
            Some(Tok::Int(i)) => {
                self.pos += 1;
                Ok(Expr::Int(i))
            }
            Some(Tok::Float(x)) => {
                self.pos += 1;
                Ok(Expr::Float(x))
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                Ok(Expr::Ident(name))
            }
            Some(Tok::Op("(")) => {
                self.pos += 1;
                let expr = self.or_expr()?;
                self.expect(")")?;
                Ok(expr)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Interpreter for vectoriser loop nests: named 2-D double arrays, a file
/// of 4-lane registers, and lane-accurate semantics for the emitted
/// unpack/permute intrinsics. One-subscript symbols address row 0.
#[derive(Default)]
pub struct VecMachine {
    arrays: HashMap<String, Vec<Vec<f64>>>,
    regs: HashMap<String, [f64; 4]>,
    vars: HashMap<String, usize>,
}

impl VecMachine {
    pub fn new() -> VecMachine {
        VecMachine::default()
    }

    pub fn alloc(&mut self, name: &str, rows: usize, cols: usize, fill: impl Fn(usize, usize) -> f64) {
        let data = (0..rows)
            .map(|r| (0..cols).map(|c| fill(r, c)).collect())
            .collect();
        self.arrays.insert(name.to_string(), data);
    }

    pub fn array(&self, name: &str) -> &Vec<Vec<f64>> {
        &self.arrays[name]
    }

    fn index(&self, i: &Index) -> usize {
        match i {
            Index::Var { name, offset } => self.vars[name] + offset,
            Index::Lit(n) => *n,
        }
    }

    fn locate(&self, sym: &Symbol) -> (usize, usize) {
        match sym.rank.as_slice() {
            [col] => (0, self.index(col)),
            [row, col] => (self.index(row), self.index(col)),
            rank => panic!("unsupported rank {rank:?}"),
        }
    }

    fn load_vec(&self, sym: &Symbol) -> [f64; 4] {
        let (r, c) = self.locate(sym);
        let row = &self.arrays[&sym.name][r];
        [row[c], row[c + 1], row[c + 2], row[c + 3]]
    }

    fn store_vec(&mut self, sym: &Symbol, v: [f64; 4]) {
        let (r, c) = self.locate(sym);
        let row = self
            .arrays
            .get_mut(&sym.name)
            .map(|a| &mut a[r])
            .unwrap_or_else(|| panic!("unknown array {}", sym.name));
        row[c..c + 4].copy_from_slice(&v);
    }

    fn eval_scalar(&self, e: &ScalarExpr) -> f64 {
        match e {
            ScalarExpr::Sym(s) => {
                let (r, c) = self.locate(s);
                self.arrays[&s.name][r][c]
            }
            ScalarExpr::Par(e) => self.eval_scalar(e),
            ScalarExpr::Add(a, b) => self.eval_scalar(a) + self.eval_scalar(b),
            ScalarExpr::Sub(a, b) => self.eval_scalar(a) - self.eval_scalar(b),
            ScalarExpr::Mul(a, b) => self.eval_scalar(a) * self.eval_scalar(b),
            ScalarExpr::Div(a, b) => self.eval_scalar(a) / self.eval_scalar(b),
        }
    }

    fn eval_vec(&self, e: &VExpr) -> [f64; 4] {
        let lanewise = |a: [f64; 4], b: [f64; 4], f: fn(f64, f64) -> f64| {
            [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]
        };
        match e {
            VExpr::Reg(r) => self.regs[r],
            VExpr::Load(s) => self.load_vec(s),
            VExpr::SetZero => [0.0; 4],
            VExpr::Add(a, b) => lanewise(self.eval_vec(a), self.eval_vec(b), |x, y| x + y),
            VExpr::Sub(a, b) => lanewise(self.eval_vec(a), self.eval_vec(b), |x, y| x - y),
            VExpr::Mul(a, b) => lanewise(self.eval_vec(a), self.eval_vec(b), |x, y| x * y),
            VExpr::Div(a, b) => lanewise(self.eval_vec(a), self.eval_vec(b), |x, y| x / y),
            VExpr::Unpackhi(a, b) => {
                let (a, b) = (self.eval_vec(a), self.eval_vec(b));
                [a[1], b[1], a[3], b[3]]
            }
            VExpr::Unpacklo(a, b) => {
                let (a, b) = (self.eval_vec(a), self.eval_vec(b));
                [a[0], b[0], a[2], b[2]]
            }
            VExpr::Perm2f128(a, b, imm) => {
                let (a, b) = (self.eval_vec(a), self.eval_vec(b));
                let half = |sel: u8| match sel & 3 {
                    0 => [a[0], a[1]],
                    1 => [a[2], a[3]],
                    2 => [b[0], b[1]],
                    _ => [b[2], b[3]],
                };
                let (lo, hi) = (half(*imm), half(imm >> 4));
                [lo[0], lo[1], hi[0], hi[1]]
            }
            VExpr::Permute(a, imm) => {
                let a = self.eval_vec(a);
                [
                    a[(imm & 1) as usize],
                    a[((imm >> 1) & 1) as usize],
                    a[2 + ((imm >> 2) & 1) as usize],
                    a[2 + ((imm >> 3) & 1) as usize],
                ]
            }
        }
    }

    pub fn run(&mut self, nodes: &[Node]) {
        for node in nodes {
            match node {
                Node::Loop(l) => {
                    let mut v = l.start;
                    while v < l.bound {
                        self.vars.insert(l.var.clone(), v);
                        self.run(&l.body);
                        v += l.incr;
                    }
                }
                Node::Incr { tensor, expr } => {
                    let value = self.eval_scalar(expr);
                    let (r, c) = self.locate(tensor);
                    if let Some(a) = self.arrays.get_mut(&tensor.name) {
                        a[r][c] += value;
                    }
                }
                Node::Vector(VStmt::Decl { reg, init }) => {
                    let v = self.eval_vec(init);
                    self.regs.insert(reg.clone(), v);
                }
                Node::Vector(VStmt::Assign { reg, rhs }) => {
                    let v = self.eval_vec(rhs);
                    self.regs.insert(reg.clone(), v);
                }
                Node::Vector(VStmt::Store { dst, src }) => {
                    let v = self.eval_vec(src);
                    self.store_vec(dst, v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::Stmt;

    #[test]
    fn test_eval_arithmetic() {
        let m = Machine::new();
        assert_eq!(m.eval("1 + 2*3").unwrap(), Val::Int(7));
        assert_eq!(m.eval("(1 + 2)*3").unwrap(), Val::Int(9));
        assert_eq!(m.eval("7 % 4").unwrap(), Val::Int(3));
        assert_eq!(m.eval("-(3 + 1)").unwrap(), Val::Int(-4));
    }

    #[test]
    fn test_eval_bits() {
        let m = Machine::new();
        assert_eq!(m.eval("1 << 3").unwrap(), Val::Int(8));
        assert_eq!(m.eval("6 & 3").unwrap(), Val::Int(2));
        assert_eq!(m.eval("~0x70000000 & 0x70000007").unwrap(), Val::Int(7));
        assert_eq!(m.eval("1 && (0 || 1)").unwrap(), Val::Int(1));
    }

    #[test]
    fn test_pointer_arithmetic_and_indexing() {
        let mut m = Machine::new();
        m.alloc_int("map", vec![5, 6, 7, 8]);
        m.set_int("i", 1);
        assert_eq!(m.eval("(map + i*2)[1]").unwrap(), Val::Int(8));
        assert_eq!(m.eval("*(map + 2)").unwrap(), Val::Int(7));
    }

    #[test]
    fn test_exec_decl_assign_loop() {
        let mut m = Machine::new();
        let stmts = vec![
            Stmt::decl_buf("int", "acc", 1),
            Stmt::assign("acc[0]", "0"),
            Stmt::For {
                var: "n".to_string(),
                start: "0".to_string(),
                end: "5".to_string(),
                body: vec![Stmt::add_assign("acc[0]", "n")],
            },
        ];
        m.exec_all(&stmts).unwrap();
        assert_eq!(m.read_int("acc", 0), 10);
    }

    #[test]
    fn test_exec_if_else() {
        let mut m = Machine::new();
        m.set_int("j_0", 0);
        let stmts = vec![
            Stmt::decl("int", "x"),
            Stmt::If {
                cond: "j_0 == 0".to_string(),
                body: vec![Stmt::assign("x", "1")],
                orelse: vec![Stmt::assign("x", "2")],
            },
        ];
        m.exec_all(&stmts).unwrap();
        assert_eq!(m.eval("x").unwrap(), Val::Int(1));
    }

    #[test]
    fn test_kernel_call() {
        fn bump(m: &mut Machine, args: &[Val]) -> Result<(), String> {
            let v = m.load(&args[0])?;
            m.store(&args[0], add_vals(&v, &Val::F64(1.0))?)
        }
        let mut m = Machine::new();
        m.alloc_f64("x", vec![41.0]);
        m.register("bump", bump);
        m.exec_all(&[Stmt::Call {
            func: "bump".to_string(),
            args: vec!["x + 0".to_string()],
        }])
        .unwrap();
        assert_eq!(m.read_f64("x", 0), 42.0);
    }
}
