//! Typed statement records for emitted wrapper code.
//!
//! Rather than splicing C text at every point of indirection, the marshaling
//! protocol and the wrapper assembler build lists of typed statement records.
//! The records are rendered to C syntax only at the final assembly step, so
//! the index arithmetic and the marshaling logic stay testable independently
//! of target syntax.
//!
//! Expressions *within* statements remain plain strings: every expression
//! produced by the index algebra is a syntactically valid standalone C
//! expression, and the algebra is their single source of truth.

/// Assignment operators used in write-back statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `lhs = rhs;`
    Set,
    /// `lhs += rhs;`
    Add,
    /// `lhs -= rhs;`
    Sub,
}

impl AssignOp {
    fn token(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
        }
    }
}

/// A single emitted statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A local variable or buffer declaration.
    ///
    /// `dims` is empty for a scalar, one entry for a flat buffer, two for a
    /// local assembly buffer. `init` is spliced verbatim after `=`.
    Decl {
        ty: String,
        name: String,
        dims: Vec<usize>,
        align: Option<usize>,
        init: Option<String>,
    },
    /// `lhs op rhs;` where `lhs` is an lvalue expression.
    Assign {
        lhs: String,
        op: AssignOp,
        rhs: String,
    },
    /// A call statement, `func(args...);`.
    Call { func: String, args: Vec<String> },
    /// A conditional block.
    If {
        cond: String,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    /// A counted loop, `for (int var = start; var < end; var++)`.
    For {
        var: String,
        start: String,
        end: String,
        body: Vec<Stmt>,
    },
}

impl Stmt {
    /// Scalar declaration without initializer.
    pub fn decl(ty: &str, name: &str) -> Stmt {
        Stmt::Decl {
            ty: ty.to_string(),
            name: name.to_string(),
            dims: vec![],
            align: None,
            init: None,
        }
    }

    /// Flat buffer declaration, `ty name[len];`.
    pub fn decl_buf(ty: &str, name: &str, len: usize) -> Stmt {
        Stmt::Decl {
            ty: ty.to_string(),
            name: name.to_string(),
            dims: vec![len],
            align: None,
            init: None,
        }
    }

    pub fn assign(lhs: impl Into<String>, rhs: impl Into<String>) -> Stmt {
        Stmt::Assign {
            lhs: lhs.into(),
            op: AssignOp::Set,
            rhs: rhs.into(),
        }
    }

    pub fn add_assign(lhs: impl Into<String>, rhs: impl Into<String>) -> Stmt {
        Stmt::Assign {
            lhs: lhs.into(),
            op: AssignOp::Add,
            rhs: rhs.into(),
        }
    }

    pub fn sub_assign(lhs: impl Into<String>, rhs: impl Into<String>) -> Stmt {
        Stmt::Assign {
            lhs: lhs.into(),
            op: AssignOp::Sub,
            rhs: rhs.into(),
        }
    }

    /// Renders this statement as C source lines at the given indent depth.
    pub fn render_into(&self, out: &mut String, depth: usize) {
        let pad = "\t".repeat(depth);
        match self {
            Stmt::Decl {
                ty,
                name,
                dims,
                align,
                init,
            } => {
                out.push_str(&pad);
                out.push_str(ty);
                out.push(' ');
                out.push_str(name);
                for d in dims {
                    out.push_str(&format!("[{d}]"));
                }
                if let Some(a) = align {
                    out.push_str(&format!(" __attribute__((aligned({a})))"));
                }
                if let Some(init) = init {
                    out.push_str(" = ");
                    out.push_str(init);
                }
                out.push_str(";\n");
            }
            Stmt::Assign { lhs, op, rhs } => {
                out.push_str(&format!("{pad}{lhs} {} {rhs};\n", op.token()));
            }
            Stmt::Call { func, args } => {
                out.push_str(&format!("{pad}{func}({});\n", args.join(", ")));
            }
            Stmt::If { cond, body, orelse } => {
                out.push_str(&format!("{pad}if ({cond}) {{\n"));
                for s in body {
                    s.render_into(out, depth + 1);
                }
                if orelse.is_empty() {
                    out.push_str(&format!("{pad}}}\n"));
                } else {
                    out.push_str(&format!("{pad}}} else {{\n"));
                    for s in orelse {
                        s.render_into(out, depth + 1);
                    }
                    out.push_str(&format!("{pad}}}\n"));
                }
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                out.push_str(&format!(
                    "{pad}for (int {var} = {start}; {var} < {end}; {var}++) {{\n"
                ));
                for s in body {
                    s.render_into(out, depth + 1);
                }
                out.push_str(&format!("{pad}}}\n"));
            }
        }
    }
}

/// Renders a statement list as C source text at the given indent depth.
pub fn render(stmts: &[Stmt], depth: usize) -> String {
    let mut out = String::new();
    for s in stmts {
        s.render_into(&mut out, depth);
    }
    out
}
