//! Loop wrapper assembly.
//!
//! `generate_wrapper` composes the per-argument marshaling fragments into a
//! complete C function iterating a kernel over a half-open element range:
//!
//! ```c
//! void wrap_kernel(int start, int end, ...) {
//!     for (int n = start; n < end; n++) {
//!         int i = n;
//!         /* init */
//!         kernel(...);
//!         /* writeback */
//!     }
//! }
//! ```
//!
//! On extruded meshes a layer loop nests inside the element loop, bounded by
//! the iteration region, and the per-layer phases move into it. A layer loop
//! is only emitted when some argument goes through a map; purely direct
//! arguments never consult the layer. `generate_cell_wrapper` is the
//! single-element variant used for per-entity evaluation, driven by a flat
//! cell number instead of a range.

use std::collections::HashMap;

use colored::Colorize;

use crate::descriptor::KernelDesc;
use crate::emit::{render, Stmt};
use crate::errors::WrapperError;
use crate::layers::{ArgWrapper, LayerAccess};
use crate::marshal;

/// Allocates names unique within one wrapper. The first request for a key
/// returns it verbatim; later requests get a numeric suffix.
#[derive(Debug, Default)]
pub struct Namer {
    counts: HashMap<String, usize>,
}

impl Namer {
    pub fn new() -> Namer {
        Namer::default()
    }

    pub fn name(&mut self, key: &str) -> String {
        let count = self.counts.entry(key.to_string()).or_insert(0);
        let name = if *count == 0 {
            key.to_string()
        } else {
            format!("{key}_{count}")
        };
        *count += 1;
        name
    }
}

/// Which part of an extruded column a wrapper iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    All,
    Bottom,
    Top,
    InteriorFacets,
}

impl Region {
    /// Layer loop bounds, half-open, in terms of the `nlayers` parameter.
    fn layer_bounds(self) -> (&'static str, &'static str) {
        match self {
            Region::All => ("0", "nlayers"),
            Region::Bottom => ("0", "1"),
            Region::Top => ("(nlayers - 1)", "nlayers"),
            Region::InteriorFacets => ("0", "(nlayers - 1)"),
        }
    }
}

/// The iteration space a wrapper is generated for.
#[derive(Debug, Clone)]
pub struct IterSpace {
    /// Indirect iteration through a subset index array
    pub subset: bool,
    /// Layered (extruded) mesh
    pub extruded: bool,
    pub region: Region,
}

impl IterSpace {
    pub fn direct() -> IterSpace {
        IterSpace {
            subset: false,
            extruded: false,
            region: Region::All,
        }
    }

    pub fn extruded(region: Region) -> IterSpace {
        IterSpace {
            subset: false,
            extruded: true,
            region,
        }
    }
}

/// A generated wrapper function.
#[derive(Clone)]
pub struct Wrapper {
    pub name: String,
    params: Vec<String>,
    body: Vec<Stmt>,
}

impl Wrapper {
    pub fn body(&self) -> &[Stmt] {
        &self.body
    }

    /// Renders the complete C function.
    pub fn code(&self) -> String {
        format!(
            "void {}({}) {{\n{}}}\n",
            self.name,
            self.params.join(", "),
            render(&self.body, 1)
        )
    }
}

impl std::fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} {}({})",
            "void".cyan(),
            self.name.green().bold(),
            self.params.join(", ").dimmed()
        )?;
        write!(f, "{}", render(&self.body, 1))
    }
}

/// Declares the wrapper parameters for all kernel arguments, returning the
/// rendered parameter list and the per-argument name groups.
fn argument_params(kernel: &KernelDesc) -> (Vec<String>, Vec<Vec<String>>) {
    let mut params = vec![];
    let mut names = vec![];
    for (i, arg) in kernel.args.iter().enumerate() {
        let mut group = vec![];
        for (j, ty) in arg.param_typenames().iter().enumerate() {
            let name = format!("arg{i}_{j}");
            // Matrix handles are opaque values, everything else arrives as
            // a pointer.
            if ty == "Mat" {
                params.push(format!("Mat {name}"));
            } else {
                params.push(format!("{ty} *{name}"));
            }
            group.push(name);
        }
        names.push(group);
    }
    (params, names)
}

/// Generates the range wrapper for a kernel over the given iteration space.
pub fn generate_wrapper(kernel: &KernelDesc, space: &IterSpace) -> Result<Wrapper, WrapperError> {
    let mut params = vec!["int start".to_string(), "int end".to_string()];
    if space.subset {
        params.push("int *ssinds".to_string());
    }
    let (arg_params, arg_names) = argument_params(kernel);
    params.extend(arg_params);
    if space.extruded {
        params.push("int nlayers".to_string());
    }

    let (start_layer, end_layer) = space.region.layer_bounds();
    let is_facet = space.extruded && space.region == Region::InteriorFacets;
    let col = if space.extruded { Some("j_0") } else { None };
    let layer = LayerAccess::Incremental {
        start: start_layer.to_string(),
    };

    let mut namer = Namer::new();
    let mut fragments = ArgWrapper::new();
    let mut call_args = vec![];
    for (i, arg) in kernel.args.iter().enumerate() {
        let prefix = format!("arg{i}_");
        let (wrapper, expr) = marshal::init_and_writeback(
            arg,
            &arg_names[i],
            "i",
            col,
            &mut namer,
            &prefix,
            &layer,
            is_facet,
        )?;
        fragments.extend(wrapper);
        call_args.push(expr);
    }
    let call = Stmt::Call {
        func: kernel.name.clone(),
        args: call_args,
    };

    let element = if space.subset { "ssinds[n]" } else { "n" };
    let mut inner = vec![Stmt::Decl {
        ty: "int".to_string(),
        name: "i".to_string(),
        dims: vec![],
        align: None,
        init: Some(element.to_string()),
    }];
    inner.extend(fragments.init);

    let layered = space.extruded && kernel.args.iter().any(|a| a.is_indirect());
    if layered {
        let mut loop_body = fragments.init_layer;
        loop_body.push(call);
        loop_body.extend(fragments.writeback);
        loop_body.extend(fragments.post_writeback);
        inner.push(Stmt::For {
            var: "j_0".to_string(),
            start: start_layer.to_string(),
            end: end_layer.to_string(),
            body: loop_body,
        });
    } else {
        inner.extend(fragments.init_layer);
        inner.push(call);
        inner.extend(fragments.writeback);
        inner.extend(fragments.post_writeback);
    }

    Ok(Wrapper {
        name: format!("wrap_{}", kernel.name),
        params,
        body: vec![Stmt::For {
            var: "n".to_string(),
            start: "start".to_string(),
            end: "end".to_string(),
            body: inner,
        }],
    })
}

/// Generates the single-element wrapper, driven by a flat cell number.
///
/// On extruded meshes the cell number interleaves layers within columns, so
/// the base element and the layer are recovered by division; the layer
/// offset is folded directly into each access instead of running a loop.
pub fn generate_cell_wrapper(
    kernel: &KernelDesc,
    space: &IterSpace,
) -> Result<Wrapper, WrapperError> {
    let mut params = vec!["int cell".to_string()];
    let (arg_params, arg_names) = argument_params(kernel);
    params.extend(arg_params);
    if space.extruded {
        params.push("int nlayers".to_string());
    }

    let mut body = vec![];
    let (col, layer) = if space.extruded {
        body.push(Stmt::Decl {
            ty: "int".to_string(),
            name: "i".to_string(),
            dims: vec![],
            align: None,
            init: Some("cell / nlayers".to_string()),
        });
        body.push(Stmt::Decl {
            ty: "int".to_string(),
            name: "j_0".to_string(),
            dims: vec![],
            align: None,
            init: Some("cell % nlayers".to_string()),
        });
        (
            Some("j_0"),
            LayerAccess::Direct {
                layer: "j_0".to_string(),
            },
        )
    } else {
        body.push(Stmt::Decl {
            ty: "int".to_string(),
            name: "i".to_string(),
            dims: vec![],
            align: None,
            init: Some("cell".to_string()),
        });
        (None, LayerAccess::Incremental { start: "0".to_string() })
    };

    let mut namer = Namer::new();
    let mut fragments = ArgWrapper::new();
    let mut call_args = vec![];
    for (i, arg) in kernel.args.iter().enumerate() {
        let prefix = format!("arg{i}_");
        let (wrapper, expr) = marshal::init_and_writeback(
            arg,
            &arg_names[i],
            "i",
            col,
            &mut namer,
            &prefix,
            &layer,
            false,
        )?;
        fragments.extend(wrapper);
        call_args.push(expr);
    }

    body.extend(fragments.init);
    body.extend(fragments.init_layer);
    body.push(Stmt::Call {
        func: kernel.name.clone(),
        args: call_args,
    });
    body.extend(fragments.writeback);
    body.extend(fragments.post_writeback);

    Ok(Wrapper {
        name: format!("wrap_{}", kernel.name),
        params,
        body,
    })
}
