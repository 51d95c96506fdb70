//! Reverse-mode automatic differentiation over 2-D tensors.
//!
//! A [`Graph`] is an append-only arena of nodes; a [`Var`] is a cheap, copyable
//! handle into it. Every backward rule is expressed with the same graph
//! operations used in the forward pass, so when [`Graph::grad`] is called with
//! `create_graph = true` the returned gradients are themselves graph variables
//! and can be differentiated again. MAML's meta-gradient relies on this: the
//! inner-loop gradient is part of the function the outer loop differentiates.
//!
//! Node ids are assigned in insertion order and every op only refers to
//! existing nodes, so descending id order is a valid reverse topological order.

mod backward;
mod loss;
mod ops;

pub use loss::{argmax_rows, cross_entropy, softmax_rows};

use ndarray::Array2;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Operation that produced a node, referencing its inputs by node id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Op {
    Leaf,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    MatMul(usize, usize),
    Transpose(usize),
    Scale(usize, f64),
    AddRow(usize, usize),
    Sum(usize),
    SumRows(usize),
    SumCols(usize),
    BroadcastRows(usize),
    BroadcastCols(usize),
    Fill(usize),
    Tanh(usize),
    Relu(usize),
    Exp(usize),
    Ln(usize),
}

impl Op {
    fn inputs(self) -> [Option<usize>; 2] {
        match self {
            Op::Leaf => [None, None],
            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::Div(a, b)
            | Op::MatMul(a, b)
            | Op::AddRow(a, b) => [Some(a), Some(b)],
            Op::Transpose(a)
            | Op::Scale(a, _)
            | Op::Sum(a)
            | Op::SumRows(a)
            | Op::SumCols(a)
            | Op::BroadcastRows(a)
            | Op::BroadcastCols(a)
            | Op::Fill(a)
            | Op::Tanh(a)
            | Op::Relu(a)
            | Op::Exp(a)
            | Op::Ln(a) => [Some(a), None],
        }
    }
}

#[derive(Debug)]
struct Node {
    value: Rc<Array2<f64>>,
    op: Op,
    requires_grad: bool,
}

/// Arena holding every tensor computed during one differentiable computation.
///
/// The graph is single-threaded (`!Sync`) by construction. Create one per
/// meta-iteration and drop it afterwards; dropping it releases every
/// intermediate activation and fast weight at once.
#[derive(Debug)]
pub struct Graph {
    nodes: RefCell<Vec<Node>>,
    grad_enabled: Cell<bool>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create an empty graph with gradient tracking enabled
    pub fn new() -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            grad_enabled: Cell::new(true),
        }
    }

    /// Register a trainable leaf. Gradients can be taken with respect to it.
    pub fn param(&self, value: Array2<f64>) -> Var<'_> {
        self.insert(value, Op::Leaf, true)
    }

    /// Register a constant leaf that never receives gradients
    pub fn constant(&self, value: Array2<f64>) -> Var<'_> {
        self.insert(value, Op::Leaf, false)
    }

    /// Register a `1 x 1` constant
    pub fn scalar(&self, value: f64) -> Var<'_> {
        self.constant(Array2::from_elem((1, 1), value))
    }

    /// Number of nodes recorded so far
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Whether newly recorded ops keep references to their inputs
    pub fn is_grad_enabled(&self) -> bool {
        self.grad_enabled.get()
    }

    /// Switch gradient tracking until the returned guard is dropped
    pub fn grad_mode(&self, enabled: bool) -> GradModeGuard<'_> {
        let previous = self.grad_enabled.replace(enabled);
        GradModeGuard {
            graph: self,
            previous,
        }
    }

    /// Run `f` with gradient tracking disabled.
    ///
    /// Every op recorded inside produces a constant node, so nothing computed
    /// here can contribute to a later gradient.
    pub fn no_grad<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.grad_mode(false);
        f()
    }

    fn insert(&self, value: Array2<f64>, op: Op, requires_grad: bool) -> Var<'_> {
        let mut nodes = self.nodes.borrow_mut();
        let id = nodes.len();
        nodes.push(Node {
            value: Rc::new(value),
            op,
            requires_grad,
        });
        Var { graph: self, id }
    }

    /// Record the result of an op. Parents are dropped when tracking is off or
    /// when no input requires a gradient.
    pub(crate) fn record(&self, value: Array2<f64>, op: Op) -> Var<'_> {
        let requires_grad = self.grad_enabled.get() && {
            let nodes = self.nodes.borrow();
            op.inputs()
                .iter()
                .flatten()
                .any(|&input| nodes[input].requires_grad)
        };
        let op = if requires_grad { op } else { Op::Leaf };
        self.insert(value, op, requires_grad)
    }

    pub(crate) fn value_of(&self, id: usize) -> Rc<Array2<f64>> {
        Rc::clone(&self.nodes.borrow()[id].value)
    }

    pub(crate) fn op_of(&self, id: usize) -> Op {
        self.nodes.borrow()[id].op
    }

    pub(crate) fn requires_grad(&self, id: usize) -> bool {
        self.nodes.borrow()[id].requires_grad
    }
}

/// Restores the previous gradient-tracking mode on drop
pub struct GradModeGuard<'g> {
    graph: &'g Graph,
    previous: bool,
}

impl Drop for GradModeGuard<'_> {
    fn drop(&mut self) {
        self.graph.grad_enabled.set(self.previous);
    }
}

/// Handle to a tensor stored in a [`Graph`]
#[derive(Clone, Copy)]
pub struct Var<'g> {
    graph: &'g Graph,
    id: usize,
}

impl<'g> Var<'g> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The graph this variable lives in
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Owned copy of the tensor value
    pub fn value(&self) -> Array2<f64> {
        (*self.data()).clone()
    }

    pub(crate) fn data(&self) -> Rc<Array2<f64>> {
        self.graph.value_of(self.id)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data().dim()
    }

    /// First element of the tensor; meant for `1 x 1` results such as losses
    pub fn item(&self) -> f64 {
        self.data().iter().next().copied().unwrap_or(0.0)
    }

    pub fn requires_grad(&self) -> bool {
        self.graph.requires_grad(self.id)
    }

    /// Constant copy of this variable, cut off from its history
    pub fn detach(&self) -> Var<'g> {
        self.graph.constant(self.value())
    }
}

impl fmt::Debug for Var<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id)
            .field("shape", &self.shape())
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}
