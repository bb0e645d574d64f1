//! Infrastructure for representing math expressions as graphs
//!
//! A [`Context`] is an arena for unique (deduplicated) math expressions,
//! which are represented as [`Node`] handles.  Each `Node` is specific to a
//! particular context, and is the input to evaluator construction (e.g.
//! [`VmEvaluator::new`](crate::eval::VmEvaluator::new)).
mod op;

pub use op::{BinaryOpcode, Op, UnaryOpcode, Var};

use crate::Error;
use ordered_float::OrderedFloat;
use std::collections::HashMap;

/// An index in the [`Context::ops`] arena
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Node(usize);

impl Node {
    /// Returns the raw index of this node
    pub fn get(self) -> usize {
        self.0
    }
}

/// A `Context` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.
#[derive(Debug, Default)]
pub struct Context {
    ops: Vec<Op>,
    seen: HashMap<Op, Node>,
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of [`Op`] nodes in the context
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Looks up the operation for the given node, if present
    pub fn get_op(&self, n: Node) -> Option<&Op> {
        self.ops.get(n.0)
    }

    /// Checks whether the given [`Node`] is valid in this context
    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get_op(node).ok_or(Error::BadNode).map(|_| ())
    }

    fn intern(&mut self, op: Op) -> Node {
        if let Some(n) = self.seen.get(&op) {
            *n
        } else {
            let n = Node(self.ops.len());
            self.ops.push(op);
            self.seen.insert(op, n);
            n
        }
    }

    /// Constructs or finds a variable node for the X axis
    pub fn x(&mut self) -> Node {
        self.intern(Op::Input(Var::X))
    }
    /// Constructs or finds a variable node for the Y axis
    pub fn y(&mut self) -> Node {
        self.intern(Op::Input(Var::Y))
    }
    /// Constructs or finds a variable node for the Z axis
    pub fn z(&mut self) -> Node {
        self.intern(Op::Input(Var::Z))
    }
    /// Returns nodes for all three axes
    pub fn axes(&mut self) -> (Node, Node, Node) {
        (self.x(), self.y(), self.z())
    }

    /// Constructs or finds a constant node
    pub fn constant(&mut self, v: f64) -> Node {
        self.intern(Op::Const(OrderedFloat(v)))
    }

    fn op_unary(&mut self, op: UnaryOpcode, a: Node) -> Result<Node, Error> {
        self.check_node(a)?;
        Ok(self.intern(Op::Unary(op, a)))
    }

    fn op_binary(
        &mut self,
        op: BinaryOpcode,
        a: Node,
        b: Node,
    ) -> Result<Node, Error> {
        self.check_node(a)?;
        self.check_node(b)?;
        Ok(self.intern(Op::Binary(op, a, b)))
    }

    /// Builds an addition node
    pub fn add(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Add, a, b)
    }
    /// Builds a subtraction node
    pub fn sub(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Sub, a, b)
    }
    /// Builds a multiplication node
    pub fn mul(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Mul, a, b)
    }
    /// Builds a division node
    pub fn div(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Div, a, b)
    }
    /// Builds a minimum node, i.e. the union of two shapes
    pub fn min(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Min, a, b)
    }
    /// Builds a maximum node, i.e. the intersection of two shapes
    pub fn max(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Max, a, b)
    }
    /// Builds a negation node
    pub fn neg(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Neg, a)
    }
    /// Builds an absolute-value node
    pub fn abs(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Abs, a)
    }
    /// Builds a square-root node
    pub fn sqrt(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Sqrt, a)
    }
    /// Builds a squaring node
    pub fn square(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Square, a)
    }

    /// Evaluates the given node at the given position
    ///
    /// This is a slow, recursive evaluator intended for testing and
    /// debugging; real evaluation should go through an
    /// [`Evaluator`](crate::eval::Evaluator) backend.
    pub fn eval_xyz(
        &self,
        node: Node,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<f64, Error> {
        let mut cache = HashMap::new();
        self.eval_inner(node, [x, y, z], &mut cache)
    }

    fn eval_inner(
        &self,
        node: Node,
        xyz: [f64; 3],
        cache: &mut HashMap<Node, f64>,
    ) -> Result<f64, Error> {
        if let Some(v) = cache.get(&node) {
            return Ok(*v);
        }
        let v = match self.get_op(node).ok_or(Error::BadNode)? {
            Op::Input(Var::X) => xyz[0],
            Op::Input(Var::Y) => xyz[1],
            Op::Input(Var::Z) => xyz[2],
            Op::Const(c) => c.0,
            &Op::Unary(op, a) => {
                let a = self.eval_inner(a, xyz, cache)?;
                match op {
                    UnaryOpcode::Neg => -a,
                    UnaryOpcode::Abs => a.abs(),
                    UnaryOpcode::Sqrt => a.sqrt(),
                    UnaryOpcode::Square => a * a,
                }
            }
            &Op::Binary(op, a, b) => {
                let a = self.eval_inner(a, xyz, cache)?;
                let b = self.eval_inner(b, xyz, cache)?;
                match op {
                    BinaryOpcode::Add => a + b,
                    BinaryOpcode::Sub => a - b,
                    BinaryOpcode::Mul => a * b,
                    BinaryOpcode::Div => a / b,
                    BinaryOpcode::Min => a.min(b),
                    BinaryOpcode::Max => a.max(b),
                }
            }
        };
        cache.insert(node, v);
        Ok(v)
    }
}
