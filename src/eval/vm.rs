//! Tape-based interpreted evaluator
//!
//! A [`VmEvaluator`] flattens an expression graph into a tape of register
//! operations, then interprets that tape in interval, point, or gradient
//! arithmetic.  Interval evaluation records a [`Choice`] for every min/max
//! clause; [`push`](Evaluator::push) uses those choices to specialize the
//! tape for the current spatial branch (decided clauses become copies, and
//! unreachable clauses are dropped).
use crate::{
    context::{BinaryOpcode, Context, Node, Op, UnaryOpcode, Var},
    eval::{Choice, Derivs, Evaluator},
    types::{Grad, Interval},
    Error,
};
use nalgebra::Vector3;
use std::collections::HashMap;

/// A single operation in a flattened tape
///
/// Operands are indices of previously-computed registers.
#[derive(Copy, Clone, Debug)]
enum TapeOp {
    Const(f64),
    Input(Var),
    Copy(u32),
    Neg(u32),
    Abs(u32),
    Sqrt(u32),
    Square(u32),
    Add(u32, u32),
    Sub(u32, u32),
    Mul(u32, u32),
    Div(u32, u32),
    Min(u32, u32),
    Max(u32, u32),
}

#[derive(Clone, Debug)]
struct Tape {
    /// Operations in evaluation order; the last one is the output
    ops: Vec<TapeOp>,
    /// Number of min/max clauses in the tape
    choice_count: usize,
}

impl Tape {
    /// Flattens the given node into evaluation order
    fn new(ctx: &Context, node: Node) -> Result<Self, Error> {
        let mut map: HashMap<Node, u32> = HashMap::new();
        let mut ops = vec![];
        let mut todo = vec![(node, false)];
        while let Some((n, ready)) = todo.pop() {
            if map.contains_key(&n) {
                continue;
            }
            let op = *ctx.get_op(n).ok_or(Error::BadNode)?;
            if ready {
                let t = match op {
                    Op::Const(c) => TapeOp::Const(c.0),
                    Op::Input(v) => TapeOp::Input(v),
                    Op::Unary(uop, a) => {
                        let a = map[&a];
                        match uop {
                            UnaryOpcode::Neg => TapeOp::Neg(a),
                            UnaryOpcode::Abs => TapeOp::Abs(a),
                            UnaryOpcode::Sqrt => TapeOp::Sqrt(a),
                            UnaryOpcode::Square => TapeOp::Square(a),
                        }
                    }
                    Op::Binary(bop, a, b) => {
                        let (a, b) = (map[&a], map[&b]);
                        match bop {
                            BinaryOpcode::Add => TapeOp::Add(a, b),
                            BinaryOpcode::Sub => TapeOp::Sub(a, b),
                            BinaryOpcode::Mul => TapeOp::Mul(a, b),
                            BinaryOpcode::Div => TapeOp::Div(a, b),
                            BinaryOpcode::Min => TapeOp::Min(a, b),
                            BinaryOpcode::Max => TapeOp::Max(a, b),
                        }
                    }
                };
                map.insert(n, ops.len() as u32);
                ops.push(t);
            } else {
                todo.push((n, true));
                for c in op.iter_children() {
                    if !map.contains_key(&c) {
                        todo.push((c, false));
                    }
                }
            }
        }
        let choice_count = ops
            .iter()
            .filter(|op| matches!(op, TapeOp::Min(..) | TapeOp::Max(..)))
            .count();
        Ok(Self { ops, choice_count })
    }

    /// Specializes the tape with one choice per min/max clause
    ///
    /// Decided clauses are rewritten as copies of the active input, then
    /// dead registers are eliminated and the survivors renumbered.
    fn simplify(&self, choices: &[Choice]) -> Self {
        debug_assert_eq!(choices.len(), self.choice_count);
        let n = self.ops.len();

        // Choices are recorded in evaluation order
        let mut choice_of = vec![usize::MAX; n];
        let mut c = 0;
        for (i, op) in self.ops.iter().enumerate() {
            if matches!(op, TapeOp::Min(..) | TapeOp::Max(..)) {
                choice_of[i] = c;
                c += 1;
            }
        }

        // Mark live registers, walking from the output
        let mut live = vec![false; n];
        live[n - 1] = true;
        for i in (0..n).rev() {
            if !live[i] {
                continue;
            }
            match self.ops[i] {
                TapeOp::Const(..) | TapeOp::Input(..) => (),
                TapeOp::Copy(a)
                | TapeOp::Neg(a)
                | TapeOp::Abs(a)
                | TapeOp::Sqrt(a)
                | TapeOp::Square(a) => live[a as usize] = true,
                TapeOp::Min(a, b) | TapeOp::Max(a, b) => {
                    match choices[choice_of[i]] {
                        Choice::Left => live[a as usize] = true,
                        Choice::Right => live[b as usize] = true,
                        Choice::Both => {
                            live[a as usize] = true;
                            live[b as usize] = true;
                        }
                    }
                }
                TapeOp::Add(a, b)
                | TapeOp::Sub(a, b)
                | TapeOp::Mul(a, b)
                | TapeOp::Div(a, b) => {
                    live[a as usize] = true;
                    live[b as usize] = true;
                }
            }
        }

        // Emit surviving operations with renumbered operands
        let mut remap = vec![u32::MAX; n];
        let mut ops = vec![];
        let mut choice_count = 0;
        for i in 0..n {
            if !live[i] {
                continue;
            }
            let op = match self.ops[i] {
                TapeOp::Min(a, b) => match choices[choice_of[i]] {
                    Choice::Left => TapeOp::Copy(remap[a as usize]),
                    Choice::Right => TapeOp::Copy(remap[b as usize]),
                    Choice::Both => {
                        choice_count += 1;
                        TapeOp::Min(remap[a as usize], remap[b as usize])
                    }
                },
                TapeOp::Max(a, b) => match choices[choice_of[i]] {
                    Choice::Left => TapeOp::Copy(remap[a as usize]),
                    Choice::Right => TapeOp::Copy(remap[b as usize]),
                    Choice::Both => {
                        choice_count += 1;
                        TapeOp::Max(remap[a as usize], remap[b as usize])
                    }
                },
                TapeOp::Const(c) => TapeOp::Const(c),
                TapeOp::Input(v) => TapeOp::Input(v),
                TapeOp::Copy(a) => TapeOp::Copy(remap[a as usize]),
                TapeOp::Neg(a) => TapeOp::Neg(remap[a as usize]),
                TapeOp::Abs(a) => TapeOp::Abs(remap[a as usize]),
                TapeOp::Sqrt(a) => TapeOp::Sqrt(remap[a as usize]),
                TapeOp::Square(a) => TapeOp::Square(remap[a as usize]),
                TapeOp::Add(a, b) => {
                    TapeOp::Add(remap[a as usize], remap[b as usize])
                }
                TapeOp::Sub(a, b) => {
                    TapeOp::Sub(remap[a as usize], remap[b as usize])
                }
                TapeOp::Mul(a, b) => {
                    TapeOp::Mul(remap[a as usize], remap[b as usize])
                }
                TapeOp::Div(a, b) => {
                    TapeOp::Div(remap[a as usize], remap[b as usize])
                }
            };
            remap[i] = ops.len() as u32;
            ops.push(op);
        }
        Self { ops, choice_count }
    }
}

/// Interpreted evaluator over a flattened expression tape
///
/// Holds a stack of tapes: the root tape at the bottom, and one
/// specialization per active [`push`](Evaluator::push) frame above it.
/// Each frame also owns a point-value cache keyed by position, consulted
/// for points loaded with [`set`](Evaluator::set).
pub struct VmEvaluator {
    tapes: Vec<Tape>,
    caches: Vec<HashMap<(u64, u64, u64), f64>>,

    /// Choices recorded by the most recent interval evaluation
    choices: Vec<Choice>,

    // Batch slots
    xs: Vec<f64>,
    ys: Vec<f64>,
    zs: Vec<f64>,
    raw: Vec<bool>,

    // Batch outputs
    out: Vec<f64>,
    out_dx: Vec<f64>,
    out_dy: Vec<f64>,
    out_dz: Vec<f64>,

    // Register scratch space, reused between evaluations
    iregs: Vec<Interval>,
    fregs: Vec<f64>,
    gregs: Vec<Grad>,
}

impl VmEvaluator {
    /// Builds an evaluator for the given node
    pub fn new(ctx: &Context, node: Node) -> Result<Self, Error> {
        if ctx.is_empty() {
            return Err(Error::EmptyContext);
        }
        let tape = Tape::new(ctx, node)?;
        let n = <Self as Evaluator>::BATCH_SIZE;
        Ok(Self {
            tapes: vec![tape],
            caches: vec![HashMap::new()],
            choices: vec![],
            xs: vec![0.0; n],
            ys: vec![0.0; n],
            zs: vec![0.0; n],
            raw: vec![false; n],
            out: vec![0.0; n],
            out_dx: vec![0.0; n],
            out_dy: vec![0.0; n],
            out_dz: vec![0.0; n],
            iregs: vec![],
            fregs: vec![],
            gregs: vec![],
        })
    }

    /// Number of operations in the currently-active tape
    #[cfg(test)]
    pub(crate) fn active_ops(&self) -> usize {
        self.tapes.last().unwrap().ops.len()
    }

    /// Depth of the specialization stack (1 = root tape only)
    pub fn depth(&self) -> usize {
        self.tapes.len()
    }

    fn run_interval(
        tape: &Tape,
        x: Interval,
        y: Interval,
        z: Interval,
        choices: &mut Vec<Choice>,
        regs: &mut Vec<Interval>,
    ) -> Interval {
        choices.clear();
        regs.clear();
        regs.resize(tape.ops.len(), f64::NAN.into());
        for (i, op) in tape.ops.iter().enumerate() {
            regs[i] = match *op {
                TapeOp::Const(c) => c.into(),
                TapeOp::Input(Var::X) => x,
                TapeOp::Input(Var::Y) => y,
                TapeOp::Input(Var::Z) => z,
                TapeOp::Copy(a) => regs[a as usize],
                TapeOp::Neg(a) => -regs[a as usize],
                TapeOp::Abs(a) => regs[a as usize].abs(),
                TapeOp::Sqrt(a) => regs[a as usize].sqrt(),
                TapeOp::Square(a) => regs[a as usize].square(),
                TapeOp::Add(a, b) => regs[a as usize] + regs[b as usize],
                TapeOp::Sub(a, b) => regs[a as usize] - regs[b as usize],
                TapeOp::Mul(a, b) => regs[a as usize] * regs[b as usize],
                TapeOp::Div(a, b) => regs[a as usize] / regs[b as usize],
                TapeOp::Min(a, b) => {
                    let (v, c) =
                        regs[a as usize].min_choice(regs[b as usize]);
                    choices.push(c);
                    v
                }
                TapeOp::Max(a, b) => {
                    let (v, c) =
                        regs[a as usize].max_choice(regs[b as usize]);
                    choices.push(c);
                    v
                }
            };
        }
        *regs.last().unwrap()
    }

    fn run_point(
        tape: &Tape,
        x: f64,
        y: f64,
        z: f64,
        regs: &mut Vec<f64>,
    ) -> f64 {
        regs.clear();
        regs.resize(tape.ops.len(), f64::NAN);
        for (i, op) in tape.ops.iter().enumerate() {
            regs[i] = match *op {
                TapeOp::Const(c) => c,
                TapeOp::Input(Var::X) => x,
                TapeOp::Input(Var::Y) => y,
                TapeOp::Input(Var::Z) => z,
                TapeOp::Copy(a) => regs[a as usize],
                TapeOp::Neg(a) => -regs[a as usize],
                TapeOp::Abs(a) => regs[a as usize].abs(),
                TapeOp::Sqrt(a) => regs[a as usize].sqrt(),
                TapeOp::Square(a) => {
                    let v = regs[a as usize];
                    v * v
                }
                TapeOp::Add(a, b) => regs[a as usize] + regs[b as usize],
                TapeOp::Sub(a, b) => regs[a as usize] - regs[b as usize],
                TapeOp::Mul(a, b) => regs[a as usize] * regs[b as usize],
                TapeOp::Div(a, b) => regs[a as usize] / regs[b as usize],
                TapeOp::Min(a, b) => {
                    regs[a as usize].min(regs[b as usize])
                }
                TapeOp::Max(a, b) => {
                    regs[a as usize].max(regs[b as usize])
                }
            };
        }
        *regs.last().unwrap()
    }

    fn run_grad(
        tape: &Tape,
        x: f64,
        y: f64,
        z: f64,
        regs: &mut Vec<Grad>,
    ) -> Grad {
        regs.clear();
        regs.resize(tape.ops.len(), Grad::default());
        for (i, op) in tape.ops.iter().enumerate() {
            regs[i] = match *op {
                TapeOp::Const(c) => c.into(),
                TapeOp::Input(Var::X) => Grad::new(x, 1.0, 0.0, 0.0),
                TapeOp::Input(Var::Y) => Grad::new(y, 0.0, 1.0, 0.0),
                TapeOp::Input(Var::Z) => Grad::new(z, 0.0, 0.0, 1.0),
                TapeOp::Copy(a) => regs[a as usize],
                TapeOp::Neg(a) => -regs[a as usize],
                TapeOp::Abs(a) => regs[a as usize].abs(),
                TapeOp::Sqrt(a) => regs[a as usize].sqrt(),
                TapeOp::Square(a) => regs[a as usize].square(),
                TapeOp::Add(a, b) => regs[a as usize] + regs[b as usize],
                TapeOp::Sub(a, b) => regs[a as usize] - regs[b as usize],
                TapeOp::Mul(a, b) => regs[a as usize] * regs[b as usize],
                TapeOp::Div(a, b) => regs[a as usize] / regs[b as usize],
                TapeOp::Min(a, b) => {
                    regs[a as usize].min(regs[b as usize])
                }
                TapeOp::Max(a, b) => {
                    regs[a as usize].max(regs[b as usize])
                }
            };
        }
        *regs.last().unwrap()
    }
}

impl Evaluator for VmEvaluator {
    const BATCH_SIZE: usize = 256;

    fn eval_interval(
        &mut self,
        lower: Vector3<f64>,
        upper: Vector3<f64>,
    ) -> Interval {
        let VmEvaluator {
            tapes,
            choices,
            iregs,
            ..
        } = self;
        let tape = tapes.last().unwrap();
        Self::run_interval(
            tape,
            Interval::new(lower.x, upper.x),
            Interval::new(lower.y, upper.y),
            Interval::new(lower.z, upper.z),
            choices,
            iregs,
        )
    }

    fn set(&mut self, p: Vector3<f64>, slot: usize) {
        assert!(slot < Self::BATCH_SIZE);
        self.xs[slot] = p.x;
        self.ys[slot] = p.y;
        self.zs[slot] = p.z;
        self.raw[slot] = false;
    }

    fn set_raw(&mut self, p: Vector3<f64>, slot: usize) {
        assert!(slot < Self::BATCH_SIZE);
        self.xs[slot] = p.x;
        self.ys[slot] = p.y;
        self.zs[slot] = p.z;
        self.raw[slot] = true;
    }

    fn values(&mut self, count: usize) -> &[f64] {
        assert!(count <= Self::BATCH_SIZE);
        let VmEvaluator {
            tapes,
            caches,
            xs,
            ys,
            zs,
            raw,
            out,
            fregs,
            ..
        } = self;
        let tape = tapes.last().unwrap();
        let cache = caches.last_mut().unwrap();
        for i in 0..count {
            let (x, y, z) = (xs[i], ys[i], zs[i]);
            out[i] = if raw[i] {
                Self::run_point(tape, x, y, z, fregs)
            } else {
                let key = (x.to_bits(), y.to_bits(), z.to_bits());
                match cache.get(&key) {
                    Some(v) => *v,
                    None => {
                        let v = Self::run_point(tape, x, y, z, fregs);
                        cache.insert(key, v);
                        v
                    }
                }
            };
        }
        &out[..count]
    }

    fn derivs(&mut self, count: usize) -> Derivs<'_> {
        assert!(count <= Self::BATCH_SIZE);
        let VmEvaluator {
            tapes,
            xs,
            ys,
            zs,
            out,
            out_dx,
            out_dy,
            out_dz,
            gregs,
            ..
        } = self;
        let tape = tapes.last().unwrap();
        for i in 0..count {
            let g = Self::run_grad(tape, xs[i], ys[i], zs[i], gregs);
            out[i] = g.v;
            out_dx[i] = g.dx;
            out_dy[i] = g.dy;
            out_dz[i] = g.dz;
        }
        Derivs {
            v: &out[..count],
            dx: &out_dx[..count],
            dy: &out_dy[..count],
            dz: &out_dz[..count],
        }
    }

    fn push(&mut self) {
        let tape = self.tapes.last().unwrap();
        let next = if self.choices.len() == tape.choice_count {
            let t = tape.simplify(&self.choices);
            log::trace!(
                "specialized tape: {} -> {} ops",
                tape.ops.len(),
                t.ops.len()
            );
            t
        } else {
            tape.clone()
        };
        self.tapes.push(next);
        self.caches.push(HashMap::new());
        self.choices.clear();
    }

    fn pop(&mut self) {
        assert!(self.tapes.len() > 1, "unbalanced evaluator pop");
        self.tapes.pop();
        self.caches.pop();
        self.choices.clear();
    }
}
