//! Adaptive cell trees with QEF vertex placement
use super::{
    cell::{corners_are_manifold, edges, CellType},
    qef::QuadraticErrorSolver,
    region::Region,
};
use crate::eval::{Evaluator, PushGuard};
use nalgebra::{
    allocator::Allocator, Const, DefaultAllocator, DimDiff, DimSub, SVector,
    Vector3, U1,
};

/// Minimum cell volume for recursive subdivision
///
/// Ambiguous cells below this volume are classified by corner sampling
/// instead of recursing further.
pub const MIN_CELL_VOLUME: f64 = 1e-3;

/// Maximum QEF residual for collapsing a branch into a leaf
pub const MAX_COLLAPSE_ERROR: f64 = 1e-8;

/// Per-axis sample count for leaf QEF construction
const SAMPLE_RES: usize = 4;
const MAX_SAMPLES: usize = SAMPLE_RES * SAMPLE_RES * SAMPLE_RES;

/// Points per edge-intersection search stage
const EDGE_SEARCH_SIZE: usize = 16;
/// Number of edge-intersection search stages
const EDGE_SEARCH_DEPTH: usize = 4;

/// A cell in an adaptively-subdivided spatial partition
///
/// Construction classifies the cell against the field, recursively builds
/// children for ambiguous cells above the volume floor, places a vertex in
/// each ambiguous leaf by QEF minimization, and merges subtrees bottom-up
/// where topology allows and the merged QEF residual stays negligible.
///
/// After [`build`](XTree::build) returns the tree is immutable; downstream
/// walkers traverse it through the accessor methods.
#[derive(Debug)]
pub struct XTree<const N: usize> {
    region: Region<N>,
    cell_type: CellType,

    /// Empty for leaves; 2^N entries for branches
    children: Vec<XTree<N>>,

    /// Corner classifications; only the first 2^N entries are meaningful,
    /// and none of them is ever `Ambiguous`
    corners: [CellType; 8],

    /// 0 for leaves, 1 + max child level for branches
    level: u32,

    manifold: bool,

    /// Feature rank of the QEF solution (1 = face, 2 = edge, 3 = corner)
    rank: u32,

    qef: QuadraticErrorSolver<N>,

    /// Vertex position; meaningful for ambiguous leaves (including
    /// collapsed branches)
    vert: SVector<f64, N>,
}

impl<const N: usize> XTree<N> {
    fn uniform(region: Region<N>, t: CellType) -> Self {
        XTree {
            region,
            cell_type: t,
            children: vec![],
            corners: [t; 8],
            level: 0,
            manifold: true,
            rank: 0,
            qef: QuadraticErrorSolver::new(),
            vert: SVector::from_element(0.0),
        }
    }

    /// Checks whether this cell has children
    pub fn is_branch(&self) -> bool {
        !self.children.is_empty()
    }

    /// Returns this cell's children (empty for leaves)
    pub fn children(&self) -> &[XTree<N>] {
        &self.children
    }

    /// Looks up the child in the given corner, if present
    pub fn child(&self, i: usize) -> Option<&XTree<N>> {
        self.children.get(i)
    }

    /// Returns the region covered by this cell
    pub fn region(&self) -> &Region<N> {
        &self.region
    }

    /// Returns this cell's classification
    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    /// Returns the corner classifications (2^N entries)
    pub fn corners(&self) -> &[CellType] {
        &self.corners[..1 << N]
    }

    /// Packs the corner states into a bitmask (filled = 1)
    pub fn corner_mask(&self) -> u8 {
        let mut mask = 0;
        for i in 0..(1 << N) {
            if self.corners[i] == CellType::Filled {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Height of this cell above the deepest leaf below it
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Whether this cell's sign configuration admits a single surface patch
    pub fn manifold(&self) -> bool {
        self.manifold
    }

    /// Feature rank of the QEF solution
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Vertex position within the cell
    pub fn vert(&self) -> SVector<f64, N> {
        self.vert
    }

    /// Vertex position, embedded into 3-space via the region's `perp`
    pub fn vert3(&self) -> Vector3<f64> {
        self.region.pos3(&self.vert)
    }

    fn zero_vert() -> SVector<f64, N> {
        SVector::from_element(0.0)
    }

    fn vert_from_normal(g: Vector3<f64>) -> SVector<f64, N> {
        SVector::<f64, N>::from_fn(|k, _| g[k])
    }
}

impl<const N: usize> XTree<N>
where
    Const<N>: DimSub<U1>,
    DefaultAllocator: Allocator<f64, DimDiff<Const<N>, U1>>,
{
    /// Builds a cell tree covering the given region
    ///
    /// The evaluator's `push`/`pop` frames bracket every ambiguous descent,
    /// so backends can specialize themselves per spatial branch.
    pub fn build<E: Evaluator>(eval: &mut E, region: Region<N>) -> Self {
        // Only 2D and 3D cell trees are supported
        const { assert!(N >= 2 && N <= 3) };
        // Every batch must fit in the evaluator's slots
        const {
            assert!(SAMPLE_RES.pow(N as u32) < E::BATCH_SIZE);
            assert!(EDGE_SEARCH_SIZE <= E::BATCH_SIZE);
            assert!((1 << N) <= E::BATCH_SIZE);
        };

        let i = eval.eval_interval(region.lower3(), region.upper3());
        if i.is_filled() {
            return Self::uniform(region, CellType::Filled);
        } else if i.is_empty() {
            return Self::uniform(region, CellType::Empty);
        }

        let cell_count = 1 << N;
        let mut corners = [CellType::Empty; 8];
        let mut children = Vec::new();
        let cell_type;
        {
            let mut eval = PushGuard::new(eval);
            let mut all_empty = true;
            let mut all_full = true;
            if region.volume() > MIN_CELL_VOLUME {
                children.reserve_exact(cell_count);
                for (i, r) in region.subdivide().into_iter().enumerate() {
                    let child = Self::build(&mut *eval, r);
                    // Child i owns corner i of this cell
                    corners[i] = child.corners[i];
                    all_empty &= child.cell_type == CellType::Empty;
                    all_full &= child.cell_type == CellType::Filled;
                    children.push(child);
                }
            } else {
                // Too small to recurse; classify by corner sampling
                for i in 0..cell_count {
                    eval.set(region.corner3(i), i);
                }
                let vs = eval.values(cell_count);
                for i in 0..cell_count {
                    corners[i] = if vs[i] < 0.0 {
                        CellType::Filled
                    } else {
                        CellType::Empty
                    };
                    all_full &= corners[i] == CellType::Filled;
                    all_empty &= corners[i] == CellType::Empty;
                }
            }
            cell_type = if all_empty {
                CellType::Empty
            } else if all_full {
                CellType::Filled
            } else {
                CellType::Ambiguous
            };
        }

        let mut out = XTree {
            region,
            cell_type,
            children,
            corners,
            level: 0,
            manifold: false,
            rank: 0,
            qef: QuadraticErrorSolver::new(),
            vert: Self::zero_vert(),
        };

        if out.cell_type != CellType::Ambiguous {
            out.corners = [out.cell_type; 8];
            out.manifold = true;
        }

        if out.is_branch() {
            out.level =
                1 + out.children.iter().map(|c| c.level).max().unwrap();
            if out.children.iter().all(|c| !c.is_branch()) {
                out.simplify();
            }
        } else if out.cell_type == CellType::Ambiguous {
            out.build_leaf(eval);
        }
        out
    }

    /// Attempts to merge a branch whose children are all leaves
    ///
    /// Implements the three checks from Ju et al. 2002, "Simplification
    /// with topology safety"; if they pass and the summed QEF solves with
    /// a negligible residual, the children are dropped and this cell
    /// becomes a leaf.
    fn simplify(&mut self) {
        self.manifold = corners_are_manifold::<N>(self.corner_mask())
            && self.children.iter().all(|c| c.manifold)
            && self.leafs_are_manifold();
        if !self.manifold {
            return;
        }

        // Feature rank is the maximum of the children's ranks; only
        // children at that rank contribute to the mass point, so that
        // lower-feature cells don't drag the centroid off the feature
        self.rank = self.children.iter().map(|c| c.rank).max().unwrap();
        for c in &self.children {
            if c.rank == self.rank {
                self.qef.merge_mass(&c.qef);
            }
            self.qef.merge_matrices(&c.qef);
        }

        let sol = self.qef.solve();
        self.vert = sol.vert;
        if sol.err < MAX_COLLAPSE_ERROR {
            log::trace!(
                "collapsing branch at level {} (err = {:e})",
                self.level,
                sol.err
            );
            self.children.clear();
            self.level = 0;
        }
    }

    /// Checks that merging this branch's leaves cannot change topology
    ///
    /// For every coarse k-face of this cell (k = 1 edges, k = 2 faces,
    /// k = N the cell center), the sign at the face midpoint must agree
    /// with at least one of the face's corners.  The midpoint sign is read
    /// from the child that owns it: the child in corner `a` has the
    /// midpoint of face `(a, s)` as its own corner `a | s`.
    fn leafs_are_manifold(&self) -> bool {
        let full = (1usize << N) - 1;
        for s in 1..=full {
            let fixed = full & !s;
            let mut a = fixed;
            loop {
                let center = self.children[a].corners[a | s];
                let mut agreed = false;
                let mut t = s;
                loop {
                    if self.corners[a | t] == center {
                        agreed = true;
                        break;
                    }
                    if t == 0 {
                        break;
                    }
                    t = (t - 1) & s;
                }
                if !agreed {
                    return false;
                }
                if a == 0 {
                    break;
                }
                a = (a - 1) & fixed;
            }
        }
        true
    }

    /// Populates vertex data for an ambiguous leaf
    fn build_leaf<E: Evaluator>(&mut self, eval: &mut E) {
        self.manifold = corners_are_manifold::<N>(self.corner_mask());

        // The mass point is built from edge intersections in every case:
        // the non-manifold case uses it as the vertex directly, and the
        // manifold case minimizes the QEF towards it
        for (u, v) in edges::<N>() {
            if self.corners[u] == self.corners[v] {
                continue;
            }
            let (mut inside, mut outside) =
                if self.corners[u] == CellType::Filled {
                    (self.region.corner(u), self.region.corner(v))
                } else {
                    (self.region.corner(v), self.region.corner(u))
                };

            // N-ary search for the crossing along this edge
            for _ in 0..EDGE_SEARCH_DEPTH {
                let mut ps =
                    [Self::zero_vert(); EDGE_SEARCH_SIZE];
                for (j, p) in ps.iter_mut().enumerate() {
                    let frac = j as f64 / (EDGE_SEARCH_SIZE - 1) as f64;
                    *p = inside * (1.0 - frac) + outside * frac;
                    eval.set_raw(self.region.pos3(p), j);
                }
                let out = eval.values(EDGE_SEARCH_SIZE);
                debug_assert!(out[0] < 0.0);
                let j = (1..EDGE_SEARCH_SIZE)
                    .find(|&j| out[j] >= 0.0)
                    .unwrap_or(EDGE_SEARCH_SIZE - 1);
                inside = ps[j - 1];
                outside = ps[j];
            }
            self.qef.add_mass_point(inside);
        }

        if self.manifold {
            self.sample_qef(eval);
            let sol = self.qef.solve();
            self.rank = sol.rank;
            self.vert = sol.vert;
        } else {
            // As described in "Dual Contouring: The Secret Sauce",
            // non-manifold cells place their vertex at the mass point
            self.vert = self.qef.mass_point();
        }
    }

    /// Builds the QEF from a regular grid of gradient samples
    fn sample_qef<E: Evaluator>(&mut self, eval: &mut E) {
        let num = SAMPLE_RES.pow(N as u32);

        // Per-axis grid positions covering the cell, corners included
        let mut pts = [[0.0; N]; SAMPLE_RES];
        for (r, row) in pts.iter_mut().enumerate() {
            let frac = r as f64 / (SAMPLE_RES - 1) as f64;
            for (j, p) in row.iter_mut().enumerate() {
                *p = self.region.lower[j] * (1.0 - frac)
                    + self.region.upper[j] * frac;
            }
        }

        let mut positions = [Self::zero_vert(); MAX_SAMPLES];
        for (i, pos) in positions.iter_mut().enumerate().take(num) {
            for j in 0..N {
                let r = (i % SAMPLE_RES.pow(j as u32 + 1))
                    / SAMPLE_RES.pow(j as u32);
                pos[j] = pts[r][j];
            }
            eval.set(self.region.pos3(pos), i);
        }

        let ds = eval.derivs(num);
        for i in 0..num {
            // One plane per sample; degenerate gradients contribute an
            // empty row (but keep their field value in b)
            let g = Vector3::new(ds.dx[i], ds.dy[i], ds.dz[i]);
            let norm = g.norm();
            let row = if norm.is_finite() && norm > 0.0 {
                let g = g / norm;
                Self::vert_from_normal(g)
            } else {
                Self::zero_vert()
            };
            let b = row.dot(&positions[i]) - ds.v[i];
            self.qef.add_sample(row, b);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        context::{Context, Node},
        eval::VmEvaluator,
    };
    use nalgebra::{Vector2, Vector3};

    fn sphere(ctx: &mut Context, center: [f64; 3], radius: f64) -> Node {
        let (x, y, z) = ctx.axes();
        let cx = ctx.constant(center[0]);
        let cy = ctx.constant(center[1]);
        let cz = ctx.constant(center[2]);
        let dx = ctx.sub(x, cx).unwrap();
        let dy = ctx.sub(y, cy).unwrap();
        let dz = ctx.sub(z, cz).unwrap();
        let dx2 = ctx.square(dx).unwrap();
        let dy2 = ctx.square(dy).unwrap();
        let dz2 = ctx.square(dz).unwrap();
        let s = ctx.add(dx2, dy2).unwrap();
        let s = ctx.add(s, dz2).unwrap();
        let r = ctx.sqrt(s).unwrap();
        let radius = ctx.constant(radius);
        ctx.sub(r, radius).unwrap()
    }

    fn cube(
        ctx: &mut Context,
        bx: [f64; 2],
        by: [f64; 2],
        bz: [f64; 2],
    ) -> Node {
        let (x, y, z) = ctx.axes();
        let mut planes = vec![];
        for (v, b) in [(x, bx), (y, by), (z, bz)] {
            let lo = ctx.constant(b[0]);
            let hi = ctx.constant(b[1]);
            planes.push(ctx.sub(lo, v).unwrap());
            planes.push(ctx.sub(v, hi).unwrap());
        }
        let mut out = planes[0];
        for p in &planes[1..] {
            out = ctx.max(out, *p).unwrap();
        }
        out
    }

    fn circle(ctx: &mut Context, radius: f64) -> Node {
        let (x, y, _) = ctx.axes();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let r = ctx.sqrt(s).unwrap();
        let radius = ctx.constant(radius);
        ctx.sub(r, radius).unwrap()
    }

    fn build3(ctx: &Context, shape: Node) -> XTree<3> {
        let mut eval = VmEvaluator::new(ctx, shape).unwrap();
        let region = Region::<3>::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
        );
        let out = XTree::build(&mut eval, region);
        assert_eq!(eval.depth(), 1, "unbalanced push/pop");
        out
    }

    fn leaves<const N: usize>(t: &XTree<N>) -> Vec<&XTree<N>> {
        let mut out = vec![];
        fn walk<'a, const N: usize>(
            t: &'a XTree<N>,
            out: &mut Vec<&'a XTree<N>>,
        ) {
            if t.is_branch() {
                for c in t.children() {
                    walk(c, out);
                }
            } else {
                out.push(t);
            }
        }
        walk(t, &mut out);
        out
    }

    /// Walks down to the leaf whose region contains the given point
    fn descend<'a>(mut t: &'a XTree<3>, p: Vector3<f64>) -> &'a XTree<3> {
        while t.is_branch() {
            let r = t.region();
            let mid = (r.lower + r.upper) * 0.5;
            let mut i = 0;
            for k in 0..3 {
                if p[k] > mid[k] {
                    i |= 1 << k;
                }
            }
            t = &t.children()[i];
        }
        t
    }

    fn check_invariants<const N: usize>(t: &XTree<N>) {
        if t.is_branch() {
            assert_eq!(t.children().len(), 1 << N);
            assert!(t.level() >= 1);
            assert_eq!(
                t.level(),
                1 + t.children().iter().map(|c| c.level()).max().unwrap()
            );
            for i in 0..(1 << N) {
                // Diagonal corner pickup
                assert_eq!(t.corners()[i], t.children()[i].corners()[i]);
                check_invariants(&t.children()[i]);
            }
            if t.manifold() {
                // When a branch accumulated its children's QEF, the sum
                // must match a field-wise re-accumulation
                let mut sum = QuadraticErrorSolver::<N>::new();
                for c in t.children() {
                    sum.merge_matrices(&c.qef);
                }
                let d = (t.qef.ata() - sum.ata()).norm();
                assert!(d < 1e-9, "bad branch QEF sum (delta {d})");
            }
        } else {
            assert!(t.children().is_empty());
            assert_eq!(t.level(), 0);
        }
        if t.cell_type() != CellType::Ambiguous {
            assert!(t.manifold());
            for i in 0..(1 << N) {
                assert_eq!(t.corners()[i], t.cell_type());
            }
        } else if !t.is_branch() {
            // Every ambiguous leaf has at least one edge crossing
            assert!(t.qef.mass_weight() > 0.0);
        }
    }

    #[test]
    fn test_empty_and_filled() {
        let mut ctx = Context::new();
        let one = ctx.constant(1.0);
        let tree = build3(&ctx, one);
        assert_eq!(tree.cell_type(), CellType::Empty);
        assert!(!tree.is_branch());
        assert_eq!(tree.level(), 0);
        assert!(tree.manifold());

        let neg = ctx.constant(-1.0);
        let tree = build3(&ctx, neg);
        assert_eq!(tree.cell_type(), CellType::Filled);
        assert!(!tree.is_branch());
        assert!(tree.manifold());
    }

    #[test]
    fn test_sphere() {
        let mut ctx = Context::new();
        let shape = sphere(&mut ctx, [0.0; 3], 1.0);
        let tree = build3(&ctx, shape);
        assert_eq!(tree.cell_type(), CellType::Ambiguous);
        check_invariants(&tree);

        let mut ambiguous = 0;
        let mut filled = 0;
        let mut empty = 0;
        for leaf in leaves(&tree) {
            match leaf.cell_type() {
                CellType::Filled => filled += 1,
                CellType::Empty => empty += 1,
                CellType::Ambiguous => {
                    ambiguous += 1;
                    assert!(leaf.manifold());
                    let r = leaf.vert().norm();
                    assert!(
                        (r - 1.0).abs() < 0.05,
                        "vertex {:?} is not on the sphere",
                        leaf.vert()
                    );
                }
            }
        }
        assert!(ambiguous > 0);
        assert!(filled > 0);
        assert!(empty > 0);
    }

    #[test]
    fn test_plane_collapses() {
        let mut ctx = Context::new();
        let shape = ctx.z();
        let tree = build3(&ctx, shape);

        // The field is linear, so the QEF is exact at every scale and the
        // entire tree merges into a single cell
        assert!(!tree.is_branch());
        assert_eq!(tree.cell_type(), CellType::Ambiguous);
        assert_eq!(tree.rank(), 1);
        assert!(tree.vert()[2].abs() < 1e-6);
        check_invariants(&tree);
    }

    #[test]
    fn test_crease_rank() {
        let mut ctx = Context::new();
        let a = sphere(&mut ctx, [-0.25, 0.0, 0.0], 0.6);
        let b = sphere(&mut ctx, [0.35, 0.0, 0.0], 0.6);
        let shape = ctx.min(a, b).unwrap();
        let tree = build3(&ctx, shape);
        check_invariants(&tree);

        // The spheres intersect in a sharp crease circle on the plane
        // x = 0.05; the cell containing a crease point sees both gradient
        // populations, and the collapse threshold keeps it un-merged
        assert!(tree.is_branch());
        let crease_r = (0.36f64 - 0.09).sqrt();
        let p = Vector3::new(
            0.05,
            crease_r / 2.0f64.sqrt(),
            crease_r / 2.0f64.sqrt(),
        );
        let leaf = descend(&tree, p);
        assert_eq!(leaf.cell_type(), CellType::Ambiguous);
        assert_eq!(leaf.rank(), 2);
        let v = leaf.vert();
        assert!((v[0] - 0.05).abs() < 0.05, "off-crease vertex {v:?}");
        let r = (v[1] * v[1] + v[2] * v[2]).sqrt();
        assert!((r - crease_r).abs() < 0.05, "off-crease vertex {v:?}");
    }

    #[test]
    fn test_cube_corner_rank() {
        let mut ctx = Context::new();
        let shape =
            cube(&mut ctx, [-0.8, 0.3], [-0.8, 0.3], [-0.8, 0.3]);
        let tree = build3(&ctx, shape);
        check_invariants(&tree);

        let corner = Vector3::new(0.3, 0.3, 0.3);
        let leaf = descend(&tree, corner);
        assert_eq!(leaf.cell_type(), CellType::Ambiguous);
        assert_eq!(leaf.rank(), 3);
        assert!(
            (leaf.vert() - corner).norm() < 0.05,
            "vertex {:?} is not at the corner",
            leaf.vert()
        );
    }

    #[test]
    fn test_degenerate_gradients() {
        // A sphere smaller than a leaf cell, placed so that a grid sample
        // lands exactly on its center, where the gradient is NaN
        let mut ctx = Context::new();
        let shape = sphere(&mut ctx, [0.0; 3], 0.04);
        let tree = build3(&ctx, shape);
        check_invariants(&tree);

        let mut ambiguous = 0;
        for leaf in leaves(&tree) {
            if leaf.cell_type() == CellType::Ambiguous {
                ambiguous += 1;
                assert!(
                    leaf.vert().iter().all(|v| v.is_finite()),
                    "non-finite vertex {:?}",
                    leaf.vert()
                );
                assert!(leaf.vert().norm() < 0.2);
            }
        }
        assert!(ambiguous > 0);
    }

    #[test]
    fn test_circle_2d() {
        let mut ctx = Context::new();
        let shape = circle(&mut ctx, 0.5);
        let mut eval = VmEvaluator::new(&ctx, shape).unwrap();
        let region = Region::<2>::with_perp(
            Vector2::new(-1.0, -1.0),
            Vector2::new(1.0, 1.0),
            &[0.25],
        );
        let tree = XTree::build(&mut eval, region);
        assert_eq!(eval.depth(), 1, "unbalanced push/pop");
        check_invariants(&tree);
        assert!(tree.is_branch());

        let mut ring = 0;
        for leaf in leaves(&tree) {
            if leaf.cell_type() == CellType::Ambiguous {
                ring += 1;
                assert!(leaf.manifold());
                let r = leaf.vert().norm();
                assert!(
                    (r - 0.5).abs() < 0.05,
                    "vertex {:?} is not on the circle",
                    leaf.vert()
                );
                // The perpendicular coordinate pads the 3D position
                assert_eq!(leaf.vert3().z, 0.25);
                assert_eq!(leaf.vert3().x, leaf.vert()[0]);
            }
        }
        assert!(ring > 8);
    }
}
