//! Quadric error functions
use nalgebra::{
    allocator::Allocator, linalg::SymmetricEigen, Const, DefaultAllocator,
    DimDiff, DimSub, SMatrix, SVector, U1,
};

/// Eigenvalues below this magnitude are treated as zero when inverting AtA
///
/// This is the fixed threshold from "Dual Contouring: The Secret Sauce",
/// tuned for unit-length gradient rows; it also defines the feature rank
/// (1 = face, 2 = edge, 3 = corner).
pub const EIGENVALUE_CUTOFF: f64 = 0.1;

/// Solver for a quadratic error function to position a vertex within a cell
///
/// The error is E(x) = Σ (nᵢ · x − bᵢ)², stored compactly as AᵀA, Aᵀb and
/// bᵀb so that merging two solvers is field-wise addition.  The mass point
/// (centroid of surface intersections) is kept in homogeneous form for the
/// same reason.
#[derive(Copy, Clone, Debug)]
pub struct QuadraticErrorSolver<const N: usize> {
    /// A^T A term
    ata: SMatrix<f64, N, N>,

    /// A^T b term
    atb: SVector<f64, N>,

    /// b^T b term
    btb: f64,

    /// Sum of mass-point contributions; divide by `mass_weight` to use
    mass_point: SVector<f64, N>,

    /// Number of accumulated mass-point contributions
    mass_weight: f64,
}

impl<const N: usize> Default for QuadraticErrorSolver<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of solving a [`QuadraticErrorSolver`]
#[derive(Copy, Clone, Debug)]
pub struct QefSolution<const N: usize> {
    /// Vertex position minimizing the error
    pub vert: SVector<f64, N>,
    /// Residual error at the vertex
    pub err: f64,
    /// Number of eigenvalues above [`EIGENVALUE_CUTOFF`]
    pub rank: u32,
}

impl<const N: usize> QuadraticErrorSolver<N> {
    pub fn new() -> Self {
        Self {
            ata: SMatrix::from_element(0.0),
            atb: SVector::from_element(0.0),
            btb: 0.0,
            mass_point: SVector::from_element(0.0),
            mass_weight: 0.0,
        }
    }

    /// Adds one row of the error function
    ///
    /// `norm` is a unit surface normal (or the zero vector, which
    /// contributes only to bᵀb) and `b = norm · p − v` for a sample at
    /// position `p` with field value `v`.
    pub fn add_sample(&mut self, norm: SVector<f64, N>, b: f64) {
        self.ata += norm * norm.transpose();
        self.atb += norm * b;
        self.btb += b * b;
    }

    /// Accumulates a surface intersection into the mass point
    pub fn add_mass_point(&mut self, pos: SVector<f64, N>) {
        self.mass_point += pos;
        self.mass_weight += 1.0;
    }

    /// Returns the centroid of accumulated intersections
    ///
    /// Not-a-number if nothing has been accumulated.
    pub fn mass_point(&self) -> SVector<f64, N> {
        self.mass_point / self.mass_weight
    }

    /// Returns the homogeneous weight of the mass point
    pub fn mass_weight(&self) -> f64 {
        self.mass_weight
    }

    /// Adds another solver's error matrices (but not its mass point)
    pub fn merge_matrices(&mut self, other: &Self) {
        self.ata += other.ata;
        self.atb += other.atb;
        self.btb += other.btb;
    }

    /// Adds another solver's mass-point accumulator
    pub fn merge_mass(&mut self, other: &Self) {
        self.mass_point += other.mass_point;
        self.mass_weight += other.mass_weight;
    }

    #[cfg(test)]
    pub(crate) fn ata(&self) -> &SMatrix<f64, N, N> {
        &self.ata
    }
}

impl<const N: usize> QuadraticErrorSolver<N>
where
    Const<N>: DimSub<U1>,
    DefaultAllocator: Allocator<f64, DimDiff<Const<N>, U1>>,
{
    /// Solves the QEF, minimizing towards the mass point
    ///
    /// AtA is real-symmetric, so its eigendecomposition doubles as an SVD;
    /// eigenvalues below [`EIGENVALUE_CUTOFF`] are truncated when forming
    /// the pseudo-inverse, which biases the solution towards the mass point
    /// along under-determined directions.
    pub fn solve(&self) -> QefSolution<N> {
        let eigen = SymmetricEigen::<f64, Const<N>>::new(self.ata);

        let rank = eigen
            .eigenvalues
            .iter()
            .filter(|l| l.abs() >= EIGENVALUE_CUTOFF)
            .count() as u32;

        let d = eigen.eigenvalues.map(|l| {
            if l.abs() < EIGENVALUE_CUTOFF {
                0.0
            } else {
                1.0 / l
            }
        });
        let pseudo_inv = eigen.eigenvectors
            * SMatrix::<f64, N, N>::from_diagonal(&d)
            * eigen.eigenvectors.transpose();

        let center = self.mass_point();
        let vert = pseudo_inv * (self.atb - self.ata * center) + center;
        let err = (self.ata * vert).dot(&vert) - 2.0 * vert.dot(&self.atb)
            + self.btb;
        QefSolution { vert, err, rank }
    }
}
