use arrayvec::ArrayVec;
use nalgebra::{SVector, Vector3};

/// An axis-aligned box in `N`-dimensional space (`N` = 2 or 3)
///
/// Evaluators always work in 3-space, so a 2D region carries the one fixed
/// perpendicular coordinate that embeds it for evaluation.
#[derive(Clone, Debug)]
pub struct Region<const N: usize> {
    /// Lower bounds of the region
    pub lower: SVector<f64, N>,
    /// Upper bounds of the region
    pub upper: SVector<f64, N>,
    /// Fixed coordinates for the remaining `3 - N` axes
    pub perp: ArrayVec<f64, 3>,
}

impl<const N: usize> Region<N> {
    /// Builds a new region with any perpendicular coordinates set to zero
    pub fn new(lower: SVector<f64, N>, upper: SVector<f64, N>) -> Self {
        let mut perp = ArrayVec::new();
        for _ in N..3 {
            perp.push(0.0);
        }
        Self { lower, upper, perp }
    }

    /// Builds a new region with the given perpendicular coordinates
    ///
    /// # Panics
    /// If `perp` does not have exactly `3 - N` entries
    pub fn with_perp(
        lower: SVector<f64, N>,
        upper: SVector<f64, N>,
        perp: &[f64],
    ) -> Self {
        assert_eq!(perp.len(), 3 - N);
        Self {
            lower,
            upper,
            perp: perp.iter().copied().collect(),
        }
    }

    /// Returns the volume (area, for 2D regions) of the box
    pub fn volume(&self) -> f64 {
        (self.upper - self.lower).product()
    }

    /// Splits the region into 2^N sub-regions at the midpoint
    ///
    /// Bit `k` of a child's index selects the upper half along axis `k`.
    pub fn subdivide(&self) -> ArrayVec<Region<N>, 8> {
        let mid = (self.lower + self.upper) * 0.5;
        let mut out = ArrayVec::new();
        for i in 0..(1 << N) {
            let lower = SVector::from_fn(|k, _| {
                if i & (1 << k) != 0 {
                    mid[k]
                } else {
                    self.lower[k]
                }
            });
            let upper = SVector::from_fn(|k, _| {
                if i & (1 << k) != 0 {
                    self.upper[k]
                } else {
                    mid[k]
                }
            });
            out.push(Region {
                lower,
                upper,
                perp: self.perp.clone(),
            });
        }
        out
    }

    /// Returns the position of the given corner (0 to 2^N - 1)
    ///
    /// Bit `k` of the corner index selects the upper bound along axis `k`.
    pub fn corner(&self, i: usize) -> SVector<f64, N> {
        debug_assert!(i < (1 << N));
        SVector::from_fn(|k, _| {
            if i & (1 << k) != 0 {
                self.upper[k]
            } else {
                self.lower[k]
            }
        })
    }

    /// Embeds an N-dimensional position into 3-space using `perp`
    pub fn pos3(&self, p: &SVector<f64, N>) -> Vector3<f64> {
        let mut out = Vector3::zeros();
        for i in 0..N {
            out[i] = p[i];
        }
        for (i, p) in self.perp.iter().enumerate() {
            out[N + i] = *p;
        }
        out
    }

    /// Lower corner of the region, embedded into 3-space
    pub fn lower3(&self) -> Vector3<f64> {
        self.pos3(&self.lower)
    }

    /// Upper corner of the region, embedded into 3-space
    pub fn upper3(&self) -> Vector3<f64> {
        self.pos3(&self.upper)
    }

    /// Corner position, embedded into 3-space
    pub fn corner3(&self, i: usize) -> Vector3<f64> {
        self.pos3(&self.corner(i))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::{Vector2, Vector3};

    #[test]
    fn test_volume() {
        let r = Region::<3>::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 2.0, 3.0),
        );
        assert_eq!(r.volume(), 6.0);

        let r = Region::<2>::new(Vector2::new(-1.0, -1.0), Vector2::zeros());
        assert_eq!(r.volume(), 1.0);
    }

    #[test]
    fn test_subdivide() {
        let r = Region::<3>::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
        );
        let rs = r.subdivide();
        assert_eq!(rs.len(), 8);
        for (i, s) in rs.iter().enumerate() {
            assert_eq!(s.volume(), 1.0);
            // Child i owns corner i of the parent
            assert_eq!(s.corner(i), r.corner(i));
            // Every child touches the parent's center
            assert_eq!(s.corner(7 - i), Vector3::zeros());
        }
    }

    #[test]
    fn test_corner_decode() {
        let r = Region::<2>::new(Vector2::new(0.0, 0.0), Vector2::new(1.0, 2.0));
        assert_eq!(r.corner(0), Vector2::new(0.0, 0.0));
        assert_eq!(r.corner(1), Vector2::new(1.0, 0.0));
        assert_eq!(r.corner(2), Vector2::new(0.0, 2.0));
        assert_eq!(r.corner(3), Vector2::new(1.0, 2.0));
    }

    #[test]
    fn test_perp_embedding() {
        let r = Region::<2>::with_perp(
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 1.0),
            &[0.5],
        );
        assert_eq!(r.lower3(), Vector3::new(0.0, 0.0, 0.5));
        assert_eq!(r.upper3(), Vector3::new(1.0, 1.0, 0.5));
        for s in r.subdivide() {
            assert_eq!(s.perp.as_slice(), &[0.5]);
        }

        let r = Region::<3>::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0));
        assert!(r.perp.is_empty());
        assert_eq!(r.upper3(), Vector3::new(1.0, 1.0, 1.0));
    }
}
