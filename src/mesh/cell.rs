//! Cell classification and corner topology
use arrayvec::ArrayVec;

/// Classification of a cell against the scalar field
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CellType {
    /// Every point in the cell is outside the surface
    Empty,
    /// Every point in the cell is inside the surface
    Filled,
    /// The cell may contain the surface
    Ambiguous,
}

/// Returns the edges of an N-dimensional cell as corner index pairs
///
/// Edges connect corners that differ in exactly one bit; the lower corner
/// comes first.  There are 4 edges for N = 2 and 12 for N = 3.
pub(crate) fn edges<const N: usize>() -> ArrayVec<(usize, usize), 12> {
    let mut out = ArrayVec::new();
    for t in 0..N {
        for i in 0..(1 << N) {
            if i & (1 << t) == 0 {
                out.push((i, i | (1 << t)));
            }
        }
    }
    out
}

/// Checks whether a corner sign pattern admits a single surface patch
///
/// A mask is manifold iff its filled corners form at most one edge-connected
/// component, and likewise for its empty corners.  This is the clustering
/// rule behind the Ju et al. 2002 sign tables, evaluated over the cell's
/// edge graph (corners adjacent iff they differ in one bit).
const fn mask_is_manifold(mask: usize, n: usize) -> bool {
    let count = 1usize << n;

    // Propagate minimum labels across same-sign edges until stable
    let mut group = [0usize; 8];
    let mut i = 0;
    while i < count {
        group[i] = i;
        i += 1;
    }
    loop {
        let mut changed = false;
        let mut i = 0;
        while i < count {
            let mut t = 0;
            while t < n {
                let j = i ^ (1 << t);
                if (mask >> i) & 1 == (mask >> j) & 1 {
                    let g = if group[i] < group[j] {
                        group[i]
                    } else {
                        group[j]
                    };
                    if group[i] != g {
                        group[i] = g;
                        changed = true;
                    }
                    if group[j] != g {
                        group[j] = g;
                        changed = true;
                    }
                }
                t += 1;
            }
            i += 1;
        }
        if !changed {
            break;
        }
    }

    // Count connected components per sign (a representative is a corner
    // that kept its own label)
    let mut filled = 0;
    let mut empty = 0;
    let mut i = 0;
    while i < count {
        if group[i] == i {
            if (mask >> i) & 1 == 1 {
                filled += 1;
            } else {
                empty += 1;
            }
        }
        i += 1;
    }
    filled <= 1 && empty <= 1
}

const fn manifold_table<const SIZE: usize>(n: usize) -> [bool; SIZE] {
    let mut out = [false; SIZE];
    let mut mask = 0;
    while mask < SIZE {
        out[mask] = mask_is_manifold(mask, n);
        mask += 1;
    }
    out
}

const MANIFOLD_MASKS_2: [bool; 16] = manifold_table::<16>(2);
const MANIFOLD_MASKS_3: [bool; 256] = manifold_table::<256>(3);

/// Looks up whether the given corner mask is manifold
pub(crate) fn corners_are_manifold<const N: usize>(mask: u8) -> bool {
    match N {
        2 => MANIFOLD_MASKS_2[mask as usize],
        3 => MANIFOLD_MASKS_3[mask as usize],
        _ => unreachable!("unsupported dimension {N}"),
    }
}
