//! Simplex templates: local vertex orderings of sub-entities.
//!
//! Conventions (shared by every rank, so downward adjacency derived from the
//! same vertex tuple is identical everywhere):
//! - Triangle `[v0, v1, v2]`, counter-clockwise; edges `(0,1) (1,2) (2,0)`.
//! - Tetrahedron `[v0, v1, v2, v3]` with positive `det(v1-v0, v2-v0, v3-v0)`;
//!   edges `(0,1) (1,2) (2,0) (0,3) (1,3) (2,3)`, faces `(0,2,1) (0,1,3)
//!   (1,2,3) (2,0,3)`.
//! - Edges and faces that are not elements store their vertices sorted by
//!   global id.

/// Vertex dimension.
pub const VERT: usize = 0;
/// Edge dimension.
pub const EDGE: usize = 1;
/// Face (triangle) dimension.
pub const FACE: usize = 2;
/// Region (tetrahedron) dimension.
pub const REGION: usize = 3;

static EDGE_VERTS: [&[usize]; 2] = [&[0], &[1]];
static TRI_VERTS: [&[usize]; 3] = [&[0], &[1], &[2]];
static TRI_EDGES: [&[usize]; 3] = [&[0, 1], &[1, 2], &[2, 0]];
static TET_VERTS: [&[usize]; 4] = [&[0], &[1], &[2], &[3]];
static TET_EDGES: [&[usize]; 6] = [&[0, 1], &[1, 2], &[2, 0], &[0, 3], &[1, 3], &[2, 3]];
static TET_FACES: [&[usize]; 4] = [&[0, 2, 1], &[0, 1, 3], &[1, 2, 3], &[2, 0, 3]];

/// Local vertex tuples of every `low`-dimensional sub-entity of a
/// `high`-dimensional simplex.
///
/// # Panics
/// Panics when `low >= high` or `high > 3`.
pub fn template(high: usize, low: usize) -> &'static [&'static [usize]] {
    match (high, low) {
        (1, 0) => &EDGE_VERTS,
        (2, 0) => &TRI_VERTS,
        (2, 1) => &TRI_EDGES,
        (3, 0) => &TET_VERTS,
        (3, 1) => &TET_EDGES,
        (3, 2) => &TET_FACES,
        _ => panic!("no simplex template for ({high}, {low})"),
    }
}

/// Number of vertices of a simplex of dimension `dim`.
#[inline]
pub const fn nverts(dim: usize) -> usize {
    dim + 1
}

/// Number of `low`-dimensional sub-entities of a `high`-dimensional simplex.
pub fn degree(high: usize, low: usize) -> usize {
    if low == high {
        1
    } else {
        template(high, low).len()
    }
}

/// Local index (within the element) of the vertex opposite a side.
///
/// `side` indexes `template(dim, dim - 1)`.
pub fn opposite_vertex(dim: usize, side: usize) -> usize {
    match dim {
        2 => [2, 0, 1][side],
        3 => [3, 2, 0, 1][side],
        _ => panic!("opposite vertex undefined for dimension {dim}"),
    }
}

/// Number of independent components of a symmetric `dim`×`dim` tensor.
#[inline]
pub const fn symm_ncomps(dim: usize) -> usize {
    dim * (dim + 1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrees_match_simplex_counts() {
        assert_eq!(degree(2, 1), 3);
        assert_eq!(degree(3, 1), 6);
        assert_eq!(degree(3, 2), 4);
        assert_eq!(degree(3, 3), 1);
    }

    #[test]
    fn opposite_vertex_is_not_in_side() {
        for dim in [2, 3] {
            for (side, verts) in template(dim, dim - 1).iter().enumerate() {
                assert!(!verts.contains(&opposite_vertex(dim, side)));
            }
        }
    }

    #[test]
    #[should_panic]
    fn template_rejects_dimension_overflow() {
        let _ = template(4, 1);
    }
}
