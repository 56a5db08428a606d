//! Structured box generator for triangle and tetrahedral meshes.
//!
//! The whole box is built on rank 0; other ranks start empty and receive
//! their share through [`Mesh::balance`]. Every entity is classified on the
//! box's model entities: per axis an entity is on the low face (code 0), in
//! the interior (1) or on the high face (2); `class_dim` is the number of
//! interior axes and `class_id` encodes the codes base 3.

use crate::algs::communicator::Communicator;
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::{Mesh, CLASS_DIM, CLASS_ID};
use crate::topology::point::GlobalId;
use crate::topology::simplex::VERT;

fn invalid_geometry(message: impl Into<String>) -> MeshAdaptError {
    MeshAdaptError::InvalidGeometry(message.into())
}

/// Kuhn subdivision: one tetrahedron per axis permutation.
const KUHN_PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

/// Build `[0, extent] ` split into `divisions` cells per axis.
///
/// Only the first `dim` entries of `extent` and `divisions` are read.
pub fn build_box<C: Communicator>(
    comm: C,
    dim: usize,
    extent: [f64; 3],
    divisions: [usize; 3],
) -> Result<Mesh<C>, MeshAdaptError> {
    let mut mesh = Mesh::new(comm, dim)?;
    for axis in 0..dim {
        if divisions[axis] == 0 {
            return Err(invalid_geometry(format!("axis {axis} has no divisions")));
        }
        if !(extent[axis] > 0.0) {
            return Err(invalid_geometry(format!(
                "axis {axis} extent {} is not positive",
                extent[axis]
            )));
        }
    }
    if mesh.rank() == 0 {
        fill_box(&mut mesh, extent, divisions)?;
    }
    mesh.commit_globals()?;
    classify_box(&mut mesh, extent)?;
    mesh.sync_next_gid()?;
    Ok(mesh)
}

fn fill_box<C: Communicator>(mesh: &mut Mesh<C>, extent: [f64; 3], divisions: [usize; 3]) -> Result<(), MeshAdaptError> {
    let dim = mesh.dim();
    let n: Vec<usize> = (0..3).map(|a| if a < dim { divisions[a] } else { 0 }).collect();
    let index = |i: usize, j: usize, k: usize| i + (n[0] + 1) * (j + (n[1] + 1) * k);

    let mut gid = 0u64;
    for k in 0..=n[2] {
        for j in 0..=n[1] {
            for i in 0..=n[0] {
                let ijk = [i, j, k];
                let p: Vec<f64> = (0..dim)
                    .map(|a| extent[a] * ijk[a] as f64 / n[a] as f64)
                    .collect();
                mesh.add_vertex(&p, GlobalId::new(gid), 0)?;
                gid += 1;
            }
        }
    }

    let mut elem_gid = 0u64;
    let mut add = |mesh: &mut Mesh<C>, mut verts: Vec<usize>| -> Result<(), MeshAdaptError> {
        let pts: Vec<[f64; 3]> = verts.iter().map(|&v| mesh.coord(v)).collect();
        if crate::geometry::metrics::signed_measure(dim, &pts) < 0.0 {
            verts.swap(1, 2);
        }
        mesh.add_element(&verts, GlobalId::new(elem_gid), 0)?;
        elem_gid += 1;
        Ok(())
    };

    if dim == 2 {
        for j in 0..n[1] {
            for i in 0..n[0] {
                let (a, b, c, d) = (index(i, j, 0), index(i + 1, j, 0), index(i + 1, j + 1, 0), index(i, j + 1, 0));
                add(mesh, vec![a, b, c])?;
                add(mesh, vec![a, c, d])?;
            }
        }
    } else {
        for k in 0..n[2] {
            for j in 0..n[1] {
                for i in 0..n[0] {
                    for perm in KUHN_PERMUTATIONS {
                        let mut at = [i, j, k];
                        let mut verts = vec![index(at[0], at[1], at[2])];
                        for axis in perm {
                            at[axis] += 1;
                            verts.push(index(at[0], at[1], at[2]));
                        }
                        add(mesh, verts)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Classify every entity on the box's faces, edges and corners.
fn classify_box<C: Communicator>(mesh: &mut Mesh<C>, extent: [f64; 3]) -> Result<(), MeshAdaptError> {
    let dim = mesh.dim();
    let tol = 1e-10 * extent[..dim].iter().cloned().fold(0.0, f64::max);
    let codes: Vec<[u8; 3]> = (0..mesh.nslots(VERT))
        .map(|v| {
            let p = mesh.coord(v);
            std::array::from_fn(|a| {
                if a >= dim {
                    1
                } else if p[a].abs() <= tol {
                    0
                } else if (p[a] - extent[a]).abs() <= tol {
                    2
                } else {
                    1
                }
            })
        })
        .collect();
    for d in 0..=dim {
        let mut class_dim = vec![0i8; mesh.nslots(d)];
        let mut class_id = vec![0i32; mesh.nslots(d)];
        for e in mesh.alive(d) {
            let verts = mesh.verts_of(d, e);
            let mut id = 0i32;
            let mut cd = 0i8;
            for a in (0..dim).rev() {
                let first = codes[verts[0]][a];
                let code = if first != 1 && verts.iter().all(|&v| codes[v][a] == first) {
                    first
                } else {
                    1
                };
                if code == 1 {
                    cd += 1;
                }
                id = id * 3 + code as i32;
            }
            class_dim[e] = cd;
            class_id[e] = id;
        }
        mesh.put_tag(d, CLASS_DIM, 1, class_dim)?;
        mesh.put_tag(d, CLASS_ID, 1, class_id)?;
    }
    Ok(())
}
