//! Geometric classification inferred from dihedral angles.
//!
//! Exposed sides (sides with a single element) are boundary entities. Where
//! two boundary sides meet at an angle sharper than the crease angle, the
//! ridge between them is a feature; vertices where features end or turn are
//! corners. Model entities are the connected components of each class,
//! numbered in order of their lowest global id.

use crate::algs::communicator::Communicator;
use crate::geometry::metrics::{dot, side_normal, Vec3};
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::{Mesh, CLASS_DIM, CLASS_ID};
use crate::topology::simplex::{self, EDGE, VERT};
use hashbrown::HashMap;

const UNSET: i8 = -1;

/// Classify every entity of a serial mesh by boundary angles; returns the
/// number of model entities per dimension.
pub fn classify_by_angles<C: Communicator>(
    mesh: &mut Mesh<C>,
    crease_angle: f64,
) -> Result<[usize; 4], MeshAdaptError> {
    if mesh.nranks() != 1 {
        return Err(MeshAdaptError::InvalidMesh(
            "angle classification needs the whole mesh on one rank".into(),
        ));
    }
    let dim = mesh.dim();
    let side_dim = dim - 1;
    let mut class_dim: Vec<Vec<i8>> = (0..=dim).map(|d| vec![UNSET; mesh.nslots(d)]).collect();
    let mut class_id: Vec<Vec<i32>> = (0..=dim).map(|d| vec![0; mesh.nslots(d)]).collect();
    let cos_crease = crease_angle.cos();

    // exposed sides with their outward normals
    let mut side_elems: HashMap<usize, Vec<(usize, usize)>> = HashMap::new();
    for e in mesh.alive(dim) {
        for (local, s) in mesh.sub_entities(dim, e, side_dim).into_iter().enumerate() {
            side_elems.entry(s).or_default().push((e, local));
        }
    }
    let mut normals: HashMap<usize, Vec3> = HashMap::new();
    for (&s, users) in &side_elems {
        if let [(e, local)] = users[..] {
            let pts = mesh.elem_points(e);
            let tuple: Vec<Vec3> = simplex::template(dim, side_dim)[local]
                .iter()
                .map(|&k| pts[k])
                .collect();
            normals.insert(s, side_normal(dim, &tuple));
            class_dim[side_dim][s] = side_dim as i8;
        }
    }

    // ridges between boundary sides: edges in 3D, vertices in 2D
    let ridge_dim = side_dim - 1;
    let mut ridge_sides: HashMap<usize, Vec<usize>> = HashMap::new();
    for &s in normals.keys() {
        for r in mesh.sub_entities(side_dim, s, ridge_dim) {
            ridge_sides.entry(r).or_default().push(s);
        }
    }
    let mut features: Vec<usize> = Vec::new();
    for (&r, sides) in &ridge_sides {
        let sharp = match sides[..] {
            [a, b] => dot(normals[&a], normals[&b]) < cos_crease,
            _ => true,
        };
        if sharp {
            class_dim[ridge_dim][r] = ridge_dim as i8;
            features.push(r);
        }
    }

    if dim == 3 {
        // corners: feature curves end, branch or turn sharply
        let mut vert_features: HashMap<usize, Vec<usize>> = HashMap::new();
        for &r in &features {
            for &v in mesh.verts_of(EDGE, r) {
                vert_features.entry(v).or_default().push(r);
            }
        }
        for (&v, edges) in &vert_features {
            let corner = match edges[..] {
                [a, b] => {
                    let ta = edge_direction(mesh, a, v);
                    let tb = edge_direction(mesh, b, v);
                    // a straight continuation has the two directions opposed
                    -dot(ta, tb) < cos_crease
                }
                _ => true,
            };
            if corner {
                class_dim[VERT][v] = 0;
            }
        }
    }

    let mut counts = [0usize; 4];
    for d in (0..=dim).rev() {
        if d == dim {
            for e in mesh.alive(dim) {
                class_dim[dim][e] = dim as i8;
            }
        }
        let members: Vec<usize> = mesh
            .alive(d)
            .filter(|&e| class_dim[d][e] == d as i8)
            .collect();
        counts[d] = number_components(mesh, d, &members, &class_dim, &mut class_id[d]);
    }

    // everything else takes the lowest-dimensional class among its cofaces
    for d in (0..dim).rev() {
        let cofaces = coface_map(mesh, d);
        for e in mesh.alive(d).collect::<Vec<_>>() {
            if class_dim[d][e] != UNSET {
                continue;
            }
            let best = cofaces
                .get(&e)
                .into_iter()
                .flatten()
                .map(|&c| (class_dim[d + 1][c], class_id[d + 1][c]))
                .filter(|&(cd, _)| cd != UNSET)
                .min()
                .unwrap_or((dim as i8, 0));
            class_dim[d][e] = best.0;
            class_id[d][e] = best.1;
        }
    }

    for d in 0..=dim {
        mesh.put_tag(d, CLASS_DIM, 1, std::mem::take(&mut class_dim[d]))?;
        mesh.put_tag(d, CLASS_ID, 1, std::mem::take(&mut class_id[d]))?;
    }
    log::debug!("classified by angles: model entity counts {counts:?}");
    Ok(counts)
}

fn edge_direction<C: Communicator>(mesh: &Mesh<C>, edge: usize, from: usize) -> Vec3 {
    let verts = mesh.verts_of(EDGE, edge);
    let to = if verts[0] == from { verts[1] } else { verts[0] };
    let (p, q) = (mesh.coord(from), mesh.coord(to));
    let t = [q[0] - p[0], q[1] - p[1], q[2] - p[2]];
    let len = dot(t, t).sqrt().max(f64::MIN_POSITIVE);
    [t[0] / len, t[1] / len, t[2] / len]
}

/// Entities of dimension `d + 1` containing each entity of dimension `d`.
fn coface_map<C: Communicator>(mesh: &Mesh<C>, d: usize) -> HashMap<usize, Vec<usize>> {
    let mut map: HashMap<usize, Vec<usize>> = HashMap::new();
    for c in mesh.alive(d + 1) {
        for s in mesh.sub_entities(d + 1, c, d) {
            map.entry(s).or_default().push(c);
        }
    }
    map
}

/// Number the connected components of `members`, where two members are
/// connected through a shared sub-entity of dimension `d - 1` that is not
/// itself classified on a lower-dimensional model entity.
fn number_components<C: Communicator>(
    mesh: &Mesh<C>,
    d: usize,
    members: &[usize],
    class_dim: &[Vec<i8>],
    ids: &mut [i32],
) -> usize {
    if members.is_empty() {
        return 0;
    }
    let mut order = members.to_vec();
    order.sort_by_key(|&e| mesh.global(d, e));
    if d == VERT {
        for (k, &v) in order.iter().enumerate() {
            ids[v] = k as i32;
        }
        return order.len();
    }
    let mut via: HashMap<usize, Vec<usize>> = HashMap::new();
    for &e in &order {
        for s in mesh.sub_entities(d, e, d - 1) {
            if class_dim[d - 1][s] == UNSET {
                via.entry(s).or_default().push(e);
            }
        }
    }
    let mut seen: HashMap<usize, i32> = HashMap::new();
    let mut next = 0i32;
    for &seed in &order {
        if seen.contains_key(&seed) {
            continue;
        }
        let mut stack = vec![seed];
        seen.insert(seed, next);
        while let Some(e) = stack.pop() {
            ids[e] = next;
            for s in mesh.sub_entities(d, e, d - 1) {
                for &n in via.get(&s).into_iter().flatten() {
                    if !seen.contains_key(&n) {
                        seen.insert(n, next);
                        stack.push(n);
                    }
                }
            }
        }
        next += 1;
    }
    next as usize
}
