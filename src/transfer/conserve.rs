//! Conservative transfer of element densities and vertex velocities.

use super::{copy_row, read_row, scratch, write_row, PlanFields, VarCompareOpts};
use crate::algs::communicator::Communicator;
use crate::data::tags::TagSet;
use crate::geometry::metrics::signed_measure;
use crate::mesh_error::{ConvergenceFailure, MeshAdaptError};
use crate::topology::cavity::{EditPlan, VertRef};
use crate::topology::mesh::Mesh;
use crate::topology::simplex::VERT;

/// Per-component integral `Σ ρ V` over the cavity.
fn cavity_integral<C: Communicator>(mesh: &Mesh<C>, cavity: &[usize], values: &[f64], n: usize) -> Vec<f64> {
    let dim = mesh.dim();
    let mut total = vec![0.0; n];
    for &e in cavity {
        let vol = signed_measure(dim, &mesh.elem_points(e)).abs();
        for (c, t) in total.iter_mut().enumerate() {
            *t += values[e * n + c] * vol;
        }
    }
    total
}

fn planned_integral(rows: &TagSet, name: &str, volumes: &[f64]) -> Vec<f64> {
    let mut total: Vec<f64> = Vec::new();
    for (k, vol) in volumes.iter().enumerate() {
        let Some(row) = read_row(rows, name, k) else {
            continue;
        };
        total.resize(row.len(), 0.0);
        for (t, x) in total.iter_mut().zip(&row) {
            *t += x * vol;
        }
    }
    total
}

/// First component outside tolerance, as a failure report.
fn compare_totals(integral: &str, compare: VarCompareOpts, before: &[f64], after: &[f64]) -> Option<ConvergenceFailure> {
    before
        .iter()
        .zip(after)
        .find(|(b, a)| !compare.accepts(**b, **a))
        .map(|(&before, &after)| ConvergenceFailure::Conservation {
            integral: integral.to_owned(),
            before,
            after,
        })
}

/// Transfer the density `name` onto the planned elements so its cavity
/// integral is unchanged.
///
/// Each new element starts from its parent's value, rescaled to the prior
/// total. When that misses the tolerance the cavity-averaged density is
/// tried; a remaining miss is returned as a warning.
pub fn conserve_field<C: Communicator>(
    mesh: &Mesh<C>,
    plan: &EditPlan,
    name: &str,
    integral: &str,
    compare: VarCompareOpts,
    volumes: &[f64],
    rows: &mut TagSet,
) -> Result<Option<ConvergenceFailure>, MeshAdaptError> {
    let dim = mesh.dim();
    let values = mesh.get_tag::<f64>(dim, name)?;
    let n = mesh.ncomps(dim, name)?;
    let before = cavity_integral(mesh, &plan.cavity, values, n);
    let guess = planned_integral(rows, name, volumes);
    for (k, el) in plan.new_elems.iter().enumerate() {
        let row: Vec<f64> = (0..n)
            .map(|c| {
                let parent = values[el.parent * n + c];
                if guess[c] != 0.0 { parent * before[c] / guess[c] } else { parent }
            })
            .collect();
        write_row(rows, name, k, &row);
    }
    let after = planned_integral(rows, name, volumes);
    if compare_totals(integral, compare, &before, &after).is_none() {
        return Ok(None);
    }

    let new_volume: f64 = volumes.iter().sum();
    if new_volume > 0.0 {
        let average: Vec<f64> = before.iter().map(|b| b / new_volume).collect();
        for k in 0..plan.new_elems.len() {
            write_row(rows, name, k, &average);
        }
    }
    let after = planned_integral(rows, name, volumes);
    let failure = compare_totals(integral, compare, &before, &after);
    if let Some(f) = &failure {
        log::warn!("{f}");
    }
    Ok(failure)
}

/// Lumped momentum of the cavity before the edit.
fn momentum_before<C: Communicator>(mesh: &Mesh<C>, plan: &EditPlan, field: &str, mass_field: Option<&str>) -> Result<Vec<f64>, MeshAdaptError> {
    let dim = mesh.dim();
    let velocity = mesh.get_tag::<f64>(VERT, field)?;
    let n = mesh.ncomps(VERT, field)?;
    let mass = mass_field.map(|m| mesh.get_tag::<f64>(dim, m)).transpose()?;
    let mass_ncomps = match mass_field {
        Some(m) => mesh.ncomps(dim, m)?,
        None => 1,
    };
    let mut total = vec![0.0; n];
    for &e in &plan.cavity {
        let vol = signed_measure(dim, &mesh.elem_points(e)).abs();
        let rho = mass.map_or(1.0, |m| m[e * mass_ncomps]);
        let lumped = rho * vol / (dim + 1) as f64;
        for &v in mesh.verts_of(dim, e) {
            for (c, t) in total.iter_mut().enumerate() {
                *t += lumped * velocity[v * n + c];
            }
        }
    }
    Ok(total)
}

/// Lumped mass vertex `v` keeps from elements outside the cavity.
fn outer_mass<C: Communicator>(mesh: &Mesh<C>, plan: &EditPlan, v: usize, mass_field: Option<&str>) -> Result<f64, MeshAdaptError> {
    let dim = mesh.dim();
    let mass = mass_field.map(|m| mesh.get_tag::<f64>(dim, m)).transpose()?;
    let mass_ncomps = match mass_field {
        Some(m) => mesh.ncomps(dim, m)?,
        None => 1,
    };
    let mut total = 0.0;
    for &e in mesh.star(v) {
        if plan.cavity.contains(&e) {
            continue;
        }
        let vol = signed_measure(dim, &mesh.elem_points(e)).abs();
        let rho = mass.map_or(1.0, |m| m[e * mass_ncomps]);
        total += rho * vol / (dim + 1) as f64;
    }
    Ok(total)
}

/// Lumped masses of the vertices of the planned elements.
fn planned_masses(plan: &EditPlan, fields: &PlanFields, mass_field: Option<&str>, volumes: &[f64], dim: usize) -> Vec<(VertRef, f64)> {
    let mut masses: Vec<(VertRef, f64)> = Vec::new();
    for (k, el) in plan.new_elems.iter().enumerate() {
        let rho = mass_field
            .and_then(|m| read_row(&fields.elems, m, k))
            .map_or(1.0, |row| row[0]);
        let lumped = rho * volumes[k] / (dim + 1) as f64;
        for &r in &el.verts {
            match masses.iter_mut().find(|(x, _)| *x == r) {
                Some((_, m)) => *m += lumped,
                None => masses.push((r, lumped)),
            }
        }
    }
    masses.sort_by_key(|(r, _)| *r);
    masses
}

/// Velocity of a planned vertex reference after transfer.
fn planned_velocity<C: Communicator>(mesh: &Mesh<C>, fields: &PlanFields, field: &str, r: VertRef) -> Result<Vec<f64>, MeshAdaptError> {
    let missing = || MeshAdaptError::MissingTag {
        dim: VERT,
        name: field.to_owned(),
    };
    match r {
        VertRef::New(k) => read_row(&fields.verts, field, k).ok_or_else(missing),
        VertRef::Old(v) => {
            let updated = fields
                .updates
                .iter()
                .find(|(slot, _)| *slot == v)
                .and_then(|(_, row)| read_row(row, field, 0));
            if let Some(row) = updated {
                return Ok(row);
            }
            let n = mesh.ncomps(VERT, field)?;
            let values = mesh.get_tag::<f64>(VERT, field)?;
            Ok(values[v * n..(v + 1) * n].to_vec())
        }
    }
}

fn momentum_after<C: Communicator>(
    mesh: &Mesh<C>,
    fields: &PlanFields,
    field: &str,
    masses: &[(VertRef, f64)],
) -> Result<Vec<f64>, MeshAdaptError> {
    let n = mesh.ncomps(VERT, field)?;
    let mut total = vec![0.0; n];
    for &(r, m) in masses {
        let u = planned_velocity(mesh, fields, field, r)?;
        for (t, x) in total.iter_mut().zip(&u) {
            *t += m * x;
        }
    }
    Ok(total)
}

/// Row of the surviving vertex `v` in the plan's update list, created from
/// its current tags when absent.
fn update_row<'f, C: Communicator>(mesh: &Mesh<C>, fields: &'f mut PlanFields, v: usize) -> &'f mut TagSet {
    let pos = match fields.updates.iter().position(|(slot, _)| *slot == v) {
        Some(pos) => pos,
        None => {
            let mut row = scratch(mesh, VERT, 1);
            copy_row(mesh, VERT, v, &mut row, 0);
            fields.updates.push((v, row));
            fields.updates.len() - 1
        }
    };
    &mut fields.updates[pos].1
}

/// Correct the transferred velocity `field` so the lumped momentum of the
/// whole mesh is unchanged.
///
/// The defect is absorbed by the new vertices of the plan. An edit without
/// new vertices corrects the vertices it keeps instead: the survivor of a
/// collapse, or every vertex of a swapped cavity. A kept vertex carries its
/// mass outside the cavity along with its correction.
#[allow(clippy::too_many_arguments)]
pub fn correct_momentum<C: Communicator>(
    mesh: &Mesh<C>,
    plan: &EditPlan,
    field: &str,
    momentum: &str,
    compare: VarCompareOpts,
    mass_field: Option<&str>,
    volumes: &[f64],
    fields: &mut PlanFields,
) -> Result<Option<ConvergenceFailure>, MeshAdaptError> {
    let dim = mesh.dim();
    let masses = planned_masses(plan, fields, mass_field, volumes, dim);
    let before = momentum_before(mesh, plan, field, mass_field)?;
    let after = momentum_after(mesh, fields, field, &masses)?;
    let defect: Vec<f64> = before.iter().zip(&after).map(|(b, a)| b - a).collect();

    let absorbs = |r: &VertRef| match (r, plan.collapse) {
        (VertRef::New(_), _) => true,
        _ if !plan.new_verts.is_empty() => false,
        (VertRef::Old(v), Some((_, w))) => *v == w,
        (VertRef::Old(_), None) => true,
    };
    let mut targets: Vec<(VertRef, f64)> = Vec::new();
    let mut target_mass = 0.0;
    for &(r, m) in masses.iter().filter(|(r, _)| absorbs(r)) {
        let outer = match r {
            VertRef::Old(v) => outer_mass(mesh, plan, v, mass_field)?,
            VertRef::New(_) => 0.0,
        };
        target_mass += m + outer;
        targets.push((r, outer));
    }
    // momentum the corrections add outside the cavity
    let mut shift = vec![0.0; before.len()];
    if target_mass > 0.0 {
        for &(r, outer) in &targets {
            let mut u = planned_velocity(mesh, fields, field, r)?;
            for ((x, d), s) in u.iter_mut().zip(&defect).zip(shift.iter_mut()) {
                *x += d / target_mass;
                *s += outer * d / target_mass;
            }
            match r {
                VertRef::New(k) => write_row(&mut fields.verts, field, k, &u),
                VertRef::Old(v) => write_row(update_row(mesh, fields, v), field, 0, &u),
            }
        }
    }

    let mut after = momentum_after(mesh, fields, field, &masses)?;
    for (a, s) in after.iter_mut().zip(&shift) {
        *a += s;
    }
    let failure = compare_totals(momentum, compare, &before, &after);
    if let Some(f) = &failure {
        log::warn!("{f}");
    }
    Ok(failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::AdaptOpts;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;
    use crate::geometry::tensor;
    use crate::topology::cavity::AdaptView;
    use crate::topology::coarsen::plan_collapse_onto;
    use crate::topology::mesh::METRIC;
    use crate::topology::simplex::EDGE;
    use crate::transfer::{planned_volumes, transfer_plan, TransferOpts};

    fn grid() -> Mesh {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
        let m = tensor::to_packed(2, &tensor::isotropic(2, 4.0));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        let rho: Vec<f64> = (0..mesh.nslots(2)).map(|e| 1.0 + e as f64).collect();
        mesh.add_tag(2, "rho", 1, rho).unwrap();
        let vel: Vec<f64> = (0..mesh.nslots(0))
            .flat_map(|v| {
                let c = mesh.coord(v);
                [c[0], -c[1]]
            })
            .collect();
        mesh.add_tag(0, "vel", 2, vel).unwrap();
        mesh
    }

    fn vertex_at(mesh: &Mesh, p: [f64; 2]) -> usize {
        mesh.alive(0)
            .find(|&v| {
                let c = mesh.coord(v);
                (c[0] - p[0]).abs() < 1e-12 && (c[1] - p[1]).abs() < 1e-12
            })
            .unwrap()
    }

    fn center_collapse(mesh: &Mesh) -> EditPlan {
        let view = AdaptView::new(mesh, METRIC).unwrap();
        let center = vertex_at(mesh, [0.5, 0.5]);
        let corner = vertex_at(mesh, [0.0, 0.0]);
        let edge = mesh.find_entity(EDGE, &[center, corner]).unwrap();
        let opts = AdaptOpts {
            should_allow_pinching: true,
            ..AdaptOpts::default()
        };
        plan_collapse_onto(&view, edge, center, corner, &opts, false).unwrap()
    }

    fn strict() -> VarCompareOpts {
        VarCompareOpts::Absolute { tolerance: 1e-12, floor: 0.0 }
    }

    #[test]
    fn collapse_preserves_the_density_integral() {
        let mesh = grid();
        let plan = center_collapse(&mesh);
        let mut opts = TransferOpts::default();
        opts.set_conserve("rho", "mass", strict());
        let fields = transfer_plan(&mesh, &plan, &opts, METRIC).unwrap();
        assert!(fields.warnings.is_empty(), "{:?}", fields.warnings);
        let values = mesh.get_tag::<f64>(2, "rho").unwrap();
        let before = cavity_integral(&mesh, &plan.cavity, values, 1);
        let after = planned_integral(&fields.elems, "rho", &planned_volumes(&mesh, &plan));
        assert!((before[0] - after[0]).abs() < 1e-12);
    }

    #[test]
    fn collapse_corrects_the_survivor_velocity() {
        let mesh = grid();
        let plan = center_collapse(&mesh);
        let mut opts = TransferOpts::default();
        opts.set_conserve("rho", "mass", strict());
        opts.set_momentum_velocity("vel", "momentum", strict());
        let fields = transfer_plan(&mesh, &plan, &opts, METRIC).unwrap();
        assert!(fields.warnings.is_empty(), "{:?}", fields.warnings);
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        assert_eq!(fields.updates.len(), 1);
        assert_eq!(fields.updates[0].0, corner);

        let before = momentum_before(&mesh, &plan, "vel", Some("rho")).unwrap();
        let masses = planned_masses(&plan, &fields, Some("rho"), &planned_volumes(&mesh, &plan), 2);
        let after = momentum_after(&mesh, &fields, "vel", &masses).unwrap();
        let outer = outer_mass(&mesh, &plan, corner, Some("rho")).unwrap();
        let old = mesh.get_tag::<f64>(0, "vel").unwrap();
        let new = read_row(&fields.updates[0].1, "vel", 0).unwrap();
        for c in 0..2 {
            let outside = outer * (new[c] - old[corner * 2 + c]);
            assert!((before[c] - after[c] - outside).abs() < 1e-12);
        }
    }

    #[test]
    fn outer_mass_counts_elements_outside_the_cavity() {
        let mesh = grid();
        let plan = center_collapse(&mesh);
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        let expected: f64 = mesh
            .star(corner)
            .iter()
            .filter(|e| !plan.cavity.contains(e))
            .map(|&e| (1.0 + e as f64) * signed_measure(2, &mesh.elem_points(e)).abs() / 3.0)
            .sum();
        let outer = outer_mass(&mesh, &plan, corner, Some("rho")).unwrap();
        assert!((outer - expected).abs() < 1e-14);
    }

    #[test]
    fn loose_tolerance_accepts_the_parent_guess() {
        let mesh = grid();
        let plan = center_collapse(&mesh);
        let mut fields = transfer_plan(&mesh, &plan, &TransferOpts::default(), METRIC).unwrap();
        let volumes = planned_volumes(&mesh, &plan);
        let warning = conserve_field(&mesh, &plan, "rho", "mass", VarCompareOpts::none(), &volumes, &mut fields.elems).unwrap();
        assert!(warning.is_none());
    }
}
