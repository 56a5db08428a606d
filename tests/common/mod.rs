#![allow(dead_code)]

use mesh_adapt::algs::communicator::Communicator;
use mesh_adapt::geometry::metrics::signed_measure;
use mesh_adapt::geometry::tensor::{self, Mat};
use mesh_adapt::topology::mesh::{Mesh, METRIC};

/// Store `m` as the metric of every vertex slot.
pub fn put_metric<C: Communicator>(mesh: &mut Mesh<C>, m: &Mat) {
    let dim = mesh.dim();
    let packed = tensor::to_packed(dim, m);
    let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| packed.clone()).collect();
    mesh.put_tag(0, METRIC, packed.len(), values).unwrap();
}

pub fn put_uniform_metric<C: Communicator>(mesh: &mut Mesh<C>, h: f64) {
    let m = tensor::isotropic(mesh.dim(), h);
    put_metric(mesh, &m);
}

/// Sum of `density · measure` over the owned elements.
pub fn integral<C: Communicator>(mesh: &Mesh<C>, density: &str) -> f64 {
    let dim = mesh.dim();
    let values = mesh.get_tag::<f64>(dim, density).unwrap();
    mesh.owned(dim)
        .map(|e| values[e] * signed_measure(dim, &mesh.elem_points(e)).abs())
        .sum()
}

/// Sum of the owned element measures.
pub fn total_measure<C: Communicator>(mesh: &Mesh<C>) -> f64 {
    let dim = mesh.dim();
    mesh.owned(dim)
        .map(|e| signed_measure(dim, &mesh.elem_points(e)).abs())
        .sum()
}

pub fn close(a: f64, b: f64, rel: f64) -> bool {
    (a - b).abs() <= rel * a.abs().max(b.abs()).max(1.0)
}

/// Lumped momentum `Σ_e ρ_e |e| / (d + 1) Σ_{v ∈ e} u_v` over the owned elements.
pub fn lumped_momentum<C: Communicator>(mesh: &Mesh<C>, density: &str, velocity: &str) -> Vec<f64> {
    let dim = mesh.dim();
    let rho = mesh.get_tag::<f64>(dim, density).unwrap();
    let u = mesh.get_tag::<f64>(0, velocity).unwrap();
    let n = mesh.ncomps(0, velocity).unwrap();
    let mut total = vec![0.0; n];
    for e in mesh.owned(dim) {
        let lumped = rho[e] * signed_measure(dim, &mesh.elem_points(e)).abs() / (dim + 1) as f64;
        for &v in mesh.verts_of(dim, e) {
            for (c, t) in total.iter_mut().enumerate() {
                *t += lumped * u[v * n + c];
            }
        }
    }
    total
}
