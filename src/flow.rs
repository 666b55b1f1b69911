//! Node-split flow formulation of the grid shortest path and a primal-dual barrier solver.
//!
//! Every cell other than the source and the sink is split into an in-node and an
//! out-node joined by a *cell arc*; move arcs join the out-node of a cell to the in-node
//! of each neighbour. Moves into the source and out of the sink are dropped. Cell arc
//! `v` costs `w[v]` and move arcs are free, so a unit path flow costs the path's weight
//! minus the (constant) source and sink weights. Cell occupancy is the flow on the cell
//! arc, and one at the source and the sink. With the box `x ≤ 1` every occupancy lies in
//! `[0, 1]`, circulations included.
//!
//! The relaxation
//! \[
//! \min_x\; c^\top x + \tfrac{\mu}{2}\lVert x\rVert^2 - \tau\textstyle\sum\log x_e
//! - \tau\sum\log(u - x_e) \quad \text{s.t. } Ax = b
//! \]
//! is solved by infeasible primal-dual Newton steps on the normal equations
//! `A D Aᵀ Δν = r`. `A` is the node-arc incidence with the sink's in-node removed, which
//! keeps `A D Aᵀ` positive definite on a connected grid.

use ndarray::{Array2, ArrayView2};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::grid::Neighbourhood;

/// Largest normal system factorised densely; bigger ones go to conjugate gradients.
pub(crate) const DENSE_LIMIT: usize = 512;

const STEP_FRACTION: f64 = 0.99;
const CENTERING: f64 = 0.1;
const CG_TOLERANCE: f64 = 1e-12;
const PIVOT_FLOOR: f64 = 1e-14;

/// Directed arc between two flow nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowArc {
    /// Node the flow leaves.
    pub tail: usize,
    /// Node the flow enters.
    pub head: usize,
    /// Cell whose occupancy this arc carries; `None` for moves.
    pub cell: Option<usize>,
}

/// Node-split arc set of an `n×n` grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowGraph {
    n: usize,
    arcs: Vec<FlowArc>,
}

impl FlowGraph {
    /// Arcs of the `n×n` grid under `neighbourhood`: cell arcs in cell order, then moves
    /// in row-major tail order. `n ≥ 1`.
    ///
    /// Out-node of cell `v` is node `v`; in-node of cell `v ≥ 1` is node `sink + v - 1`,
    /// so the sink's in-node is the last node and the source's out-node is node 0.
    pub fn new(n: usize, neighbourhood: Neighbourhood) -> Self {
        let sink = (n * n).saturating_sub(1);
        let in_node = |v: usize| sink + v - 1;
        let mut arcs: Vec<FlowArc> = (1..sink)
            .map(|v| FlowArc {
                tail: in_node(v),
                head: v,
                cell: Some(v),
            })
            .collect();
        for u in 0..sink {
            for v in neighbourhood.neighbours(n, u / n, u % n) {
                if v != 0 {
                    arcs.push(FlowArc {
                        tail: u,
                        head: in_node(v),
                        cell: None,
                    });
                }
            }
        }
        Self { n, arcs }
    }

    /// Grid side length.
    pub fn side(&self) -> usize {
        self.n
    }

    /// Cell arcs followed by move arcs.
    pub fn arcs(&self) -> &[FlowArc] {
        &self.arcs
    }

    /// Number of arcs.
    pub fn num_arcs(&self) -> usize {
        self.arcs.len()
    }

    /// Rows of the reduced incidence matrix: every node except the sink's in-node.
    pub fn num_rows(&self) -> usize {
        (2 * self.n * self.n).saturating_sub(3)
    }

    /// Per-arc cost from a cell grid: `grid[v]` on the cell arc of `v`, zero on moves.
    pub fn gather_cells(&self, grid: &ArrayView2<'_, f64>) -> Vec<f64> {
        let n = self.n;
        self.arcs
            .iter()
            .map(|a| a.cell.map_or(0.0, |v| grid[(v / n, v % n)]))
            .collect()
    }

    /// Adjoint of [`FlowGraph::gather_cells`]: moves cell-arc values back to their cells.
    pub fn scatter_cells(&self, values: &[f64]) -> Array2<f64> {
        let n = self.n;
        let mut out = Array2::zeros((n, n));
        for (a, &x) in self.arcs.iter().zip(values) {
            if let Some(v) = a.cell {
                out[(v / n, v % n)] += x;
            }
        }
        out
    }

    /// Cell occupancy of an arc flow.
    pub fn occupancy(&self, flow: &[f64]) -> Array2<f64> {
        let n = self.n;
        let mut occ = self.scatter_cells(flow);
        occ[(0, 0)] = 1.0;
        occ[(n - 1, n - 1)] = 1.0;
        occ
    }

    /// `out = A x`: net outflow of every node but the sink's in-node.
    fn apply_a(&self, x: &[f64], out: &mut [f64]) {
        out.iter_mut().for_each(|o| *o = 0.0);
        let m = out.len();
        for (a, &xe) in self.arcs.iter().zip(x) {
            out[a.tail] += xe;
            if a.head < m {
                out[a.head] -= xe;
            }
        }
    }

    /// `out = Aᵀ y`, with the sink potential pinned at zero.
    fn apply_at(&self, y: &[f64], out: &mut [f64]) {
        let m = y.len();
        for (o, a) in out.iter_mut().zip(&self.arcs) {
            *o = y[a.tail] - if a.head < m { y[a.head] } else { 0.0 };
        }
    }

    /// Right-hand side `b`: one unit leaves the source.
    fn supply(&self) -> Vec<f64> {
        let mut b = vec![0.0; self.num_rows()];
        if let Some(first) = b.first_mut() {
            *first = 1.0;
        }
        b
    }

    fn normal_diagonal(&self, d: &[f64]) -> Vec<f64> {
        let m = self.num_rows();
        let mut diag = vec![0.0; m];
        for (a, &de) in self.arcs.iter().zip(d) {
            diag[a.tail] += de;
            if a.head < m {
                diag[a.head] += de;
            }
        }
        diag
    }

    fn normal_matrix(&self, d: &[f64]) -> Array2<f64> {
        let m = self.num_rows();
        let mut mat = Array2::zeros((m, m));
        for (a, &de) in self.arcs.iter().zip(d) {
            let (u, v) = (a.tail, a.head);
            mat[(u, u)] += de;
            if v < m {
                mat[(v, v)] += de;
                mat[(u, v)] -= de;
                mat[(v, u)] -= de;
            }
        }
        mat
    }

    /// Solves `A diag(d) Aᵀ y = rhs`.
    pub(crate) fn solve_normal(&self, d: &[f64], rhs: &[f64]) -> Result<Vec<f64>> {
        let m = self.num_rows();
        if m == 0 {
            return Ok(Vec::new());
        }
        if m <= DENSE_LIMIT {
            cholesky_solve(self.normal_matrix(d), rhs)
        } else {
            Ok(self.conjugate_gradient(d, rhs, 10 * m))
        }
    }

    /// `out = A diag(d) Aᵀ p`, using `buf` for the arc-sized intermediate.
    fn apply_normal(&self, d: &[f64], p: &[f64], buf: &mut [f64], out: &mut [f64]) {
        self.apply_at(p, buf);
        buf.iter_mut().zip(d).for_each(|(e, de)| *e *= de);
        self.apply_a(buf, out);
    }

    /// Jacobi-preconditioned conjugate gradients, matrix-free.
    fn conjugate_gradient(&self, d: &[f64], rhs: &[f64], max_iterations: usize) -> Vec<f64> {
        let m = rhs.len();
        let inv_diag: Vec<f64> = self
            .normal_diagonal(d)
            .into_iter()
            .map(|v| if v > 0.0 { 1.0 / v } else { 1.0 })
            .collect();
        let mut arc_buf = vec![0.0; self.num_arcs()];

        let b_norm = norm2(rhs);
        let mut x = vec![0.0; m];
        if b_norm == 0.0 {
            return x;
        }
        let mut r = rhs.to_vec();
        let mut z: Vec<f64> = r.iter().zip(&inv_diag).map(|(ri, di)| ri * di).collect();
        let mut p = z.clone();
        let mut rz = dot(&r, &z);
        let mut ap = vec![0.0; m];

        for k in 0..max_iterations {
            self.apply_normal(d, &p, &mut arc_buf, &mut ap);
            let p_ap = dot(&p, &ap);
            if p_ap <= 0.0 {
                warn!("CG: non-positive p.Ap = {p_ap:.4e} at iteration {k}");
                return x;
            }
            let alpha = rz / p_ap;
            axpy(alpha, &p, &mut x);
            axpy(-alpha, &ap, &mut r);
            let res = norm2(&r);
            if res <= CG_TOLERANCE * b_norm {
                trace!(iterations = k + 1, residual = res / b_norm, "CG converged");
                return x;
            }
            z.iter_mut().zip(&r).zip(&inv_diag).for_each(|((zi, ri), di)| *zi = ri * di);
            let rz_new = dot(&r, &z);
            let beta = rz_new / rz;
            rz = rz_new;
            p.iter_mut().zip(&z).for_each(|(pi, zi)| *pi = zi + beta * *pi);
        }
        warn!(
            residual = norm2(&r) / b_norm,
            "CG: normal equations not solved to tolerance in {max_iterations} iterations"
        );
        x
    }
}

/// In-place Cholesky of the lower triangle, then two triangular solves.
///
/// Pivots that collapse below `PIVOT_FLOOR × max diagonal` are replaced by a huge value,
/// which decouples the corresponding row instead of failing.
fn cholesky_solve(mut a: Array2<f64>, rhs: &[f64]) -> Result<Vec<f64>> {
    let m = rhs.len();
    let max_diag = (0..m).map(|i| a[(i, i)]).fold(0.0, f64::max);
    if !(max_diag > 0.0 && max_diag.is_finite()) {
        return Err(Error::Numerical("normal matrix has no positive diagonal"));
    }
    let floor = PIVOT_FLOOR * max_diag;
    for j in 0..m {
        let mut pivot = a[(j, j)];
        for k in 0..j {
            pivot -= a[(j, k)] * a[(j, k)];
        }
        let l_jj = if pivot > floor { pivot.sqrt() } else { 1e64 };
        a[(j, j)] = l_jj;
        for i in j + 1..m {
            let mut s = a[(i, j)];
            for k in 0..j {
                s -= a[(i, k)] * a[(j, k)];
            }
            a[(i, j)] = s / l_jj;
        }
    }

    let mut y = rhs.to_vec();
    for i in 0..m {
        for k in 0..i {
            y[i] -= a[(i, k)] * y[k];
        }
        y[i] /= a[(i, i)];
    }
    for i in (0..m).rev() {
        for k in i + 1..m {
            y[i] -= a[(k, i)] * y[k];
        }
        y[i] /= a[(i, i)];
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(Error::Numerical("non-finite normal-equation solution"));
    }
    Ok(y)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    y.iter_mut().zip(x).for_each(|(yi, xi)| *yi += alpha * xi);
}

/// Largest `t` with `v + t·dv ≥ 0`.
fn max_step(v: &[f64], dv: &[f64]) -> f64 {
    v.iter()
        .zip(dv)
        .filter(|(_, d)| **d < 0.0)
        .map(|(v, d)| -v / d)
        .fold(f64::INFINITY, f64::min)
}

/// Objective and stopping rule of one relaxation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarrierSettings {
    /// Ridge coefficient `μ`.
    pub ridge: f64,
    /// Extra diagonal in the Newton system; changes steps, not the solution.
    pub damping: f64,
    /// Upper bound on every arc flow, if boxed.
    pub upper: Option<f64>,
    /// Barrier level the solve settles at; zero solves the relaxation to optimality.
    pub barrier_floor: f64,
    /// Newton-step budget.
    pub max_iterations: usize,
    /// Scaled residual tolerance.
    pub tolerance: f64,
}

/// Converged flow and the Newton scaling needed to differentiate it.
#[derive(Debug, Clone)]
pub struct FlowSolution {
    /// Arc flows.
    pub flow: Vec<f64>,
    /// `D = (μ + damping + z/x + w/s)⁻¹` at the solution.
    pub scaling: Vec<f64>,
    /// Newton steps taken.
    pub iterations: usize,
}

/// Runs the primal-dual barrier method on `graph` with arc costs `costs`.
pub fn solve_barrier(
    graph: &FlowGraph,
    costs: &[f64],
    settings: &BarrierSettings,
) -> Result<FlowSolution> {
    let e = graph.num_arcs();
    let m = graph.num_rows();
    let b = graph.supply();
    let upper = settings.upper;
    let floor = settings.barrier_floor;
    let ridge = settings.ridge;

    let mut x = vec![upper.map_or(1.0, |u| 0.5 * u); e];
    let mut z = vec![1.0; e];
    let mut w = if upper.is_some() { vec![1.0; e] } else { Vec::new() };
    let mut nu = vec![0.0; m];
    let ncomp = e + w.len();
    let b_scale = 1.0 + norm2(&b);
    let c_scale = 1.0 + norm2(costs);

    let mut ax = vec![0.0; m];
    let mut at_nu = vec![0.0; e];
    let mut scaling = vec![0.0; e];
    let mut iteration = 0;
    loop {
        let slack: Vec<f64> = match upper {
            Some(u) => x.iter().map(|xi| u - xi).collect(),
            None => Vec::new(),
        };
        graph.apply_a(&x, &mut ax);
        let r_p: Vec<f64> = ax.iter().zip(&b).map(|(a, b)| a - b).collect();
        graph.apply_at(&nu, &mut at_nu);
        let r_d: Vec<f64> = (0..e)
            .map(|i| costs[i] + ridge * x[i] - at_nu[i] - z[i] + w.get(i).copied().unwrap_or(0.0))
            .collect();

        let gap = dot(&x, &z) + dot(&slack, &w);
        let barrier = if ncomp == 0 { 0.0 } else { gap / ncomp as f64 };
        let centrality = x
            .iter()
            .zip(&z)
            .chain(slack.iter().zip(&w))
            .map(|(a, b)| (a * b - floor).abs())
            .fold(0.0, f64::max);
        let residual = (norm2(&r_p) / b_scale)
            .max(norm2(&r_d) / c_scale)
            .max(centrality / (1.0 + floor));
        if !residual.is_finite() {
            return Err(Error::Numerical("non-finite barrier iterate"));
        }

        // Scaling at the current iterate; at convergence it is the one backward needs.
        for i in 0..e {
            let mut h = ridge + settings.damping + z[i] / x[i];
            if let (Some(s), Some(wi)) = (slack.get(i), w.get(i)) {
                h += wi / s;
            }
            scaling[i] = 1.0 / h;
        }

        trace!(iteration, residual, barrier, "barrier step");
        if residual <= settings.tolerance {
            debug!(iterations = iteration, barrier, "relaxation converged");
            return Ok(FlowSolution {
                flow: x,
                scaling,
                iterations: iteration,
            });
        }
        if iteration == settings.max_iterations {
            return Err(Error::SolverDivergence {
                iterations: iteration,
                residual,
                tolerance: settings.tolerance,
            });
        }

        let tau = (CENTERING * barrier).max(floor);
        let r_hat: Vec<f64> = (0..e)
            .map(|i| {
                let mut v = -r_d[i] + tau / x[i] - z[i];
                if let (Some(s), Some(wi)) = (slack.get(i), w.get(i)) {
                    v += wi - tau / s;
                }
                v
            })
            .collect();
        let d_r: Vec<f64> = scaling.iter().zip(&r_hat).map(|(d, r)| d * r).collect();
        let mut rhs = vec![0.0; m];
        graph.apply_a(&d_r, &mut rhs);
        rhs.iter_mut().zip(&r_p).for_each(|(v, rp)| *v = -rp - *v);

        let d_nu = graph.solve_normal(&scaling, &rhs)?;
        let mut at_dnu = vec![0.0; e];
        graph.apply_at(&d_nu, &mut at_dnu);
        let dx: Vec<f64> = (0..e).map(|i| scaling[i] * (r_hat[i] + at_dnu[i])).collect();
        let dz: Vec<f64> = (0..e).map(|i| (tau - x[i] * z[i] - z[i] * dx[i]) / x[i]).collect();
        let dw: Vec<f64> = slack
            .iter()
            .zip(&w)
            .zip(&dx)
            .map(|((s, wi), dxi)| (tau - s * wi + wi * dxi) / s)
            .collect();
        let neg_dx: Vec<f64> = dx.iter().map(|v| -v).collect();

        let limit = max_step(&x, &dx)
            .min(max_step(&slack, &neg_dx))
            .min(max_step(&z, &dz))
            .min(max_step(&w, &dw));
        let alpha = (STEP_FRACTION * limit).min(1.0);

        axpy(alpha, &dx, &mut x);
        axpy(alpha, &dz, &mut z);
        axpy(alpha, &dw, &mut w);
        axpy(alpha, &d_nu, &mut nu);
        iteration += 1;
    }
}

/// Pulls `upstream = ∂L/∂occupancy` back to the cell weights by implicit differentiation
/// of the barrier optimality conditions.
///
/// With `P = D - D Aᵀ (A D Aᵀ)⁻¹ A D`, the flow responds to arc costs as `∂x/∂c = -P`,
/// and each cell weight is the cost of its cell arc.
pub fn implicit_backward(
    graph: &FlowGraph,
    scaling: &[f64],
    upstream: &ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    let g = graph.gather_cells(upstream);
    let dg: Vec<f64> = scaling.iter().zip(&g).map(|(d, g)| d * g).collect();
    let mut rhs = vec![0.0; graph.num_rows()];
    graph.apply_a(&dg, &mut rhs);
    let y = graph.solve_normal(scaling, &rhs)?;
    let mut at_y = vec![0.0; graph.num_arcs()];
    graph.apply_at(&y, &mut at_y);
    let grad_costs: Vec<f64> = (0..graph.num_arcs())
        .map(|i| scaling[i] * at_y[i] - dg[i])
        .collect();
    Ok(graph.scatter_cells(&grad_costs))
}
