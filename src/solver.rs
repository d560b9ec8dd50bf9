//! Convex solver interface.
//!
//! Optimization and allocation code describe their programs as a [`ConicProblem`] and hand
//! them to a [`ConicSolver`]. [`ClarabelSolver`] is the default implementation; tests and
//! callers can swap in their own.

use crate::error::{OptimizerError, Result};
use tracing::debug;

/// A linear constraint `coefficients · x (=|<=) bound`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub coefficients: Vec<f64>,
    pub bound: f64,
}

/// Norm bound `‖rows · x‖₂ <= radius`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormBound {
    pub rows: Vec<Vec<f64>>,
    pub radius: f64,
}

/// Minimize `½ xᵀPx + qᵀx` subject to linear equalities, linear inequalities and an
/// optional norm bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ConicProblem {
    num_variables: usize,
    quadratic: Option<Vec<Vec<f64>>>,
    linear: Vec<f64>,
    equalities: Vec<LinearConstraint>,
    inequalities: Vec<LinearConstraint>,
    norm_bound: Option<NormBound>,
}

impl ConicProblem {
    /// An empty problem over `num_variables` variables with a zero objective.
    pub fn new(num_variables: usize) -> Self {
        Self {
            num_variables,
            quadratic: None,
            linear: vec![0.0; num_variables],
            equalities: Vec::new(),
            inequalities: Vec::new(),
            norm_bound: None,
        }
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// Set the quadratic cost matrix `P` (symmetric).
    pub fn quadratic(mut self, p: Vec<Vec<f64>>) -> Self {
        self.quadratic = Some(p);
        self
    }

    /// Set the linear cost vector `q`.
    pub fn linear(mut self, q: Vec<f64>) -> Self {
        self.linear = q;
        self
    }

    pub fn equal(mut self, coefficients: Vec<f64>, bound: f64) -> Self {
        self.equalities.push(LinearConstraint {
            coefficients,
            bound,
        });
        self
    }

    pub fn less_equal(mut self, coefficients: Vec<f64>, bound: f64) -> Self {
        self.inequalities.push(LinearConstraint {
            coefficients,
            bound,
        });
        self
    }

    pub fn greater_equal(self, coefficients: Vec<f64>, bound: f64) -> Self {
        let negated = coefficients.into_iter().map(|c| -c).collect();
        self.less_equal(negated, -bound)
    }

    /// Bound a single variable from both sides.
    pub fn bounded(self, index: usize, lower: f64, upper: f64) -> Self {
        let mut unit = vec![0.0; self.num_variables];
        unit[index] = 1.0;
        self.less_equal(unit.clone(), upper).greater_equal(unit, lower)
    }

    pub fn norm_bound(mut self, rows: Vec<Vec<f64>>, radius: f64) -> Self {
        self.norm_bound = Some(NormBound { rows, radius });
        self
    }

    pub fn quadratic_cost(&self) -> Option<&Vec<Vec<f64>>> {
        self.quadratic.as_ref()
    }

    pub fn linear_cost(&self) -> &[f64] {
        &self.linear
    }

    pub fn equalities(&self) -> &[LinearConstraint] {
        &self.equalities
    }

    pub fn inequalities(&self) -> &[LinearConstraint] {
        &self.inequalities
    }

    pub fn norm_constraint(&self) -> Option<&NormBound> {
        self.norm_bound.as_ref()
    }

    /// Objective value at `x`.
    pub fn objective(&self, x: &[f64]) -> f64 {
        let linear: f64 = self.linear.iter().zip(x).map(|(q, v)| q * v).sum();
        let quadratic = self.quadratic.as_ref().map_or(0.0, |p| {
            let mut total = 0.0;
            for (i, row) in p.iter().enumerate() {
                for (j, pij) in row.iter().enumerate() {
                    total += x[i] * pij * x[j];
                }
            }
            0.5 * total
        });
        linear + quadratic
    }
}

/// Solves convex conic programs.
pub trait ConicSolver: Send + Sync {
    /// Return an optimal point, or a [`OptimizerError::SolverFailure`] when the problem is
    /// infeasible, unbounded or numerically broken.
    fn solve(&self, problem: &ConicProblem) -> Result<Vec<f64>>;
}

/// Interior-point solver backed by Clarabel.
#[derive(Debug, Clone, Copy)]
pub struct ClarabelSolver {
    max_iter: u32,
    verbose: bool,
}

impl Default for ClarabelSolver {
    fn default() -> Self {
        Self {
            max_iter: 200,
            verbose: false,
        }
    }
}

impl ClarabelSolver {
    pub fn new(max_iter: u32) -> Self {
        Self {
            max_iter,
            ..Default::default()
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Compressed sparse column parts: (colptr, rowval, nzval).
type CscParts = (Vec<usize>, Vec<usize>, Vec<f64>);

/// Dense row-major rows to CSC parts, skipping zeros. With `upper_only`, entries below
/// the diagonal are left out.
fn to_csc(rows: &[&[f64]], num_cols: usize, upper_only: bool) -> CscParts {
    let mut colptr = vec![0];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();
    for j in 0..num_cols {
        for (i, row) in rows.iter().enumerate() {
            if upper_only && i > j {
                break;
            }
            let val = row[j];
            if val.abs() > 1e-14 {
                nzval.push(val);
                rowval.push(i);
            }
        }
        colptr.push(nzval.len());
    }
    (colptr, rowval, nzval)
}

impl ConicSolver for ClarabelSolver {
    fn solve(&self, problem: &ConicProblem) -> Result<Vec<f64>> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let n = problem.num_variables();

        let p = match problem.quadratic_cost() {
            Some(matrix) => {
                let rows: Vec<&[f64]> = matrix.iter().map(|r| r.as_slice()).collect();
                let (colptr, rowval, nzval) = to_csc(&rows, n, true);
                CscMatrix::new(n, n, colptr, rowval, nzval)
            }
            None => CscMatrix::new(n, n, vec![0; n + 1], Vec::new(), Vec::new()),
        };

        // Stacked as [equalities; inequalities; norm bound] to match the cone order.
        let mut a_rows: Vec<Vec<f64>> = Vec::new();
        let mut b: Vec<f64> = Vec::new();
        for c in problem.equalities().iter().chain(problem.inequalities()) {
            a_rows.push(c.coefficients.clone());
            b.push(c.bound);
        }
        if let Some(norm) = problem.norm_constraint() {
            // s = (radius, rows · x) must lie in the second-order cone.
            a_rows.push(vec![0.0; n]);
            b.push(norm.radius);
            for row in &norm.rows {
                a_rows.push(row.iter().map(|v| -v).collect());
                b.push(0.0);
            }
        }

        let m = a_rows.len();
        let row_refs: Vec<&[f64]> = a_rows.iter().map(|r| r.as_slice()).collect();
        let (colptr, rowval, nzval) = to_csc(&row_refs, n, false);
        let a = CscMatrix::new(m, n, colptr, rowval, nzval);

        let mut cones = Vec::new();
        if !problem.equalities().is_empty() {
            cones.push(ZeroConeT(problem.equalities().len()));
        }
        if !problem.inequalities().is_empty() {
            cones.push(NonnegativeConeT(problem.inequalities().len()));
        }
        if let Some(norm) = problem.norm_constraint() {
            cones.push(SecondOrderConeT(norm.rows.len() + 1));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.max_iter)
            .verbose(self.verbose)
            .build()
            .map_err(|e| OptimizerError::SolverFailure(format!("Failed to build settings: {}", e)))?;

        let mut solver = DefaultSolver::new(&p, problem.linear_cost(), &a, &b, &cones, settings)
            .map_err(|e| OptimizerError::SolverFailure(format!("Failed to create solver: {:?}", e)))?;

        solver.solve();

        let status = &solver.solution.status;
        debug!(
            "Clarabel finished with status {:?} after {} iterations",
            status, solver.solution.iterations
        );

        if !matches!(status, SolverStatus::Solved | SolverStatus::AlmostSolved) {
            return Err(OptimizerError::SolverFailure(format!(
                "Optimization failed with status: {:?}",
                status
            )));
        }

        Ok(solver.solution.x.clone())
    }
}
