//! Conversion of portfolio weights into whole numbers of shares.
//!
//! The allocation minimizes `leftover + Σ |w_i · budget - shares_i · price_i|` over
//! non-negative integer share counts that fit in the budget. A greedy allocation seeds the
//! search, then a depth-first branch and bound over LP relaxations improves it until the
//! node limit is reached.

use crate::error::{OptimizerError, Result};
use crate::solver::{ConicProblem, ConicSolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Default number of relaxations explored before the best allocation found is returned.
pub const DEFAULT_NODE_LIMIT: usize = 2000;

const INTEGRALITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocatedPosition {
    pub shares: u64,
    pub price: f64,
    pub value: f64,
}

/// Share counts per instrument plus unspent cash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscreteAllocation {
    /// Positions with at least one share.
    pub positions: BTreeMap<String, AllocatedPosition>,
    pub leftover_cash: f64,
}

impl DiscreteAllocation {
    /// Everything stays in cash.
    pub fn cash_only(budget: f64) -> Self {
        Self {
            positions: BTreeMap::new(),
            leftover_cash: budget,
        }
    }

    pub fn invested(&self) -> f64 {
        self.positions.values().map(|p| p.value).sum()
    }

    pub fn shares(&self, id: &str) -> u64 {
        self.positions.get(id).map_or(0, |p| p.shares)
    }
}

/// One instrument taking part in the allocation.
#[derive(Debug, Clone)]
struct Target {
    id: String,
    price: f64,
    amount: f64,
}

fn evaluate(targets: &[Target], shares: &[u64], budget: f64) -> Option<f64> {
    let spent: f64 = targets
        .iter()
        .zip(shares)
        .map(|(t, &s)| s as f64 * t.price)
        .sum();
    let leftover = budget - spent;
    if leftover < -1e-9 {
        return None;
    }
    let deviation: f64 = targets
        .iter()
        .zip(shares)
        .map(|(t, &s)| (t.amount - s as f64 * t.price).abs())
        .sum();
    Some(leftover.max(0.0) + deviation)
}

/// Per-share bounds added while branching.
#[derive(Debug, Clone)]
struct Node {
    lower: Vec<f64>,
    upper: Vec<Option<f64>>,
}

pub struct DiscreteAllocator<'a> {
    solver: &'a dyn ConicSolver,
    node_limit: usize,
}

impl<'a> DiscreteAllocator<'a> {
    pub fn new(solver: &'a dyn ConicSolver) -> Self {
        Self {
            solver,
            node_limit: DEFAULT_NODE_LIMIT,
        }
    }

    pub fn with_node_limit(mut self, node_limit: usize) -> Self {
        self.node_limit = node_limit;
        self
    }

    /// Allocate `budget` across `weights` at `latest_prices`.
    ///
    /// Non-positive weights get no shares. Instruments without a usable price are skipped
    /// with a warning.
    pub fn allocate(
        &self,
        weights: &[(String, f64)],
        latest_prices: &HashMap<String, f64>,
        budget: f64,
    ) -> Result<DiscreteAllocation> {
        if !(budget > 0.0) || !budget.is_finite() {
            return Err(OptimizerError::InvalidOptimizerParameter(format!(
                "allocation budget must be > 0, got {}",
                budget
            )));
        }

        let mut targets = Vec::new();
        for (id, weight) in weights {
            if *weight <= 0.0 {
                continue;
            }
            match latest_prices.get(id) {
                Some(&price) if price.is_finite() && price > 0.0 => targets.push(Target {
                    id: id.clone(),
                    price,
                    amount: weight * budget,
                }),
                _ => warn!("No usable latest price for {}, skipping it in the allocation", id),
            }
        }

        if targets.is_empty() {
            return Ok(DiscreteAllocation::cash_only(budget));
        }

        let greedy = self.greedy(&targets, budget);
        let shares = self.branch_and_bound(&targets, budget, greedy);

        let mut allocation = DiscreteAllocation::cash_only(budget);
        for (target, count) in targets.iter().zip(shares) {
            if count == 0 {
                continue;
            }
            let value = count as f64 * target.price;
            allocation.leftover_cash -= value;
            allocation.positions.insert(
                target.id.clone(),
                AllocatedPosition {
                    shares: count,
                    price: target.price,
                    value,
                },
            );
        }
        allocation.leftover_cash = allocation.leftover_cash.max(0.0);

        debug!(
            "Allocated {:.2} of {:.2} across {} positions",
            allocation.invested(),
            budget,
            allocation.positions.len()
        );
        Ok(allocation)
    }

    /// Floor allocation, then one share at a time to the largest remaining deficit.
    fn greedy(&self, targets: &[Target], budget: f64) -> Vec<u64> {
        let mut shares: Vec<u64> = targets
            .iter()
            .map(|t| (t.amount / t.price).floor().max(0.0) as u64)
            .collect();
        let mut leftover = budget
            - targets
                .iter()
                .zip(&shares)
                .map(|(t, &s)| s as f64 * t.price)
                .sum::<f64>();

        loop {
            let candidate = targets
                .iter()
                .enumerate()
                .filter(|(_, t)| t.price <= leftover + 1e-9)
                .map(|(i, t)| (i, t.amount - shares[i] as f64 * t.price))
                .filter(|(_, deficit)| *deficit > 0.0)
                .max_by(|a, b| a.1.total_cmp(&b.1));
            match candidate {
                Some((i, _)) => {
                    shares[i] += 1;
                    leftover -= targets[i].price;
                }
                None => break,
            }
        }
        shares
    }

    /// Variables: shares (n), absolute deviations (n), leftover (1).
    fn relaxation(&self, targets: &[Target], budget: f64, node: &Node) -> ConicProblem {
        let n = targets.len();
        let size = 2 * n + 1;

        let mut cost = vec![0.0; size];
        for c in cost.iter_mut().skip(n) {
            *c = 1.0;
        }

        let mut budget_row = vec![0.0; size];
        for (i, t) in targets.iter().enumerate() {
            budget_row[i] = t.price;
        }
        budget_row[2 * n] = 1.0;

        let mut leftover_unit = vec![0.0; size];
        leftover_unit[2 * n] = 1.0;

        let mut problem = ConicProblem::new(size)
            .linear(cost)
            .equal(budget_row, budget)
            .greater_equal(leftover_unit, 0.0);

        for (i, t) in targets.iter().enumerate() {
            // d_i >= amount - s_i·p_i and d_i >= s_i·p_i - amount
            let mut under = vec![0.0; size];
            under[i] = t.price;
            under[n + i] = 1.0;
            let mut over = vec![0.0; size];
            over[i] = -t.price;
            over[n + i] = 1.0;

            let mut unit = vec![0.0; size];
            unit[i] = 1.0;

            problem = problem
                .greater_equal(under, t.amount)
                .greater_equal(over, -t.amount)
                .greater_equal(unit.clone(), node.lower[i]);
            if let Some(upper) = node.upper[i] {
                problem = problem.less_equal(unit, upper);
            }
        }
        problem
    }

    fn branch_and_bound(&self, targets: &[Target], budget: f64, incumbent: Vec<u64>) -> Vec<u64> {
        let n = targets.len();
        let mut best = incumbent;
        let mut best_cost = evaluate(targets, &best, budget).unwrap_or(f64::INFINITY);

        let mut stack = vec![Node {
            lower: vec![0.0; n],
            upper: vec![None; n],
        }];
        let mut explored = 0;

        while let Some(node) = stack.pop() {
            if explored >= self.node_limit {
                debug!("Node limit of {} reached, keeping best allocation", self.node_limit);
                break;
            }
            explored += 1;

            let problem = self.relaxation(targets, budget, &node);
            let solution = match self.solver.solve(&problem) {
                Ok(x) => x,
                Err(_) => continue,
            };
            if problem.objective(&solution) >= best_cost - 1e-9 {
                continue;
            }

            let branch_on = solution[..n]
                .iter()
                .enumerate()
                .map(|(i, s)| (i, (s - s.round()).abs()))
                .filter(|(_, frac)| *frac > INTEGRALITY_TOLERANCE)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, _)| i);

            match branch_on {
                None => {
                    let shares: Vec<u64> =
                        solution[..n].iter().map(|s| s.round().max(0.0) as u64).collect();
                    if let Some(cost) = evaluate(targets, &shares, budget) {
                        if cost < best_cost - 1e-9 {
                            best_cost = cost;
                            best = shares;
                        }
                    }
                }
                Some(i) => {
                    let value = solution[i];
                    let mut down = node.clone();
                    down.upper[i] = Some(value.floor());
                    let mut up = node;
                    up.lower[i] = value.ceil();
                    // Explore the rounded-down branch first, it tends to stay within budget.
                    stack.push(up);
                    stack.push(down);
                }
            }
        }

        debug!(
            "Branch and bound explored {} nodes, objective {:.4}",
            explored, best_cost
        );
        best
    }
}
