//! Effect selector: constrained-random choice of transformations per run
//!
//! ## Algorithm
//!
//! 1. Eligible pool = catalog entries outside their cooldown window, by id
//! 2. Target size drawn uniformly from `[min, min(max, eligible)]`
//! 3. Stratified phase: one weighted draw per required category
//! 4. Fill phase: weighted draws from what is left until the target is met
//!
//! Every draw removes the candidate from the pool. A candidate whose
//! exclusion group is already taken is discarded and the draw repeats, so one
//! pass makes at most `eligible` draws. A pass that leaves a required category
//! unfilled or ends below `min` is repeated with a fresh pool, since an early
//! grouped pick can block a later category. All passes share one
//! [`IterationGuard`] of `retry_factor x eligible` draws; when it runs out the
//! best pass so far is kept.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use shared_utils::IterationGuard;
use tracing::{debug, trace, warn};

use crate::catalog::{Catalog, Category, TransformationDescriptor};
use crate::errors::SelectionError;
use crate::ledger::LedgerSnapshot;
use crate::params::{self, ParameterSet, ValidatedBounds, PARAMS_SALT};

/// What happens when a required category cannot be filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Keep the partial plan if it still meets `min`
    #[default]
    BestEffort,
    /// Fail the selection
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConstraints {
    pub min: usize,
    pub max: usize,
    /// Categories that should be represented, tried in this order
    pub required_categories: Vec<Category>,
    /// Draw budget multiplier over the eligible count
    pub retry_factor: u32,
    pub quota_policy: QuotaPolicy,
}

impl Default for SelectionConstraints {
    fn default() -> Self {
        Self {
            min: 2,
            max: 5,
            required_categories: vec![Category::Color, Category::Audio],
            retry_factor: 10,
            quota_policy: QuotaPolicy::BestEffort,
        }
    }
}

impl SelectionConstraints {
    pub fn validate(&self) -> Result<(), SelectionError> {
        if self.max == 0 {
            return Err(SelectionError::InvalidConstraints("max must be > 0".into()));
        }
        if self.min > self.max {
            return Err(SelectionError::InvalidConstraints(format!(
                "min {} > max {}",
                self.min, self.max
            )));
        }
        let required = self.required();
        if required.len() > self.max {
            return Err(SelectionError::InvalidConstraints(format!(
                "{} required categories exceed max {}",
                required.len(),
                self.max
            )));
        }
        if self.retry_factor == 0 {
            return Err(SelectionError::InvalidConstraints(
                "retry_factor must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Required categories, first occurrence wins.
    fn required(&self) -> Vec<Category> {
        let mut seen = HashSet::new();
        self.required_categories
            .iter()
            .copied()
            .filter(|c| seen.insert(*c))
            .collect()
    }
}

/// The chosen transformations for one run. Immutable once execution starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPlan {
    pub seed: u64,
    /// Run index of the snapshot the plan was selected against
    pub run_index: u64,
    pub ledger_version: u64,
    /// Selection order
    pub transformations: Vec<String>,
    /// Required categories left unfilled (best-effort plans only)
    pub missing_categories: Vec<Category>,
    /// Draws spent, across every pass
    #[serde(default)]
    pub draws: u32,
    pub params: ParameterSet,
}

impl SelectionPlan {
    pub fn contains(&self, id: &str) -> bool {
        self.transformations.iter().any(|t| t == id)
    }

    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }
}

/// Outcome of one selection pass
struct Pass<'c> {
    picked: Vec<&'c TransformationDescriptor>,
    missing: Vec<Category>,
    exhausted: bool,
}

impl Pass<'_> {
    fn is_complete(&self, min: usize) -> bool {
        self.picked.len() >= min && self.missing.is_empty()
    }

    /// Meets `min`, then fewer unfilled categories, then larger.
    fn rank(&self, min: usize) -> (bool, std::cmp::Reverse<usize>, usize) {
        (
            self.picked.len() >= min,
            std::cmp::Reverse(self.missing.len()),
            self.picked.len(),
        )
    }
}

enum Draw<'c> {
    Picked(&'c TransformationDescriptor),
    PoolEmpty,
    BudgetExhausted,
}

pub struct Selector<'a> {
    catalog: &'a Catalog,
    constraints: &'a SelectionConstraints,
    bounds: &'a ValidatedBounds,
}

impl<'a> Selector<'a> {
    pub fn new(
        catalog: &'a Catalog,
        constraints: &'a SelectionConstraints,
        bounds: &'a ValidatedBounds,
    ) -> Self {
        Self {
            catalog,
            constraints,
            bounds,
        }
    }

    /// Select a plan against `ledger`. `seed = None` draws one from entropy;
    /// the seed used is recorded in the plan either way.
    pub fn select(
        &self,
        ledger: &LedgerSnapshot,
        seed: Option<u64>,
    ) -> Result<SelectionPlan, SelectionError> {
        let c = self.constraints;
        c.validate()?;

        let seed = seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let pool: Vec<&TransformationDescriptor> =
            self.catalog.iter().filter(|d| ledger.is_eligible(d)).collect();
        let eligible = pool.len();

        if eligible < c.min {
            return Err(SelectionError::InsufficientEligibleTransformations {
                eligible,
                selected: 0,
                min: c.min,
                missing: vec![],
            });
        }

        let upper = c.max.min(eligible);
        let target = if upper > c.min {
            rng.random_range(c.min..=upper)
        } else {
            c.min
        };

        debug!(
            seed,
            eligible,
            target,
            run_index = ledger.run_index(),
            "Selecting transformations"
        );

        let mut guard = IterationGuard::for_candidates(eligible, c.retry_factor, "transformation selection");
        let mut passes = 0u32;
        let mut best: Option<Pass<'_>> = None;

        let exhausted = loop {
            passes += 1;
            let pass = self.pass(&mut rng, pool.clone(), target, &mut guard);
            let exhausted = pass.exhausted;
            // only an unfilled category that still has candidates can change on a new pass
            let done = pass.is_complete(c.min)
                || exhausted
                || pass.missing.is_empty()
                || !pass
                    .missing
                    .iter()
                    .all(|category| pool.iter().any(|d| d.category == *category));
            if best.as_ref().map_or(true, |b| pass.rank(c.min) > b.rank(c.min)) {
                best = Some(pass);
            }
            if done {
                break exhausted;
            }
            trace!(passes, draws = guard.current(), "Selection pass incomplete, repeating");
        };

        let draws = guard.current().min(guard.max());
        let (picked, missing) = match best {
            Some(pass) => (pass.picked, pass.missing),
            None => (Vec::new(), c.required()),
        };

        if exhausted {
            warn!(
                draws,
                budget = guard.max(),
                passes,
                selected = picked.len(),
                "Selection draw budget exhausted, keeping best partial plan"
            );
        }

        if picked.len() < c.min || (!missing.is_empty() && c.quota_policy == QuotaPolicy::Strict) {
            return Err(SelectionError::InsufficientEligibleTransformations {
                eligible,
                selected: picked.len(),
                min: c.min,
                missing,
            });
        }

        if !missing.is_empty() {
            warn!(missing = ?missing, "Required categories unfilled, best-effort plan");
        }

        let transformations: Vec<String> = picked.iter().map(|d| d.id.clone()).collect();
        let params = params::derive(params::mix_seed(seed, PARAMS_SALT), self.bounds);

        debug!(seed, transformations = ?transformations, "Selection complete");

        Ok(SelectionPlan {
            seed,
            run_index: ledger.run_index(),
            ledger_version: ledger.version(),
            transformations,
            missing_categories: missing,
            draws,
            params,
        })
    }

    /// One stratified + fill pass over a fresh copy of the eligible pool.
    fn pass<'c, R: Rng>(
        &self,
        rng: &mut R,
        mut pool: Vec<&'c TransformationDescriptor>,
        target: usize,
        guard: &mut IterationGuard,
    ) -> Pass<'c> {
        let c = self.constraints;
        let mut picked: Vec<&TransformationDescriptor> = Vec::with_capacity(target);
        let mut groups: HashSet<&str> = HashSet::new();
        let mut missing = Vec::new();
        let mut exhausted = false;

        // stratified phase
        for category in c.required() {
            if picked.iter().any(|d| d.category == category) {
                continue;
            }
            if exhausted || picked.len() >= c.max {
                missing.push(category);
                continue;
            }
            match draw(rng, &mut pool, guard, &groups, |d| d.category == category) {
                Draw::Picked(d) => take(d, &mut picked, &mut groups),
                Draw::PoolEmpty => {
                    debug!(%category, "No eligible candidate left for required category");
                    missing.push(category);
                }
                Draw::BudgetExhausted => {
                    exhausted = true;
                    missing.push(category);
                }
            }
        }

        // fill phase
        while !exhausted && picked.len() < target {
            match draw(rng, &mut pool, guard, &groups, |_| true) {
                Draw::Picked(d) => take(d, &mut picked, &mut groups),
                Draw::PoolEmpty => break,
                Draw::BudgetExhausted => exhausted = true,
            }
        }

        Pass {
            picked,
            missing,
            exhausted,
        }
    }
}

fn take<'c>(
    descriptor: &'c TransformationDescriptor,
    picked: &mut Vec<&'c TransformationDescriptor>,
    groups: &mut HashSet<&'c str>,
) {
    if let Some(group) = descriptor.exclusion_group.as_deref() {
        groups.insert(group);
    }
    picked.push(descriptor);
}

/// Weighted draw among pool entries accepted by `filter`.
///
/// The drawn entry leaves the pool whether it is kept or discarded for an
/// exclusion conflict; group membership only grows within a selection, so a
/// discarded entry could never be kept later.
fn draw<'c, R, F>(
    rng: &mut R,
    pool: &mut Vec<&'c TransformationDescriptor>,
    guard: &mut IterationGuard,
    groups: &HashSet<&str>,
    filter: F,
) -> Draw<'c>
where
    R: Rng,
    F: Fn(&TransformationDescriptor) -> bool,
{
    loop {
        let candidates: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, d)| filter(d))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Draw::PoolEmpty;
        }
        if guard.increment().is_err() {
            return Draw::BudgetExhausted;
        }

        let index = weighted_index(rng, pool, &candidates);
        let candidate = pool.remove(index);

        match candidate.exclusion_group.as_deref() {
            Some(group) if groups.contains(group) => {
                trace!(id = %candidate.id, group, "Exclusion conflict, redrawing");
            }
            _ => return Draw::Picked(candidate),
        }
    }
}

/// Cumulative scan over `candidates` (ascending id), so ties go to the
/// lower id.
fn weighted_index<R: Rng>(
    rng: &mut R,
    pool: &[&TransformationDescriptor],
    candidates: &[usize],
) -> usize {
    let total: f64 = candidates.iter().map(|&i| pool[i].weight).sum();
    let mut point = rng.random::<f64>() * total;
    for &i in candidates {
        let weight = pool[i].weight;
        if point < weight {
            return i;
        }
        point -= weight;
    }
    // float rounding at the top end
    candidates[candidates.len() - 1]
}
