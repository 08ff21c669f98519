//! Built-in planners.

use crate::core::link::LinkCandidate;
use crate::orchestration::planner::{Planner, PlannerContext};

/// One link per agent at a time, in adversary order.
///
/// An agent with primary work still in flight (or waiting on trust) gets
/// nothing new until that work concludes.
pub struct AtomicPlanner;

impl Planner for AtomicPlanner {
    fn name(&self) -> &str {
        "atomic"
    }

    fn next(&self, ctx: &PlannerContext<'_>) -> Vec<LinkCandidate> {
        let mut decided = Vec::new();
        for agent in ctx.agents {
            if ctx.has_outstanding(&agent.paw) {
                continue;
            }
            let next = ctx
                .abilities
                .iter()
                .find_map(|ability| ctx.candidates(agent, ability).into_iter().next());
            decided.extend(next);
        }
        decided
    }
}

/// Everything every agent can run, all at once.
pub struct BatchPlanner;

impl Planner for BatchPlanner {
    fn name(&self) -> &str {
        "batch"
    }

    fn next(&self, ctx: &PlannerContext<'_>) -> Vec<LinkCandidate> {
        let mut decided = Vec::new();
        for agent in ctx.agents {
            for ability in ctx.abilities {
                decided.extend(ctx.candidates(agent, ability));
            }
        }
        decided
    }
}

/// Tactic buckets run in order; a bucket must drain before the next opens.
///
/// Abilities whose tactic is not listed form a final bucket.
pub struct BucketsPlanner {
    buckets: Vec<String>,
}

impl BucketsPlanner {
    pub fn new(buckets: Vec<String>) -> Self {
        Self { buckets }
    }

    fn bucket_candidates<F>(&self, ctx: &PlannerContext<'_>, in_bucket: F) -> Vec<LinkCandidate>
    where
        F: Fn(&str) -> bool,
    {
        let mut decided = Vec::new();
        for agent in ctx.agents {
            for ability in ctx.abilities.iter().filter(|a| in_bucket(&a.tactic)) {
                decided.extend(ctx.candidates(agent, ability));
            }
        }
        decided
    }
}

impl Planner for BucketsPlanner {
    fn name(&self) -> &str {
        "buckets"
    }

    fn next(&self, ctx: &PlannerContext<'_>) -> Vec<LinkCandidate> {
        for bucket in &self.buckets {
            let decided = self.bucket_candidates(ctx, |tactic| tactic == bucket);
            if !decided.is_empty() {
                return decided;
            }
            if ctx.tactic_outstanding(bucket) {
                return Vec::new();
            }
        }
        self.bucket_candidates(ctx, |tactic| !self.buckets.iter().any(|b| b == tactic))
    }
}
