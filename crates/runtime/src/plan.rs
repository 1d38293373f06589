//! Run plans
//!
//! A [`RunPlan`] describes one run: seed, step count and property
//! overrides applied before the first step. [`RunPlanVector`] builds
//! batches of plans for ensembles, with bulk seed and property sweeps.

use std::ops::{Add, AddAssign, Index, Mul};

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// A property value a plan can override.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Scalar(f64),
    Vec2([f64; 2]),
    Vec3([f64; 3]),
}

/// Configuration for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    random_seed: u64,
    steps: u64,
    overrides: IndexMap<String, PropertyValue>,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl RunPlan {
    pub fn new() -> Self {
        Self {
            random_seed: 0,
            steps: 1,
            overrides: IndexMap::new(),
        }
    }

    pub fn set_random_seed(&mut self, seed: u64) -> &mut Self {
        self.random_seed = seed;
        self
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Steps to run. Zero means run until an exit condition fires.
    pub fn set_steps(&mut self, steps: u64) -> &mut Self {
        self.steps = steps;
        self
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> &mut Self {
        self.overrides.insert(name.to_string(), value);
        self
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.overrides.get(name).copied()
    }

    pub fn overrides(&self) -> impl Iterator<Item = (&str, PropertyValue)> {
        self.overrides.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// An ordered batch of run plans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPlanVector {
    plans: Vec<RunPlan>,
}

impl RunPlanVector {
    /// `count` copies of the default plan.
    pub fn new(count: usize) -> Self {
        Self {
            plans: vec![RunPlan::new(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunPlan> {
        self.plans.iter()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RunPlan> {
        self.plans.get_mut(index)
    }

    /// Set the step count of every plan.
    pub fn set_steps(&mut self, steps: u64) -> &mut Self {
        for plan in &mut self.plans {
            plan.set_steps(steps);
        }
        self
    }

    /// Seed plan `i` with `initial + i * step`.
    pub fn set_random_seed(&mut self, initial: u64, step: u64) -> &mut Self {
        for (i, plan) in self.plans.iter_mut().enumerate() {
            plan.set_random_seed(initial.wrapping_add(step.wrapping_mul(i as u64)));
        }
        self
    }

    /// Draw every plan's seed from one generator, so a batch seeded the
    /// same way reproduces the same per-run seeds.
    pub fn randomize_seeds(&mut self, generator_seed: u64) -> &mut Self {
        let mut rng = StdRng::seed_from_u64(generator_seed);
        for plan in &mut self.plans {
            plan.set_random_seed(rng.next_u64());
        }
        self
    }

    /// Set one scalar property to the same value in every plan.
    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> &mut Self {
        for plan in &mut self.plans {
            plan.set_property(name, value);
        }
        self
    }

    /// Sweep a scalar property linearly from `min` (first plan) to `max`
    /// (last plan).
    pub fn set_property_lerp_range(&mut self, name: &str, min: f64, max: f64) -> &mut Self {
        let n = self.plans.len();
        for (i, plan) in self.plans.iter_mut().enumerate() {
            let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            plan.set_property(name, PropertyValue::Scalar(min + (max - min) * t));
        }
        self
    }

    /// Draw a scalar property uniformly from `[min, max)` per plan.
    pub fn set_property_uniform_random(
        &mut self,
        name: &str,
        min: f64,
        max: f64,
        generator_seed: u64,
    ) -> &mut Self {
        let mut rng = StdRng::seed_from_u64(generator_seed);
        for plan in &mut self.plans {
            plan.set_property(name, PropertyValue::Scalar(rng.gen_range(min..max)));
        }
        self
    }
}

impl Index<usize> for RunPlanVector {
    type Output = RunPlan;

    fn index(&self, index: usize) -> &RunPlan {
        &self.plans[index]
    }
}

impl Add<RunPlan> for RunPlanVector {
    type Output = RunPlanVector;

    fn add(mut self, rhs: RunPlan) -> RunPlanVector {
        self.plans.push(rhs);
        self
    }
}

impl Add for RunPlanVector {
    type Output = RunPlanVector;

    fn add(mut self, rhs: RunPlanVector) -> RunPlanVector {
        self.plans.extend(rhs.plans);
        self
    }
}

impl AddAssign<RunPlan> for RunPlanVector {
    fn add_assign(&mut self, rhs: RunPlan) {
        self.plans.push(rhs);
    }
}

impl AddAssign for RunPlanVector {
    fn add_assign(&mut self, rhs: RunPlanVector) {
        self.plans.extend(rhs.plans);
    }
}

impl Add for RunPlan {
    type Output = RunPlanVector;

    fn add(self, rhs: RunPlan) -> RunPlanVector {
        RunPlanVector {
            plans: vec![self, rhs],
        }
    }
}

/// `plan * n` repeats the plan `n` times.
impl Mul<usize> for RunPlan {
    type Output = RunPlanVector;

    fn mul(self, rhs: usize) -> RunPlanVector {
        RunPlanVector {
            plans: vec![self; rhs],
        }
    }
}

impl Mul<usize> for RunPlanVector {
    type Output = RunPlanVector;

    fn mul(mut self, rhs: usize) -> RunPlanVector {
        let base = std::mem::take(&mut self.plans);
        for _ in 0..rhs {
            self.plans.extend(base.iter().cloned());
        }
        self
    }
}

impl<'a> IntoIterator for &'a RunPlanVector {
    type Item = &'a RunPlan;
    type IntoIter = std::slice::Iter<'a, RunPlan>;

    fn into_iter(self) -> Self::IntoIter {
        self.plans.iter()
    }
}
