//! Population-based search over discrete assignments.
//!
//! `EvolutionarySearch` is a plain generational loop: roulette-wheel parent selection, uniform
//! crossover, per-gene mutation and elitism. The current assignment is seeded into the first
//! generation, and elites survive every generation, so the best result never scores below the
//! starting point.

use std::cmp::Ordering;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reshard_common::config::SearchConfig;

use crate::problem::SearchProblem;

/// Limits of one search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBudget {
    /// Maximum generations to evolve.
    pub generations: usize,
    /// Wall-clock deadline; the search stops after the generation in flight.
    pub deadline: Option<Instant>,
}

impl SearchBudget {
    fn exhausted(&self, generation: usize) -> bool {
        generation >= self.generations || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Best assignment found by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Value of every variable.
    pub genes: Vec<u32>,
    /// Fitness of `genes`.
    pub fitness: f64,
    /// Generations actually evolved.
    pub generations: usize,
}

/// Strategy that searches a [`SearchProblem`] within a budget.
pub trait Optimizer {
    /// Returns the best assignment found.
    fn search(&mut self, problem: &dyn SearchProblem, budget: SearchBudget) -> Assignment;
}

/// Progress callbacks of a search run.
pub trait SearchObserver {
    /// Called after each generation with the best fitness so far.
    fn on_generation(&mut self, generation: usize, best_fitness: f64);

    /// Called once with the final result.
    fn on_finish(&mut self, _best: &Assignment) {}
}

/// Reports search progress as `tracing` events.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    log_interval: usize,
}

impl TracingObserver {
    /// Logs every `log_interval` generations; `0` logs only the final result.
    #[must_use]
    pub const fn new(log_interval: usize) -> Self {
        Self { log_interval }
    }
}

impl SearchObserver for TracingObserver {
    fn on_generation(&mut self, generation: usize, best_fitness: f64) {
        if self.log_interval > 0 && generation % self.log_interval == 0 {
            tracing::debug!(generation, best_fitness, "placement search progress");
        }
    }

    fn on_finish(&mut self, best: &Assignment) {
        tracing::info!(
            generations = best.generations,
            best_fitness = best.fitness,
            "placement search finished"
        );
    }
}

/// Generational evolutionary search.
#[derive(Debug)]
pub struct EvolutionarySearch<O = TracingObserver> {
    config: SearchConfig,
    rng: SmallRng,
    observer: O,
}

impl EvolutionarySearch<TracingObserver> {
    /// Creates a search reporting through `tracing`.
    ///
    /// A fixed `config.seed` makes runs reproducible; otherwise the RNG is seeded from entropy.
    #[must_use]
    pub fn new(config: SearchConfig) -> Self {
        let observer = TracingObserver::new(config.log_interval);
        Self::with_observer(config, observer)
    }
}

impl<O: SearchObserver> EvolutionarySearch<O> {
    /// Creates a search reporting to a custom observer.
    #[must_use]
    pub fn with_observer(mut config: SearchConfig, observer: O) -> Self {
        config.crossover_rate = unit_rate(config.crossover_rate);
        config.mutation_rate = unit_rate(config.mutation_rate);
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            config,
            rng,
            observer,
        }
    }

    /// Observer passed at construction.
    #[must_use]
    pub const fn observer(&self) -> &O {
        &self.observer
    }

    fn random_genes(&mut self, length: usize, domain: u32) -> Vec<u32> {
        (0..length).map(|_| self.rng.gen_range(0..domain)).collect()
    }

    /// Roulette-wheel pick over fitness shifted so the worst individual gets a sliver of weight.
    fn select<'a>(&mut self, population: &'a [Scored]) -> &'a Scored {
        let worst = population
            .iter()
            .map(|individual| individual.fitness)
            .fold(f64::INFINITY, f64::min);
        let total = population
            .iter()
            .map(|individual| individual.fitness - worst + f64::EPSILON)
            .sum::<f64>();
        if !(total.is_finite() && total > 0.0) {
            return &population[self.rng.gen_range(0..population.len())];
        }

        let mut ticket = self.rng.gen_range(0.0..total);
        for individual in population {
            ticket -= individual.fitness - worst + f64::EPSILON;
            if ticket <= 0.0 {
                return individual;
            }
        }
        &population[population.len() - 1]
    }

    fn breed(&mut self, population: &[Scored], domain: u32) -> Vec<u32> {
        let first = self.select(population).genes.clone();
        let mut child = if self.rng.gen_bool(self.config.crossover_rate) {
            let second = &self.select(population).genes;
            first
                .iter()
                .zip(second)
                .map(|(a, b)| if self.rng.gen_bool(0.5) { *a } else { *b })
                .collect()
        } else {
            first
        };
        for gene in &mut child {
            if self.rng.gen_bool(self.config.mutation_rate) {
                *gene = self.rng.gen_range(0..domain);
            }
        }
        child
    }
}

#[derive(Debug, Clone)]
struct Scored {
    genes: Vec<u32>,
    fitness: f64,
}

fn unit_rate(rate: f64) -> f64 {
    if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) }
}

fn by_fitness_desc(a: &Scored, b: &Scored) -> Ordering {
    b.fitness.total_cmp(&a.fitness)
}

impl<O: SearchObserver> Optimizer for EvolutionarySearch<O> {
    fn search(&mut self, problem: &dyn SearchProblem, budget: SearchBudget) -> Assignment {
        let length = problem.variable_count();
        let domain = problem.domain().max(1);
        let score = |genes: Vec<u32>| Scored {
            fitness: problem.fitness(&genes),
            genes,
        };

        let seed = score(problem.current());
        if length == 0 || domain == 1 {
            let best = Assignment {
                genes: seed.genes,
                fitness: seed.fitness,
                generations: 0,
            };
            self.observer.on_finish(&best);
            return best;
        }

        let population_size = self.config.population_size.max(2);
        let elite_count = self.config.elite_count.min(population_size - 1);
        let mut population = Vec::with_capacity(population_size);
        population.push(seed);
        while population.len() < population_size {
            let genes = self.random_genes(length, domain);
            population.push(score(genes));
        }
        population.sort_by(by_fitness_desc);

        let mut generation = 0;
        while !budget.exhausted(generation) {
            let mut next = population[..elite_count].to_vec();
            while next.len() < population_size {
                let child = self.breed(&population, domain);
                next.push(score(child));
            }
            next.sort_by(by_fitness_desc);
            population = next;
            generation += 1;
            self.observer.on_generation(generation, population[0].fitness);
        }

        let best = population.swap_remove(0);
        let best = Assignment {
            genes: best.genes,
            fitness: best.fitness,
            generations: generation,
        };
        self.observer.on_finish(&best);
        best
    }
}
