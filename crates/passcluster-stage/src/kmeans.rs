//! Seeded k-means over pass feature vectors.
//!
//! Centres are seeded with greedy k-means++ and refined with Lloyd
//! iterations. The same input and seed always yield the same labels.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use passcluster_core::DEFAULT_N_CLUSTERS;

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_MAX_ITER: usize = 300;
pub const DEFAULT_TOL: f64 = 1e-4;

/// How many seeded initializations to run; the lowest inertia wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NInit {
    /// One k-means++ initialization.
    Auto,
    Fixed(usize),
}

impl NInit {
    pub fn resolve(&self) -> usize {
        match self {
            NInit::Auto => 1,
            NInit::Fixed(n) => (*n).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KMeansConfig {
    pub n_clusters: usize,
    pub seed: u64,
    pub max_iter: usize,
    /// Relative tolerance, scaled by the mean per-feature variance.
    pub tol: f64,
    pub n_init: NInit,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: DEFAULT_N_CLUSTERS,
            seed: DEFAULT_SEED,
            max_iter: DEFAULT_MAX_ITER,
            tol: DEFAULT_TOL,
            n_init: NInit::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    /// Cluster index per input row, in `0..effective_k`.
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
    pub iterations: usize,
    /// `min(n_clusters, distinct rows)`.
    pub effective_k: usize,
}

impl KMeansFit {
    fn empty() -> Self {
        Self {
            labels: Vec::new(),
            centroids: Vec::new(),
            inertia: 0.0,
            iterations: 0,
            effective_k: 0,
        }
    }

    pub fn populated_clusters(&self) -> usize {
        self.labels.iter().collect::<HashSet<_>>().len()
    }
}

pub struct KMeans {
    config: KMeansConfig,
}

impl KMeans {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    pub fn fit<P: AsRef<[f64]>>(&self, points: &[P]) -> KMeansFit {
        let data: Vec<&[f64]> = points.iter().map(AsRef::as_ref).collect();
        if data.is_empty() || self.config.n_clusters == 0 {
            return KMeansFit::empty();
        }

        let k = self.config.n_clusters.min(count_distinct(&data));
        let tol = self.config.tol * mean_variance(&data);
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut best: Option<KMeansFit> = None;
        for init in 0..self.config.n_init.resolve() {
            let centroids = kmeans_plus_plus(&data, k, &mut rng);
            let fit = lloyd(&data, centroids, self.config.max_iter.max(1), tol);
            debug!(
                init,
                k,
                iterations = fit.iterations,
                inertia = fit.inertia,
                "k-means initialization finished"
            );
            if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }

        match best {
            Some(fit) => fit,
            None => KMeansFit::empty(),
        }
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn count_distinct(data: &[&[f64]]) -> usize {
    data.iter()
        .map(|point| {
            point
                .iter()
                // -0.0 and 0.0 are the same point
                .map(|v| if *v == 0.0 { 0u64 } else { v.to_bits() })
                .collect::<Vec<_>>()
        })
        .collect::<HashSet<_>>()
        .len()
}

fn mean_variance(data: &[&[f64]]) -> f64 {
    let n = data.len() as f64;
    let dims = data.first().map_or(0, |p| p.len());
    if dims == 0 {
        return 0.0;
    }
    let total: f64 = (0..dims)
        .map(|d| {
            let mean = data.iter().map(|p| p[d]).sum::<f64>() / n;
            data.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n
        })
        .sum();
    total / dims as f64
}

/// Index drawn with probability proportional to `weights[i]`.
fn sample_weighted(weights: &[f64], total: f64, rng: &mut StdRng) -> usize {
    let target = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative > target {
            return i;
        }
    }
    // rounding can leave `target` just above the final sum
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
}

fn kmeans_plus_plus(data: &[&[f64]], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let local_trials = 2 + (k as f64).ln().floor() as usize;

    let first = rng.gen_range(0..data.len());
    let mut centres = vec![data[first].to_vec()];
    let mut closest: Vec<f64> = data
        .iter()
        .map(|p| squared_distance(p, data[first]))
        .collect();
    let mut potential: f64 = closest.iter().sum();

    while centres.len() < k && potential > 0.0 {
        let mut best: Option<(usize, Vec<f64>, f64)> = None;
        for _ in 0..local_trials {
            let candidate = sample_weighted(&closest, potential, rng);
            let trial_closest: Vec<f64> = data
                .iter()
                .zip(&closest)
                .map(|(p, current)| current.min(squared_distance(p, data[candidate])))
                .collect();
            let trial_potential: f64 = trial_closest.iter().sum();
            if best
                .as_ref()
                .map_or(true, |(_, _, p)| trial_potential < *p)
            {
                best = Some((candidate, trial_closest, trial_potential));
            }
        }
        let Some((chosen, chosen_closest, chosen_potential)) = best else {
            break;
        };
        centres.push(data[chosen].to_vec());
        closest = chosen_closest;
        potential = chosen_potential;
    }

    centres
}

fn nearest_centre(point: &[f64], centres: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, centre) in centres.iter().enumerate() {
        let d = squared_distance(point, centre);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Returns whether any label changed.
fn assign(data: &[&[f64]], centres: &[Vec<f64>], labels: &mut [usize]) -> bool {
    let mut changed = false;
    for (point, label) in data.iter().zip(labels.iter_mut()) {
        let (nearest, _) = nearest_centre(point, centres);
        if nearest != *label {
            *label = nearest;
            changed = true;
        }
    }
    changed
}

fn recompute_centres(data: &[&[f64]], labels: &[usize], centres: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let dims = centres.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0; dims]; centres.len()];
    let mut counts = vec![0usize; centres.len()];
    for (point, &label) in data.iter().zip(labels) {
        counts[label] += 1;
        for (acc, v) in sums[label].iter_mut().zip(point.iter()) {
            *acc += v;
        }
    }

    // Empty clusters move onto the points worst served by their centre.
    let mut far_points: Vec<usize> = (0..data.len()).collect();
    far_points.sort_by(|&a, &b| {
        let da = squared_distance(data[a], &centres[labels[a]]);
        let db = squared_distance(data[b], &centres[labels[b]]);
        db.total_cmp(&da)
    });
    let mut far_points = far_points.into_iter();

    sums.into_iter()
        .zip(counts)
        .enumerate()
        .map(|(j, (sum, count))| {
            if count > 0 {
                sum.into_iter().map(|s| s / count as f64).collect()
            } else {
                match far_points.next() {
                    Some(i) => data[i].to_vec(),
                    None => centres[j].clone(),
                }
            }
        })
        .collect()
}

fn lloyd(data: &[&[f64]], mut centres: Vec<Vec<f64>>, max_iter: usize, tol: f64) -> KMeansFit {
    let mut labels = vec![usize::MAX; data.len()];
    let mut iterations = 0;

    loop {
        iterations += 1;
        let changed = assign(data, &centres, &mut labels);
        if !changed || iterations >= max_iter {
            break;
        }

        let updated = recompute_centres(data, &labels, &centres);
        let shift: f64 = centres
            .iter()
            .zip(&updated)
            .map(|(old, new)| squared_distance(old, new))
            .sum();
        centres = updated;
        if shift <= tol {
            assign(data, &centres, &mut labels);
            break;
        }
    }

    let inertia = data
        .iter()
        .zip(&labels)
        .map(|(point, &label)| squared_distance(point, &centres[label]))
        .sum();

    KMeansFit {
        effective_k: centres.len(),
        labels,
        centroids: centres,
        inertia,
        iterations,
    }
}
