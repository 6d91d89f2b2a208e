use serde::Serialize;

pub const DEFAULT_MAX_CENTROIDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Centroid {
    pub mean: f64,
    pub weight: f64,
}

/// Bounded-memory quantile estimator.
///
/// Holds at most `max_centroids` centroids. Compression repeatedly folds the
/// adjacent pair with the smallest combined weight, which keeps the clusters
/// evenly sized across the value range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TDigest {
    max_centroids: usize,
    centroids: Vec<Centroid>,
    total_weight: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CENTROIDS)
    }
}

impl TDigest {
    pub fn new(max_centroids: usize) -> Self {
        let max_centroids = max_centroids.max(2);
        Self {
            max_centroids,
            centroids: Vec::with_capacity(max_centroids),
            total_weight: 0.0,
        }
    }

    pub fn add(&mut self, x: f64) {
        self.add_weighted(x, 1.0);
    }

    pub fn add_weighted(&mut self, mean: f64, weight: f64) {
        if !mean.is_finite() || !weight.is_finite() || weight <= 0.0 {
            return;
        }
        self.centroids.push(Centroid { mean, weight });
        self.total_weight += weight;
        if self.centroids.len() >= self.max_centroids {
            self.compress();
        }
    }

    /// Folds every centroid of `other` into this digest.
    pub fn merge(&mut self, other: &TDigest) {
        for c in &other.centroids {
            self.add_weighted(c.mean, c.weight);
        }
    }

    /// Sorts by mean and folds adjacent pairs until at most ⌈cap/2⌉ remain.
    pub fn compress(&mut self) {
        self.sort();
        let target = self.max_centroids.div_ceil(2);
        while self.centroids.len() > target {
            let i = (0..self.centroids.len() - 1)
                .min_by(|&a, &b| self.fold_cost(a).cmp_key(&self.fold_cost(b)))
                .unwrap_or(0);
            let (left, right) = (self.centroids[i], self.centroids[i + 1]);
            let weight = left.weight + right.weight;
            self.centroids[i] = Centroid {
                mean: (left.mean * left.weight + right.mean * right.weight) / weight,
                weight,
            };
            self.centroids.remove(i + 1);
        }
    }

    /// Mean of the first centroid whose cumulative weight reaches `q · total`.
    /// Returns 0 on an empty digest.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.centroids.is_empty() {
            return 0.0;
        }
        let mut sorted = self.centroids.clone();
        sorted.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        let q = if q.is_nan() { 0.5 } else { q.clamp(0.0, 1.0) };
        let target = q * self.total_weight;
        let mut cumulative = 0.0;
        for c in &sorted {
            cumulative += c.weight;
            if cumulative >= target {
                return c.mean;
            }
        }
        sorted[sorted.len() - 1].mean
    }

    pub fn centroids(&self) -> &[Centroid] {
        &self.centroids
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn max_centroids(&self) -> usize {
        self.max_centroids
    }

    fn sort(&mut self) {
        self.centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    }

    fn fold_cost(&self, i: usize) -> FoldCost {
        let (a, b) = (&self.centroids[i], &self.centroids[i + 1]);
        FoldCost {
            weight: a.weight + b.weight,
            gap: b.mean - a.mean,
        }
    }
}

struct FoldCost {
    weight: f64,
    gap: f64,
}

impl FoldCost {
    fn cmp_key(&self, other: &FoldCost) -> std::cmp::Ordering {
        self.weight
            .total_cmp(&other.weight)
            .then(self.gap.total_cmp(&other.gap))
    }
}
