//! Random forest classifier used by the train stage.

use std::cmp::Ordering;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::error::{PipelineError, Result};
use crate::storage;

pub trait Classifier {
    fn fit(&mut self, data: &Dataset) -> Result<()>;

    fn predict_one(&self, row: &[f64]) -> Result<usize>;

    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<usize>> {
        rows.iter().map(|r| self.predict_one(r)).collect()
    }

    /// Mean accuracy on `data`.
    fn score(&self, data: &Dataset) -> Result<f64> {
        if data.is_empty() {
            return Err(PipelineError::Dataset("cannot score an empty dataset".to_string()));
        }
        let predicted = self.predict(&data.features)?;
        Ok(crate::metrics::accuracy(&data.targets, &predicted))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Node {
    Leaf {
        class: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn predict(&self, row: &[f64]) -> usize {
        match self {
            Node::Leaf { class } => *class,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

/// Bagged CART trees with gini splits and `sqrt(n_features)` candidate
/// features per split. Fully determined by `random_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomForest {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub random_state: u64,
    #[serde(default)]
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub target_names: Vec<String>,
    #[serde(default)]
    n_classes: usize,
    #[serde(default)]
    trees: Vec<Node>,
}

impl RandomForest {
    pub const MODEL_TYPE: &'static str = "RandomForest";

    pub fn new(n_estimators: usize, max_depth: usize, random_state: u64) -> Self {
        Self {
            n_estimators,
            max_depth,
            random_state,
            feature_names: vec![],
            target_names: vec![],
            n_classes: 0,
            trees: vec![],
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let model: Self = storage::load_json(path)?;
        if !model.is_fitted() {
            return Err(PipelineError::Other(format!(
                "model at {} is not fitted",
                path.display()
            )));
        }
        Ok(model)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn build(
        &self,
        data: &Dataset,
        idx: &[usize],
        depth: usize,
        rng: &mut StdRng,
    ) -> Node {
        let counts = class_counts(data, idx, self.n_classes);
        let majority = argmax(&counts);
        let pure = counts.iter().filter(|c| **c > 0).count() <= 1;
        if pure || depth >= self.max_depth || idx.len() < 2 {
            return Node::Leaf { class: majority };
        }

        let n_features = data.n_features();
        let mtry = ((n_features as f64).sqrt().floor() as usize).max(1);
        let candidates = rand::seq::index::sample(rng, n_features, mtry).into_vec();

        match best_split(data, idx, &candidates, &counts) {
            Some((feature, threshold)) => {
                let (left, right): (Vec<usize>, Vec<usize>) = idx
                    .iter()
                    .copied()
                    .partition(|&i| data.features[i][feature] <= threshold);
                Node::Split {
                    feature,
                    threshold,
                    left: Box::new(self.build(data, &left, depth + 1, rng)),
                    right: Box::new(self.build(data, &right, depth + 1, rng)),
                }
            }
            None => Node::Leaf { class: majority },
        }
    }
}

impl Classifier for RandomForest {
    fn fit(&mut self, data: &Dataset) -> Result<()> {
        if self.n_estimators == 0 || self.max_depth == 0 {
            return Err(PipelineError::InvalidParam(
                "n_estimators and max_depth must be positive".to_string(),
            ));
        }
        if data.is_empty() || data.n_features() == 0 {
            return Err(PipelineError::Dataset("cannot fit on empty data".to_string()));
        }

        self.n_classes = data.n_classes();
        self.feature_names = data.feature_names.clone();
        self.target_names = data.target_names.clone();

        let mut rng = StdRng::seed_from_u64(self.random_state);
        let n = data.len();
        let mut trees = Vec::with_capacity(self.n_estimators);
        for _ in 0..self.n_estimators {
            let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            trees.push(self.build(data, &bootstrap, 0, &mut rng));
        }
        self.trees = trees;

        debug!(
            n_estimators = self.n_estimators,
            max_depth = self.max_depth,
            rows = n,
            "Fitted random forest"
        );
        Ok(())
    }

    fn predict_one(&self, row: &[f64]) -> Result<usize> {
        if !self.is_fitted() {
            return Err(PipelineError::Other("model is not fitted".to_string()));
        }
        if row.len() != self.feature_names.len() {
            return Err(PipelineError::Dataset(format!(
                "expected {} features, got {}",
                self.feature_names.len(),
                row.len()
            )));
        }
        let mut votes = vec![0usize; self.n_classes.max(1)];
        for tree in &self.trees {
            let class = tree.predict(row);
            if class >= votes.len() {
                votes.resize(class + 1, 0);
            }
            votes[class] += 1;
        }
        Ok(argmax(&votes))
    }
}

fn class_counts(data: &Dataset, idx: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_classes];
    for &i in idx {
        counts[data.targets[i]] += 1;
    }
    counts
}

/// Index of the largest count; ties go to the lowest index.
fn argmax(counts: &[usize]) -> usize {
    let mut best = 0;
    for (i, c) in counts.iter().enumerate() {
        if *c > counts[best] {
            best = i;
        }
    }
    best
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total;
            p * p
        })
        .sum::<f64>()
}

/// Best (feature, threshold) among `candidates`, if any split lowers impurity.
fn best_split(
    data: &Dataset,
    idx: &[usize],
    candidates: &[usize],
    counts: &[usize],
) -> Option<(usize, f64)> {
    let n = idx.len();
    let parent = gini(counts, n);
    let mut best: Option<(usize, f64, f64)> = None;

    for &feature in candidates {
        let mut sorted = idx.to_vec();
        sorted.sort_by(|&a, &b| {
            data.features[a][feature]
                .partial_cmp(&data.features[b][feature])
                .unwrap_or(Ordering::Equal)
        });

        let mut left = vec![0usize; counts.len()];
        let mut right = counts.to_vec();
        for i in 0..n - 1 {
            let class = data.targets[sorted[i]];
            left[class] += 1;
            right[class] -= 1;

            let value = data.features[sorted[i]][feature];
            let next = data.features[sorted[i + 1]][feature];
            if value == next {
                continue;
            }
            let n_left = i + 1;
            let n_right = n - n_left;
            let impurity = (n_left as f64 * gini(&left, n_left)
                + n_right as f64 * gini(&right, n_right))
                / n as f64;

            if best.map_or(true, |(_, _, b)| impurity < b - 1e-12) {
                best = Some((feature, (value + next) / 2.0, impurity));
            }
        }
    }

    best.filter(|(_, _, impurity)| *impurity < parent - 1e-12)
        .map(|(feature, threshold, _)| (feature, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forest_learns_iris() {
        let iris = Dataset::iris().unwrap();
        let (train, test) = iris.stratified_split(0.2, 42).unwrap();
        let mut model = RandomForest::new(25, 5, 42);
        model.fit(&train).unwrap();
        assert!(model.score(&train).unwrap() > 0.9);
        assert!(model.score(&test).unwrap() > 0.8);
    }

    #[test]
    fn same_seed_same_forest() {
        let iris = Dataset::iris().unwrap();
        let mut a = RandomForest::new(5, 3, 7);
        let mut b = RandomForest::new(5, 3, 7);
        a.fit(&iris).unwrap();
        b.fit(&iris).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn predict_checks_feature_count() {
        let iris = Dataset::iris().unwrap();
        let mut model = RandomForest::new(3, 2, 0);
        model.fit(&iris).unwrap();
        assert!(model.predict_one(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn unfitted_model_cannot_predict() {
        let model = RandomForest::new(3, 2, 0);
        assert!(model.predict_one(&[1.0, 2.0, 3.0, 4.0]).is_err());
    }
}
