//! Tabular classification data: bundled iris sample, CSV I/O and stratified splits.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PipelineError, Result};

const IRIS_CSV: &str = include_str!("../assets/iris.csv");
pub const IRIS_TARGET_NAMES: [&str; 3] = ["setosa", "versicolor", "virginica"];

const TARGET_COL: &str = "target";
const TARGET_NAME_COL: &str = "target_name";
/// Class labels must be below this.
const MAX_CLASSES: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub target_names: Vec<String>,
    /// Row-major feature matrix
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<usize>,
}

impl Dataset {
    /// The bundled iris sample: 150 rows, 4 features, 3 classes.
    pub fn iris() -> Result<Self> {
        Self::from_csv_str(IRIS_CSV, &IRIS_TARGET_NAMES)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn n_classes(&self) -> usize {
        let seen = self.targets.iter().max().map(|m| m + 1).unwrap_or(0);
        seen.max(self.target_names.len())
    }

    /// Names of the classes present in the data, in class order.
    pub fn present_classes(&self) -> Vec<String> {
        let mut present: Vec<usize> = self.targets.clone();
        present.sort_unstable();
        present.dedup();
        present.into_iter().map(|c| self.class_name(c)).collect()
    }

    pub fn class_name(&self, class: usize) -> String {
        self.target_names
            .get(class)
            .cloned()
            .unwrap_or_else(|| class.to_string())
    }

    fn subset(&self, indices: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            target_names: self.target_names.clone(),
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            targets: indices.iter().map(|&i| self.targets[i]).collect(),
        }
    }

    /// Parse CSV text with a header row. A `target` column is required; an
    /// optional `target_name` column supplies class names and is otherwise dropped.
    pub fn from_csv_str(content: &str, default_target_names: &[&str]) -> Result<Self> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<String> = lines
            .next()
            .ok_or_else(|| PipelineError::Dataset("empty CSV".to_string()))?
            .split(',')
            .map(|h| h.trim().trim_matches('"').to_string())
            .collect();

        let target_idx = header
            .iter()
            .position(|h| h == TARGET_COL)
            .ok_or_else(|| PipelineError::Dataset("missing 'target' column".to_string()))?;
        let name_idx = header.iter().position(|h| h == TARGET_NAME_COL);
        let feature_idx: Vec<usize> = (0..header.len())
            .filter(|i| *i != target_idx && Some(*i) != name_idx)
            .collect();

        let mut features = vec![];
        let mut targets = vec![];
        let mut names: Vec<Option<String>> = vec![];

        for (line_no, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(',').map(|c| c.trim().trim_matches('"')).collect();
            if cells.len() != header.len() {
                return Err(PipelineError::Dataset(format!(
                    "row {}: expected {} fields, found {}",
                    line_no + 2,
                    header.len(),
                    cells.len()
                )));
            }
            let row = feature_idx
                .iter()
                .map(|&i| {
                    cells[i].parse::<f64>().map_err(|_| {
                        PipelineError::Dataset(format!(
                            "row {}: '{}' is not a number",
                            line_no + 2,
                            cells[i]
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            let target = cells[target_idx].parse::<f64>().ok().filter(|t| {
                *t >= 0.0 && t.fract() == 0.0 && *t < MAX_CLASSES as f64
            });
            let target = target.ok_or_else(|| {
                PipelineError::Dataset(format!(
                    "row {}: invalid target '{}'",
                    line_no + 2,
                    cells[target_idx]
                ))
            })? as usize;

            if let Some(ni) = name_idx {
                if names.len() <= target {
                    names.resize(target + 1, None);
                }
                names[target].get_or_insert_with(|| cells[ni].to_string());
            }
            features.push(row);
            targets.push(target);
        }

        let mut target_names: Vec<String> =
            default_target_names.iter().map(|s| s.to_string()).collect();
        for (class, name) in names.into_iter().enumerate() {
            if let Some(name) = name {
                if class < target_names.len() {
                    target_names[class] = name;
                } else {
                    target_names.resize(class, String::new());
                    target_names.push(name);
                }
            }
        }

        Ok(Self {
            feature_names: feature_idx.iter().map(|&i| header[i].clone()).collect(),
            target_names,
            features,
            targets,
        })
    }

    pub fn read_csv(path: &Path, default_target_names: &[&str]) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::Dataset(format!(
                "file not found: {}",
                path.display()
            )));
        }
        Self::from_csv_str(&fs::read_to_string(path)?, default_target_names)
    }

    pub fn to_csv_string(&self, with_target_name: bool) -> String {
        let mut header = self.feature_names.clone();
        header.push(TARGET_COL.to_string());
        if with_target_name {
            header.push(TARGET_NAME_COL.to_string());
        }
        let mut out = header.join(",") + "\n";
        for (row, target) in self.features.iter().zip(&self.targets) {
            let mut cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            cells.push(target.to_string());
            if with_target_name {
                cells.push(self.class_name(*target));
            }
            out += &(cells.join(",") + "\n");
        }
        out
    }

    pub fn write_csv(&self, path: &Path, with_target_name: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_csv_string(with_target_name))?;
        Ok(())
    }

    /// Split into (train, test), preserving class proportions.
    ///
    /// Every class sends `round(n_class * test_size)` rows to test, at least one and
    /// at most `n_class - 1` when the class has two or more rows. The split is fully
    /// determined by `seed`.
    pub fn stratified_split(&self, test_size: f64, seed: u64) -> Result<(Self, Self)> {
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(PipelineError::InvalidParam(format!(
                "test_size must be in (0, 1), got {}",
                test_size
            )));
        }
        if self.len() < 2 {
            return Err(PipelineError::Dataset(
                "need at least 2 rows to split".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut train_idx = vec![];
        let mut test_idx = vec![];

        for class in 0..self.n_classes() {
            let mut members: Vec<usize> = (0..self.len())
                .filter(|&i| self.targets[i] == class)
                .collect();
            if members.is_empty() {
                continue;
            }
            members.shuffle(&mut rng);

            let n = members.len();
            let mut n_test = (n as f64 * test_size).round() as usize;
            if n >= 2 {
                n_test = n_test.clamp(1, n - 1);
            } else {
                n_test = 0;
            }
            test_idx.extend_from_slice(&members[..n_test]);
            train_idx.extend_from_slice(&members[n_test..]);
        }

        train_idx.shuffle(&mut rng);
        test_idx.shuffle(&mut rng);
        Ok((self.subset(&train_idx), self.subset(&test_idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iris_sample_is_complete() {
        let iris = Dataset::iris().unwrap();
        assert_eq!(iris.len(), 150);
        assert_eq!(iris.n_features(), 4);
        assert_eq!(iris.n_classes(), 3);
        assert_eq!(iris.class_name(2), "virginica");
    }

    #[test]
    fn stratified_split_keeps_class_balance() {
        let iris = Dataset::iris().unwrap();
        let (train, test) = iris.stratified_split(0.2, 42).unwrap();
        assert_eq!(train.len(), 120);
        assert_eq!(test.len(), 30);
        for class in 0..3 {
            assert_eq!(test.targets.iter().filter(|t| **t == class).count(), 10);
        }

        let (_, again) = iris.stratified_split(0.2, 42).unwrap();
        assert_eq!(test, again);
        let (_, other) = iris.stratified_split(0.2, 7).unwrap();
        assert_ne!(test.features, other.features);
    }

    #[test]
    fn stratified_split_rejects_bad_fraction() {
        let iris = Dataset::iris().unwrap();
        assert!(iris.stratified_split(0.0, 1).is_err());
        assert!(iris.stratified_split(1.0, 1).is_err());
    }

    #[test]
    fn csv_target_name_column_is_dropped_on_read() {
        let csv = "a,b,target,target_name\n1.0,2.0,1,beta\n3.5,4.0,0,alpha\n";
        let ds = Dataset::from_csv_str(csv, &[]).unwrap();
        assert_eq!(ds.feature_names, vec!["a", "b"]);
        assert_eq!(ds.target_names, vec!["alpha", "beta"]);
        assert_eq!(ds.features[1], vec![3.5, 4.0]);
        assert_eq!(ds.targets, vec![1, 0]);
    }

    #[test]
    fn csv_without_target_is_rejected() {
        let err = Dataset::from_csv_str("a,b\n1,2\n", &[]).unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn csv_out_of_range_target_is_rejected() {
        for label in ["1e20", "1e9", "10000", "-1", "1.5", "inf"] {
            let csv = format!("a,target,target_name\n1.0,{},x\n", label);
            let err = Dataset::from_csv_str(&csv, &[]).unwrap_err();
            assert!(err.to_string().contains("invalid target"), "{}", label);
        }
        let ds = Dataset::from_csv_str("a,target\n1.0,9999\n", &[]).unwrap();
        assert_eq!(ds.n_classes(), MAX_CLASSES);
    }
}
