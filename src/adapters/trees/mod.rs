//! Tree adapter: gradient-boosted tree scorers exported by the training run.
//!
//! Two serialized model families are supported:
//!
//! - `lightgbm`: binary decision trees. A node sends `x <= threshold` left;
//!   NaN follows `default_left`. Leaf values are summed with `base_score`.
//! - `catboost`: oblivious trees. Every level shares one `(feature, border)`
//!   split; `x > border` sets the level's bit in the leaf index.
//!
//! Both output `sigmoid(margin)`.
//!
//! Models are validated once at load: every child index must point forward
//! (so traversal terminates), every feature index must be in range, and every
//! numeric parameter must be finite. `predict` can then walk the trees without
//! further checks.

use serde::{Deserialize, Serialize};

use crate::domain::{Architecture, PredictError, Scorer};

/// Deepest oblivious tree accepted (leaf table of 2^16 entries).
pub const MAX_OBLIVIOUS_DEPTH: usize = 16;

/// Errors raised while loading a tree model.
#[derive(Debug, thiserror::Error)]
pub enum TreeModelError {
    #[error("Invalid model JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tree {tree}: {reason}")]
    InvalidTree { tree: usize, reason: String },

    #[error("Model declares zero input features")]
    NoFeatures,

    #[error("Model parameter '{0}' is not finite")]
    NonFinite(&'static str),
}

fn invalid(tree: usize, reason: impl Into<String>) -> TreeModelError {
    TreeModelError::InvalidTree {
        tree,
        reason: reason.into(),
    }
}

fn sigmoid(margin: f64) -> f64 {
    if margin >= 0.0 {
        1.0 / (1.0 + (-margin).exp())
    } else {
        let e = margin.exp();
        e / (1.0 + e)
    }
}

// ─── Binary trees ───────────────────────────────────────────────────────────

/// A node of a binary decision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        /// Direction taken when the feature value is NaN.
        default_left: bool,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// Nodes in index order; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryTree {
    pub nodes: Vec<Node>,
}

impl BinaryTree {
    fn validate(&self, tree: usize, n_features: usize) -> Result<(), TreeModelError> {
        if self.nodes.is_empty() {
            return Err(invalid(tree, "no nodes"));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(invalid(
                            tree,
                            format!("node {idx} splits on feature {feature} (width {n_features})"),
                        ));
                    }
                    if !threshold.is_finite() {
                        return Err(invalid(tree, format!("node {idx} has non-finite threshold")));
                    }
                    for child in [left, right] {
                        if *child <= idx || *child >= self.nodes.len() {
                            return Err(invalid(
                                tree,
                                format!("node {idx} has invalid child index {child}"),
                            ));
                        }
                    }
                }
                Node::Leaf { value } => {
                    if !value.is_finite() {
                        return Err(invalid(tree, format!("leaf {idx} is not finite")));
                    }
                }
            }
        }
        Ok(())
    }

    fn leaf_value(&self, x: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                } => {
                    let v = x[*feature];
                    let go_left = if v.is_nan() {
                        *default_left
                    } else {
                        v <= *threshold
                    };
                    idx = if go_left { *left } else { *right };
                }
            }
        }
    }
}

/// LightGBM-style additive ensemble of binary trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryTreeModel {
    pub n_features: usize,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<BinaryTree>,
}

impl BinaryTreeModel {
    fn validate(&self) -> Result<(), TreeModelError> {
        if self.n_features == 0 {
            return Err(TreeModelError::NoFeatures);
        }
        if !self.base_score.is_finite() {
            return Err(TreeModelError::NonFinite("base_score"));
        }
        self.trees
            .iter()
            .enumerate()
            .try_for_each(|(i, t)| t.validate(i, self.n_features))
    }

    fn margin(&self, x: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.leaf_value(x)).sum::<f64>()
    }
}

// ─── Oblivious trees ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObliviousSplit {
    pub feature: usize,
    pub border: f64,
}

/// Symmetric tree: `splits[d]` decides bit `d` of the leaf index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObliviousTree {
    pub splits: Vec<ObliviousSplit>,
    pub leaf_values: Vec<f64>,
}

impl ObliviousTree {
    fn validate(&self, tree: usize, n_features: usize) -> Result<(), TreeModelError> {
        let depth = self.splits.len();
        if depth > MAX_OBLIVIOUS_DEPTH {
            return Err(invalid(tree, format!("depth {depth} exceeds {MAX_OBLIVIOUS_DEPTH}")));
        }
        if self.leaf_values.len() != 1 << depth {
            return Err(invalid(
                tree,
                format!(
                    "depth {depth} needs {} leaf values, got {}",
                    1usize << depth,
                    self.leaf_values.len()
                ),
            ));
        }
        for (level, split) in self.splits.iter().enumerate() {
            if split.feature >= n_features {
                return Err(invalid(
                    tree,
                    format!(
                        "level {level} splits on feature {} (width {n_features})",
                        split.feature
                    ),
                ));
            }
            if !split.border.is_finite() {
                return Err(invalid(tree, format!("level {level} has non-finite border")));
            }
        }
        if self.leaf_values.iter().any(|v| !v.is_finite()) {
            return Err(invalid(tree, "non-finite leaf value"));
        }
        Ok(())
    }

    fn leaf_value(&self, x: &[f64]) -> f64 {
        let index = self
            .splits
            .iter()
            .enumerate()
            .filter(|(_, s)| x[s.feature] > s.border)
            .fold(0usize, |acc, (level, _)| acc | (1 << level));
        self.leaf_values[index]
    }
}

/// CatBoost-style additive ensemble of oblivious trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObliviousTreeModel {
    pub n_features: usize,
    #[serde(default)]
    pub bias: f64,
    pub trees: Vec<ObliviousTree>,
}

impl ObliviousTreeModel {
    fn validate(&self) -> Result<(), TreeModelError> {
        if self.n_features == 0 {
            return Err(TreeModelError::NoFeatures);
        }
        if !self.bias.is_finite() {
            return Err(TreeModelError::NonFinite("bias"));
        }
        self.trees
            .iter()
            .enumerate()
            .try_for_each(|(i, t)| t.validate(i, self.n_features))
    }

    fn margin(&self, x: &[f64]) -> f64 {
        self.bias + self.trees.iter().map(|t| t.leaf_value(x)).sum::<f64>()
    }
}

// ─── Scorer ─────────────────────────────────────────────────────────────────

/// A validated tree model of either family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "architecture")]
pub enum TreeModel {
    #[serde(rename = "lightgbm")]
    LightGbm(BinaryTreeModel),
    #[serde(rename = "catboost")]
    CatBoost(ObliviousTreeModel),
}

impl TreeModel {
    /// Parse and validate a serialized model.
    ///
    /// # Errors
    /// JSON errors and structural validation failures.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TreeModelError> {
        let model: Self = serde_json::from_slice(bytes)?;
        model.validate()?;
        Ok(model)
    }

    /// # Errors
    /// Structural validation failures.
    pub fn validate(&self) -> Result<(), TreeModelError> {
        match self {
            Self::LightGbm(m) => m.validate(),
            Self::CatBoost(m) => m.validate(),
        }
    }

    #[must_use]
    pub fn architecture(&self) -> Architecture {
        match self {
            Self::LightGbm(_) => Architecture::LightGbm,
            Self::CatBoost(_) => Architecture::CatBoost,
        }
    }

    #[must_use]
    pub fn n_trees(&self) -> usize {
        match self {
            Self::LightGbm(m) => m.trees.len(),
            Self::CatBoost(m) => m.trees.len(),
        }
    }
}

impl Scorer for TreeModel {
    fn n_features(&self) -> usize {
        match self {
            Self::LightGbm(m) => m.n_features,
            Self::CatBoost(m) => m.n_features,
        }
    }

    fn predict(&self, features: &[f64]) -> Result<f64, PredictError> {
        let expected = self.n_features();
        if features.len() != expected {
            return Err(PredictError::WidthMismatch {
                expected,
                got: features.len(),
            });
        }
        let margin = match self {
            Self::LightGbm(m) => m.margin(features),
            Self::CatBoost(m) => m.margin(features),
        };
        if !margin.is_finite() {
            return Err(PredictError::Malformed(format!("margin {margin} is not finite")));
        }
        Ok(sigmoid(margin))
    }
}
