use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ce_groupby::{nan_propagating_max, nan_propagating_min};

use crate::{CalcError, CalcResult};

/// A callable over the flattened numeric arguments of a function node.
pub type FunctionImpl = Arc<dyn Fn(&[f64]) -> CalcResult<f64> + Send + Sync>;

/// Functions that are registered but not implemented yet, paired with the
/// feature name their `NotImplemented` error reports.
pub const PLANNED_FUNCTIONS: &[(&str, &str)] = &[
    ("format_date", "Date formatting"),
    ("date_part", "Date component extraction"),
    ("concat", "String concatenation"),
    ("substring", "Substring extraction"),
    ("pattern_match", "Pattern matching"),
    ("percentile", "Percentile calculation"),
    ("stddev", "Standard deviation calculation"),
    ("variance", "Variance calculation"),
    ("median", "Median calculation"),
    ("zscore", "Z-score calculation"),
    ("som", "Self-organizing maps"),
    ("pca", "PCA"),
    ("umap", "UMAP transformation"),
    ("tsne", "t-SNE transformation"),
    ("linear_regression", "Linear regression"),
    ("polynomial_regression", "Polynomial regression"),
    ("residuals", "Residuals calculation"),
    ("anova", "ANOVA"),
    ("normalize", "Data normalization"),
    ("standardize", "Data standardization"),
    ("log_transform", "Logarithmic transformation"),
    ("bin", "Data binning"),
    ("dummy_variables", "Dummy variable creation"),
];

/// Case-insensitive table of named functions.
///
/// [`FunctionRegistry::new`] holds the aggregate built-ins (`sum`, `avg`,
/// `min`, `max`, `count`) and every entry of [`PLANNED_FUNCTIONS`].
/// Registering an existing name replaces it.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionImpl>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_aggregates();
        registry.register_planned();
        registry
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[f64]) -> CalcResult<f64> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_lowercase(), Arc::new(function));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FunctionImpl> {
        self.functions.get(&name.to_lowercase())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn is_planned(name: &str) -> bool {
        let name = name.to_lowercase();
        PLANNED_FUNCTIONS.iter().any(|(planned, _)| *planned == name)
    }

    fn register_aggregates(&mut self) {
        self.register("sum", |values| Ok(values.iter().sum()));
        self.register("avg", |values| {
            Ok(values.iter().sum::<f64>() / values.len() as f64)
        });
        self.register("min", |values| Ok(nan_propagating_min(values)));
        self.register("max", |values| Ok(nan_propagating_max(values)));
        self.register("count", |values| Ok(values.len() as f64));
    }

    fn register_planned(&mut self) {
        for &(name, feature) in PLANNED_FUNCTIONS {
            self.register(name, move |_| Err(CalcError::NotImplemented(feature.to_owned())));
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("names", &self.names())
            .finish()
    }
}
