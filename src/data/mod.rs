//! Training examples and the sources that serve them.
//!
//! ## Submodules
//!
//! - [`delimited`] — Delimited-text pattern files (CSV and friends)

pub mod delimited;

pub use delimited::{load_patterns, parse_patterns, DelimitedFormat};

use ndarray::{Array1, ArrayView1};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

use crate::error::{NetError, NetResult};

/// One example: an input vector, the expected output, and optional metadata.
///
/// Patterns are assembled once and then only read.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    input: Array1<f64>,
    output: Array1<f64>,
    label: Option<String>,
    properties: BTreeMap<String, String>,
}

impl Pattern {
    pub fn new(input: Array1<f64>, output: Array1<f64>) -> Self {
        Self {
            input,
            output,
            label: None,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn input(&self) -> ArrayView1<'_, f64> {
        self.input.view()
    }

    pub fn output(&self) -> ArrayView1<'_, f64> {
        self.output.view()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// An ordered, shuffleable collection of patterns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternSource {
    name: String,
    patterns: Vec<Pattern>,
}

impl PatternSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_patterns(name, Vec::new())
    }

    pub fn from_patterns(name: impl Into<String>, patterns: Vec<Pattern>) -> Self {
        Self {
            name: name.into(),
            patterns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, pattern: Pattern) {
        self.patterns.push(pattern);
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Pattern> {
        self.patterns.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pattern> {
        self.patterns.iter()
    }

    /// Uniformly permute the patterns in place.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.patterns.shuffle(rng);
    }

    /// Check every pattern against the widths of the network it will feed.
    ///
    /// # Errors
    /// `ShapeMismatch` naming the first offending pattern.
    pub fn validate(&self, input_width: usize, output_width: usize) -> NetResult<()> {
        for (i, pattern) in self.patterns.iter().enumerate() {
            if pattern.input.len() != input_width {
                return Err(NetError::shape(
                    format!("input of pattern {i} in `{}`", self.name),
                    input_width,
                    pattern.input.len(),
                ));
            }
            if pattern.output.len() != output_width {
                return Err(NetError::shape(
                    format!("output of pattern {i} in `{}`", self.name),
                    output_width,
                    pattern.output.len(),
                ));
            }
        }
        Ok(())
    }

    /// Split into training and test sources.
    ///
    /// The split is deterministic: the last `test_fraction` of the patterns become
    /// the test source. Shuffle first for a random split.
    #[must_use]
    pub fn split(mut self, test_fraction: f64) -> (PatternSource, PatternSource) {
        let n = self.patterns.len();
        let test_count = ((n as f64) * test_fraction.clamp(0.0, 1.0)) as usize;
        let test = self.patterns.split_off(n - test_count);
        let test_name = format!("{}-test", self.name);
        (self, PatternSource::from_patterns(test_name, test))
    }
}

impl<'a> IntoIterator for &'a PatternSource {
    type Item = &'a Pattern;
    type IntoIter = std::slice::Iter<'a, Pattern>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
