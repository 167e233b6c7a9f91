//! Indicators — named metric streams with an aggregation policy.
//!
//! Samples stored between two `write` calls form the *step buffer*. A
//! [`IndicatorKind::Queue`] indicator additionally keeps a ring buffer of the
//! most recent `queue_limit` reduced samples that survives `write`, which is
//! what it prints (a long-window moving average).

use crate::error::IndicatorError;
use crate::style::Style;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sample {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Sample {
    /// The individual numbers in this sample.
    pub fn values(&self) -> &[f64] {
        match self {
            Sample::Scalar(v) => std::slice::from_ref(v),
            Sample::Array(values) => values,
        }
    }

    /// Mean of the values, `None` for an empty array.
    pub fn mean(&self) -> Option<f64> {
        mean(self.values())
    }
}

macro_rules! sample_from_numeric {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Sample {
                fn from(v: $t) -> Self {
                    Sample::Scalar(v as f64)
                }
            }
        )*
    };
}

sample_from_numeric!(f64, f32, i32, i64, u32, u64, usize);

impl From<Vec<f64>> for Sample {
    fn from(values: Vec<f64>) -> Self {
        Sample::Array(values)
    }
}

impl From<Vec<f32>> for Sample {
    fn from(values: Vec<f32>) -> Self {
        Sample::Array(values.into_iter().map(f64::from).collect())
    }
}

impl From<&[f64]> for Sample {
    fn from(values: &[f64]) -> Self {
        Sample::Array(values.to_vec())
    }
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Aggregation policy of an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    /// Mean of this step's samples.
    Scalar,
    /// Full distribution of this step's values; prints mean and count.
    Histogram,
    /// Mean of a ring buffer of the most recent samples.
    Queue,
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorKind::Scalar => write!(f, "scalar"),
            IndicatorKind::Histogram => write!(f, "histogram"),
            IndicatorKind::Queue => write!(f, "queue"),
        }
    }
}

/// Registration policy for an indicator or an indicator template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub kind: IndicatorKind,
    pub is_print: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_limit: Option<usize>,
}

impl IndicatorSpec {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndicatorKind::Scalar,
            is_print: true,
            queue_limit: None,
        }
    }

    /// Histograms are exported to metric writers but not printed by default.
    pub fn histogram(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndicatorKind::Histogram,
            is_print: false,
            queue_limit: None,
        }
    }

    pub fn queue(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            kind: IndicatorKind::Queue,
            is_print: true,
            queue_limit: Some(limit),
        }
    }

    pub fn with_print(mut self, is_print: bool) -> Self {
        self.is_print = is_print;
        self
    }

    pub fn validate(&self) -> Result<(), IndicatorError> {
        if self.name.trim().is_empty() {
            return Err(IndicatorError::Config {
                name: self.name.clone(),
                reason: "name must not be empty".into(),
            });
        }
        if self.kind == IndicatorKind::Queue {
            match self.queue_limit {
                Some(limit) if limit > 0 => {}
                _ => {
                    return Err(IndicatorError::Config {
                        name: self.name.clone(),
                        reason: "queue indicators need a queue_limit greater than zero".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Aggregated value of one indicator for the console summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSummary {
    pub name: String,
    pub kind: IndicatorKind,
    pub value: f64,
    /// Number of samples (scalar), values (histogram), or queued samples (queue).
    pub count: usize,
    pub style: Style,
}

impl IndicatorSummary {
    pub fn display_value(&self) -> String {
        match self.kind {
            IndicatorKind::Histogram => format!("{} (n={})", format_value(self.value), self.count),
            _ => format_value(self.value),
        }
    }
}

/// Compact numeric formatting used on progress lines.
pub fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if !value.is_finite() {
        format!("{value}")
    } else if value.fract() == 0.0 && magnitude < 1e9 {
        format!("{value:.0}")
    } else if magnitude >= 1e4 || magnitude < 1e-3 {
        format!("{value:.3e}")
    } else {
        format!("{value:.4}")
    }
}

/// Storage and policy for one named metric stream.
#[derive(Debug, Clone)]
pub struct Indicator {
    spec: IndicatorSpec,
    template: Option<String>,
    step_samples: Vec<Sample>,
    queue: VecDeque<f64>,
}

impl Indicator {
    pub fn new(spec: IndicatorSpec) -> Self {
        Self {
            spec,
            template: None,
            step_samples: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// An indicator materialized from a wildcard template.
    pub(crate) fn from_template(name: &str, template: &IndicatorSpec) -> Self {
        let mut spec = template.clone();
        spec.name = name.to_string();
        Self {
            spec,
            template: Some(template.name.clone()),
            step_samples: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> IndicatorKind {
        self.spec.kind
    }

    pub fn is_print(&self) -> bool {
        self.spec.is_print
    }

    pub fn spec(&self) -> &IndicatorSpec {
        &self.spec
    }

    /// Name of the template this indicator was materialized from, if any.
    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    /// Replace the aggregation policy, keeping stored history.
    pub(crate) fn set_policy(&mut self, spec: &IndicatorSpec) {
        let name = std::mem::take(&mut self.spec.name);
        self.spec = spec.clone();
        self.spec.name = name;
        self.trim_queue();
    }

    /// Replace the policy and the template this indicator follows.
    ///
    /// `None` turns a materialized indicator into an explicitly registered one.
    pub(crate) fn rebind(&mut self, spec: &IndicatorSpec, template: Option<String>) {
        self.set_policy(spec);
        self.template = template;
    }

    pub fn push(&mut self, sample: Sample) {
        if self.spec.kind == IndicatorKind::Queue {
            if let Some(m) = sample.mean() {
                self.queue.push_back(m);
                self.trim_queue();
            }
        }
        self.step_samples.push(sample);
    }

    fn trim_queue(&mut self) {
        let limit = match (self.spec.kind, self.spec.queue_limit) {
            (IndicatorKind::Queue, Some(limit)) => limit,
            _ => return,
        };
        while self.queue.len() > limit {
            self.queue.pop_front();
        }
    }

    pub fn step_len(&self) -> usize {
        self.step_samples.len()
    }

    pub fn has_step_samples(&self) -> bool {
        !self.step_samples.is_empty()
    }

    /// The retained ring buffer, oldest first.
    pub fn queued(&self) -> impl Iterator<Item = f64> + '_ {
        self.queue.iter().copied()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Every value stored this step, flattened.
    pub fn distribution(&self) -> Vec<f64> {
        self.step_samples
            .iter()
            .flat_map(|s| s.values().iter().copied())
            .collect()
    }

    /// Aggregate for this step, or `None` when nothing was stored.
    pub fn summary(&self) -> Option<IndicatorSummary> {
        if self.step_samples.is_empty() {
            return None;
        }
        let (value, count) = match self.spec.kind {
            IndicatorKind::Scalar => {
                let means: Vec<f64> = self.step_samples.iter().filter_map(Sample::mean).collect();
                (mean(&means)?, self.step_samples.len())
            }
            IndicatorKind::Histogram => {
                let values = self.distribution();
                (mean(&values)?, values.len())
            }
            IndicatorKind::Queue => {
                let values: Vec<f64> = self.queue.iter().copied().collect();
                (mean(&values)?, values.len())
            }
        };
        let style = if value.is_finite() {
            Style::Value
        } else {
            Style::Failure
        };
        Some(IndicatorSummary {
            name: self.spec.name.clone(),
            kind: self.spec.kind,
            value,
            count,
            style,
        })
    }

    /// Empty the step buffer. The queue ring buffer is kept.
    pub fn clear_step(&mut self) {
        self.step_samples.clear();
    }
}
