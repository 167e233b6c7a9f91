//! The set of registered indicators, with wildcard name templates.
//!
//! Names are dot-separated segments (`layer.3.weight`). A template such as
//! `layer.*.weight` has exactly one `*` segment, which stands for one or more
//! concrete segments. The first `store` to a concrete name that matches a
//! template materializes an indicator under that name with the template's
//! policy; later stores hit it directly by name.

use crate::error::IndicatorError;
use crate::indicator::{Indicator, IndicatorKind, IndicatorSpec, IndicatorSummary, Sample};
use crate::writer::StepRecord;
use std::collections::HashMap;

const WILDCARD: &str = "*";

#[derive(Debug, Clone)]
struct Template {
    spec: IndicatorSpec,
    prefix: Vec<String>,
    suffix: Vec<String>,
}

impl Template {
    fn parse(spec: IndicatorSpec) -> Result<Self, IndicatorError> {
        let segments: Vec<&str> = spec.name.split('.').collect();
        let wildcards: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.contains('*'))
            .map(|(i, _)| i)
            .collect();

        let invalid = |reason: &str| IndicatorError::Config {
            name: spec.name.clone(),
            reason: reason.to_string(),
        };

        let at = match wildcards.as_slice() {
            [at] => *at,
            [] => return Err(invalid("template has no wildcard segment")),
            _ => return Err(invalid("only one wildcard segment is allowed")),
        };
        if segments[at] != WILDCARD {
            return Err(invalid("a wildcard must be a whole segment"));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty name segment"));
        }

        let prefix = segments[..at].iter().map(|s| s.to_string()).collect();
        let suffix = segments[at + 1..].iter().map(|s| s.to_string()).collect();
        Ok(Self {
            spec,
            prefix,
            suffix,
        })
    }

    fn matches(&self, segments: &[&str]) -> bool {
        let fixed = self.prefix.len() + self.suffix.len();
        if segments.len() <= fixed {
            return false;
        }
        let tail = &segments[segments.len() - self.suffix.len()..];
        self.prefix.iter().zip(segments).all(|(p, s)| p == s)
            && self.suffix.iter().zip(tail).all(|(p, s)| p == s)
    }

    /// Literal segment count, then literal character count.
    fn specificity(&self) -> (usize, usize) {
        let literal = self.prefix.iter().chain(&self.suffix);
        (
            self.prefix.len() + self.suffix.len(),
            literal.map(String::len).sum(),
        )
    }
}

fn is_template(name: &str) -> bool {
    name.contains('*')
}

/// Registered indicators keyed by name.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSet {
    indicators: Vec<Indicator>,
    by_name: HashMap<String, usize>,
    templates: Vec<Template>,
    auto_register: bool,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown names become printed scalar indicators instead of failing.
    pub fn with_auto_register(mut self, auto_register: bool) -> Self {
        self.auto_register = auto_register;
        self
    }

    pub fn set_auto_register(&mut self, auto_register: bool) {
        self.auto_register = auto_register;
    }

    /// Register or update an indicator or template policy.
    ///
    /// Re-registering an existing name replaces the policy and keeps history.
    pub fn register(&mut self, spec: IndicatorSpec) -> Result<(), IndicatorError> {
        spec.validate()?;

        if is_template(&spec.name) {
            let template = Template::parse(spec)?;
            match self
                .templates
                .iter_mut()
                .find(|t| t.spec.name == template.spec.name)
            {
                Some(existing) => existing.spec = template.spec,
                None => self.templates.push(template),
            }
            self.rebind_materialized();
            return Ok(());
        }

        match self.by_name.get(&spec.name) {
            Some(&idx) => self.indicators[idx].rebind(&spec, None),
            None => {
                self.by_name
                    .insert(spec.name.clone(), self.indicators.len());
                self.indicators.push(Indicator::new(spec));
            }
        }
        Ok(())
    }

    /// Re-point indicators materialized from templates at their best template.
    fn rebind_materialized(&mut self) {
        for idx in 0..self.indicators.len() {
            if self.indicators[idx].template().is_none() {
                continue;
            }
            let segments: Vec<&str> = self.indicators[idx].name().split('.').collect();
            let Some(spec) = self.best_template(&segments).map(|t| t.spec.clone()) else {
                continue;
            };
            let indicator = &mut self.indicators[idx];
            if indicator.template() != Some(spec.name.as_str()) {
                tracing::debug!(
                    indicator = %indicator.name(),
                    template = %spec.name,
                    "Rebinding indicator to a more specific template"
                );
            }
            let template = spec.name.clone();
            indicator.rebind(&spec, Some(template));
        }
    }

    fn best_template(&self, segments: &[&str]) -> Option<&Template> {
        let mut best: Option<&Template> = None;
        for template in self.templates.iter().filter(|t| t.matches(segments)) {
            match best {
                Some(b) if template.specificity() <= b.specificity() => {}
                _ => best = Some(template),
            }
        }
        best
    }

    /// Resolve `name` to an indicator index, materializing from a template
    /// or auto-registering when needed.
    fn resolve(&mut self, name: &str) -> Result<usize, IndicatorError> {
        if let Some(&idx) = self.by_name.get(name) {
            return Ok(idx);
        }

        let segments: Vec<&str> = name.split('.').collect();
        let indicator = match self.best_template(&segments) {
            Some(template) => Indicator::from_template(name, &template.spec),
            None if self.auto_register => {
                tracing::debug!(indicator = %name, "Auto-registering scalar indicator");
                Indicator::new(IndicatorSpec::scalar(name))
            }
            None => {
                return Err(IndicatorError::Unknown {
                    name: name.to_string(),
                });
            }
        };

        let idx = self.indicators.len();
        self.by_name.insert(name.to_string(), idx);
        self.indicators.push(indicator);
        Ok(idx)
    }

    /// Append a sample to the indicator resolved for `name`.
    pub fn store(&mut self, name: &str, sample: Sample) -> Result<(), IndicatorError> {
        let idx = self.resolve(name)?;
        self.indicators[idx].push(sample);
        Ok(())
    }

    /// Append several samples, all or none: every name is checked before
    /// the first sample lands.
    pub fn store_batch(&mut self, samples: Vec<(String, Sample)>) -> Result<(), IndicatorError> {
        if let Some((name, _)) = samples.iter().find(|(name, _)| !self.can_resolve(name)) {
            return Err(IndicatorError::Unknown { name: name.clone() });
        }
        for (name, sample) in samples {
            self.store(&name, sample)?;
        }
        Ok(())
    }

    fn can_resolve(&self, name: &str) -> bool {
        if self.auto_register || self.by_name.contains_key(name) {
            return true;
        }
        let segments: Vec<&str> = name.split('.').collect();
        self.best_template(&segments).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Indicator> {
        self.by_name.get(name).map(|&idx| &self.indicators[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Concrete indicators in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter()
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Console summary of printed indicators that have samples this step.
    pub fn summarize(&self) -> Vec<IndicatorSummary> {
        self.indicators
            .iter()
            .filter(|i| i.is_print())
            .filter_map(Indicator::summary)
            .collect()
    }

    /// Everything stored this step, printed or not, for metric writers.
    pub fn export(&self, step: u64) -> StepRecord {
        let mut record = StepRecord::new(step);
        for indicator in self.indicators.iter().filter(|i| i.has_step_samples()) {
            match indicator.kind() {
                IndicatorKind::Histogram => {
                    record
                        .histograms
                        .insert(indicator.name().to_string(), indicator.distribution());
                }
                IndicatorKind::Scalar | IndicatorKind::Queue => {
                    if let Some(summary) = indicator.summary() {
                        record
                            .scalars
                            .insert(indicator.name().to_string(), summary.value);
                    }
                }
            }
        }
        record
    }

    /// Empty every step buffer; queue ring buffers are untouched.
    pub fn clear_step_buffers(&mut self) {
        for indicator in &mut self.indicators {
            indicator.clear_step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(summaries: &[IndicatorSummary]) -> Vec<&str> {
        summaries.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_store_unknown_fails() {
        let mut set = IndicatorSet::new();
        let err = set.store("loss", Sample::Scalar(1.0)).unwrap_err();
        assert!(matches!(err, IndicatorError::Unknown { name } if name == "loss"));
    }

    #[test]
    fn test_store_batch_with_unknown_name_stores_nothing() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("loss")).unwrap();
        set.register(IndicatorSpec::scalar("grad.*")).unwrap();

        let err = set
            .store_batch(vec![
                ("loss".to_string(), Sample::Scalar(1.0)),
                ("grad.w".to_string(), Sample::Scalar(0.5)),
                ("acc".to_string(), Sample::Scalar(0.9)),
            ])
            .unwrap_err();
        assert!(matches!(err, IndicatorError::Unknown { name } if name == "acc"));
        assert!(!set.get("loss").unwrap().has_step_samples());
        assert!(!set.contains("grad.w"));

        set.store_batch(vec![
            ("loss".to_string(), Sample::Scalar(1.0)),
            ("grad.w".to_string(), Sample::Scalar(0.5)),
        ])
        .unwrap();
        assert_eq!(set.get("loss").unwrap().step_len(), 1);
        assert_eq!(set.get("grad.w").unwrap().step_len(), 1);
    }

    #[test]
    fn test_auto_register_scalar() {
        let mut set = IndicatorSet::new().with_auto_register(true);
        set.store("loss", Sample::Scalar(2.0)).unwrap();
        let ind = set.get("loss").unwrap();
        assert_eq!(ind.kind(), IndicatorKind::Scalar);
        assert!(ind.is_print());
    }

    #[test]
    fn test_register_is_idempotent_and_keeps_history() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::queue("loss", 4)).unwrap();
        set.store("loss", Sample::Scalar(1.0)).unwrap();
        set.store("loss", Sample::Scalar(2.0)).unwrap();
        set.register(IndicatorSpec::queue("loss", 4)).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("loss").unwrap().queue_len(), 2);
    }

    #[test]
    fn test_queue_limit_zero_is_config_error() {
        let mut set = IndicatorSet::new();
        assert!(matches!(
            set.register(IndicatorSpec::queue("loss", 0)),
            Err(IndicatorError::Config { .. })
        ));
    }

    #[test]
    fn test_template_validation() {
        let mut set = IndicatorSet::new();
        assert!(set.register(IndicatorSpec::histogram("a.*.b.*")).is_err());
        assert!(set.register(IndicatorSpec::histogram("layer*.w")).is_err());
        assert!(set.register(IndicatorSpec::histogram("a..*")).is_err());
        assert!(set.register(IndicatorSpec::histogram("layer.*.weight")).is_ok());
    }

    #[test]
    fn test_wildcard_materializes_separate_streams() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("layer.*.norm")).unwrap();
        set.store("layer.0.norm", Sample::Scalar(1.0)).unwrap();
        set.store("layer.1.norm", Sample::Scalar(3.0)).unwrap();

        let summary = set.summarize();
        assert_eq!(names(&summary), vec!["layer.0.norm", "layer.1.norm"]);
        assert_eq!(summary[0].value, 1.0);
        assert_eq!(summary[1].value, 3.0);
        assert_eq!(
            set.get("layer.0.norm").unwrap().template(),
            Some("layer.*.norm")
        );
    }

    #[test]
    fn test_wildcard_spans_multiple_segments() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("grad.*")).unwrap();
        set.store("grad.encoder.block.0", Sample::Scalar(1.0)).unwrap();
        assert!(set.contains("grad.encoder.block.0"));
        // The wildcard needs at least one segment.
        assert!(set.store("grad", Sample::Scalar(1.0)).is_err());
    }

    #[test]
    fn test_most_specific_template_wins() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("model.*")).unwrap();
        set.register(IndicatorSpec::histogram("model.*.weight")).unwrap();
        set.store("model.fc1.weight", Sample::Scalar(1.0)).unwrap();
        set.store("model.fc1.bias", Sample::Scalar(1.0)).unwrap();

        assert_eq!(
            set.get("model.fc1.weight").unwrap().kind(),
            IndicatorKind::Histogram
        );
        assert_eq!(
            set.get("model.fc1.bias").unwrap().kind(),
            IndicatorKind::Scalar
        );
    }

    #[test]
    fn test_template_tie_goes_to_first_registered() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("a.*")).unwrap();
        set.register(IndicatorSpec::histogram("*.b")).unwrap();
        set.store("a.b", Sample::Scalar(1.0)).unwrap();
        assert_eq!(set.get("a.b").unwrap().template(), Some("a.*"));
    }

    #[test]
    fn test_exact_match_beats_template() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::histogram("layer.*")).unwrap();
        set.register(IndicatorSpec::scalar("layer.out")).unwrap();
        set.store("layer.out", Sample::Scalar(1.0)).unwrap();
        assert_eq!(set.get("layer.out").unwrap().kind(), IndicatorKind::Scalar);
        assert_eq!(set.get("layer.out").unwrap().template(), None);
    }

    #[test]
    fn test_template_update_propagates_policy() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("layer.*").with_print(false))
            .unwrap();
        set.store("layer.0", Sample::Scalar(1.0)).unwrap();
        assert!(set.summarize().is_empty());

        set.register(IndicatorSpec::scalar("layer.*")).unwrap();
        assert_eq!(names(&set.summarize()), vec!["layer.0"]);
    }

    #[test]
    fn test_more_specific_template_takes_over_materialized() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("model.*")).unwrap();
        set.store("model.fc.weight", Sample::Scalar(2.0)).unwrap();
        set.register(IndicatorSpec::histogram("model.*.weight"))
            .unwrap();

        let ind = set.get("model.fc.weight").unwrap();
        assert_eq!(ind.template(), Some("model.*.weight"));
        assert_eq!(ind.step_len(), 1);
    }

    #[test]
    fn test_clear_step_buffers_skips_empty_indicators() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::scalar("x")).unwrap();
        set.register(IndicatorSpec::queue("q", 3)).unwrap();
        set.store("x", Sample::Scalar(1.0)).unwrap();
        set.store("q", Sample::Scalar(1.0)).unwrap();
        assert_eq!(set.summarize().len(), 2);

        set.clear_step_buffers();
        assert!(set.summarize().is_empty());
        assert_eq!(set.get("q").unwrap().queue_len(), 1);
    }

    #[test]
    fn test_export_includes_unprinted_histograms() {
        let mut set = IndicatorSet::new();
        set.register(IndicatorSpec::histogram("w")).unwrap();
        set.register(IndicatorSpec::scalar("loss")).unwrap();
        set.store("w", Sample::Array(vec![1.0, 2.0])).unwrap();
        set.store("loss", Sample::Scalar(0.5)).unwrap();

        let record = set.export(7);
        assert_eq!(record.step, 7);
        assert_eq!(record.histograms["w"], vec![1.0, 2.0]);
        assert_eq!(record.scalars["loss"], 0.5);
        assert_eq!(names(&set.summarize()), vec!["loss"]);
    }
}
