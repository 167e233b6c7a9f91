//! `runlab demo`: a toy linear regression trained with mini-batch SGD.
//!
//! Small enough to finish in seconds, but it goes through every part of the
//! engine: a step loop over epochs, nested sections, an iterated batch loop,
//! queue/scalar/histogram indicators (with a wildcard per-parameter
//! template), one checkpoint per epoch, resume, and Ctrl-C deferred to the
//! end of the current epoch.

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runlab_core::checkpoint::RestoreError;
use runlab_core::{
    Experiment, IndicatorSpec, InterruptHub, RestoreRegistry, SectionOptions, ValueSource,
};
use std::sync::Arc;

const FEATURES: usize = 3;
const TRUE_WEIGHTS: [f64; FEATURES] = [2.0, -3.5, 0.5];
const TRUE_BIAS: f64 = 1.0;
const SAMPLES: usize = 2000;
const LEARNING_RATE: f64 = 0.05;
const MODEL_VALUE: &str = "model";

#[derive(clap::Args, Debug, Clone)]
pub struct DemoOptions {
    /// Number of epochs to train
    #[arg(long, default_value_t = 5)]
    pub epochs: u64,

    /// Mini-batches per epoch
    #[arg(long, default_value_t = 50)]
    pub batches: usize,

    /// Continue from the latest checkpoint instead of starting over
    #[arg(long)]
    pub resume: bool,

    /// Experiment name
    #[arg(long, default_value = "demo")]
    pub name: String,

    /// Comment recorded with the trial
    #[arg(long, default_value = "")]
    pub comment: String,

    /// Seed of the synthetic data set
    #[arg(long, default_value_t = 7)]
    pub seed: u64,
}

/// Synthetic `y = w·x + b + noise` data, split into train and validation.
#[derive(Debug, Clone)]
pub struct Dataset {
    xs: Vec<[f64; FEATURES]>,
    ys: Vec<f64>,
    train_len: usize,
}

impl Dataset {
    pub fn synthetic(samples: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut xs = Vec::with_capacity(samples);
        let mut ys = Vec::with_capacity(samples);
        for _ in 0..samples {
            let x: [f64; FEATURES] = std::array::from_fn(|_| rng.gen_range(-1.0..1.0));
            let y = dot(&TRUE_WEIGHTS, &x) + TRUE_BIAS + rng.gen_range(-0.1..0.1);
            xs.push(x);
            ys.push(y);
        }
        Self {
            train_len: samples * 4 / 5,
            xs,
            ys,
        }
    }

    /// Index ranges of `count` roughly equal training batches.
    pub fn batches(&self, count: usize) -> Vec<std::ops::Range<usize>> {
        let count = count.clamp(1, self.train_len.max(1));
        let size = self.train_len.div_ceil(count);
        (0..self.train_len)
            .step_by(size.max(1))
            .map(|start| start..(start + size).min(self.train_len))
            .collect()
    }

    pub fn validation_loss(&self, model: &LinearModel) -> f64 {
        model.loss(&self.xs[self.train_len..], &self.ys[self.train_len..])
    }
}

/// The trained parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub weights: [f64; FEATURES],
    pub bias: f64,
}

impl LinearModel {
    pub fn zeros() -> Self {
        Self {
            weights: [0.0; FEATURES],
            bias: 0.0,
        }
    }

    fn predict(&self, x: &[f64; FEATURES]) -> f64 {
        dot(&self.weights, x) + self.bias
    }

    /// Mean squared error.
    pub fn loss(&self, xs: &[[f64; FEATURES]], ys: &[f64]) -> f64 {
        if xs.is_empty() {
            return 0.0;
        }
        let total: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| (self.predict(x) - y).powi(2))
            .sum();
        total / xs.len() as f64
    }

    /// One gradient step on a batch; returns the batch loss before the step.
    pub fn sgd_step(&mut self, xs: &[[f64; FEATURES]], ys: &[f64], lr: f64) -> f64 {
        if xs.is_empty() {
            return 0.0;
        }
        let n = xs.len() as f64;
        let mut grad_w = [0.0; FEATURES];
        let mut grad_b = 0.0;
        let mut loss = 0.0;
        for (x, y) in xs.iter().zip(ys) {
            let err = self.predict(x) - y;
            loss += err * err;
            for (g, xi) in grad_w.iter_mut().zip(x) {
                *g += 2.0 * err * xi / n;
            }
            grad_b += 2.0 * err / n;
        }
        for (w, g) in self.weights.iter_mut().zip(grad_w) {
            *w -= lr * g;
        }
        self.bias -= lr * grad_b;
        loss / n
    }

    /// Little-endian `f64`s: the weights, then the bias.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.weights
            .iter()
            .chain(std::iter::once(&self.bias))
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RestoreError> {
        if bytes.len() != (FEATURES + 1) * 8 {
            return Err(format!(
                "expected {} bytes of model state, found {}",
                (FEATURES + 1) * 8,
                bytes.len()
            )
            .into());
        }
        let mut values = bytes.chunks_exact(8).map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        });
        let mut model = Self::zeros();
        for w in model.weights.iter_mut() {
            *w = values.next().unwrap_or_default();
        }
        model.bias = values.next().unwrap_or_default();
        Ok(model)
    }
}

impl ValueSource for LinearModel {
    fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        vec![(MODEL_VALUE.to_string(), self.to_bytes())]
    }
}

fn dot(a: &[f64; FEATURES], b: &[f64; FEATURES]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Outcome of a demo run.
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub start_step: u64,
    pub final_step: u64,
    pub interrupted: bool,
    pub valid_loss: f64,
    pub model: LinearModel,
}

fn register_indicators(experiment: &Experiment) -> runlab_core::Result<()> {
    let tracker = experiment.tracker();
    tracker.register(IndicatorSpec::scalar("loss.train"))?;
    tracker.register(IndicatorSpec::scalar("loss.valid"))?;
    tracker.register(IndicatorSpec::queue("loss.recent", 20))?;
    tracker.register(IndicatorSpec::histogram("param.*").with_print(false))?;
    Ok(())
}

fn store_params(experiment: &Experiment, model: &LinearModel) -> runlab_core::Result<()> {
    let tracker = experiment.tracker();
    for (i, w) in model.weights.iter().enumerate() {
        tracker.store(&format!("param.weight.{i}"), *w)?;
    }
    tracker.store("param.bias", model.bias)
}

/// Train the demo model inside `experiment`.
pub fn run(
    experiment: &mut Experiment,
    hub: &Arc<InterruptHub>,
    options: &DemoOptions,
) -> anyhow::Result<DemoReport> {
    let tracker = experiment.tracker().clone();
    register_indicators(experiment)?;

    let data = tracker.section_scope("Generating data", SectionOptions::new(), || {
        Ok::<_, anyhow::Error>(Dataset::synthetic(SAMPLES, options.seed))
    })?;
    let batches = data.batches(options.batches);

    let mut model = LinearModel::zeros();
    let start_step = {
        let mut registry = RestoreRegistry::new().on(MODEL_VALUE, |blob| {
            model = LinearModel::from_bytes(blob)?;
            Ok(())
        });
        experiment
            .start_train(!options.resume, &mut registry)
            .context("Failed to start training")?
    };

    let epochs = tracker.loop_steps(start_step..options.epochs.max(start_step));
    let token = epochs.cancellation_token();
    for epoch in epochs {
        let _interrupt = tracker.delayed_interrupt(hub);

        for batch in tracker.iterate("Train", batches.iter()) {
            let loss = model.sgd_step(
                &data.xs[batch.clone()],
                &data.ys[batch.clone()],
                LEARNING_RATE,
            );
            tracker.store("loss.train", loss)?;
            tracker.store("loss.recent", loss)?;
            store_params(experiment, &model)?;
        }

        let valid = tracker.section("Valid", SectionOptions::new());
        tracker.store("loss.valid", data.validation_loss(&model))?;
        drop(valid);

        tracker.write();
        tracker.set_global_step(epoch + 1);
        experiment.save_checkpoint(&model)?;
        experiment.save_progress()?;
    }

    let report = DemoReport {
        start_step,
        final_step: tracker.global_step(),
        interrupted: token.is_cancelled(),
        valid_loss: data.validation_loss(&model),
        model,
    };
    tracker.flush_writers();
    tracker.info([
        ("experiment", experiment.name().to_string()),
        ("steps", format!("{} -> {}", report.start_step, report.final_step)),
        ("valid loss", format!("{:.5}", report.valid_loss)),
        (
            "model",
            format!("w = {:.3?}, b = {:.3}", report.model.weights, report.model.bias),
        ),
        ("interrupted", report.interrupted.to_string()),
    ]);
    tracing::info!(
        experiment = experiment.name(),
        final_step = report.final_step,
        interrupted = report.interrupted,
        "Demo finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlab_core::{RecordingSink, Tracker, Trial};
    use tempfile::TempDir;

    fn options(epochs: u64, resume: bool) -> DemoOptions {
        DemoOptions {
            epochs,
            batches: 10,
            resume,
            name: "toy".into(),
            comment: "test".into(),
            seed: 3,
        }
    }

    fn open(dir: &TempDir, sink: RecordingSink) -> Experiment {
        Experiment::open(dir.path(), "toy", Tracker::new(sink))
            .unwrap()
            .with_trial(Trial::new("test", "runlab demo", false))
    }

    fn quiet_hub() -> Arc<InterruptHub> {
        Arc::new(InterruptHub::with_fallback(|| {}))
    }

    #[test]
    fn test_model_bytes_roundtrip_and_length_check() {
        let model = LinearModel {
            weights: [1.5, -2.0, 0.25],
            bias: 3.0,
        };
        assert_eq!(LinearModel::from_bytes(&model.to_bytes()).unwrap(), model);
        assert!(LinearModel::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_batches_cover_training_split() {
        let data = Dataset::synthetic(100, 1);
        let batches = data.batches(7);
        assert_eq!(batches.first().unwrap().start, 0);
        assert_eq!(batches.last().unwrap().end, 80);
        assert!(batches.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn test_sgd_reduces_loss() {
        let data = Dataset::synthetic(500, 2);
        let mut model = LinearModel::zeros();
        let before = data.validation_loss(&model);
        for _ in 0..20 {
            for batch in data.batches(10) {
                model.sgd_step(&data.xs[batch.clone()], &data.ys[batch], LEARNING_RATE);
            }
        }
        assert!(data.validation_loss(&model) < before / 10.0);
    }

    #[test]
    fn test_demo_trains_and_checkpoints_each_epoch() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let mut exp = open(&dir, sink.clone());

        let report = run(&mut exp, &quiet_hub(), &options(3, false)).unwrap();
        assert_eq!(report.start_step, 0);
        assert_eq!(report.final_step, 3);
        assert!(!report.interrupted);
        assert_eq!(exp.checkpoints().steps().unwrap(), vec![3]);

        let lines = sink.lines();
        assert!(lines.iter().any(|l| l.starts_with("       2:")));
        assert!(lines.iter().any(|l| l.contains("loss.valid")));
    }

    #[test]
    fn test_demo_resume_continues_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut first = open(&dir, RecordingSink::new());
        let trained = run(&mut first, &quiet_hub(), &options(2, false)).unwrap();
        drop(first);

        let mut second = open(&dir, RecordingSink::new());
        let resumed = run(&mut second, &quiet_hub(), &options(4, true)).unwrap();
        assert_eq!(resumed.start_step, 2);
        assert_eq!(resumed.final_step, 4);
        assert!(resumed.valid_loss <= trained.valid_loss);
        assert_eq!(second.checkpoints().steps().unwrap(), vec![4]);
    }

    #[test]
    fn test_demo_resume_past_target_runs_no_epochs() {
        let dir = TempDir::new().unwrap();
        let mut first = open(&dir, RecordingSink::new());
        run(&mut first, &quiet_hub(), &options(3, false)).unwrap();
        drop(first);

        let mut second = open(&dir, RecordingSink::new());
        let report = run(&mut second, &quiet_hub(), &options(1, true)).unwrap();
        assert_eq!(report.start_step, 3);
        assert_eq!(report.final_step, 3);
    }
}
