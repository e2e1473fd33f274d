//! Noise2Inverse: self-supervised training from redundant noisy projections.
//!
//! The projection angles are split into K interleaved subsets and each
//! subset is reconstructed on its own. For every sample one subset is drawn
//! as the target and the model learns to predict it from the mean of the
//! other K−1 reconstructions. With independent noise per subset the target
//! noise is uncorrelated with the input, so the model converges towards the
//! clean image without ever seeing one.
//!
//! Only the K→1 mode is implemented.

pub mod checkpoint;
pub mod loss;

use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ct::{make_sub_operators, Geometry, ProjectionOperator, Reconstructor, SplitOperator};
use crate::error::{ensure_config, Error};
use crate::phantom::Batch;

pub use self::checkpoint::{CheckpointSink, FileCheckpointer};
pub use self::loss::LossKind;

/// An image-to-image model that can be trained by the solver.
pub trait ImageModel<B: Backend> {
    /// `[batch, 1, H, W]` → `[batch, 1, H, W]`
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;
}

#[derive(Config, Debug)]
pub struct Noise2InverseConfig {
    /// Number of angular splits K.
    #[config(default = 4)]
    pub sino_splits: usize,
    /// Save a checkpoint every this many epochs.
    #[config(default = 10)]
    pub checkpoint_freq: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = "LossKind::Mse")]
    pub loss: LossKind,
    /// Seed of the split-selection RNG; entropy when unset.
    #[config(default = "None")]
    pub seed: Option<u64>,
    #[config(default = true)]
    pub verbose: bool,
}

/// Lifecycle of a solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    /// Built, training data or checkpoint sink still missing.
    Uninitialized,
    Configured,
    Training,
    Completed,
}

/// Target split and the splits averaged into the model input, for one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDraw {
    pub target: usize,
    pub labels: Vec<usize>,
}

impl SplitDraw {
    pub fn new(target: usize, splits: usize) -> Self {
        Self {
            target,
            labels: (0..splits).filter(|&s| s != target).collect(),
        }
    }
}

/// Per-batch test losses.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub losses: Vec<f64>,
    pub mean: f64,
    /// Population standard deviation across batches.
    pub std: f64,
}

impl TestReport {
    fn from_losses(losses: Vec<f64>) -> Self {
        let n = losses.len().max(1) as f64;
        let mean = losses.iter().sum::<f64>() / n;
        let var = losses.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
        Self {
            losses,
            mean,
            std: var.sqrt(),
        }
    }
}

/// Build `(label_array, random_target)` from `[K, batch, 1, H, W]` split
/// reconstructions. Both outputs are detached.
pub fn assemble_pairs<B: Backend>(
    sub_recon: Tensor<B, 5>,
    draws: &[SplitDraw],
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [k, _, c, h, w] = sub_recon.dims();
    let device = sub_recon.device();

    let (labels, targets): (Vec<_>, Vec<_>) = draws
        .iter()
        .enumerate()
        .map(|(sample, draw)| {
            let per_sample = sub_recon.clone().slice([0..k, sample..sample + 1]);
            let target = per_sample
                .clone()
                .slice([draw.target..draw.target + 1])
                .reshape([1, c, h, w]);
            let label = per_sample
                .select(0, index_tensor(&draw.labels, &device))
                .mean_dim(0)
                .reshape([1, c, h, w]);
            (label, target)
        })
        .unzip();

    (
        Tensor::cat(labels, 0).detach(),
        Tensor::cat(targets, 0).detach(),
    )
}

fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

fn progress_bar(len: usize, visible: bool, template: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb
}

/// Noise2Inverse training loop around a model `M`, optimizer `O`, projection
/// operator `P` and fast reconstruction `R`.
pub struct Noise2InverseSolver<B: AutodiffBackend, M, O, P, R> {
    pub model: M,
    optimizer: O,
    config: Noise2InverseConfig,
    geometry: Geometry,
    sub_operators: Vec<SplitOperator<P>>,
    reconstructor: R,
    rng: StdRng,
    train_batches: Vec<Batch<B>>,
    test_batches: Vec<Batch<B>>,
    checkpointer: Option<Box<dyn CheckpointSink<M>>>,
    train_loss: Vec<f64>,
    current_epoch: usize,
    state: SolverState,
}

impl<B, M, O, P, R> Noise2InverseSolver<B, M, O, P, R>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageModel<B>,
    M::InnerModule: ImageModel<B::InnerBackend>,
    O: Optimizer<M, B>,
    P: ProjectionOperator<B>,
    R: Reconstructor<B, P>,
{
    /// Build the solver and one operator per angular split.
    ///
    /// `make_operator` turns a sub-sampled geometry into an operator.
    pub fn new<F>(
        model: M,
        optimizer: O,
        config: Noise2InverseConfig,
        geometry: Option<Geometry>,
        make_operator: F,
        reconstructor: R,
    ) -> crate::error::Result<Self>
    where
        F: FnMut(&Geometry) -> P,
    {
        let geometry = geometry
            .ok_or_else(|| Error::precondition("geometry must be given to the Noise2Inverse solver"))?;
        geometry.validate()?;
        ensure_config!(
            config.sino_splits >= 2,
            "Noise2Inverse needs at least 2 splits, got {}",
            config.sino_splits
        );

        let sub_operators = make_sub_operators(&geometry, config.sino_splits, make_operator)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            model,
            optimizer,
            config,
            geometry,
            sub_operators,
            reconstructor,
            rng,
            train_batches: Vec::new(),
            test_batches: Vec::new(),
            checkpointer: None,
            train_loss: Vec::new(),
            current_epoch: 0,
            state: SolverState::Uninitialized,
        })
    }

    /// Replace the split-selection RNG.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn set_training(&mut self, batches: Vec<Batch<B>>) {
        self.train_batches = batches;
        self.refresh_state();
    }

    pub fn set_testing(&mut self, batches: Vec<Batch<B>>) {
        self.test_batches = batches;
    }

    pub fn set_checkpointer(&mut self, sink: Box<dyn CheckpointSink<M>>) {
        self.checkpointer = Some(sink);
        self.refresh_state();
    }

    /// Noise2Inverse has no clean labels to validate against; the request is
    /// logged and ignored.
    pub fn set_validation(&mut self, _batches: Vec<Batch<B>>, _validation_freq: usize) {
        log::warn!("Noise2Inverse does not support validation; ignoring validation setup");
    }

    /// Always zero.
    pub fn validate(&self) -> f64 {
        0.0
    }

    pub fn config(&self) -> &Noise2InverseConfig {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn sub_operators(&self) -> &[SplitOperator<P>] {
        &self.sub_operators
    }

    pub fn train_loss(&self) -> &[f64] {
        &self.train_loss
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    fn refresh_state(&mut self) {
        if self.state == SolverState::Uninitialized && self.check_complete().is_ok() {
            self.state = SolverState::Configured;
        }
    }

    /// Fail if anything needed by [`train`](Self::train) is missing.
    pub fn check_complete(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        if self.train_batches.is_empty() {
            missing.push("training data");
        }
        if self.checkpointer.is_none() {
            missing.push("checkpoint sink");
        }
        if self.config.checkpoint_freq == 0 {
            missing.push("positive checkpoint_freq");
        }
        ensure_config!(
            missing.is_empty(),
            "incomplete solver configuration, missing: {}",
            missing.join(", ")
        );
        Ok(())
    }

    /// Reconstruct every split of `data` with its own operator.
    ///
    /// Returns `[K, batch, ...]` where `...` is the per-sample shape of
    /// `target`. The whole batch goes through each split's reconstruction at
    /// once, which is equivalent to reconstructing sample by sample.
    pub fn compute_noisy_sub_recon(&self, data: &Tensor<B, 4>, target: &Tensor<B, 4>) -> Tensor<B, 5> {
        let target_dims = target.dims();
        let device = data.device();

        let recons = self
            .sub_operators
            .iter()
            .map(|split| {
                let sinogram = data
                    .clone()
                    .select(2, index_tensor(&split.angle_indices, &device));
                self.reconstructor
                    .reconstruct(&split.operator, sinogram)
                    .reshape(target_dims)
                    .detach()
            })
            .collect();
        Tensor::stack(recons, 0)
    }

    /// Draw a uniformly random target split for each of `batch` samples.
    pub fn draw_splits(&mut self, batch: usize) -> Vec<SplitDraw> {
        let k = self.config.sino_splits;
        (0..batch)
            .map(|_| SplitDraw::new(self.rng.gen_range(0..k), k))
            .collect()
    }

    /// One optimizer step on a mini-batch. Returns the batch loss.
    pub fn mini_batch_step(&mut self, data: Tensor<B, 4>, target: Tensor<B, 4>) -> crate::error::Result<f64> {
        let [batch, _, _, _] = data.dims();
        if batch == 0 {
            return Err(Error::precondition("empty mini-batch"));
        }

        let sub_recon = self.compute_noisy_sub_recon(&data, &target);
        let draws = self.draw_splits(batch);
        let (label_array, random_target) = assemble_pairs(sub_recon, &draws);

        let output = self.model.forward(label_array);
        let loss = self.config.loss.compute(output, random_target);
        let loss_value: f64 = loss.clone().into_scalar().elem();

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);
        Ok(loss_value)
    }

    /// One pass over the training set. Returns the mean mini-batch loss.
    pub fn train_step(&mut self) -> crate::error::Result<f64> {
        let n = self.train_batches.len();
        if n == 0 {
            return Err(Error::precondition("no training data"));
        }

        let mut epoch_loss = 0.0;
        for i in 0..n {
            let Batch { sinograms, targets } = self.train_batches[i].clone();
            epoch_loss += self.mini_batch_step(sinograms, targets)?;
        }
        Ok(epoch_loss / n as f64)
    }

    fn save_checkpoint(&mut self, epoch: usize) -> crate::error::Result<()> {
        match self.checkpointer.as_mut() {
            Some(sink) => sink.save_checkpoint(epoch, &self.model, &self.train_loss),
            None => Err(Error::config("no checkpoint sink configured")),
        }
    }

    /// Train for `n_epochs`, checkpointing every `checkpoint_freq` epochs.
    pub fn train(&mut self, n_epochs: usize) -> crate::error::Result<()> {
        if n_epochs == 0 {
            return Err(Error::precondition("number of epochs must be a positive integer"));
        }
        self.check_complete()?;

        self.state = SolverState::Training;
        self.train_loss = Vec::with_capacity(n_epochs);
        log::info!(
            "Noise2Inverse: {n_epochs} epochs, {} splits, {} batches",
            self.config.sino_splits,
            self.train_batches.len()
        );

        let pb = progress_bar(
            n_epochs,
            self.config.verbose,
            "{spinner:.green} Training [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        );
        for epoch in 0..n_epochs {
            let loss = self.train_step()?;
            self.train_loss.push(loss);
            self.current_epoch = epoch + 1;
            log::debug!("epoch {}: loss={loss:.6}", epoch + 1);
            pb.set_message(format!("loss={loss:.6}"));

            if (epoch + 1) % self.config.checkpoint_freq == 0 {
                self.save_checkpoint(epoch)?;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.state = SolverState::Completed;
        Ok(())
    }

    /// Evaluate the model on the test batches with the same random split
    /// construction as training, without gradient tracking.
    pub fn test(&mut self) -> crate::error::Result<TestReport> {
        let n = self.test_batches.len();
        if n == 0 {
            return Err(Error::precondition("no test data"));
        }
        if self.config.verbose {
            log::info!("Testing model after {} epochs of training", self.current_epoch);
        }

        let model = self.model.valid();
        let mut losses = Vec::with_capacity(n);
        for i in 0..n {
            let Batch { sinograms, targets } = self.test_batches[i].clone();
            let [batch, _, _, _] = sinograms.dims();
            let sub_recon = self.compute_noisy_sub_recon(&sinograms, &targets).inner();
            let draws = self.draw_splits(batch);
            let (label_array, random_target) = assemble_pairs(sub_recon, &draws);

            let output = model.forward(label_array);
            let loss: f64 = self
                .config
                .loss
                .compute(output, random_target)
                .into_scalar()
                .elem();
            losses.push(loss);
        }

        let report = TestReport::from_losses(losses);
        if self.config.verbose {
            log::info!("Testing loss: {} - Testing loss std: {}", report.mean, report.std);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use burn::backend::{Autodiff, NdArray};
    use burn::module::{Module, Param};
    use burn::nn::Initializer;
    use burn::optim::adaptor::OptimizerAdaptor;
    use burn::optim::{Sgd, SgdConfig};

    use crate::ct::{Fbp, ParallelBeam};
    use crate::phantom;

    type TestBackend = Autodiff<NdArray>;

    /// `x * scale`, identity at initialisation.
    #[derive(Module, Debug)]
    struct Gain<B: Backend> {
        scale: Param<Tensor<B, 1>>,
    }

    impl<B: Backend> Gain<B> {
        fn identity(device: &B::Device) -> Self {
            Self {
                scale: Initializer::Ones.init([1], device),
            }
        }
    }

    impl<B: Backend> ImageModel<B> for Gain<B> {
        fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
            x * self.scale.val().reshape([1, 1, 1, 1])
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Vec<usize>>>);

    impl<M> CheckpointSink<M> for RecordingSink {
        fn save_checkpoint(&mut self, epoch: usize, _model: &M, train_loss: &[f64]) -> crate::error::Result<()> {
            assert_eq!(train_loss.len(), epoch + 1);
            self.0.borrow_mut().push(epoch);
            Ok(())
        }
    }

    type Solver = Noise2InverseSolver<
        TestBackend,
        Gain<TestBackend>,
        OptimizerAdaptor<Sgd<NdArray>, Gain<TestBackend>, TestBackend>,
        ParallelBeam<TestBackend>,
        Fbp,
    >;

    fn solver(geo: &Geometry, config: Noise2InverseConfig) -> crate::error::Result<Solver> {
        let device = Default::default();
        Noise2InverseSolver::new(
            Gain::identity(&device),
            SgdConfig::new().init(),
            config,
            Some(geo.clone()),
            |g| ParallelBeam::new(g, &device),
            Fbp,
        )
    }

    fn batches(geo: &Geometry, n: usize, batch_size: usize) -> Vec<Batch<TestBackend>> {
        let device = Default::default();
        let full = ParallelBeam::<TestBackend>::new(geo, &device);
        let mut rng = StdRng::seed_from_u64(3);
        phantom::synthetic_batches(&full, &mut rng, n, batch_size, 0.05, &device)
    }

    #[test]
    fn end_to_end_mini_batch_step() {
        let geo = Geometry::parallel_beam(16, 360);
        let mut solver = solver(&geo, Noise2InverseConfig::new().with_seed(Some(0))).unwrap();

        let counts: Vec<usize> = solver
            .sub_operators()
            .iter()
            .map(|s| s.operator.geometry().n_angles())
            .collect();
        assert_eq!(counts.len(), 4);
        // the last angle is excluded, so the split holding it is one short
        assert_eq!(counts, vec![90, 90, 90, 89]);

        let batch = batches(&geo, 1, 2).remove(0);
        let loss = solver.mini_batch_step(batch.sinograms, batch.targets).unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn sub_recon_shape() {
        let geo = Geometry::parallel_beam(12, 24);
        let solver = solver(&geo, Noise2InverseConfig::new().with_sino_splits(3)).unwrap();
        let batch = batches(&geo, 1, 2).remove(0);
        let sub = solver.compute_noisy_sub_recon(&batch.sinograms, &batch.targets);
        assert_eq!(sub.dims(), [3, 2, 1, 12, 12]);
    }

    #[test]
    fn target_split_never_in_label_average() {
        let geo = Geometry::parallel_beam(8, 20);
        let mut solver = solver(&geo, Noise2InverseConfig::new().with_seed(Some(11))).unwrap();

        let draws = solver.draw_splits(200);
        for draw in &draws {
            assert!(draw.target < 4);
            assert_eq!(draw.labels.len(), 3);
            assert!(!draw.labels.contains(&draw.target));
        }
        // every split gets drawn at some point
        for s in 0..4 {
            assert!(draws.iter().any(|d| d.target == s));
        }
    }

    #[test]
    fn label_average_excludes_target_values() {
        let device = Default::default();
        // split s is filled with the value s
        let splits: Vec<Tensor<NdArray, 4>> = (0..4)
            .map(|s| Tensor::<NdArray, 4>::ones([2, 1, 3, 3], &device).mul_scalar(s as f64))
            .collect();
        let sub = Tensor::stack::<5>(splits, 0);
        let draws = vec![SplitDraw::new(1, 4), SplitDraw::new(3, 4)];

        let (labels, targets) = assemble_pairs(sub, &draws);
        let labels = labels.mean_dim(3).mean_dim(2).reshape([2]).into_data().to_vec::<f32>().unwrap();
        let targets = targets.mean_dim(3).mean_dim(2).reshape([2]).into_data().to_vec::<f32>().unwrap();

        assert_eq!(targets, vec![1.0, 3.0]);
        assert!((labels[0] - 5.0 / 3.0).abs() < 1e-6);
        assert!((labels[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn seeded_solvers_draw_identically() {
        let geo = Geometry::parallel_beam(8, 20);
        let config = Noise2InverseConfig::new().with_seed(Some(5));
        let mut a = solver(&geo, config.clone()).unwrap();
        let mut b = solver(&geo, config).unwrap();
        assert_eq!(a.draw_splits(32), b.draw_splits(32));

        let mut c = solver(&geo, Noise2InverseConfig::new())
            .unwrap()
            .with_rng(StdRng::seed_from_u64(5));
        let mut d = solver(&geo, Noise2InverseConfig::new().with_seed(Some(5))).unwrap();
        assert_eq!(c.draw_splits(8), d.draw_splits(8));
    }

    #[test]
    fn missing_geometry_is_a_precondition_error() {
        let device = Default::default();
        let result: crate::error::Result<Solver> = Noise2InverseSolver::new(
            Gain::identity(&device),
            SgdConfig::new().init(),
            Noise2InverseConfig::new(),
            None,
            |g| ParallelBeam::new(g, &device),
            Fbp,
        );
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn single_split_is_rejected() {
        let geo = Geometry::parallel_beam(8, 20);
        let result = solver(&geo, Noise2InverseConfig::new().with_sino_splits(1));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn train_rejects_zero_epochs_and_incomplete_setup() {
        let geo = Geometry::parallel_beam(8, 20);
        let mut solver = solver(&geo, Noise2InverseConfig::new()).unwrap();
        assert!(matches!(solver.train(0), Err(Error::Precondition(_))));
        assert!(matches!(solver.train(1), Err(Error::Configuration(_))));
        assert_eq!(solver.state(), SolverState::Uninitialized);
    }

    #[test]
    fn checkpoints_follow_frequency() {
        let geo = Geometry::parallel_beam(12, 24);
        let config = Noise2InverseConfig::new()
            .with_sino_splits(3)
            .with_checkpoint_freq(2)
            .with_seed(Some(1))
            .with_verbose(false);
        let mut solver = solver(&geo, config).unwrap();

        let sink = RecordingSink::default();
        solver.set_training(batches(&geo, 2, 2));
        assert_eq!(solver.state(), SolverState::Uninitialized);
        solver.set_checkpointer(Box::new(sink.clone()));
        assert_eq!(solver.state(), SolverState::Configured);

        solver.train(5).unwrap();
        assert_eq!(*sink.0.borrow(), vec![1, 3]);
        assert_eq!(solver.train_loss().len(), 5);
        assert!(solver.train_loss().iter().all(|l| l.is_finite() && *l >= 0.0));
        assert_eq!(solver.current_epoch(), 5);
        assert_eq!(solver.state(), SolverState::Completed);
    }

    #[test]
    fn validation_is_ignored() {
        let geo = Geometry::parallel_beam(12, 24);
        let mut solver = solver(&geo, Noise2InverseConfig::new().with_sino_splits(3)).unwrap();
        solver.set_validation(batches(&geo, 1, 1), 10);
        assert_eq!(solver.validate(), 0.0);
    }

    #[test]
    fn test_reports_mean_and_std() {
        let geo = Geometry::parallel_beam(12, 24);
        let config = Noise2InverseConfig::new()
            .with_sino_splits(3)
            .with_seed(Some(2))
            .with_verbose(false);
        let mut solver = solver(&geo, config).unwrap();
        solver.set_testing(batches(&geo, 3, 2));

        let report = solver.test().unwrap();
        assert_eq!(report.losses.len(), 3);
        let mean = report.losses.iter().sum::<f64>() / 3.0;
        assert!((report.mean - mean).abs() < 1e-12);
        assert!(report.std >= 0.0);
    }

    #[test]
    fn population_std() {
        let report = TestReport::from_losses(vec![1.0, 3.0]);
        assert_eq!(report.mean, 2.0);
        assert_eq!(report.std, 1.0);
    }
}
