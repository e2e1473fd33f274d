use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module};
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use convexreg::config::{DeviceKind, ExperimentConfig};
use convexreg::ct::{Fbp, Geometry, ParallelBeam, Reconstructor};
use convexreg::denoiser::{Denoiser, DenoiserConfig};
use convexreg::metrics;
use convexreg::phantom::{self, Ellipse};
use convexreg::regularizer::AcrConfig;
use convexreg::training::{FileCheckpointer, ImageModel, LossKind, Noise2InverseConfig, Noise2InverseSolver};

/// Learned convex regularization and Noise2Inverse training for CT.
///
/// All experiments run on synthetic ellipse phantoms with a parallel-beam
/// acquisition over the half circle.
#[derive(Parser)]
#[command(name = "convexreg", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct ExperimentArgs {
    /// Output directory for checkpoints and images.
    #[arg(long, default_value = "./runs")]
    output: PathBuf,

    /// Side length of the phantoms in pixels.
    #[arg(long, default_value_t = 64)]
    image_size: usize,

    /// Number of projection angles.
    #[arg(long, default_value_t = 360)]
    angles: usize,

    /// Gaussian noise level relative to the sinogram peak.
    #[arg(long, default_value_t = 0.02)]
    noise: f64,

    /// Compute device (cpu or gpu).
    #[arg(long, default_value = "cpu", value_enum)]
    device: DeviceKind,

    /// Seed for phantoms, noise and split selection.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl ExperimentArgs {
    fn into_config(self) -> Result<ExperimentConfig> {
        let config = ExperimentConfig {
            output_dir: self.output,
            image_size: self.image_size,
            n_angles: self.angles,
            noise_level: self.noise,
            device: self.device,
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train a denoiser with Noise2Inverse on synthetic noisy sinograms.
    Train {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Number of training epochs.
        #[arg(long, default_value_t = 20)]
        epochs: usize,

        /// Number of angular splits.
        #[arg(long, default_value_t = 4)]
        splits: usize,

        /// Learning rate.
        #[arg(long, default_value_t = 1e-4)]
        lr: f64,

        /// Training loss.
        #[arg(long, default_value = "mse", value_enum)]
        loss: LossKind,

        /// Save a checkpoint every this many epochs.
        #[arg(long, default_value_t = 10)]
        checkpoint_freq: usize,

        /// Number of training batches.
        #[arg(long, default_value_t = 8)]
        train_batches: usize,

        /// Number of test batches.
        #[arg(long, default_value_t = 2)]
        test_batches: usize,

        #[arg(long, default_value_t = 4)]
        batch_size: usize,
    },

    /// Reconstruct a phantom with the convex regularizer.
    Reconstruct {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Trained regularizer weights (burn compact record). Freshly
        /// initialised weights are used when omitted.
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Gradient steps of the variational solver.
        #[arg(long, default_value_t = 100)]
        iterates: usize,

        /// Step size of the variational solver.
        #[arg(long, default_value_t = 1e-5)]
        step: f64,

        /// Regularization weight.
        #[arg(long, default_value_t = 1.0)]
        lambda: f64,

        /// Keep iterating when the PSNR against the phantom decreases.
        #[arg(long)]
        no_earlystop: bool,
    },

    /// Print the default regularizer and solver configurations as JSON.
    Defaults,
}

struct TrainArgs {
    epochs: usize,
    solver: Noise2InverseConfig,
    train_batches: usize,
    test_batches: usize,
    batch_size: usize,
}

/// Run Noise2Inverse training with a specific backend.
fn run_train<B: AutodiffBackend>(config: ExperimentConfig, args: TrainArgs, device: B::Device) -> Result<()> {
    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let geometry = Geometry::parallel_beam(config.image_size, config.n_angles);
    eprintln!("Building parallel-beam operator ({} angles, {} bins)...", geometry.n_angles(), geometry.detector_bins);
    let full = ParallelBeam::<B>::new(&geometry, &device);
    let train = phantom::synthetic_batches(&full, &mut rng, args.train_batches, args.batch_size, config.noise_level, &device);
    let test = phantom::synthetic_batches(&full, &mut rng, args.test_batches, args.batch_size, config.noise_level, &device);

    let model: Denoiser<B> = DenoiserConfig::new().init(&device);
    let optim = AdamConfig::new().with_epsilon(1e-8).init::<B, Denoiser<B>>();

    let mut solver = Noise2InverseSolver::new(
        model,
        optim,
        args.solver,
        Some(geometry),
        |g| ParallelBeam::<B>::new(g, &device),
        Fbp,
    )?;
    solver.set_training(train);
    solver.set_testing(test.clone());
    solver.set_checkpointer(Box::new(FileCheckpointer::<B>::new(config.checkpoints_dir(), "n2i")));

    eprintln!();
    eprintln!(
        "Noise2Inverse: {} epochs, {} splits, lr={}, loss={:?}",
        args.epochs,
        solver.config().sino_splits,
        solver.config().learning_rate,
        solver.config().loss,
    );
    eprintln!("  Corpus: {} x {} phantoms", args.train_batches, args.batch_size);
    eprintln!();

    solver.train(args.epochs)?;
    for (epoch, loss) in solver.train_loss().iter().enumerate() {
        eprintln!("  Epoch {:>3}/{}: loss={loss:.6}", epoch + 1, args.epochs);
    }

    let report = solver.test()?;
    eprintln!("Test loss: {:.6} (std {:.6})", report.mean, report.std);

    let images_dir = config.images_dir();
    fs::create_dir_all(&images_dir)?;
    let model = solver.model.valid();
    let sample = &test[0];
    let fbp = Fbp.reconstruct(&full, sample.sinograms.clone()).inner();
    let denoised = model.forward(fbp.clone());
    let target = sample.targets.clone().inner();
    eprintln!(
        "  FBP PSNR: {:.2} dB, denoised PSNR: {:.2} dB",
        metrics::psnr(&fbp, &target),
        metrics::psnr(&denoised, &target),
    );
    phantom::save_png(&fbp, &images_dir.join("fbp.png"))?;
    phantom::save_png(&denoised, &images_dir.join("n2i.png"))?;

    let final_path = config.checkpoints_dir().join("n2i_final");
    model
        .save_file(&final_path, &CompactRecorder::new())
        .map_err(|e| anyhow::anyhow!("failed to save {}: {e:?}", final_path.display()))?;
    eprintln!("Model saved to {}", final_path.display());
    Ok(())
}

/// Run ACR variational reconstruction with a specific backend.
fn run_reconstruct<B: AutodiffBackend>(
    config: ExperimentConfig,
    acr_config: AcrConfig,
    weights: Option<PathBuf>,
    device: B::Device,
) -> Result<()> {
    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let geometry = Geometry::parallel_beam(config.image_size, config.n_angles);
    let operator = ParallelBeam::<B>::new(&geometry, &device);

    let mut acr = acr_config.init::<B>(&device)?;
    if let Some(path) = weights {
        acr = acr
            .load_file(&path, &CompactRecorder::new(), &device)
            .map_err(|e| anyhow::anyhow!("failed to load regularizer weights from {}: {e:?}", path.display()))?;
        eprintln!("Loaded regularizer weights from {}", path.display());
    }

    let target = phantom::rasterize::<B>(&Ellipse::random_phantom(&mut rng), config.image_size, &device);
    let sinogram = phantom::noisy_sinograms(&operator, target.clone(), config.noise_level);

    eprintln!("Reconstructing with {} iterates...", acr_config.iterates);
    let result = acr.reconstruction(&operator, &Fbp, sinogram.clone(), Some(&target));
    let fbp = Fbp.reconstruct(&operator, sinogram);

    if result.stopped_early {
        eprintln!("  Stopped early after {} steps", result.steps);
    }
    eprintln!(
        "  FBP PSNR: {:.2} dB, ACR PSNR: {:.2} dB (SSIM {:.4})",
        metrics::psnr(&fbp, &target),
        metrics::psnr(&result.image, &target),
        metrics::ssim(&result.image, &target),
    );

    let images_dir = config.images_dir();
    fs::create_dir_all(&images_dir)?;
    phantom::save_png(&target, &images_dir.join("phantom.png"))?;
    phantom::save_png(&fbp, &images_dir.join("fbp.png"))?;
    phantom::save_png(&result.image, &images_dir.join("acr.png"))?;
    eprintln!("Images written to {}", images_dir.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            experiment,
            epochs,
            splits,
            lr,
            loss,
            checkpoint_freq,
            train_batches,
            test_batches,
            batch_size,
        } => {
            let config = experiment.into_config()?;
            let args = TrainArgs {
                epochs,
                solver: Noise2InverseConfig::new()
                    .with_sino_splits(splits)
                    .with_learning_rate(lr)
                    .with_loss(loss)
                    .with_checkpoint_freq(checkpoint_freq)
                    .with_seed(Some(config.seed)),
                train_batches,
                test_batches,
                batch_size,
            };
            match config.device {
                DeviceKind::Cpu => {
                    run_train::<Autodiff<NdArray>>(config, args, Default::default())?;
                }
                DeviceKind::Gpu => {
                    eprintln!("Using GPU (WGPU)");
                    run_train::<Autodiff<Wgpu>>(config, args, WgpuDevice::default())?;
                }
            }
        }

        Commands::Reconstruct {
            experiment,
            weights,
            iterates,
            step,
            lambda,
            no_earlystop,
        } => {
            let config = experiment.into_config()?;
            let acr_config = AcrConfig::new()
                .with_iterates(iterates)
                .with_var_step(step)
                .with_lambda(lambda)
                .with_earlystop(!no_earlystop);
            match config.device {
                DeviceKind::Cpu => {
                    run_reconstruct::<Autodiff<NdArray>>(config, acr_config, weights, Default::default())?;
                }
                DeviceKind::Gpu => {
                    eprintln!("Using GPU (WGPU)");
                    run_reconstruct::<Autodiff<Wgpu>>(config, acr_config, weights, WgpuDevice::default())?;
                }
            }
        }

        Commands::Defaults => {
            let defaults = serde_json::json!({
                "acr": AcrConfig::new(),
                "noise2inverse": Noise2InverseConfig::new(),
                "experiment": ExperimentConfig::default(),
            });
            println!("{}", serde_json::to_string_pretty(&defaults)?);
        }
    }

    Ok(())
}
