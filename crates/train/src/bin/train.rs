//! CLI for training CTC acoustic models from scratch or from a checkpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use asr_common::{
    set_deterministic, DatasetSource, Lexicon, ModelKind, PrefetchLoader, SpeechDataset,
    TrainingConfig,
};
use asr_core::{build_model, GreedyDecoder};
use asr_train::{
    checkpoint, trainable_vars, Adam, BatchTrainer, CtcLoss, EpochController, EvalHarness,
    Optimizer, ParamsAdam, Sgd, TransformerOptimizer,
};

/// Fixed reference rate of the SGD path (the scheduled path overwrites its
/// base rate every step).
const SGD_LR: f64 = 0.01;
const SGD_MOMENTUM: f64 = 0.9;

#[derive(Parser, Debug)]
#[command(name = "asr-train", about = "Train a CTC acoustic model")]
struct Args {
    /// Architecture to train. Unknown names are rejected.
    #[arg(long, default_value = "DeepSpeech", value_parser = parse_model_kind)]
    model: ModelKind,
    /// Epoch to resume from; 0 starts fresh.
    #[arg(long, default_value = "0")]
    from_epoch: usize,
    /// Apply time/frequency masking to training features.
    #[arg(long)]
    augment: bool,
    #[arg(long, default_value = "100")]
    epochs: usize,
    /// Scale factor of the warmup schedule.
    #[arg(long, default_value = "0.1")]
    k: f64,
    /// Warmup step count of the schedule.
    #[arg(long, default_value = "4000")]
    warmup: usize,
    /// Global gradient-norm clip.
    #[arg(long, default_value = "1.0")]
    clip_norm: f64,
    #[arg(long, default_value = "train.csv")]
    train_manifest: PathBuf,
    /// Training subsample scored at every epoch boundary.
    #[arg(long, default_value = "uf.csv")]
    train_subsample_manifest: PathBuf,
    /// Held-out set scored at every epoch boundary.
    #[arg(long, default_value = "test.csv")]
    heldout_manifest: PathBuf,
    #[arg(long, default_value = "lexicon.json")]
    lexicon: PathBuf,
    #[arg(long, default_value = "8")]
    batch_size: usize,
    #[arg(long, default_value = "4")]
    eval_batch_size: usize,
    /// Worker threads of the prefetching loader.
    #[arg(long, default_value = "4")]
    num_workers: usize,
    /// Batches per windowed-loss report.
    #[arg(long, default_value = "1000")]
    log_window: usize,
    #[arg(long, default_value = "123456")]
    seed: u64,
    /// Directory the `checkpoints_<ModelKind>` tree lives under.
    #[arg(long, default_value = ".")]
    checkpoint_root: PathBuf,
}

fn parse_model_kind(s: &str) -> Result<ModelKind, String> {
    s.parse()
}

impl Args {
    fn to_config(&self) -> TrainingConfig {
        let mut config = TrainingConfig::new(self.model);
        config.from_epoch = self.from_epoch;
        config.epochs = self.epochs;
        config.augment = self.augment;
        config.scale_factor = self.k;
        config.warmup_steps = self.warmup;
        config.clip_norm = self.clip_norm;
        config.batch_size = self.batch_size;
        config.eval_batch_size = self.eval_batch_size;
        config.num_workers = self.num_workers;
        config.log_window = self.log_window;
        config.seed = self.seed;
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.to_config();

    let device = Device::cuda_if_available(0)?;
    set_deterministic(&device, config.seed)?;

    let lexicon = Lexicon::load(&args.lexicon)?;
    tracing::info!(classes = lexicon.num_classes(), "lexicon loaded");

    let train_dataset = Arc::new(SpeechDataset::new(
        &args.train_manifest,
        &lexicon,
        config.augment,
        config.seed,
    )?);
    tracing::info!(
        utterances = train_dataset.len(),
        feat_dim = train_dataset.feat_dim(),
        augment = config.augment,
        "training data loaded"
    );
    let mut train_source =
        PrefetchLoader::new(Arc::clone(&train_dataset), config.batch_size, config.num_workers);

    // Evaluation subsamples run un-augmented.
    let train_subsample = Arc::new(SpeechDataset::new(
        &args.train_subsample_manifest,
        &lexicon,
        false,
        config.seed,
    )?);
    let heldout = Arc::new(SpeechDataset::new(
        &args.heldout_manifest,
        &lexicon,
        false,
        config.seed,
    )?);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(
        config.model,
        train_dataset.feat_dim(),
        lexicon.num_classes(),
        vb,
    )?;
    let vars = trainable_vars(&varmap);
    let num_params: usize = vars.iter().map(|v| v.as_tensor().elem_count()).sum();
    tracing::info!(model = %config.model, parameters = num_params, "model built");

    // Static startup decision: the transformer kind trains under the warmup
    // schedule, everything else under fixed-rate Nesterov SGD.
    let mut optimizer: Box<dyn Optimizer> = if config.model.uses_warmup_schedule() {
        let adam = Adam::new(vars.clone(), ParamsAdam::default())?;
        Box::new(TransformerOptimizer::new(
            adam,
            config.scale_factor,
            config.warmup_steps,
        ))
    } else {
        Box::new(Sgd::new(vars.clone(), SGD_LR, SGD_MOMENTUM)?)
    };

    // Resume is strict: the requested epoch's checkpoint must exist.
    if config.from_epoch > 0 {
        let path = checkpoint::checkpoint_path(
            &args.checkpoint_root,
            config.model,
            config.from_epoch - 1,
        );
        let (model_state, optimizer_state) = checkpoint::load(&path, &device)
            .with_context(|| format!("resume from epoch {}", config.from_epoch))?;
        checkpoint::restore(&varmap, optimizer.as_mut(), &model_state, &optimizer_state)?;
        tracing::info!(checkpoint = %path.display(), "resumed");
    }

    let mut eval = EvalHarness::new(
        Box::new(DatasetSource::new(train_subsample, config.eval_batch_size)),
        Box::new(DatasetSource::new(heldout, config.eval_batch_size)),
        Box::new(GreedyDecoder::default()),
        device.clone(),
    );
    let criterion = CtcLoss::default();

    let controller = EpochController::new(
        config.model,
        config.log_window,
        args.checkpoint_root.clone(),
        BatchTrainer::new(device.clone(), vars, config.clip_norm),
    );

    let bar = ProgressBar::new(config.epochs as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} epochs [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    for offset in 0..config.epochs {
        let epoch = config.from_epoch + offset;
        let summaries = controller.run(
            model.as_ref(),
            &varmap,
            &mut train_source,
            optimizer.as_mut(),
            &criterion,
            &mut eval,
            1,
            epoch,
        )?;
        let summary = &summaries[0];
        bar.set_message(format!(
            "epoch {epoch}: train_acc {:.3} test_acc {:.3}",
            summary.train_accuracy, summary.heldout_accuracy
        ));
        bar.inc(1);
    }
    bar.finish();

    tracing::info!(
        epochs = config.epochs,
        from_epoch = config.from_epoch,
        "training done"
    );
    Ok(())
}
