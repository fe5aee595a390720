use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::dataset::{
    augment_samples, load_dictionary, samples_from_dictionary, split_samples, write_split_file,
    EncodedDataset, Vocabulary, PAD_ID,
};
use crate::model::{G2pTransformer, ModelSpec};
use crate::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: EpochMetrics,
    pub val: EpochMetrics,
    pub epoch_seconds: f64,
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub run_dir: PathBuf,
    pub history: Vec<EpochSummary>,
    pub best_epoch: usize,
    pub best_val_loss: f64,
}

/// Run the full pipeline: load, split, optionally augment, write split files,
/// train, checkpoint. Per-epoch metrics are handed to `on_epoch` so the
/// caller decides how to display them.
pub fn run_training(
    cfg: &TrainConfig,
    on_epoch: &mut dyn FnMut(&EpochSummary),
) -> crate::Result<TrainOutcome> {
    cfg.validate()?;

    let dict = load_dictionary(
        Path::new(&cfg.dictionary),
        cfg.lexicon.as_deref().map(Path::new),
    )?;
    let mut samples = samples_from_dictionary(&dict);
    if cfg.max_samples > 0 {
        samples.truncate(cfg.max_samples);
    }
    println!(
        "Loaded {} text-phoneme pairs from {} dictionary entries",
        samples.len(),
        dict.len()
    );

    let (mut train_samples, val_samples, test_samples) =
        split_samples(samples, cfg.train_ratio, cfg.val_ratio, cfg.seed)?;
    println!(
        "Data split: train={} val={} test={}",
        train_samples.len(),
        val_samples.len(),
        test_samples.len()
    );

    if cfg.augment {
        eprintln!(
            "Warning: midpoint-split augmentation is a word-boundary heuristic and may produce phonetically incorrect pairs"
        );
        let before = train_samples.len();
        train_samples = augment_samples(&train_samples);
        println!(
            "Augmented training data from {} to {} samples",
            before,
            train_samples.len()
        );
    }

    if train_samples.is_empty() {
        return Err(PipelineError::Data(
            "training split is empty; raise --train-ratio or provide more data".into(),
        ));
    }

    let run_id = cfg
        .run_name
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y%m%d-%H%M%S").to_string());
    let run_dir = PathBuf::from(&cfg.output_dir).join(&run_id);
    let checkpoints_dir = run_dir.join("checkpoints");
    fs::create_dir_all(&checkpoints_dir)?;

    fs::write(run_dir.join("config.json"), serde_json::to_string_pretty(cfg)?)?;

    for (name, split) in [
        ("train_data.txt", &train_samples),
        ("val_data.txt", &val_samples),
        ("test_data.txt", &test_samples),
    ] {
        let path = run_dir.join(name);
        write_split_file(&path, split)?;
        println!("Wrote {} samples to {}", split.len(), path.display());
    }

    let vocab = Vocabulary::build(&[&train_samples, &val_samples, &test_samples]);
    println!(
        "Vocabulary: {} chars, {} phonemes, seq_len={}",
        vocab.vocab_size() - 1,
        vocab.phoneme_size() - 1,
        vocab.seq_len
    );

    let spec = ModelSpec::from_config(cfg, &vocab);
    fs::write(
        run_dir.join("model_spec.json"),
        serde_json::to_string_pretty(&spec)?,
    )?;

    let device = resolve_device(&cfg.device)?;
    println!("Using device: {device:?}");

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = G2pTransformer::new(&spec, vb)?;

    let adamw_params = ParamsAdamW {
        lr: cfg.learning_rate,
        weight_decay: cfg.weight_decay,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), adamw_params)?;

    let train_data = EncodedDataset::encode(&vocab, &train_samples);
    let val_data = if val_samples.is_empty() {
        println!("Validation split is empty, evaluating on training samples instead");
        train_data.clone()
    } else {
        EncodedDataset::encode(&vocab, &val_samples)
    };

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut best_val_loss = f64::INFINITY;
    let mut best_epoch = 0usize;
    let mut history = Vec::new();
    let mut global_step = 0usize;

    for epoch in 1..=cfg.epochs {
        let epoch_started = Instant::now();

        let mut train_indices: Vec<usize> = (0..train_data.len()).collect();
        train_indices.shuffle(&mut rng);
        let train_metrics = run_epoch(
            &model,
            &train_data,
            &train_indices,
            cfg,
            &device,
            Some(&mut optimizer),
            &mut global_step,
            true,
        )?;

        let val_indices: Vec<usize> = (0..val_data.len()).collect();
        let val_metrics = run_epoch(
            &model,
            &val_data,
            &val_indices,
            cfg,
            &device,
            None,
            &mut global_step,
            false,
        )?;

        let summary = EpochSummary {
            epoch,
            train: train_metrics,
            val: val_metrics,
            epoch_seconds: epoch_started.elapsed().as_secs_f64(),
        };
        on_epoch(&summary);
        history.push(summary.clone());

        let last_ckpt = checkpoints_dir.join("last.safetensors");
        varmap
            .save(&last_ckpt)
            .map_err(PipelineError::Candle)?;
        fs::write(
            checkpoints_dir.join("last.json"),
            serde_json::to_string_pretty(&summary)?,
        )?;

        if summary.val.loss < best_val_loss {
            best_val_loss = summary.val.loss;
            best_epoch = epoch;
            varmap
                .save(checkpoints_dir.join("best.safetensors"))
                .map_err(PipelineError::Candle)?;
            fs::write(
                checkpoints_dir.join("best.json"),
                serde_json::to_string_pretty(&summary)?,
            )?;
        }
    }

    fs::write(
        run_dir.join("metrics_history.json"),
        serde_json::to_string_pretty(&history)?,
    )?;

    println!("Run ID: {run_id}");
    println!("Best validation loss: {best_val_loss:.4} at epoch {best_epoch}");
    println!("Artifacts written to: {}", run_dir.display());

    Ok(TrainOutcome {
        run_dir,
        history,
        best_epoch,
        best_val_loss,
    })
}

fn run_epoch(
    model: &G2pTransformer,
    data: &EncodedDataset,
    indices: &[usize],
    cfg: &TrainConfig,
    device: &Device,
    mut optimizer: Option<&mut AdamW>,
    global_step: &mut usize,
    is_training: bool,
) -> crate::Result<EpochMetrics> {
    let num_batches = indices.len().div_ceil(cfg.batch_size);
    let progress = ProgressBar::new(num_batches as u64);
    progress.set_style(progress_style());

    let mut total_nll = 0f64;
    let mut total_correct = 0f64;
    let mut total_valid = 0f64;

    let mut interval_nll = 0f64;
    let mut interval_correct = 0f64;
    let mut interval_valid = 0f64;

    for (batch_idx, batch_indices) in indices.chunks(cfg.batch_size).enumerate() {
        if is_training {
            *global_step += 1;
        }

        let (inputs, targets) = load_batch(data, batch_indices, device)?;

        let logits = model.forward_t(&inputs, is_training)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let picked = log_probs
            .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
            .squeeze(D::Minus1)?;

        // Padding positions carry no signal.
        let mask = targets.ne(PAD_ID)?.to_dtype(DType::F32)?;
        let valid_count = f64::from(mask.sum_all()?.to_scalar::<f32>()?);
        if valid_count <= 0.0 {
            progress.inc(1);
            continue;
        }

        let nll_sum_t = (picked.neg()? * &mask)?.sum_all()?;
        let loss = nll_sum_t.affine(1.0 / valid_count, 0.0)?;

        if let Some(opt) = optimizer.as_deref_mut() {
            opt.backward_step(&loss)?;
        }

        let predictions = logits.argmax(D::Minus1)?;
        let correct = (predictions.eq(&targets)?.to_dtype(DType::F32)? * &mask)?
            .sum_all()?
            .to_scalar::<f32>()? as f64;
        let nll_sum = nll_sum_t.to_scalar::<f32>()? as f64;

        total_nll += nll_sum;
        total_correct += correct;
        total_valid += valid_count;

        interval_nll += nll_sum;
        interval_correct += correct;
        interval_valid += valid_count;

        progress.set_message(format!(
            "loss={:.4} acc={:.3}",
            nll_sum / valid_count,
            correct / valid_count
        ));
        progress.inc(1);

        if is_training
            && cfg.log_every_batches > 0
            && (*global_step % cfg.log_every_batches == 0)
            && interval_valid > 0.0
        {
            println!(
                "step={} train_loss={:.5} train_accuracy={:.5}",
                *global_step,
                interval_nll / interval_valid,
                interval_correct / interval_valid,
            );
            interval_nll = 0.0;
            interval_correct = 0.0;
            interval_valid = 0.0;
        }

        if batch_idx + 1 == num_batches {
            progress.finish_and_clear();
        }
    }

    if total_valid <= 0.0 {
        return Err(PipelineError::Data(
            "no non-padding target tokens in this epoch".into(),
        ));
    }

    Ok(EpochMetrics {
        loss: total_nll / total_valid,
        accuracy: total_correct / total_valid,
    })
}

fn load_batch(
    data: &EncodedDataset,
    batch_indices: &[usize],
    device: &Device,
) -> crate::Result<(Tensor, Tensor)> {
    let seq_len = data.inputs[batch_indices[0]].len();
    let mut input_flat = Vec::with_capacity(batch_indices.len() * seq_len);
    let mut target_flat = Vec::with_capacity(batch_indices.len() * seq_len);
    for &idx in batch_indices {
        input_flat.extend_from_slice(&data.inputs[idx]);
        target_flat.extend_from_slice(&data.targets[idx]);
    }
    let shape = (batch_indices.len(), seq_len);
    let inputs = Tensor::from_vec(input_flat, shape, device)?;
    let targets = Tensor::from_vec(target_flat, shape, device)?;
    Ok((inputs, targets))
}

pub fn resolve_device(device_arg: &str) -> crate::Result<Device> {
    match device_arg {
        "auto" => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0).map_err(|e| {
            PipelineError::Config(format!(
                "CUDA requested with --device cuda, but it is not available: {e}"
            ))
        }),
        other => Err(PipelineError::Config(format!(
            "unsupported --device value: {other} (expected auto|cpu|cuda)"
        ))),
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
