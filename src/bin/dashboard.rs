//! Interactive terminal front-end over the training pipeline. Every command
//! runs synchronously: a training run blocks the prompt until it finishes.

use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::str::FromStr;

use crossterm::style::Stylize;

use g2p_trainer::config::ModelType;
use g2p_trainer::session::{Phase, Session};
use g2p_trainer::train::EpochSummary;
use g2p_trainer::{dataset, export, train, TrainConfig};

fn main() -> anyhow::Result<()> {
    println!("{}", "JP G2P Training Dashboard".bold());
    println!("Type 'help' for commands.\n");

    let mut session = Session::new(TrainConfig::defaults());
    let stdin = io::stdin();

    loop {
        print!("g2p> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match command {
            "help" => help(),
            "quit" | "exit" => break,
            "status" => status(&session),
            "load" => cmd_load(&mut session, &args),
            "set" => cmd_set(&mut session, &args),
            "train" => cmd_train(&mut session),
            "metrics" => cmd_metrics(&session),
            "export" => cmd_export(&session),
            other => warning(&format!("unknown command '{other}', try 'help'")),
        }
    }

    Ok(())
}

fn help() {
    println!("  load <dictionary.json> [lexicon.json]  load a phoneme dictionary");
    println!("  set <option> <value>                   change a hyperparameter");
    println!("      options: epochs batch-size learning-rate train-ratio val-ratio");
    println!("               seed model-type augment export device output-dir");
    println!("               d-model layers heads dropout");
    println!("  status                                 show session state and config");
    println!("  train                                  run the training pipeline");
    println!("  metrics                                per-epoch metrics of the last run");
    println!("  export                                 export the last run's weights");
    println!("  quit                                   leave the dashboard");
}

fn success(message: &str) {
    println!("{}", format!("✔ {message}").green());
}

fn warning(message: &str) {
    println!("{}", format!("⚠ {message}").yellow());
}

fn error(message: &str) {
    println!("{}", format!("✘ {message}").red());
}

fn status(session: &Session) {
    let cfg = &session.cfg;
    println!("phase: {}", session.phase());
    println!("dictionary: {}", cfg.dictionary);
    if let Some(lexicon) = &cfg.lexicon {
        println!("lexicon: {lexicon}");
    }
    println!(
        "model: {:?} d_model={} layers={} heads={} dropout={}",
        cfg.model_type, cfg.d_model, cfg.layers, cfg.heads, cfg.dropout
    );
    println!(
        "training: epochs={} batch_size={} lr={} seed={} device={}",
        cfg.epochs, cfg.batch_size, cfg.learning_rate, cfg.seed, cfg.device
    );
    println!(
        "split: train={} val={} | augment={} export={}",
        cfg.train_ratio, cfg.val_ratio, cfg.augment, cfg.export
    );
    if let Some(stats) = &session.stats {
        println!(
            "dataset: {} entries ({} after filtering), {} unique chars, {} unique phonemes",
            stats.entries, stats.filtered, stats.unique_chars, stats.unique_phonemes
        );
    }
    if let Some(err) = &session.last_error {
        error(err);
    }
}

fn cmd_load(session: &mut Session, args: &[&str]) {
    let Some(dictionary) = args.first() else {
        warning("usage: load <dictionary.json> [lexicon.json]");
        return;
    };
    let lexicon = args.get(1).copied();

    match dataset::load_dictionary(Path::new(dictionary), lexicon.map(Path::new)) {
        Ok(dict) => {
            let stats = dataset::dictionary_stats(&dict);
            session.cfg.dictionary = dictionary.to_string();
            session.cfg.lexicon = lexicon.map(str::to_string);
            success(&format!(
                "Loaded {} entries ({} usable, {} unique chars, {} unique phonemes)",
                stats.entries, stats.filtered, stats.unique_chars, stats.unique_phonemes
            ));
            session.stats = Some(stats);
        }
        Err(e) => error(&e.to_string()),
    }
}

fn cmd_set(session: &mut Session, args: &[&str]) {
    let [key, value] = args else {
        warning("usage: set <option> <value>");
        return;
    };

    let cfg = &mut session.cfg;
    let applied = match *key {
        "epochs" => parse_into(value, &mut cfg.epochs),
        "batch-size" => parse_into(value, &mut cfg.batch_size),
        "learning-rate" => parse_into(value, &mut cfg.learning_rate),
        "train-ratio" => parse_into(value, &mut cfg.train_ratio),
        "val-ratio" => parse_into(value, &mut cfg.val_ratio),
        "seed" => parse_into(value, &mut cfg.seed),
        "d-model" => parse_into(value, &mut cfg.d_model),
        "layers" => parse_into(value, &mut cfg.layers),
        "heads" => parse_into(value, &mut cfg.heads),
        "dropout" => parse_into(value, &mut cfg.dropout),
        "augment" => parse_into(value, &mut cfg.augment),
        "export" => parse_into(value, &mut cfg.export),
        "device" => {
            cfg.device = value.to_string();
            Ok(())
        }
        "output-dir" => {
            cfg.output_dir = value.to_string();
            Ok(())
        }
        "model-type" => match *value {
            "forward" => {
                cfg.model_type = ModelType::Forward;
                Ok(())
            }
            "autoregressive" => {
                cfg.model_type = ModelType::Autoregressive;
                Ok(())
            }
            other => Err(format!("unknown model type '{other}'")),
        },
        other => Err(format!("unknown option '{other}'")),
    };

    match applied {
        Ok(()) => {
            if let Err(e) = session.cfg.validate() {
                warning(&e.to_string());
            } else {
                success(&format!("{key} = {value}"));
            }
        }
        Err(e) => warning(&e),
    }
}

fn parse_into<T: FromStr>(value: &str, slot: &mut T) -> Result<(), String>
where
    T::Err: Display,
{
    match value.parse() {
        Ok(parsed) => {
            *slot = parsed;
            Ok(())
        }
        Err(e) => Err(format!("invalid value '{value}': {e}")),
    }
}

fn cmd_train(session: &mut Session) {
    if let Err(e) = session.cfg.validate() {
        error(&e.to_string());
        return;
    }
    if let Err(e) = session.begin_preparing() {
        error(&e.to_string());
        return;
    }
    println!("Preparing dataset and model...");
    let cfg = session.cfg.clone();
    if let Err(e) = session.begin_training() {
        error(&e.to_string());
        return;
    }

    let result = {
        let mut on_epoch = |summary: &EpochSummary| {
            println!(
                "Epoch {}/{}: loss={:.4} acc={:.2}% val_loss={:.4} val_acc={:.2}% ({:.1}s)",
                summary.epoch,
                cfg.epochs,
                summary.train.loss,
                summary.train.accuracy * 100.0,
                summary.val.loss,
                summary.val.accuracy * 100.0,
                summary.epoch_seconds
            );
            session.record_epoch(summary);
        };
        train::run_training(&cfg, &mut on_epoch)
    };

    match result {
        Ok(outcome) => {
            let run_dir = outcome.run_dir.clone();
            let best = outcome.best_val_loss;
            if session.finish(outcome).is_err() {
                warning("session left training state unexpectedly");
            }
            success(&format!(
                "Training completed (best val_loss={best:.4}), artifacts in {}",
                run_dir.display()
            ));
            if cfg.export {
                run_export(&run_dir);
            }
        }
        Err(e) => {
            session.fail(e.to_string());
            error(&format!("Training failed: {e}"));
        }
    }
}

fn cmd_metrics(session: &Session) {
    if session.history.is_empty() {
        warning("train a model to see metrics");
        return;
    }
    println!("epoch      loss  accuracy  val_loss  val_accuracy   seconds");
    for s in &session.history {
        println!(
            "{:>5}  {:>8.4}  {:>7.2}%  {:>8.4}  {:>11.2}%  {:>8.1}",
            s.epoch,
            s.train.loss,
            s.train.accuracy * 100.0,
            s.val.loss,
            s.val.accuracy * 100.0,
            s.epoch_seconds
        );
    }
    if let Some(outcome) = &session.outcome {
        println!(
            "best: val_loss={:.4} at epoch {}",
            outcome.best_val_loss, outcome.best_epoch
        );
    }
}

fn cmd_export(session: &Session) {
    match (session.phase(), &session.outcome) {
        (Phase::Done, Some(outcome)) => run_export(&outcome.run_dir),
        _ => warning("no finished run to export; run 'train' first"),
    }
}

fn run_export(run_dir: &Path) {
    match export::export_run(run_dir) {
        Ok(report) if report.verified => {
            success(&format!("Exported and verified {}", report.artifact.display()));
        }
        Ok(report) => warning(&format!(
            "Exported {} but verification failed (see warnings above)",
            report.artifact.display()
        )),
        Err(e) => error(&format!("Export failed: {e}")),
    }
}
