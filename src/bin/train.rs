use clap::Parser;

use g2p_trainer::{export, train, TrainConfig};

fn main() -> anyhow::Result<()> {
    if cfg!(debug_assertions) {
        eprintln!(
            "Warning: running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }
    let cfg = TrainConfig::parse();

    let outcome = train::run_training(&cfg, &mut |summary| {
        println!(
            "Epoch {}/{}: loss={:.4}, accuracy={:.3}, val_loss={:.4}, val_accuracy={:.3} ({:.1}s)",
            summary.epoch,
            cfg.epochs,
            summary.train.loss,
            summary.train.accuracy,
            summary.val.loss,
            summary.val.accuracy,
            summary.epoch_seconds
        );
    })?;

    if cfg.export {
        export::export_run(&outcome.run_dir)?;
    }

    Ok(())
}
