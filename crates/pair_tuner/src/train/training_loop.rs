//! Resumable training loop
//!
//! Drives epoch/batch iteration, triggers periodic state persistence, and
//! resumes mid-epoch from the latest snapshot. One run moves through
//! `NotStarted → Resuming? → Training(e, s) → Evaluating(e) → … → Completed`;
//! any failure while resuming or persisting is terminal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::{loss, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, error, info, warn};

use super::args::TrainArgs;
use super::checkpoint::{self, CheckpointInterval, CheckpointTag, ResumePosition, Snapshot};
use crate::config::RunConfig;
use crate::data::{BatchProvider, JsonlProvider, PadPolicy, SyntheticProvider};
use crate::evaluate;
use crate::model::{ModelConfig, PairClassifier};
use crate::optim::{AdamW, ParamsAdamW};
use crate::schedule::LinearSchedule;
use crate::session::{LossScaler, Session};

const EVAL_BATCH_SIZE: usize = 32;
const NUM_LABELS: usize = 2;
const SYNTHETIC_VOCAB: usize = 1024;
const SYNTHETIC_SEQ_LEN: usize = 32;
const LOG_INTERVAL: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Resuming,
    Training { epoch: usize, step: usize },
    Evaluating { epoch: usize },
    Completed,
}

pub(crate) struct PhaseTracker {
    current: RunPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: RunPhase::NotStarted,
        }
    }

    fn set(&mut self, next: RunPhase) {
        debug!(from = ?self.current, to = ?next, "run phase");
        self.current = next;
    }

    #[cfg(test)]
    fn current(&self) -> RunPhase {
        self.current
    }
}

/// What one invocation did. `overall_step` counts every batch examined,
/// including batches skipped while resuming.
#[derive(Debug)]
pub struct RunReport {
    pub overall_step: usize,
    pub checkpoints: Vec<PathBuf>,
}

/// CLI entry point: installs the interrupt handler and runs to completion.
pub fn run(args: TrainArgs) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let r = stop.clone();
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let c = ctrl_c_count.clone();

    let handler = ctrlc::set_handler(move || {
        let count = c.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            info!("\n🛑 Ctrl+C detected! Finishing current batch...");
            info!("   (Press Ctrl+C again to force quit WITHOUT saving)");
            r.store(true, Ordering::SeqCst);
        } else {
            error!("⚠️  Force quit! Exiting immediately.");
            std::process::exit(1);
        }
    });
    if let Err(e) = handler {
        warn!("Ctrl-C handler unavailable: {}", e);
    }

    let report = train(&args, &stop)?;
    info!(
        "Done. {} batches examined, {} checkpoint(s) written.",
        report.overall_step,
        report.checkpoints.len()
    );
    Ok(())
}

/// The loop itself, separated from signal handling so it can be driven
/// directly by tests. `stop` requests a graceful exit at the next batch
/// boundary.
pub fn train(args: &TrainArgs, stop: &AtomicBool) -> Result<RunReport> {
    let config = RunConfig::from_args(args);
    // Malformed checkpoint configuration is fatal before any work happens.
    let interval = CheckpointInterval::parse(args.checkpointing_steps.as_deref())?;
    let session = Session::new(args.cpu, args.mixed_precision)?;

    info!("--- Pair-Tuner Training ---");
    info!(
        "Hyperparams: LR={}, Epochs={}, Batch={}, Seed={}, Accum={}",
        config.lr, config.num_epochs, config.batch_size, config.seed, config.grad_accum
    );

    std::fs::create_dir_all(&args.output_dir)?;

    let mut run_rng = StdRng::seed_from_u64(config.seed);

    let bundle = build_providers(args, &config)?;
    let mut train_data = bundle.train;
    let mut eval_data = bundle.eval;
    let batches_per_epoch = train_data.num_batches();
    if batches_per_epoch == 0 {
        bail!("training dataset is empty");
    }
    info!("Batches per epoch: {}", batches_per_epoch);

    let model_config = ModelConfig {
        vocab_size: bundle.vocab_size,
        hidden_dim: args.dim,
        num_layers: args.layers,
        num_labels: NUM_LABELS,
    };
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &session.device);
    let model = PairClassifier::new(&model_config, vb)?;
    let vars = sorted_vars(&varmap);

    let mut optimizer = AdamW::new(
        vars.clone(),
        ParamsAdamW {
            lr: config.lr,
            ..Default::default()
        },
    )?;
    let total_updates =
        (batches_per_epoch * config.num_epochs + config.grad_accum - 1) / config.grad_accum;
    let mut schedule = LinearSchedule::new(config.lr, config.warmup_steps, total_updates);
    let mut scaler = LossScaler::for_precision(session.precision);

    let mut phase = PhaseTracker::new();

    // Resolve the resume request before the epoch loop. A request that
    // cannot be satisfied fails the run; there is no silent fresh start.
    let mut resume_pos: Option<ResumePosition> = None;
    if let Some(request) = &args.resume_from_checkpoint {
        phase.set(RunPhase::Resuming);
        let (dir, tag) = checkpoint::resolve_resume(request, &args.output_dir)?;
        info!("📂 Resuming from checkpoint: {}", dir.display());
        let restored = checkpoint::load_snapshot(
            &dir,
            &model_config,
            &mut varmap,
            &mut optimizer,
            &mut schedule,
            &session.device,
        )?;
        run_rng = StdRng::seed_from_u64(restored.rng_word);
        if let (Some(live), Some(saved)) = (scaler.as_mut(), restored.scaler) {
            *live = saved;
        }
        let pos = tag.resume_position(batches_per_epoch);
        info!(
            "Resume position: epoch {}, intra-epoch offset {:?}",
            pos.starting_epoch, pos.resume_step
        );
        resume_pos = Some(pos);
    }
    let starting_epoch = resume_pos.map_or(0, |p| p.starting_epoch);

    // Per-invocation counter: counts batches examined since *this* process
    // started, not since the run that wrote the checkpoint. A resumed
    // invocation counts from zero again, so its step-tagged names replay
    // the low indices.
    let mut overall_step = 0usize;
    let mut checkpoints: Vec<PathBuf> = Vec::new();
    let mut accum: Vec<Option<Tensor>> = vec![None; vars.len()];
    let mut processed = 0usize;
    let start_time = Instant::now();
    let mut interrupted = false;

    'epochs: for epoch in starting_epoch..config.num_epochs {
        train_data.begin_epoch(epoch);

        for step in 0..batches_per_epoch {
            if skip_for_resume(resume_pos, epoch, step) {
                // Skipped batches still advance the counter so step-tagged
                // names line up with an uninterrupted run of the same length.
                overall_step += 1;
                continue;
            }
            phase.set(RunPhase::Training { epoch, step });

            let batch = train_data.batch(step, &session.device)?;
            let logits = model.forward(&batch.input_ids, &batch.attention_mask)?;
            let mut loss = loss::cross_entropy(&logits, &batch.labels)?;
            let loss_value = loss.to_scalar::<f32>()?;
            if config.grad_accum > 1 {
                loss = (loss / config.grad_accum as f64)?;
            }
            if let Some(s) = &scaler {
                loss = (loss * s.scale as f64)?;
            }

            let grads = loss.backward()?;
            for (i, var) in vars.iter().enumerate() {
                if let Some(g) = grads.get(var) {
                    accum[i] = Some(match accum[i].take() {
                        Some(a) => (&a + g)?,
                        None => g.clone(),
                    });
                }
            }
            if (step + 1) % config.grad_accum == 0 || step + 1 == batches_per_epoch {
                let lr = schedule.advance();
                optimizer.set_lr(lr);
                let scale = scaler.map_or(1.0, |s| s.scale);
                optimizer.step_grads(&accum, scale)?;
                for g in accum.iter_mut() {
                    *g = None;
                }
            }

            overall_step += 1;
            processed += 1;

            if step % LOG_INTERVAL == 0 {
                let elapsed = start_time.elapsed().as_secs_f64();
                let examples_per_sec = if elapsed > 0.0 {
                    processed as f64 * config.batch_size as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    "Epoch {} | Step {:4} | Loss: {:.4} | LR: {:.7} | {:.1} ex/s",
                    epoch,
                    step,
                    loss_value,
                    optimizer.learning_rate(),
                    examples_per_sec
                );
            }

            if let CheckpointInterval::EveryNSteps(n) = interval {
                if overall_step % n == 0 {
                    let tag = CheckpointTag::Step(overall_step);
                    let snap = Snapshot {
                        model: &varmap,
                        model_config: &model_config,
                        run_config: &config,
                        optimizer: &optimizer,
                        schedule: &schedule,
                        rng_word: run_rng.gen(),
                        scaler,
                    };
                    let dir =
                        checkpoint::save_snapshot(&args.output_dir, tag, overall_step, &snap)?;
                    info!("💾 Saved checkpoint: {}", dir.display());
                    checkpoints.push(dir);
                }
            }

            if stop.load(Ordering::SeqCst) {
                warn!("🛑 Interrupted at overall step {}; stopping.", overall_step);
                if let CheckpointInterval::EveryNSteps(n) = interval {
                    if overall_step % n != 0 {
                        let tag = CheckpointTag::Step(overall_step);
                        let snap = Snapshot {
                            model: &varmap,
                            model_config: &model_config,
                            run_config: &config,
                            optimizer: &optimizer,
                            schedule: &schedule,
                            rng_word: run_rng.gen(),
                            scaler,
                        };
                        let dir =
                            checkpoint::save_snapshot(&args.output_dir, tag, overall_step, &snap)?;
                        info!("💾 Saved checkpoint: {}", dir.display());
                        checkpoints.push(dir);
                    }
                }
                interrupted = true;
                break 'epochs;
            }
        }

        phase.set(RunPhase::Evaluating { epoch });
        let metrics = evaluate::evaluate_provider(&model, eval_data.as_mut(), &session.device)?;
        info!(
            "epoch {}: accuracy {:.4} | f1 {:.4}",
            epoch, metrics.accuracy, metrics.f1
        );

        if interval == CheckpointInterval::EveryEpoch {
            let tag = CheckpointTag::Epoch(epoch);
            let snap = Snapshot {
                model: &varmap,
                model_config: &model_config,
                run_config: &config,
                optimizer: &optimizer,
                schedule: &schedule,
                rng_word: run_rng.gen(),
                scaler,
            };
            let dir = checkpoint::save_snapshot(&args.output_dir, tag, overall_step, &snap)?;
            info!("💾 Saved checkpoint: {}", dir.display());
            checkpoints.push(dir);
        }
    }

    if !interrupted {
        phase.set(RunPhase::Completed);
    }
    Ok(RunReport {
        overall_step,
        checkpoints,
    })
}

/// True when `step` belongs to the already-consumed prefix of the first
/// resumed epoch. Epoch-tagged resumes (no intra-epoch offset) never skip.
fn skip_for_resume(resume: Option<ResumePosition>, epoch: usize, step: usize) -> bool {
    match resume {
        Some(pos) if epoch == pos.starting_epoch => {
            pos.resume_step.is_some_and(|r| step < r)
        }
        _ => false,
    }
}

/// Variables in name order. `VarMap::all_vars` iterates a HashMap, and the
/// optimizer's saved moments are index-keyed, so the order must be identical
/// in the invocation that saved a snapshot and the one that loads it.
fn sorted_vars(varmap: &VarMap) -> Vec<Var> {
    let data = varmap.data().lock().expect("varmap lock poisoned");
    let mut named: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.into_iter().map(|(_, var)| var).collect()
}

struct DataBundle {
    train: Box<dyn BatchProvider>,
    eval: Box<dyn BatchProvider>,
    vocab_size: usize,
}

fn build_providers(args: &TrainArgs, config: &RunConfig) -> Result<DataBundle> {
    if args.synthetic {
        info!(
            "Using synthetic data provider ({} batches/epoch)",
            args.synthetic_batches
        );
        let eval_batches = (args.synthetic_batches / 4).max(1);
        return Ok(DataBundle {
            train: Box::new(SyntheticProvider::new(
                args.synthetic_batches,
                config.batch_size,
                SYNTHETIC_SEQ_LEN,
                SYNTHETIC_VOCAB,
                NUM_LABELS,
                config.seed,
            )),
            eval: Box::new(SyntheticProvider::new(
                eval_batches,
                config.batch_size,
                SYNTHETIC_SEQ_LEN,
                SYNTHETIC_VOCAB,
                NUM_LABELS,
                config.seed.wrapping_add(1),
            )),
            vocab_size: SYNTHETIC_VOCAB,
        });
    }

    let data_dir = args
        .data
        .as_ref()
        .ok_or_else(|| anyhow!("--data is required unless --synthetic is set"))?;
    let tokenizer_path = args
        .tokenizer
        .clone()
        .unwrap_or_else(|| data_dir.join("tokenizer.json"));
    info!("Loading tokenizer from: {}", tokenizer_path.display());
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", tokenizer_path.display()))?;
    let vocab_size = tokenizer.get_vocab_size(true);
    info!("✅ Tokenizer loaded. Vocab size: {}", vocab_size);

    let pad = args.pad_to_length.map_or(PadPolicy::Longest, PadPolicy::Fixed);
    let train = JsonlProvider::load(
        data_dir.join("train.jsonl"),
        &tokenizer,
        config.batch_size,
        args.max_len,
        pad,
        Some(config.seed),
    )?;
    let eval = JsonlProvider::load(
        data_dir.join("validation.jsonl"),
        &tokenizer,
        EVAL_BATCH_SIZE,
        args.max_len,
        pad,
        None,
    )?;
    Ok(DataBundle {
        train: Box::new(train),
        eval: Box::new(eval),
        vocab_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_resume_never_skips() {
        let pos = ResumePosition {
            starting_epoch: 2,
            resume_step: None,
        };
        assert!(!skip_for_resume(Some(pos), 2, 0));
        assert!(!skip_for_resume(Some(pos), 3, 0));
    }

    #[test]
    fn step_resume_skips_only_the_first_epoch_prefix() {
        let pos = ResumePosition {
            starting_epoch: 2,
            resume_step: Some(3),
        };
        assert!(skip_for_resume(Some(pos), 2, 0));
        assert!(skip_for_resume(Some(pos), 2, 2));
        assert!(!skip_for_resume(Some(pos), 2, 3));
        // Later epochs run in full.
        assert!(!skip_for_resume(Some(pos), 3, 0));
    }

    #[test]
    fn fresh_runs_skip_nothing() {
        assert!(!skip_for_resume(None, 0, 0));
    }

    #[test]
    fn phase_tracker_records_transitions() {
        let mut phase = PhaseTracker::new();
        assert_eq!(phase.current(), RunPhase::NotStarted);
        phase.set(RunPhase::Training { epoch: 0, step: 5 });
        assert_eq!(phase.current(), RunPhase::Training { epoch: 0, step: 5 });
        phase.set(RunPhase::Completed);
        assert_eq!(phase.current(), RunPhase::Completed);
    }
}
