//! Epoch-end callbacks driving the training loop.
//!
//! Each callback only tracks state and returns a decision; the trainer owns
//! the model and acts on the decision (snapshot, restore, save, new rate).

use tracing::info;

/// Outcome of an early-stopping check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// Monitored value improved; snapshot the current weights.
    Improved,
    Continue,
    /// Patience exhausted; restore the snapshot and stop the phase.
    Stop,
}

/// Stop when validation loss has not improved for `patience` epochs.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    wait: usize,
    best_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            wait: 0,
            best_epoch: None,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn on_epoch_end(&mut self, epoch: usize, val_loss: f64) -> StopDecision {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            info!(
                "early stopping: no val_loss improvement for {} epochs (best {:.4})",
                self.patience, self.best
            );
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }
}

/// Multiply the learning rate by `factor` after `patience` stagnant epochs.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_delta: f64,
    min_lr: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize) -> Self {
        Self {
            factor,
            patience,
            min_delta: 1e-4,
            min_lr: 0.0,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// Returns the learning rate for the next epoch.
    pub fn on_epoch_end(&mut self, val_loss: f64, lr: f64) -> f64 {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return lr;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return lr;
        }
        self.wait = 0;
        let reduced = (lr * self.factor).max(self.min_lr);
        if reduced < lr {
            info!("reducing learning rate {lr:.2e} -> {reduced:.2e}");
        }
        reduced
    }
}

/// What the trainer does after an epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochAction<M> {
    /// Keep training at `lr`.
    Continue { lr: f64 },
    /// End the phase. `restore` is the lowest-val-loss snapshot, if any.
    Stop {
        restore: Option<M>,
        best_epoch: Option<usize>,
    },
}

/// Early stopping and the plateau schedule for one phase, plus the weight
/// snapshot early stopping restores. Build a new one per phase.
#[derive(Clone, Debug)]
pub struct PhaseCallbacks<M> {
    early_stopping: EarlyStopping,
    plateau: ReduceLrOnPlateau,
    best_weights: Option<M>,
}

impl<M: Clone> PhaseCallbacks<M> {
    pub fn new(early_stopping: EarlyStopping, plateau: ReduceLrOnPlateau) -> Self {
        Self {
            early_stopping,
            plateau,
            best_weights: None,
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, val_loss: f64, lr: f64, model: &M) -> EpochAction<M> {
        match self.early_stopping.on_epoch_end(epoch, val_loss) {
            StopDecision::Improved => self.best_weights = Some(model.clone()),
            StopDecision::Continue => {}
            StopDecision::Stop => {
                return EpochAction::Stop {
                    restore: self.best_weights.take(),
                    best_epoch: self.early_stopping.best_epoch(),
                }
            }
        }
        EpochAction::Continue {
            lr: self.plateau.on_epoch_end(val_loss, lr),
        }
    }
}

/// Tracks the best validation accuracy; the trainer saves on improvement.
///
/// Not reset between phases.
#[derive(Clone, Debug)]
pub struct BestCheckpoint {
    best: f64,
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self {
            best: f64::NEG_INFINITY,
        }
    }
}

impl BestCheckpoint {
    pub fn best(&self) -> Option<f64> {
        self.best.is_finite().then_some(self.best)
    }

    /// True when `val_accuracy` beats every previous value.
    pub fn improved(&mut self, val_accuracy: f64) -> bool {
        if val_accuracy > self.best {
            self.best = val_accuracy;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut es = EarlyStopping::new(3, 0.0);
        assert_eq!(es.on_epoch_end(0, 1.0), StopDecision::Improved);
        assert_eq!(es.on_epoch_end(1, 0.9), StopDecision::Improved);
        assert_eq!(es.on_epoch_end(2, 0.9), StopDecision::Continue);
        assert_eq!(es.on_epoch_end(3, 0.95), StopDecision::Continue);
        assert_eq!(es.on_epoch_end(4, 0.91), StopDecision::Stop);
        assert_eq!(es.best_epoch(), Some(1));
        assert_eq!(es.best(), 0.9);
    }

    #[test]
    fn early_stopping_improvement_resets_wait() {
        let mut es = EarlyStopping::new(2, 0.0);
        es.on_epoch_end(0, 1.0);
        assert_eq!(es.on_epoch_end(1, 1.0), StopDecision::Continue);
        assert_eq!(es.on_epoch_end(2, 0.5), StopDecision::Improved);
        assert_eq!(es.on_epoch_end(3, 0.6), StopDecision::Continue);
        assert_eq!(es.on_epoch_end(4, 0.6), StopDecision::Stop);
    }

    #[test]
    fn early_stopping_nan_never_improves() {
        let mut es = EarlyStopping::new(1, 0.0);
        assert_eq!(es.on_epoch_end(0, f64::NAN), StopDecision::Stop);
        assert_eq!(es.best(), f64::INFINITY);
        assert_eq!(es.best_epoch(), None);
    }

    #[test]
    fn plateau_halves_after_patience() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 2);
        let mut lr = 1e-3;
        lr = plateau.on_epoch_end(1.0, lr);
        assert_eq!(lr, 1e-3);
        lr = plateau.on_epoch_end(0.99995, lr); // below min_delta
        assert_eq!(lr, 1e-3);
        lr = plateau.on_epoch_end(1.0, lr);
        assert_eq!(lr, 5e-4);
        // wait restarts after a reduction
        lr = plateau.on_epoch_end(1.0, lr);
        assert_eq!(lr, 5e-4);
        lr = plateau.on_epoch_end(1.0, lr);
        assert_eq!(lr, 2.5e-4);
    }

    #[test]
    fn plateau_zero_min_delta_counts_tiny_gains() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 1).with_min_delta(0.0);
        assert_eq!(plateau.on_epoch_end(0.1, 1.0), 1.0);
        assert_eq!(plateau.on_epoch_end(0.099_99, 1.0), 1.0);
        assert_eq!(plateau.on_epoch_end(0.099_99, 1.0), 0.5);
    }

    fn phase(patience: usize) -> PhaseCallbacks<usize> {
        PhaseCallbacks::new(EarlyStopping::new(patience, 0.0), ReduceLrOnPlateau::new(0.5, 2))
    }

    #[test]
    fn phase_stop_restores_lowest_loss_snapshot() {
        let mut callbacks = phase(5);
        let losses = [1.0, 0.8, 0.9, 0.85, 0.95, 0.9, 0.81];
        let mut lr = 1e-3;
        let mut outcome = None;
        // the snapshot is the epoch number it was taken at
        for (i, loss) in losses.into_iter().enumerate() {
            let epoch = i + 1;
            match callbacks.on_epoch_end(epoch, loss, lr, &epoch) {
                EpochAction::Continue { lr: next } => lr = next,
                stop => {
                    outcome = Some((epoch, stop));
                    break;
                }
            }
        }
        let (stopped_at, action) = outcome.unwrap();
        assert_eq!(stopped_at, 7);
        assert_eq!(
            action,
            EpochAction::Stop {
                restore: Some(2),
                best_epoch: Some(2)
            }
        );
        // halved after epochs 4 and 6
        assert_eq!(lr, 2.5e-4);
    }

    #[test]
    fn phase_stop_without_improvement_has_nothing_to_restore() {
        let mut callbacks = phase(1);
        assert_eq!(
            callbacks.on_epoch_end(1, f64::NAN, 1e-3, &1),
            EpochAction::Stop {
                restore: None,
                best_epoch: None
            }
        );
    }

    #[test]
    fn checkpoint_tracks_strict_improvement() {
        let mut ckpt = BestCheckpoint::default();
        assert_eq!(ckpt.best(), None);
        assert!(ckpt.improved(0.5));
        assert!(!ckpt.improved(0.5));
        assert!(ckpt.improved(0.75));
        assert!(!ckpt.improved(f64::NAN));
        assert_eq!(ckpt.best(), Some(0.75));
    }
}
