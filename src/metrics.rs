//! Running metrics reset at every epoch.

use candle_core::{DType, Result, Tensor, D};

/// The running mean of the values it has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mean {
    total: f64,
    count: usize,
}

impl Mean {
    /// Add a value.
    pub fn update(&mut self, value: f32) {
        self.total += value as f64;
        self.count += 1;
    }

    /// The mean so far, `0` before any update.
    pub fn result(&self) -> f32 {
        if self.count == 0 {
            return 0.;
        }
        (self.total / self.count as f64) as f32
    }

    /// Forget every value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The fraction of predictions whose arg max matches an integer label.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SparseCategoricalAccuracy {
    correct: usize,
    total: usize,
}

impl SparseCategoricalAccuracy {
    /// Count a batch of `(N,)` `u32` labels against `(N, classes)` scores.
    pub fn update(&mut self, labels: &Tensor, scores: &Tensor) -> Result<()> {
        let correct = scores
            .argmax(D::Minus1)?
            .eq(labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;
        self.correct += correct as usize;
        self.total += labels.dims1()?;
        Ok(())
    }

    /// The number of correct predictions so far.
    pub fn correct(&self) -> usize {
        self.correct
    }

    /// The number of predictions so far.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The accuracy so far in `[0, 1]`, `0` before any update.
    pub fn result(&self) -> f32 {
        if self.total == 0 {
            return 0.;
        }
        self.correct as f32 / self.total as f32
    }

    /// Forget every prediction.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
