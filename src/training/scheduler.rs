// Copyright 2024 The GLiNER Rust Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::f64::consts::PI;

/// # Cosine learning rate schedule with linear warmup
/// Multiplicative factor applied to the base learning rates: linear increase from 0 to 1 over
/// the warmup steps, then half a cosine period down to 0 at the last step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineWithWarmup {
    warmup_steps: usize,
    total_steps: usize,
}

impl CosineWithWarmup {
    /// `warmup_ratio` below 1 is a fraction of `total_steps`, otherwise a number of steps.
    pub fn new(total_steps: usize, warmup_ratio: f64) -> CosineWithWarmup {
        let warmup_steps = if warmup_ratio < 1.0 {
            (total_steps as f64 * warmup_ratio.max(0.0)) as usize
        } else {
            warmup_ratio as usize
        };
        CosineWithWarmup {
            warmup_steps,
            total_steps,
        }
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn lr_factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let progress = (step - self.warmup_steps) as f64
            / self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn warmup_ratio_is_fraction_or_step_count() {
        assert_eq!(CosineWithWarmup::new(1000, 0.1).warmup_steps(), 100);
        assert_eq!(CosineWithWarmup::new(1000, 250.0).warmup_steps(), 250);
    }

    #[test]
    fn factor_rises_then_decays() {
        let schedule = CosineWithWarmup::new(100, 0.1);
        assert_eq!(schedule.lr_factor(0), 0.0);
        assert!((schedule.lr_factor(5) - 0.5).abs() < 1e-9);
        assert!((schedule.lr_factor(10) - 1.0).abs() < 1e-9);
        assert!((schedule.lr_factor(55) - 0.5).abs() < 1e-9);
        assert!(schedule.lr_factor(100).abs() < 1e-9);
        assert!(schedule.lr_factor(40) > schedule.lr_factor(70));
    }
}
