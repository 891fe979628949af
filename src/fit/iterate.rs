//! Sweep drivers.
//!
//! One `iterate()` call advances every running peak once. The original
//! strategy takes a single clamped Gauss-Newton step per peak and
//! recalculates errors in a second pass. The Levenberg-Marquardt strategy
//! wraps each peak's step in an inner accept/reject loop with multiplicative
//! trust adjustment; there is no hard retry cap, termination is bounded by
//! the damping blowing up.

use crate::fit::{solve_spd, FitState, Strategy};
use crate::model::PsfModel;
use crate::peak::PeakStatus;
use crate::trace::trace_span;
use crate::{LAMBDA_DOWN, LAMBDA_UP};

impl<M: PsfModel> FitState<M> {
    /// Runs one sweep over all peaks with the configured strategy.
    pub fn iterate(&mut self) {
        match self.config.strategy {
            Strategy::Original => self.iterate_original(),
            Strategy::LevenbergMarquardt => self.iterate_lm(),
        }
        self.emit_sweep_event();
    }

    fn iterate_original(&mut self) {
        let _span = trace_span!("iterate_original", peaks = self.peaks.len());
        for i in 0..self.peaks.len() {
            if self.peaks[i].status != PeakStatus::Running {
                continue;
            }
            self.update_peak_original(i);
        }
        for i in 0..self.peaks.len() {
            if self.peaks[i].status != PeakStatus::Running {
                continue;
            }
            if !self.recalc_error(i) {
                // Failed error calculation removes the peak for good.
                self.subtract_peak(i);
            }
        }
    }

    /// One clamped Gauss-Newton step: derivatives with the peak still in the
    /// buffers, subtract, solve, update, validate, re-add.
    fn update_peak_original(&mut self, index: usize) {
        self.clone_to_working(index);
        let (jacobian, hessian) = self.working_jacobian_hessian();
        self.subtract_working();
        self.diag.n_iterations += 1;

        let delta = match solve_spd(hessian, jacobian) {
            Some(delta) => delta,
            None => {
                self.diag.n_dposv += 1;
                self.working.status = PeakStatus::Error;
                self.commit_working(index);
                return;
            }
        };

        self.model.update_peak(&mut self.working, &delta);
        if !self.check_working() {
            // Peak stays subtracted.
            self.commit_working(index);
            return;
        }
        self.refresh_working_footprint();
        self.add_working();
        self.commit_working(index);
    }

    fn iterate_lm(&mut self) {
        let _span = trace_span!("iterate_lm", peaks = self.peaks.len());
        for i in 0..self.peaks.len() {
            if self.peaks[i].status != PeakStatus::Running {
                continue;
            }
            self.update_peak_lm(i);
        }
    }

    fn update_peak_lm(&mut self, index: usize) {
        self.clone_to_working(index);
        self.calc_error_working();
        let starting_error = self.working.error;
        let (jacobian, hessian) = self.working_jacobian_hessian();
        self.subtract_working();

        loop {
            // Status may hold a leftover from the previous attempt.
            self.working.status = PeakStatus::Running;
            self.diag.n_iterations += 1;

            let mut damped = hessian.clone();
            for d in 0..damped.nrows() {
                damped[(d, d)] *= 1.0 + self.working.lambda;
            }
            let delta = match solve_spd(damped, jacobian.clone()) {
                Some(delta) => delta,
                None => {
                    self.diag.n_dposv += 1;
                    self.working.status = PeakStatus::Error;
                    self.working.lambda *= LAMBDA_UP;
                    if !self.working.lambda.is_finite() {
                        break;
                    }
                    continue;
                }
            };

            self.model.update_peak(&mut self.working, &delta);
            if !self.check_working() {
                self.restore_working(index);
                if !self.working.lambda.is_finite() {
                    break;
                }
                continue;
            }

            self.refresh_working_footprint();
            self.add_working();

            if !self.calc_error_working() {
                self.subtract_working();
                self.restore_working(index);
                if !self.working.lambda.is_finite() {
                    break;
                }
                continue;
            }

            let current_error = self.working.error;
            if current_error > starting_error {
                // Usually the damping has grown so large that the peak barely
                // moved; treat a within-tolerance increase as converged.
                if (current_error - starting_error) / starting_error < self.config.tolerance {
                    self.working.status = PeakStatus::Converged;
                    break;
                }
                self.diag.n_non_decr += 1;
                self.subtract_working();
                self.restore_working(index);
                if !self.working.lambda.is_finite() {
                    break;
                }
                continue;
            }

            if (starting_error - current_error) / starting_error < self.config.tolerance {
                self.working.status = PeakStatus::Converged;
            } else {
                self.working.lambda *= LAMBDA_DOWN;
            }
            break;
        }

        self.commit_working(index);
    }
}
