//! Multi-channel coupled fitting.
//!
//! [`MultiChannelFit`] drives C single-channel fit states in lockstep. Each
//! group of C peaks (one per channel) represents a single emitter seen
//! through affine-mapped views: x, y, z and optionally height are shared
//! across the group after mapping, backgrounds float per channel, and any
//! channel's failure fails the whole group.
//!
//! The affine mappings store their coefficients in `(y, x)` order, so the
//! x/y roles read as transposed wherever a transform is applied. This
//! matches the calibration data layout and is applied literally.

use nalgebra::DVector;

use crate::fit::{solve_spd, FitState, Strategy};
use crate::model::PsfModel;
use crate::peak::{param, PeakResult, PeakSeed, PeakStatus};
use crate::trace::{trace_event, trace_span};
use crate::util::{PsfFitError, PsfFitResult};
use crate::{LAMBDA_DOWN, LAMBDA_UP};

const COUPLED_PARAMS: [usize; 5] = [
    param::HEIGHT,
    param::XCENTER,
    param::YCENTER,
    param::ZCENTER,
    param::BACKGROUND,
];

/// z-dependent per-parameter channel weights.
///
/// Each table is `n_weights * n_channels` with z as the slow axis. The
/// background table is carried for interface parity even though backgrounds
/// currently float independently per channel.
#[derive(Clone, Debug)]
pub struct ChannelWeights {
    /// Background weights.
    pub w_bg: Vec<f64>,
    /// Height weights.
    pub w_h: Vec<f64>,
    /// x weights.
    pub w_x: Vec<f64>,
    /// y weights.
    pub w_y: Vec<f64>,
    /// z weights.
    pub w_z: Vec<f64>,
    /// Number of z samples per table.
    pub n_weights: usize,
}

impl ChannelWeights {
    /// Uniform weights with a single z sample, the coordinator default.
    pub fn uniform(n_channels: usize) -> Self {
        Self {
            w_bg: vec![1.0; n_channels],
            w_h: vec![1.0; n_channels],
            w_x: vec![1.0; n_channels],
            w_y: vec![1.0; n_channels],
            w_z: vec![1.0; n_channels],
            n_weights: 1,
        }
    }
}

/// Coupled fitter over C image planes.
pub struct MultiChannelFit<M> {
    channels: Vec<FitState<M>>,
    n_fit: usize,
    independent_heights: bool,
    tolerance: f64,
    strategy: Strategy,
    xt_0ton: Vec<f64>,
    yt_0ton: Vec<f64>,
    xt_nto0: Vec<f64>,
    yt_nto0: Vec<f64>,
    weights: ChannelWeights,
    w_z_offset: f64,
    w_z_scale: f64,
    heights: Vec<f64>,
}

impl<M: PsfModel> MultiChannelFit<M> {
    /// Couples the given channels.
    ///
    /// All channels must share image dimensions, and every channel model
    /// must fit the `(height, x, y, z, background)` parameter set so the
    /// coordinated update knows what each Jacobian slot means. Transforms
    /// default to identity and weights to uniform; tolerance and strategy
    /// are taken from channel 0.
    ///
    /// With `independent_heights` each channel fits its own height
    /// (two-color data); otherwise heights are coupled through a weighted
    /// average (single-species multi-plane data).
    pub fn new(channels: Vec<FitState<M>>, independent_heights: bool) -> PsfFitResult<Self> {
        if channels.is_empty() {
            return Err(PsfFitError::InvalidInput("at least one channel is required"));
        }
        let width = channels[0].image.width();
        let height = channels[0].image.height();
        for ch in &channels[1..] {
            if ch.image.width() != width || ch.image.height() != height {
                return Err(PsfFitError::InvalidInput(
                    "all channels must share image dimensions",
                ));
            }
        }
        for ch in &channels {
            if ch.model.jacobian_params() != COUPLED_PARAMS.as_slice() {
                return Err(PsfFitError::InvalidInput(
                    "channel models must fit height, x, y, z and background",
                ));
            }
        }

        let nc = channels.len();
        let tolerance = channels[0].tolerance();
        let strategy = channels[0].config.strategy;

        // Identity in the (y, x) coefficient convention.
        let mut xt_id = Vec::with_capacity(3 * nc);
        let mut yt_id = Vec::with_capacity(3 * nc);
        for _ in 0..nc {
            xt_id.extend_from_slice(&[0.0, 1.0, 0.0]);
            yt_id.extend_from_slice(&[0.0, 0.0, 1.0]);
        }

        Ok(Self {
            channels,
            n_fit: 0,
            independent_heights,
            tolerance,
            strategy,
            xt_0ton: xt_id.clone(),
            yt_0ton: yt_id.clone(),
            xt_nto0: xt_id,
            yt_nto0: yt_id,
            weights: ChannelWeights::uniform(nc),
            w_z_offset: 0.0,
            w_z_scale: 0.0,
            heights: vec![1.0; nc],
        })
    }

    /// Number of channels.
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Peaks per channel.
    pub fn n_fit(&self) -> usize {
        self.n_fit
    }

    /// Read access to one channel's fit state.
    pub fn channel(&self, index: usize) -> &FitState<M> {
        &self.channels[index]
    }

    /// Current per-channel height weighting factors.
    pub fn heights(&self) -> &[f64] {
        &self.heights
    }

    /// The active weight tables.
    pub fn weights(&self) -> &ChannelWeights {
        &self.weights
    }

    /// Sets the channel-pair affine transforms.
    ///
    /// Each slice holds `3 * n_channels` coefficients `(a0, a1, a2)` applied
    /// as `a0 + a1*y + a2*x`; channel 0 entries must be the identity.
    pub fn set_transforms(
        &mut self,
        xt_0ton: &[f64],
        yt_0ton: &[f64],
        xt_nto0: &[f64],
        yt_nto0: &[f64],
    ) -> PsfFitResult<()> {
        let expected = 3 * self.channels.len();
        for (slice, context) in [
            (xt_0ton, "xt_0toN transform"),
            (yt_0ton, "yt_0toN transform"),
            (xt_nto0, "xt_Nto0 transform"),
            (yt_nto0, "yt_Nto0 transform"),
        ] {
            if slice.len() != expected {
                return Err(PsfFitError::SizeMismatch {
                    context,
                    expected,
                    got: slice.len(),
                });
            }
        }
        self.xt_0ton = xt_0ton.to_vec();
        self.yt_0ton = yt_0ton.to_vec();
        self.xt_nto0 = xt_nto0.to_vec();
        self.yt_nto0 = yt_nto0.to_vec();
        Ok(())
    }

    /// Sets the z-dependent parameter weighting tables.
    pub fn set_weights(&mut self, weights: ChannelWeights) -> PsfFitResult<()> {
        if weights.n_weights == 0 {
            return Err(PsfFitError::InvalidInput("at least one weight sample is required"));
        }
        let expected = weights.n_weights * self.channels.len();
        for (len, context) in [
            (weights.w_bg.len(), "w_bg weights"),
            (weights.w_h.len(), "w_h weights"),
            (weights.w_x.len(), "w_x weights"),
            (weights.w_y.len(), "w_y weights"),
            (weights.w_z.len(), "w_z weights"),
        ] {
            if len != expected {
                return Err(PsfFitError::SizeMismatch {
                    context,
                    expected,
                    got: len,
                });
            }
        }
        self.weights = weights;
        for h in &mut self.heights {
            *h = 1.0;
        }
        Ok(())
    }

    /// Sets the scale and offset mapping a peak z to a weight-table index.
    pub fn set_weight_indexing(&mut self, z_offset: f64, z_scale: f64) {
        self.w_z_offset = z_offset;
        self.w_z_scale = z_scale;
    }

    /// Maps a channel-0 position into channel `index`.
    pub fn map_to_channel(&self, index: usize, tx: f64, ty: f64) -> (f64, f64) {
        let m = index * 3;
        let mx = self.yt_0ton[m] + ty * self.yt_0ton[m + 1] + tx * self.yt_0ton[m + 2];
        let my = self.xt_0ton[m] + ty * self.xt_0ton[m + 1] + tx * self.xt_0ton[m + 2];
        (mx, my)
    }

    fn weight_index(&self, z: f64) -> usize {
        // Truncation toward zero, then clamping, matching the calibration
        // data convention.
        let zi = (self.w_z_scale * (z - self.w_z_offset)) as i64;
        zi.clamp(0, self.weights.n_weights as i64 - 1) as usize
    }

    /// Seeds one group per entry, mapping channel-0 positions into every
    /// other channel.
    ///
    /// In fixed-heights mode each group's heights are averaged and reset to
    /// the mean. A group with any channel out of bounds is failed whole,
    /// with already-added members subtracted back out.
    pub fn new_peaks(&mut self, seeds: &[PeakSeed]) -> PsfFitResult<()> {
        let _span = trace_span!("mp_new_peaks", count = seeds.len());
        for k in 0..self.channels.len() {
            if k == 0 {
                self.channels[0].new_peaks(seeds)?;
            } else {
                let mapped: Vec<PeakSeed> = seeds
                    .iter()
                    .map(|seed| {
                        let (mx, my) = self.map_to_channel(k, seed.x_center, seed.y_center);
                        PeakSeed {
                            x_center: mx,
                            y_center: my,
                            ..*seed
                        }
                    })
                    .collect();
                self.channels[k].new_peaks(&mapped)?;
            }
        }
        self.n_fit = seeds.len();
        for h in &mut self.heights {
            *h = 1.0;
        }
        if !self.independent_heights {
            for i in 0..self.n_fit {
                self.reset_group_height(i);
            }
        }
        self.sync_seed_status();
        Ok(())
    }

    /// Averages a fresh group's heights across channels and recomputes the
    /// member errors at the shared height.
    fn reset_group_height(&mut self, index: usize) {
        let nc = self.channels.len();
        let mut height = 0.0;
        for ch in &self.channels {
            height += ch.peaks[index].params[param::HEIGHT];
        }
        height /= nc as f64;

        for k in 0..nc {
            let live = !matches!(
                self.channels[k].peaks[index].status,
                PeakStatus::Error | PeakStatus::BadPeak
            );
            if live {
                self.channels[k].subtract_peak(index);
            }
            self.channels[k].peaks[index].params[param::HEIGHT] = height;
            if live {
                self.channels[k].add_peak(index);
                self.channels[k].recalc_error(index);
            }
        }
    }

    /// Fails every group that has a failed member, subtracting survivors.
    fn sync_seed_status(&mut self) {
        for i in 0..self.n_fit {
            let any_bad = self.channels.iter().any(|ch| {
                matches!(ch.peaks[i].status, PeakStatus::Error | PeakStatus::BadPeak)
            });
            if !any_bad {
                continue;
            }
            for ch in &mut self.channels {
                if !matches!(ch.peaks[i].status, PeakStatus::Error | PeakStatus::BadPeak) {
                    ch.subtract_peak(i);
                }
                ch.peaks[i].status = PeakStatus::Error;
            }
        }
    }

    /// Number of groups still running.
    pub fn unconverged(&self) -> usize {
        self.channels[0].unconverged()
    }

    /// Committed results for one channel, in seed order.
    pub fn results(&self, channel: usize) -> Vec<PeakResult> {
        self.channels[channel].results()
    }

    /// Runs one sweep over all groups with channel 0's strategy.
    pub fn iterate(&mut self) {
        match self.strategy {
            Strategy::Original => self.iterate_original(),
            Strategy::LevenbergMarquardt => self.iterate_lm(),
        }
        trace_event!("mp_sweep", unconverged = self.unconverged());
    }

    fn iterate_lm(&mut self) {
        let _span = trace_span!("mp_iterate_lm", groups = self.n_fit);
        let nc = self.channels.len();
        for i in 0..self.n_fit {
            if self.channels[0].peaks[i].status != PeakStatus::Running {
                continue;
            }

            // Copy, take derivatives and subtract in every channel before
            // any solving; the group advances or retries as one.
            let mut starting_error = 0.0;
            let mut jacobians = Vec::with_capacity(nc);
            let mut hessians = Vec::with_capacity(nc);
            for ch in &mut self.channels {
                ch.clone_to_working(i);
                ch.calc_error_working();
                starting_error += ch.working.error;
                let (jac, hess) = ch.working_jacobian_hessian();
                jacobians.push(jac);
                hessians.push(hess);
                ch.subtract_working();
            }

            loop {
                for ch in &mut self.channels {
                    ch.working.status = PeakStatus::Running;
                }

                let mut deltas = Vec::with_capacity(nc);
                let mut solved = true;
                for k in 0..nc {
                    let ch = &mut self.channels[k];
                    ch.diag.n_iterations += 1;
                    let mut damped = hessians[k].clone();
                    for d in 0..damped.nrows() {
                        damped[(d, d)] *= 1.0 + ch.working.lambda;
                    }
                    match solve_spd(damped, jacobians[k].clone()) {
                        Some(delta) => deltas.push(delta),
                        None => {
                            ch.diag.n_dposv += 1;
                            solved = false;
                            break;
                        }
                    }
                }
                if !solved {
                    for ch in &mut self.channels {
                        ch.working.status = PeakStatus::Error;
                        ch.working.lambda *= LAMBDA_UP;
                    }
                    if !self.channels[0].working.lambda.is_finite() {
                        break;
                    }
                    continue;
                }

                self.coordinator_update(&deltas);

                let mut ok = true;
                for k in 0..nc {
                    if !self.channels[k].check_working() {
                        ok = false;
                    }
                }
                if !ok {
                    self.restore_working_group(i);
                    if !self.channels[0].working.lambda.is_finite() {
                        break;
                    }
                    continue;
                }

                for ch in &mut self.channels {
                    ch.refresh_working_footprint();
                    ch.add_working();
                }

                let mut current_error = 0.0;
                let mut error_ok = true;
                for ch in &mut self.channels {
                    if ch.calc_error_working() {
                        current_error += ch.working.error;
                    } else {
                        error_ok = false;
                    }
                }
                if !error_ok {
                    for ch in &mut self.channels {
                        ch.subtract_working();
                    }
                    self.restore_working_group(i);
                    if !self.channels[0].working.lambda.is_finite() {
                        break;
                    }
                    continue;
                }

                if current_error > starting_error {
                    if (current_error - starting_error) / starting_error < self.tolerance {
                        for ch in &mut self.channels {
                            ch.working.status = PeakStatus::Converged;
                        }
                        break;
                    }
                    for ch in &mut self.channels {
                        ch.diag.n_non_decr += 1;
                        ch.subtract_working();
                    }
                    self.restore_working_group(i);
                    if !self.channels[0].working.lambda.is_finite() {
                        break;
                    }
                    continue;
                }

                if (starting_error - current_error) / starting_error < self.tolerance {
                    for ch in &mut self.channels {
                        ch.working.status = PeakStatus::Converged;
                    }
                } else {
                    for ch in &mut self.channels {
                        ch.working.lambda *= LAMBDA_DOWN;
                    }
                }
                break;
            }

            let status = self.channels[0].working.status;
            for ch in &mut self.channels {
                ch.working.status = status;
                ch.commit_working(i);
            }
        }
    }

    fn iterate_original(&mut self) {
        let _span = trace_span!("mp_iterate_original", groups = self.n_fit);
        let nc = self.channels.len();
        for i in 0..self.n_fit {
            if self.channels[0].peaks[i].status != PeakStatus::Running {
                continue;
            }

            let mut systems = Vec::with_capacity(nc);
            for ch in &mut self.channels {
                ch.clone_to_working(i);
                systems.push(ch.working_jacobian_hessian());
                ch.subtract_working();
                ch.diag.n_iterations += 1;
            }

            let mut deltas = Vec::with_capacity(nc);
            let mut solved = true;
            for (k, (jacobian, hessian)) in systems.into_iter().enumerate() {
                match solve_spd(hessian, jacobian) {
                    Some(delta) => deltas.push(delta),
                    None => {
                        self.channels[k].diag.n_dposv += 1;
                        solved = false;
                        break;
                    }
                }
            }
            if !solved {
                self.fail_working_group(i);
                continue;
            }

            self.coordinator_update(&deltas);

            let mut ok = true;
            for k in 0..nc {
                if !self.channels[k].check_working() {
                    ok = false;
                }
            }
            if !ok {
                self.fail_working_group(i);
                continue;
            }

            for ch in &mut self.channels {
                ch.refresh_working_footprint();
                ch.add_working();
                ch.commit_working(i);
            }
        }

        // Error pass: a group converges or fails as one.
        for i in 0..self.n_fit {
            if self.channels[0].peaks[i].status != PeakStatus::Running {
                continue;
            }

            let mut any_bad = false;
            let mut all_converged = true;
            for ch in &mut self.channels {
                if !ch.recalc_error(i) {
                    any_bad = true;
                }
                if ch.peaks[i].status != PeakStatus::Converged {
                    all_converged = false;
                }
            }
            if !all_converged {
                for ch in &mut self.channels {
                    ch.peaks[i].status = PeakStatus::Running;
                }
            }
            if any_bad {
                for ch in &mut self.channels {
                    ch.subtract_peak(i);
                    ch.peaks[i].status = PeakStatus::Error;
                }
            }
        }
    }

    /// Commits the whole group as failed; members are already subtracted.
    fn fail_working_group(&mut self, index: usize) {
        for ch in &mut self.channels {
            ch.working.status = PeakStatus::Error;
            ch.commit_working(index);
        }
    }

    fn restore_working_group(&mut self, index: usize) {
        for ch in &mut self.channels {
            ch.restore_working(index);
        }
    }

    /// Applies the solved per-channel deltas as one coupled update.
    ///
    /// x and y deltas are mapped into channel 0's frame, averaged with the
    /// z-indexed weights, applied to channel 0 and projected back out. z is
    /// a weighted average applied everywhere; backgrounds are independent;
    /// heights depend on the coupling mode.
    fn coordinator_update(&mut self, deltas: &[DVector<f64>]) {
        let nc = self.channels.len();
        let zi = self.weight_index(self.channels[0].working.params[param::ZCENTER]);

        if self.independent_heights {
            for k in 0..nc {
                let working = &mut self.channels[k].working;
                working.update_param(deltas[k][0], param::HEIGHT);
                if working.params[param::HEIGHT] < 0.01 {
                    working.params[param::HEIGHT] = 0.01;
                }
                self.heights[k] = self.channels[k].working.params[param::HEIGHT];
            }
        } else {
            let mut p_ave = 0.0;
            let mut p_total = 0.0;
            for k in 0..nc {
                p_ave += deltas[k][0] * self.weights.w_h[zi * nc + k];
                p_total += self.weights.w_h[zi * nc + k];
            }
            self.channels[0]
                .working
                .update_param(p_ave / p_total, param::HEIGHT);
            let h0 = self.channels[0].working.params[param::HEIGHT];
            for k in 1..nc {
                self.channels[k].working.params[param::HEIGHT] = h0;
            }
        }

        // x and y deltas, transposed relative to the mapping convention.
        let mut p_ave = 0.0;
        let mut p_total = 0.0;
        for k in 0..nc {
            let delta =
                self.yt_nto0[k * 3 + 1] * deltas[k][2] + self.yt_nto0[k * 3 + 2] * deltas[k][1];
            let weight = self.weights.w_x[zi * nc + k] * self.heights[k];
            p_ave += delta * weight;
            p_total += weight;
        }
        self.channels[0]
            .working
            .update_param(p_ave / p_total, param::XCENTER);

        let mut p_ave = 0.0;
        let mut p_total = 0.0;
        for k in 0..nc {
            let delta =
                self.xt_nto0[k * 3 + 1] * deltas[k][2] + self.xt_nto0[k * 3 + 2] * deltas[k][1];
            let weight = self.weights.w_y[zi * nc + k] * self.heights[k];
            p_ave += delta * weight;
            p_total += weight;
        }
        self.channels[0]
            .working
            .update_param(p_ave / p_total, param::YCENTER);

        // Project channel 0's new position into the other channels.
        let x0 = self.channels[0].working.params[param::XCENTER];
        let y0 = self.channels[0].working.params[param::YCENTER];
        for k in 1..nc {
            let m = k * 3;
            let tx = self.yt_0ton[m] + self.yt_0ton[m + 1] * y0 + self.yt_0ton[m + 2] * x0;
            let ty = self.xt_0ton[m] + self.xt_0ton[m + 1] * y0 + self.xt_0ton[m + 2] * x0;
            let working = &mut self.channels[k].working;
            working.params[param::XCENTER] = tx;
            working.params[param::YCENTER] = ty;
        }

        for ch in &mut self.channels {
            ch.working.settle_anchor_rounded();
        }

        // z is a plain weighted average, clamped per channel.
        let mut p_ave = 0.0;
        let mut p_total = 0.0;
        for k in 0..nc {
            let weight = self.weights.w_z[zi * nc + k] * self.heights[k];
            p_ave += deltas[k][3] * weight;
            p_total += weight;
        }
        let dz = p_ave / p_total;
        for ch in &mut self.channels {
            ch.working.update_param(dz, param::ZCENTER);
            ch.model.check_z_range(&mut ch.working);
        }

        for k in 0..nc {
            self.channels[k]
                .working
                .update_param(deltas[k][4], param::BACKGROUND);
        }
    }
}
