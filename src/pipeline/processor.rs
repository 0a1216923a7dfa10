//! Raw-sample decoding, calibration and range-switch glitch suppression.
//!
//! Each packed sample carries a 14-bit current, a 14-bit voltage, the
//! current-range select and two sync bits. When the analog front end changes
//! current range, charge coupling distorts the surrounding samples for a few
//! microseconds; the processor buffers the affected window and repairs it
//! according to the configured [`SuppressMode`] before anything reaches the
//! downstream sink.

use crate::calibration::Calibration;

/// Hard cap on a suppression window; beyond it samples are flushed as NaN.
pub const SUPPRESS_SAMPLES_MAX: usize = 512;

/// Depth of the pre-transition history ring.
pub const SUPPRESS_HISTORY_MAX: usize = 8;

/// Synthetic current-range for the missing-sample sentinel.
pub const I_RANGE_MISSING: u8 = 8;

/// Annotation byte reported for samples dropped by the window clamp.
const BITS_OVERFLOW: u8 = 0xff;

/// Experimentally determined charge-coupling durations in samples at
/// 2 MSPS, indexed `[to][from]` by current-range select. The aggressive
/// profile.
pub const SUPPRESS_MATRIX_M: [[u8; 9]; 9] = [
    //  0  1  2  3  4  5  6  7  8    from this current select
    [0, 5, 5, 5, 5, 5, 6, 6, 0], // to 0
    [3, 0, 5, 5, 5, 6, 7, 8, 0], // to 1
    [4, 4, 0, 6, 6, 7, 7, 8, 0], // to 2
    [4, 4, 4, 0, 6, 6, 7, 7, 0], // to 3
    [4, 4, 4, 4, 0, 6, 7, 6, 0], // to 4
    [4, 4, 4, 4, 4, 0, 7, 6, 0], // to 5
    [4, 4, 4, 4, 4, 4, 0, 6, 0], // to 6
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 7 (off)
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 8 (missing)
];

/// Conservative profile: every non-zero window widened by two samples,
/// capped at the history depth. This is the default.
pub const SUPPRESS_MATRIX_N: [[u8; 9]; 9] = [
    //  0  1  2  3  4  5  6  7  8    from this current select
    [0, 7, 7, 7, 7, 7, 8, 8, 0], // to 0
    [5, 0, 7, 7, 7, 8, 8, 8, 0], // to 1
    [6, 6, 0, 8, 8, 8, 8, 8, 0], // to 2
    [6, 6, 6, 0, 8, 8, 8, 8, 0], // to 3
    [6, 6, 6, 6, 0, 8, 8, 8, 0], // to 4
    [6, 6, 6, 6, 6, 0, 8, 8, 0], // to 5
    [6, 6, 6, 6, 6, 6, 0, 8, 0], // to 6
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 7 (off)
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 8 (missing)
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressMode {
    /// Emit every sample as calibrated, glitches included.
    Off,
    /// Blank the window with NaN, keeping each sample's annotation.
    Nan,
    /// Replace window currents with the mean of pre-history and post tail.
    Mean,
    /// Interpolate window currents from the last good value to the settled
    /// post-transition value.
    Interp,
}

/// Downstream consumer of calibrated samples.
///
/// `bits` packs the annotation byte: bits 3:0 current range, bit 4 the
/// current LSB (GPI0), bit 5 the voltage LSB (GPI1).
pub trait SampleSink {
    fn emit(&mut self, cal_i: f32, cal_v: f32, bits: u8);
}

pub struct RawProcessor {
    cal: Calibration,
    mode: SuppressMode,
    samples_pre: usize,
    samples_post: usize,
    /// Fixed window length; `None` consults the charge-coupling table.
    window_override: Option<u8>,
    window: &'static [[u8; 9]; 9],

    d_cal: [[f32; 2]; SUPPRESS_SAMPLES_MAX],
    d_bits: [u8; SUPPRESS_SAMPLES_MAX],
    d_history: [[f32; 2]; SUPPRESS_HISTORY_MAX],
    d_history_idx: usize,
    idx_out: usize,
    suppress_count: usize,
    i_range_last: u8,
    cal_i_pre: f32,

    sample_toggle_last: u16,
    sample_toggle_mask: u16,
    voltage_range: usize,
    is_skipping: bool,

    pub sample_count: u64,
    pub sample_missing_count: u64,
    pub skip_count: u64,
    pub sample_sync_count: u64,
    pub contiguous_count: u64,
}

impl Default for RawProcessor {
    fn default() -> Self {
        Self::new(SuppressMode::Mean)
    }
}

impl RawProcessor {
    pub fn new(mode: SuppressMode) -> Self {
        let mut processor = Self {
            cal: Calibration::default(),
            mode,
            samples_pre: 2,
            samples_post: 2,
            window_override: None,
            window: &SUPPRESS_MATRIX_N,
            d_cal: [[0.0; 2]; SUPPRESS_SAMPLES_MAX],
            d_bits: [0; SUPPRESS_SAMPLES_MAX],
            d_history: [[0.0; 2]; SUPPRESS_HISTORY_MAX],
            d_history_idx: 0,
            idx_out: 0,
            suppress_count: 0,
            i_range_last: 7,
            cal_i_pre: f32::NAN,
            sample_toggle_last: 0,
            sample_toggle_mask: 0,
            voltage_range: 0,
            is_skipping: true,
            sample_count: 0,
            sample_missing_count: 0,
            skip_count: 0,
            sample_sync_count: 0,
            contiguous_count: 0,
        };
        processor.reset();
        processor
    }

    pub fn reset(&mut self) {
        self.sample_count = 0;
        self.sample_missing_count = 0;
        self.skip_count = 0;
        self.sample_sync_count = 0;
        self.contiguous_count = 0;
        self.is_skipping = true;
        self.suppress_count = 0;
        self.i_range_last = 7;
        self.cal_i_pre = f32::NAN;
        self.sample_toggle_last = 0;
        self.sample_toggle_mask = 0;
        self.idx_out = 0;
        self.d_history = [[0.0; 2]; SUPPRESS_HISTORY_MAX];
        self.d_history_idx = 0;
    }

    pub fn set_calibration(&mut self, mut cal: Calibration) {
        cal.normalize();
        self.cal = cal;
    }

    pub fn set_suppress_options(
        &mut self,
        samples_pre: usize,
        samples_post: usize,
        window_override: Option<u8>,
    ) {
        self.samples_pre = samples_pre.min(SUPPRESS_HISTORY_MAX);
        self.samples_post = samples_post;
        self.window_override = window_override;
    }

    /// Decode, calibrate and emit one raw sample.
    pub fn process(&mut self, raw_i: u16, raw_v: u16, sink: &mut dyn SampleSink) {
        let mut is_missing = false;
        let i_range: u8;
        if raw_i == 0xffff && raw_v == 0xffff {
            is_missing = true;
            i_range = I_RANGE_MISSING;
            self.sample_missing_count += 1;
            self.contiguous_count = 0;
            if !self.is_skipping {
                self.skip_count += 1;
                self.is_skipping = true;
            }
        } else {
            i_range = ((raw_i & 0x0003) as u8) | (((raw_v & 0x0001) as u8) << 2);
            self.is_skipping = false;
            self.contiguous_count += 1;
        }
        let bits =
            (i_range & 0x0f) | (((raw_i & 0x0004) as u8) << 2) | (((raw_v & 0x0004) as u8) << 3);

        // A range change opens (or extends) a suppression window.
        if i_range != self.i_range_last && self.mode != SuppressMode::Off {
            let mut window = self.window[i_range as usize][self.i_range_last as usize];
            if window != 0 {
                if let Some(fixed) = self.window_override {
                    window = fixed;
                }
                let idx = self.idx_out + window as usize + self.samples_post;
                if idx > self.suppress_count {
                    self.suppress_count = idx;
                }
            }
        }

        let sample_toggle_current = (raw_v >> 1) & 0x1;
        let raw_i = raw_i >> 2;
        let raw_v = raw_v >> 2;
        let sync_miss = (sample_toggle_current ^ self.sample_toggle_last ^ 1) & self.sample_toggle_mask;
        if sync_miss != 0 && !is_missing {
            self.skip_count += 1;
            self.is_skipping = true;
            self.sample_sync_count += 1;
        }
        self.sample_toggle_last = sample_toggle_current;
        self.sample_toggle_mask = 0x1;

        let (cal_i, cal_v);
        if i_range > 7 {
            cal_i = f32::NAN;
            cal_v = f32::NAN;
        } else {
            let range = i_range as usize;
            cal_i = (raw_i as f32 + self.cal.current_offset[range]) * self.cal.current_gain[range];
            cal_v = (raw_v as f32 + self.cal.voltage_offset[self.voltage_range])
                * self.cal.voltage_gain[self.voltage_range];
        }

        if self.idx_out < SUPPRESS_SAMPLES_MAX {
            self.d_bits[self.idx_out] = bits;
            self.d_cal[self.idx_out] = [cal_i, cal_v];
        }

        if self.suppress_count > 0 {
            if self.suppress_count == 1 {
                self.close_window(cal_i, sink);
            } else {
                // Defer output until the window settles.
                self.idx_out += 1;
            }
            self.suppress_count -= 1;
        } else {
            self.history_insert(cal_i, cal_v);
            self.sample_count += 1;
            self.cal_i_pre = cal_i;
            sink.emit(cal_i, cal_v, bits);
            self.idx_out = 0;
        }
        self.i_range_last = i_range;
    }

    /// The window's final sample arrived; repair and flush the buffer.
    fn close_window(&mut self, cal_i_now: f32, sink: &mut dyn SampleSink) {
        if self.idx_out >= SUPPRESS_SAMPLES_MAX {
            log::warn!(
                "suppression window of {} samples exceeds the {SUPPRESS_SAMPLES_MAX}-sample buffer",
                self.idx_out + 1
            );
            while self.idx_out >= SUPPRESS_SAMPLES_MAX {
                self.sample_count += 1;
                sink.emit(f32::NAN, f32::NAN, BITS_OVERFLOW);
                self.idx_out -= 1;
            }
        }
        let total = self.idx_out + 1;
        let body = total.saturating_sub(self.samples_post);
        match self.mode {
            SuppressMode::Mean => {
                let mut acc = 0.0f32;
                let mut count = 0usize;
                let mut idx = (self.d_history_idx + SUPPRESS_HISTORY_MAX - self.samples_pre)
                    % SUPPRESS_HISTORY_MAX;
                for _ in 0..self.samples_pre {
                    let value = self.d_history[idx][0];
                    if value.is_finite() {
                        acc += value;
                        count += 1;
                    }
                    idx = (idx + 1) % SUPPRESS_HISTORY_MAX;
                }
                for idx in body..total {
                    acc += self.d_cal[idx][0];
                    count += 1;
                }
                let mean = if count > 0 { acc / count as f32 } else { 0.0 };
                for idx in 0..body {
                    self.sample_count += 1;
                    let cal_v = self.d_cal[idx][1];
                    sink.emit(mean, cal_v, self.d_bits[idx]);
                    self.history_insert(mean, cal_v);
                }
            }
            SuppressMode::Nan => {
                for idx in 0..body {
                    self.sample_count += 1;
                    sink.emit(f32::NAN, f32::NAN, self.d_bits[idx]);
                }
            }
            SuppressMode::Off => {
                // Unreachable through `process`, which never opens a window
                // in this mode; kept for parity with the repair table.
                for idx in 0..body {
                    self.sample_count += 1;
                    sink.emit(self.d_cal[idx][0], self.d_cal[idx][1], self.d_bits[idx]);
                    self.history_insert(self.d_cal[idx][0], self.d_cal[idx][1]);
                }
            }
            SuppressMode::Interp => {
                let y1 = cal_i_now;
                let y0 = if self.cal_i_pre.is_finite() {
                    self.cal_i_pre
                } else {
                    y1
                };
                let step = if body > 0 { (y1 - y0) / body as f32 } else { 0.0 };
                let mut y = y0;
                for idx in 0..body {
                    y += step;
                    self.sample_count += 1;
                    let cal_v = self.d_cal[idx][1];
                    sink.emit(y, cal_v, self.d_bits[idx]);
                    self.history_insert(y, cal_v);
                }
                self.cal_i_pre = y1;
            }
        }
        // The post tail passes through untouched.
        for idx in body..total {
            self.sample_count += 1;
            sink.emit(self.d_cal[idx][0], self.d_cal[idx][1], self.d_bits[idx]);
            self.history_insert(self.d_cal[idx][0], self.d_cal[idx][1]);
        }
        self.idx_out = 0;
    }

    fn history_insert(&mut self, cal_i: f32, cal_v: f32) {
        self.d_history[self.d_history_idx] = [cal_i, cal_v];
        self.d_history_idx = (self.d_history_idx + 1) % SUPPRESS_HISTORY_MAX;
    }
}
