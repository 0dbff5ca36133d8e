//! Motion planning for fly scans.
//!
//! Pure computation. Given the requested angular range, the frame time and the
//! controller constants, [`plan`] produces a [`MotionPlan`]: an encoder-quantized
//! step, the constant rotation speed, and taxi positions far enough outside the
//! data range that the stage is at speed before the first trigger and after the
//! last one.
//!
//! # Quantization
//!
//! The PSO pulse generator counts whole encoder ticks, so the angular step is
//! rounded to the nearest integer number of counts (ties to even). When that
//! moves the step by more than `1e-4` counts a warning is logged; the corrected
//! step is what every downstream consumer must use.
//!
//! # Taxi distance
//!
//! `taxi = ceil(accel_dist / |step| + 0.5) · |step|` with
//! `accel_dist = accel_time / 2 · motor_speed`, i.e. an integer number of steps
//! that always covers the acceleration ramp plus half a step.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};

/// Difference between raw and quantized counts that is reported.
pub const QUANTIZATION_TOLERANCE: f64 = 1e-4;

/// Inputs of one planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionRequest {
    /// First projection angle, degrees
    pub rotation_start: f64,
    /// Requested angular step, degrees, signed
    pub rotation_step: f64,
    /// Number of projections
    pub num_angles: u32,
    /// Seconds between triggers, readout margin included
    pub frame_time: f64,
    /// Encoder counts per full rotation; a negative value means the encoder
    /// counts down while the motor moves positive
    pub counts_per_rotation: f64,
    /// Motor acceleration time, seconds
    pub accel_time: f64,
    /// Motor record `DIR` field: 0 = Pos, anything else = Neg
    pub motor_direction: i64,
}

/// Direction signs that combine into the PSO window orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Senses {
    /// +1 when the scan moves toward larger user angles
    pub user_direction: f64,
    /// +1 unless the motor record direction is inverted
    pub motor_polarity: f64,
    /// Sign of the counts per rotation
    pub encoder_polarity: f64,
}

impl Senses {
    /// Product of the three signs: the direction encoder counts move during the scan.
    pub fn overall(&self) -> f64 {
        self.user_direction * self.motor_polarity * self.encoder_polarity
    }
}

/// Result of [`plan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionPlan {
    /// First projection angle
    pub rotation_start: f64,
    /// Quantized step, signed like the request
    pub rotation_step: f64,
    /// Number of projections
    pub num_angles: u32,
    /// Last projection angle: `start + (n-1)·|step|·user_direction`
    pub rotation_stop: f64,
    /// Quantized counts per step, signed like step × counts_per_rotation
    pub encoder_counts_per_step: i64,
    /// Unrounded counts per step
    pub raw_counts: f64,
    /// Counts per rotation the plan was made for
    pub counts_per_rotation: f64,
    /// Direction signs
    pub senses: Senses,
    /// Constant rotation speed, degrees per second
    pub motor_speed: f64,
    /// Distance covered while accelerating
    pub accel_distance: f64,
    /// Run-up distance, a whole number of steps
    pub taxi_distance: f64,
    /// Where the stage waits before the scan
    pub taxi_start: f64,
    /// Where the stage is sent to run the scan
    pub taxi_end: f64,
}

impl MotionPlan {
    /// Nominal angle of every projection.
    pub fn theta(&self) -> Vec<f64> {
        let direction = self.senses.user_direction;
        let step = self.rotation_step.abs();
        (0..self.num_angles)
            .map(|k| self.rotation_start + f64::from(k) * step * direction)
            .collect()
    }

    /// True when quantization moved the step noticeably.
    pub fn was_quantized(&self) -> bool {
        (self.raw_counts - self.encoder_counts_per_step as f64).abs() > QUANTIZATION_TOLERANCE
    }

    /// `start + n·step`: the stop angle as stored in the scan parameters.
    pub fn nominal_stop(&self) -> f64 {
        self.rotation_start + f64::from(self.num_angles) * self.rotation_step
    }
}

/// Round `step` to whole encoder counts.
///
/// Returns `(counts, raw_counts, quantized_step)`.
pub fn quantize_step(step: f64, counts_per_rotation: f64) -> ScanResult<(i64, f64, f64)> {
    if !counts_per_rotation.is_finite() || counts_per_rotation == 0.0 {
        return Err(ScanError::Configuration(format!(
            "encoder counts per rotation is {counts_per_rotation}; cannot plan motion"
        )));
    }
    let counts_per_degree = counts_per_rotation / 360.0;
    let raw = step * counts_per_degree;
    let counts = raw.round_ties_even();
    if counts == 0.0 || !counts.is_finite() {
        return Err(ScanError::Configuration(format!(
            "rotation step {step} is less than one encoder count"
        )));
    }
    let quantized = counts / counts_per_degree;
    if (raw - counts).abs() > QUANTIZATION_TOLERANCE {
        warn!(
            requested_step = step,
            raw_counts = raw,
            counts = counts as i64,
            corrected_step = quantized,
            "rotation step is not an integer number of encoder counts; step corrected"
        );
    }
    Ok((counts as i64, raw, quantized))
}

/// Plan one fly scan.
///
/// # Errors
///
/// `ScanError::Configuration` when the counts per rotation is zero or not a
/// number, when the step rounds to zero counts, or when the frame time or
/// acceleration time is out of range.
pub fn plan(request: &MotionRequest) -> ScanResult<MotionPlan> {
    if !(request.frame_time > 0.0) {
        return Err(ScanError::Configuration(format!(
            "frame time must be positive, got {}",
            request.frame_time
        )));
    }
    if !(request.accel_time >= 0.0) {
        return Err(ScanError::Configuration(format!(
            "acceleration time must not be negative, got {}",
            request.accel_time
        )));
    }

    let (counts, raw_counts, rotation_step) =
        quantize_step(request.rotation_step, request.counts_per_rotation)?;

    let senses = Senses {
        user_direction: if rotation_step > 0.0 { 1.0 } else { -1.0 },
        motor_polarity: if request.motor_direction == 0 { 1.0 } else { -1.0 },
        encoder_polarity: request.counts_per_rotation.signum(),
    };
    let direction = senses.user_direction;
    let step = rotation_step.abs();

    let motor_speed = step / request.frame_time;
    let accel_distance = request.accel_time / 2.0 * motor_speed;
    let taxi_steps = (accel_distance / step + 0.5).ceil();
    let taxi_distance = taxi_steps * step;

    let n = f64::from(request.num_angles);
    let start = request.rotation_start;
    let plan = MotionPlan {
        rotation_start: start,
        rotation_step,
        num_angles: request.num_angles,
        rotation_stop: start + (n - 1.0).max(0.0) * step * direction,
        encoder_counts_per_step: counts,
        raw_counts,
        counts_per_rotation: request.counts_per_rotation,
        senses,
        motor_speed,
        accel_distance,
        taxi_distance,
        taxi_start: start - taxi_distance * direction,
        taxi_end: start + n * step * direction + taxi_distance * direction,
    };
    debug!(
        counts_per_step = plan.encoder_counts_per_step,
        speed = plan.motor_speed,
        taxi = plan.taxi_distance,
        taxi_start = plan.taxi_start,
        taxi_end = plan.taxi_end,
        "motion plan"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn request(step: f64) -> MotionRequest {
        MotionRequest {
            rotation_start: 0.0,
            rotation_step: step,
            num_angles: 180,
            frame_time: 0.01,
            counts_per_rotation: 360_000.0,
            accel_time: 0.5,
            motor_direction: 0,
        }
    }

    #[test]
    fn integral_step_is_kept() {
        let plan = plan(&request(1.0)).unwrap();
        assert_eq!(plan.encoder_counts_per_step, 1000);
        assert!(!plan.was_quantized());
        assert_eq!(plan.rotation_step, 1.0);
        assert_eq!(plan.motor_speed, 100.0);
        assert_eq!(plan.rotation_stop, 179.0);
        assert_eq!(plan.nominal_stop(), 180.0);
        // accel_dist = 25 deg -> ceil(25.5) = 26 steps
        assert_eq!(plan.taxi_distance, 26.0);
        assert_eq!(plan.taxi_start, -26.0);
        assert_eq!(plan.taxi_end, 206.0);
    }

    #[traced_test]
    #[test]
    fn near_integral_steps_do_not_warn() {
        assert_eq!(plan(&request(0.33)).unwrap().encoder_counts_per_step, 330);
        assert_eq!(plan(&request(0.333)).unwrap().encoder_counts_per_step, 333);
        assert!(!logs_contain("step corrected"));
    }

    #[traced_test]
    #[test]
    fn third_of_a_degree_is_corrected_with_a_warning() {
        let plan = plan(&request(1.0 / 3.0)).unwrap();
        assert_eq!(plan.encoder_counts_per_step, 333);
        assert!(plan.was_quantized());
        assert!((plan.rotation_step - 0.333).abs() < 1e-12);
        assert!(logs_contain("step corrected"));
    }

    #[test]
    fn quantization_stays_within_one_count_and_is_idempotent() {
        for cpr in [360_000.0, 11_840_200.0, 36_000.0, -360_000.0] {
            for step in [0.1, 0.12345, 1.0 / 7.0, 0.25, -0.2, 3.0] {
                let first = plan(&MotionRequest {
                    counts_per_rotation: cpr,
                    ..request(step)
                })
                .unwrap();
                assert!((first.rotation_step - step).abs() < 360.0 / cpr.abs());
                let second = plan(&MotionRequest {
                    counts_per_rotation: cpr,
                    ..request(first.rotation_step)
                })
                .unwrap();
                assert_eq!(first.encoder_counts_per_step, second.encoder_counts_per_step);
                assert_eq!(first.rotation_step, second.rotation_step);
                assert_eq!(first.taxi_distance, second.taxi_distance);
            }
        }
    }

    #[test]
    fn taxi_covers_the_acceleration_ramp() {
        for accel_time in [0.0, 0.05, 0.5, 1.0, 3.3] {
            for frame_time in [0.001, 0.01, 0.2, 1.5] {
                for step in [0.1, 0.25, 1.0, -0.6] {
                    let plan = plan(&MotionRequest {
                        accel_time,
                        frame_time,
                        ..request(step)
                    })
                    .unwrap();
                    let step = plan.rotation_step.abs();
                    assert!(plan.taxi_distance >= plan.accel_distance);
                    let steps = plan.taxi_distance / step;
                    assert!((steps - steps.round()).abs() < 1e-9);
                    assert!(steps >= 1.0);
                }
            }
        }
    }

    #[test]
    fn negative_step_runs_backwards() {
        let plan = plan(&MotionRequest {
            rotation_start: 180.0,
            num_angles: 10,
            ..request(-1.0)
        })
        .unwrap();
        assert_eq!(plan.encoder_counts_per_step, -1000);
        assert_eq!(plan.senses.user_direction, -1.0);
        assert_eq!(plan.senses.overall(), -1.0);
        assert_eq!(plan.rotation_stop, 171.0);
        assert!(plan.taxi_start > 180.0);
        assert!(plan.taxi_end < 170.0);
        assert_eq!(plan.theta()[1], 179.0);
    }

    #[test]
    fn inverted_motor_and_encoder_flip_the_sense() {
        let plan = plan(&MotionRequest {
            motor_direction: 1,
            counts_per_rotation: -360_000.0,
            ..request(1.0)
        })
        .unwrap();
        assert_eq!(plan.senses.motor_polarity, -1.0);
        assert_eq!(plan.senses.encoder_polarity, -1.0);
        assert_eq!(plan.senses.overall(), 1.0);
    }

    #[test]
    fn counts_carry_the_encoder_sign() {
        let inverted = |step: f64| {
            plan(&MotionRequest {
                counts_per_rotation: -360_000.0,
                ..request(step)
            })
            .unwrap()
            .encoder_counts_per_step
        };
        assert_eq!(inverted(1.0), -1000);
        assert_eq!(inverted(-1.0), 1000);
    }

    #[test]
    fn zero_counts_per_rotation_is_fatal() {
        let err = plan(&MotionRequest {
            counts_per_rotation: 0.0,
            ..request(1.0)
        })
        .unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
        assert!(plan(&MotionRequest {
            counts_per_rotation: f64::NAN,
            ..request(1.0)
        })
        .is_err());
        assert!(plan(&MotionRequest {
            frame_time: 0.0,
            ..request(1.0)
        })
        .is_err());
    }
}
