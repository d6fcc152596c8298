//! Node volume curves.
//!
//! A curve maps the 101 user-visible volume steps (0..=100) to an
//! attenuation in centi-dBFS. Simple-step curves are a straight line from
//! `max_volume` at step 100 down by `volume_step` per step; explicit curves
//! carry all 101 values. The engine applies the result as a linear scaler.

/// Number of user-visible volume steps.
pub const VOLUME_STEPS: usize = 101;

/// Volume in centi-dB below which the scaler snaps to zero.
const MUTE_FLOOR_DB_100: i32 = -9_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCurve {
    /// Straight line: `max_volume` centi-dBFS at step 100, dropping
    /// `volume_step` centi-dB per step below it.
    SimpleStep { max_volume: i32, volume_step: i32 },
    /// One centi-dBFS value per step, index = step.
    Explicit { db_at: Box<[i32; VOLUME_STEPS]> },
}

impl Default for VolumeCurve {
    /// 0 dBFS at full volume, 0.5 dB per step.
    fn default() -> VolumeCurve {
        VolumeCurve::SimpleStep {
            max_volume: 0,
            volume_step: 50,
        }
    }
}

impl VolumeCurve {
    /// Build an explicit curve from 101 centi-dBFS values, `db_at[step]`.
    pub fn explicit(db_at: [i32; VOLUME_STEPS]) -> VolumeCurve {
        VolumeCurve::Explicit {
            db_at: Box::new(db_at),
        }
    }

    /// Attenuation at `step` in centi-dBFS. Steps above 100 clamp.
    pub fn db_at_step(&self, step: u8) -> i32 {
        let step = step.min(100) as i32;
        match self {
            VolumeCurve::SimpleStep {
                max_volume,
                volume_step,
            } => max_volume - (100 - step) * volume_step,
            VolumeCurve::Explicit { db_at } => db_at[step as usize],
        }
    }

    /// Linear scaler for `step`. Step 0 and anything at or below the mute
    /// floor produce exactly 0.0.
    pub fn scaler_at_step(&self, step: u8) -> f32 {
        if step == 0 {
            return 0.0;
        }
        db_100_to_scaler(self.db_at_step(step))
    }
}

/// Convert centi-dB to a linear scaler.
pub fn db_100_to_scaler(db_100: i32) -> f32 {
    if db_100 <= MUTE_FLOOR_DB_100 {
        return 0.0;
    }
    10f32.powf(db_100 as f32 / 2000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_curve_endpoints() {
        let curve = VolumeCurve::default();
        assert_eq!(curve.db_at_step(100), 0);
        assert_eq!(curve.db_at_step(50), -2500);
        assert_eq!(curve.db_at_step(0), -5000);
    }

    #[test]
    fn test_simple_step_from_config_values() {
        // max_volume = -3 dBFS, 0.75 dB per step.
        let curve = VolumeCurve::SimpleStep {
            max_volume: -300,
            volume_step: 75,
        };
        assert_eq!(curve.db_at_step(100), -300);
        assert_eq!(curve.db_at_step(0), -7800);
    }

    #[test]
    fn test_explicit_curve_lookup() {
        let mut db_at = [0i32; VOLUME_STEPS];
        for (step, slot) in db_at.iter_mut().enumerate() {
            *slot = -((100 - step) as i32) * 100;
        }
        let curve = VolumeCurve::explicit(db_at);
        assert_eq!(curve.db_at_step(100), 0);
        assert_eq!(curve.db_at_step(40), -6000);
    }

    #[test]
    fn test_scaler_values() {
        let curve = VolumeCurve::default();
        assert_eq!(curve.scaler_at_step(0), 0.0);
        assert!((curve.scaler_at_step(100) - 1.0).abs() < 1e-6);
        // -20 dB is a factor of 10.
        assert!((db_100_to_scaler(-2000) - 0.1).abs() < 1e-6);
        assert_eq!(db_100_to_scaler(-9600), 0.0);
    }
}
