//! Shared wind generator

use glam::DVec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::WindSettings;

/// Wind state persisted with the simulation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindState {
    /// Meters per second
    pub speed: f64,
    /// Degrees CCW from east, the direction the wind blows toward
    pub direction: f64,
}

impl WindState {
    pub fn vector(&self) -> DVec2 {
        DVec2::from_angle(self.direction.to_radians()) * self.speed
    }
}

/// Mean-reverting random walk over speed plus a free walk over direction
pub struct WindModel {
    settings: WindSettings,
    state: WindState,
    rng: ChaCha8Rng,
}

impl WindModel {
    /// Start at `initial`, or at the configured average blowing west when none was saved
    pub fn new(settings: WindSettings, initial: Option<WindState>, seed: u64) -> Self {
        let state = initial.unwrap_or(WindState {
            speed: settings.speed_average,
            direction: 270.0,
        });
        let mut model = Self {
            settings,
            state,
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        model.state.speed = model.state.speed.clamp(0.0, model.settings.max_gust.max(0.0));
        model
    }

    pub fn state(&self) -> WindState {
        self.state
    }

    pub fn vector(&self) -> DVec2 {
        self.state.vector()
    }

    pub fn update_settings(&mut self, settings: WindSettings) {
        self.settings = settings;
    }

    /// Advance the wind by `dt` simulated seconds
    pub fn step(&mut self, dt: f64) -> WindState {
        if dt <= 0.0 {
            return self.state;
        }

        let s = &self.settings;
        let bias = if s.speed_variability > 0.0 {
            s.mean_reversion.clamp(0.0, 1.0)
                * ((s.speed_average - self.state.speed) / s.speed_variability).tanh()
        } else {
            0.0
        };
        let r: f64 = self.rng.gen_range(-1.0..=1.0);
        let speed_delta = (r * (1.0 - bias.abs()) + bias) * s.speed_variability * dt;
        self.state.speed = (self.state.speed + speed_delta).clamp(0.0, s.max_gust.max(0.0));

        let r: f64 = self.rng.gen_range(-1.0..=1.0);
        let direction_delta = r * s.direction_variability * dt;
        self.state.direction = (self.state.direction + direction_delta).rem_euclid(360.0);

        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WindSettings {
        WindSettings {
            speed_average: 5.0,
            max_gust: 10.0,
            speed_variability: 1.0,
            direction_variability: 3.0,
            mean_reversion: 0.5,
        }
    }

    #[test]
    fn one_second_tick_stays_in_bounds() {
        for seed in 0..200 {
            let mut wind = WindModel::new(settings(), None, seed);
            let state = wind.step(1.0);
            assert!((4.0..=6.0).contains(&state.speed), "seed {seed}: {}", state.speed);
            assert!((0.0..=10.0).contains(&state.speed));
            assert!((0.0..360.0).contains(&state.direction));
        }
    }

    #[test]
    fn speed_clamped_to_gust_and_direction_wraps() {
        let mut wind = WindModel::new(
            settings(),
            Some(WindState {
                speed: 9.9,
                direction: 359.9,
            }),
            7,
        );
        for _ in 0..1000 {
            let state = wind.step(1.0);
            assert!((0.0..=10.0).contains(&state.speed));
            assert!((0.0..360.0).contains(&state.direction));
        }
    }

    #[test]
    fn long_run_tracks_average() {
        let mut wind = WindModel::new(
            settings(),
            Some(WindState {
                speed: 0.0,
                direction: 0.0,
            }),
            42,
        );
        let mut total = 0.0;
        let steps = 20_000;
        for _ in 0..steps {
            total += wind.step(0.5).speed;
        }
        let mean = total / steps as f64;
        assert!((mean - 5.0).abs() < 1.0, "mean speed {mean}");
    }

    #[test]
    fn same_seed_same_wind() {
        let mut a = WindModel::new(settings(), None, 99);
        let mut b = WindModel::new(settings(), None, 99);
        for _ in 0..50 {
            assert_eq!(a.step(0.1), b.step(0.1));
        }
    }

    #[test]
    fn zero_dt_is_noop() {
        let mut wind = WindModel::new(settings(), None, 1);
        let before = wind.state();
        assert_eq!(wind.step(0.0), before);
    }

    #[test]
    fn vector_points_where_wind_blows() {
        let state = WindState {
            speed: 2.0,
            direction: 90.0,
        };
        let v = state.vector();
        assert!(v.x.abs() < 1e-9);
        assert!((v.y - 2.0).abs() < 1e-9);
    }
}
