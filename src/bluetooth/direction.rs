//! Reconnection bearing estimation
//!
//! Fuses RSSI readings with compass headings. Samples with a heading are
//! bucketed into equal angular sectors (sector 0 is centred on north) and
//! each sector gets a recency-weighted mean strength. The strongest sector is
//! the bearing. Sectors without samples count as the noise floor when the
//! spread is computed, so a single strong sector stands out while a uniform
//! ring of readings does not.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::DirectionSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct RssiHeadingSample {
    pub strength: i16,
    /// Degrees in [0, 360)
    pub heading: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionEstimate {
    pub heading: Option<f64>,
    /// In [0, 1]
    pub confidence: f64,
    pub last_strength: Option<i16>,
    pub sample_count: usize,
    pub last_sample_at: Option<DateTime<Utc>>,
}

impl DirectionEstimate {
    fn empty() -> Self {
        Self {
            heading: None,
            confidence: 0.0,
            last_strength: None,
            sample_count: 0,
            last_sample_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectionEstimator {
    settings: DirectionSettings,
    window: VecDeque<RssiHeadingSample>,
}

impl DirectionEstimator {
    pub fn new(settings: DirectionSettings) -> Self {
        Self {
            settings,
            window: VecDeque::new(),
        }
    }

    pub fn add_sample(&mut self, strength: i16, heading: Option<f64>) {
        self.add_sample_at(strength, heading, Utc::now());
    }

    /// Append a sample and drop everything older than the window.
    pub fn add_sample_at(
        &mut self,
        strength: i16,
        heading: Option<f64>,
        captured_at: DateTime<Utc>,
    ) {
        let heading = heading
            .filter(|h| h.is_finite())
            .map(|h| h.rem_euclid(360.0));

        self.window.push_back(RssiHeadingSample {
            strength,
            heading,
            captured_at,
        });

        let cutoff = captured_at - Duration::seconds(self.settings.window_secs);
        self.window.retain(|sample| sample.captured_at >= cutoff);
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn samples(&self) -> impl Iterator<Item = &RssiHeadingSample> {
        self.window.iter()
    }

    pub fn estimate(&self) -> DirectionEstimate {
        let Some(latest) = self.window.iter().max_by_key(|s| s.captured_at) else {
            return DirectionEstimate::empty();
        };

        let mut estimate = DirectionEstimate {
            last_strength: Some(latest.strength),
            sample_count: self.window.len(),
            last_sample_at: Some(latest.captured_at),
            ..DirectionEstimate::empty()
        };

        let sectors = self.settings.sectors;
        let width = 360.0 / sectors as f64;
        let mut weighted_sum = vec![0.0f64; sectors];
        let mut weight_total = vec![0.0f64; sectors];
        let mut headed = 0usize;

        for sample in &self.window {
            let Some(heading) = sample.heading else {
                continue;
            };
            headed += 1;

            let sector = (((heading + width / 2.0) / width).floor() as usize) % sectors;
            let age_ms = (latest.captured_at - sample.captured_at).num_milliseconds().max(0);
            let age = age_ms as f64 / 1000.0;
            let weight = 0.5f64.powf(age / self.settings.decay_half_life_secs);

            weighted_sum[sector] += weight * sample.strength as f64;
            weight_total[sector] += weight;
        }

        // Strength alone never yields a bearing
        if headed == 0 {
            return estimate;
        }

        let averages: Vec<f64> = weighted_sum
            .iter()
            .zip(&weight_total)
            .map(|(sum, total)| {
                if *total > 0.0 {
                    sum / total
                } else {
                    self.settings.noise_floor_dbm
                }
            })
            .collect();

        let (best_sector, best_average) = averages
            .iter()
            .enumerate()
            .filter(|(idx, _)| weight_total[*idx] > 0.0)
            .fold((0usize, f64::NEG_INFINITY), |best, (idx, avg)| {
                if *avg > best.1 {
                    (idx, *avg)
                } else {
                    best
                }
            });

        let mean = averages.iter().sum::<f64>() / sectors as f64;
        let spread_factor =
            ((best_average - mean) / self.settings.spread_full_scale_db).clamp(0.0, 1.0);
        let count_factor = (headed as f64 / self.settings.min_samples as f64).min(1.0);

        estimate.heading = Some(best_sector as f64 * width);
        estimate.confidence = (spread_factor * count_factor).clamp(0.0, 1.0);
        estimate
    }
}

impl Default for DirectionEstimator {
    fn default() -> Self {
        Self::new(DirectionSettings::default())
    }
}
