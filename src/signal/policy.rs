//! Creation-time checks: content, moderation, TTL bounds and location privacy.
//!
//! Everything here rejects with a specific reason. Nothing is truncated or
//! clamped.

use chrono::Duration;

use super::types::CoarseLocation;
use crate::config::SignalSettings;
use crate::error::SignalError;

const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone)]
pub struct SignalPolicy {
    settings: SignalSettings,
    blocked: Vec<String>,
}

impl SignalPolicy {
    pub fn new(settings: SignalSettings) -> Self {
        let blocked = settings
            .blocked_terms
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Self { settings, blocked }
    }

    /// Trimmed content, or the reason it cannot be posted.
    pub fn check_content(&self, content: &str) -> Result<String, SignalError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SignalError::EmptyContent);
        }

        let len = content.chars().count();
        if len > self.settings.max_content_chars {
            return Err(SignalError::ContentTooLong {
                len,
                max: self.settings.max_content_chars,
            });
        }

        let lowered = content.to_lowercase();
        if let Some(term) = self.blocked.iter().find(|term| lowered.contains(term.as_str())) {
            return Err(SignalError::Moderated(format!("contains blocked term \"{term}\"")));
        }

        Ok(content.to_string())
    }

    pub fn ttl(&self, requested_secs: Option<i64>) -> Result<Duration, SignalError> {
        let ttl_secs = requested_secs.unwrap_or(self.settings.ttl_default_secs);
        if ttl_secs < self.settings.ttl_min_secs || ttl_secs > self.settings.ttl_max_secs {
            return Err(SignalError::TtlOutOfBounds {
                ttl_secs,
                min_secs: self.settings.ttl_min_secs,
                max_secs: self.settings.ttl_max_secs,
            });
        }
        Ok(Duration::seconds(ttl_secs))
    }

    /// Snap a position to the centre of its grid cell. Cells are
    /// `privacy_radius_m` on a side.
    pub fn coarsen(&self, latitude: f64, longitude: f64) -> CoarseLocation {
        let radius_m = self.settings.privacy_radius_m;
        let lat_cell = radius_m / METERS_PER_DEGREE;
        let latitude = snap(latitude.clamp(-90.0, 90.0), lat_cell).clamp(-90.0, 90.0);

        // Longitude degrees shrink towards the poles
        let lon_cell = (lat_cell / latitude.to_radians().cos().max(0.01)).min(360.0);
        let longitude = snap(longitude, lon_cell);
        let longitude = (longitude + 180.0).rem_euclid(360.0) - 180.0;

        CoarseLocation {
            latitude,
            longitude,
            radius_m,
        }
    }
}

fn snap(value: f64, cell: f64) -> f64 {
    (value / cell).floor() * cell + cell / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SignalPolicy {
        SignalPolicy::new(SignalSettings {
            blocked_terms: vec!["Spam".to_string(), " ".to_string()],
            ..SignalSettings::default()
        })
    }

    #[test]
    fn content_limit_counts_code_points() {
        let policy = policy();
        let at_limit = "é".repeat(280);
        assert_eq!(policy.check_content(&at_limit).unwrap().chars().count(), 280);

        let over = "é".repeat(281);
        assert_eq!(
            policy.check_content(&over).unwrap_err(),
            SignalError::ContentTooLong { len: 281, max: 280 }
        );
    }

    #[test]
    fn blank_content_is_rejected() {
        assert_eq!(policy().check_content("   \n").unwrap_err(), SignalError::EmptyContent);
    }

    #[test]
    fn blocked_terms_match_case_insensitively() {
        assert!(matches!(
            policy().check_content("free SPAM here"),
            Err(SignalError::Moderated(_))
        ));
        assert!(policy().check_content("water at the spring").is_ok());
    }

    #[test]
    fn ttl_outside_bounds_is_rejected_not_clamped() {
        let policy = policy();
        assert_eq!(policy.ttl(None).unwrap(), Duration::hours(1));
        assert_eq!(policy.ttl(Some(60)).unwrap(), Duration::seconds(60));
        assert!(matches!(policy.ttl(Some(59)), Err(SignalError::TtlOutOfBounds { .. })));
        assert!(matches!(
            policy.ttl(Some(86_401)),
            Err(SignalError::TtlOutOfBounds { .. })
        ));
    }

    #[test]
    fn nearby_points_share_a_cell() {
        let policy = policy();
        let a = policy.coarsen(47.60621, -122.33207);
        let b = policy.coarsen(47.60625, -122.33210);
        assert_eq!(a, b);

        // Within one cell of the original
        assert!((a.latitude - 47.60621).abs() * METERS_PER_DEGREE <= 500.0);
        assert_eq!(a.radius_m, 500.0);
    }
}
