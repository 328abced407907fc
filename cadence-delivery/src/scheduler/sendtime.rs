//! Per-recipient send-time resolution.

use chrono::{DateTime, Duration, Timelike, Utc};

use cadence_common::audience::RecipientProfile;

/// Confidence below which a recipient's optimal hour is ignored.
const MIN_CONFIDENCE: f64 = 0.5;

/// Fallback hour when nothing is known about the audience.
const DEFAULT_HOUR: u8 = 10;

/// Today at `hour` UTC, rolled forward one day when already past.
fn today_at_hour(now: DateTime<Utc>, hour: u8) -> DateTime<Utc> {
    let candidate = now
        .with_hour(u32::from(hour.min(23)))
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    if candidate <= now {
        candidate + Duration::days(1)
    } else {
        candidate
    }
}

/// Resolve the effective send time for one recipient.
///
/// Preference order when the campaign opts into AI send time:
/// a pre-computed per-recipient time, the recipient's confident optimal
/// hour, the audience-wide best hour, then hour 10. All UTC.
#[must_use]
pub fn resolve_send_time(
    campaign_scheduled_at: DateTime<Utc>,
    ai_send_time: bool,
    precomputed: Option<DateTime<Utc>>,
    profile: Option<&RecipientProfile>,
    audience_best_hour: Option<u8>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if !ai_send_time {
        return campaign_scheduled_at;
    }

    if let Some(at) = precomputed {
        return at;
    }

    if let Some(profile) = profile {
        if profile.optimal_hour_confidence >= MIN_CONFIDENCE {
            if let Some(hour) = profile.optimal_hour {
                return today_at_hour(now, hour);
            }
        }
    }

    if let Some(hour) = audience_best_hour {
        return today_at_hour(now, hour);
    }

    today_at_hour(now, DEFAULT_HOUR)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn profile(hour: u8, confidence: f64) -> RecipientProfile {
        RecipientProfile {
            subscriber_id: cadence_common::ids::SubscriberId::generate(),
            engagement_score: 0.5,
            total_sends: 10,
            total_opens: 5,
            engagement_trend: 0.0,
            open_rate: 0.5,
            consecutive_bounces: 0,
            has_complained: false,
            mailbox_state: cadence_common::audience::MailboxState::Healthy,
            send_suspended_until: None,
            last_open_at: None,
            first_seen_at: None,
            optimal_hour: Some(hour),
            optimal_hour_confidence: confidence,
            image_preference: 0.5,
            personalization_preference: 0.5,
            has_purchased: false,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, h, m, 0).single().unwrap()
    }

    #[test]
    fn disabled_optimization_uses_campaign_time() {
        let scheduled = at(9, 30);
        let resolved = resolve_send_time(
            scheduled,
            false,
            None,
            Some(&profile(20, 0.9)),
            Some(14),
            at(8, 0),
        );
        assert_eq!(resolved, scheduled);
    }

    #[test]
    fn precomputed_time_wins() {
        let precomputed = at(17, 45);
        let resolved = resolve_send_time(
            at(9, 0),
            true,
            Some(precomputed),
            Some(&profile(20, 0.9)),
            None,
            at(8, 0),
        );
        assert_eq!(resolved, precomputed);
    }

    #[test]
    fn confident_profile_hour_is_used() {
        let resolved = resolve_send_time(at(9, 0), true, None, Some(&profile(14, 0.8)), None, at(8, 0));
        assert_eq!(resolved, at(14, 0));
    }

    #[test]
    fn low_confidence_falls_through_to_audience() {
        let resolved =
            resolve_send_time(at(9, 0), true, None, Some(&profile(14, 0.3)), Some(16), at(8, 0));
        assert_eq!(resolved, at(16, 0));
    }

    #[test]
    fn past_hour_rolls_to_tomorrow() {
        let resolved = resolve_send_time(at(9, 0), true, None, Some(&profile(7, 0.9)), None, at(8, 0));
        assert_eq!(
            resolved,
            Utc.with_ymd_and_hms(2026, 6, 16, 7, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn no_signal_defaults_to_ten() {
        let resolved = resolve_send_time(at(9, 0), true, None, None, None, at(8, 0));
        assert_eq!(resolved, at(10, 0));
    }
}
