//! Per-recipient classification rules.
//!
//! An ordered cascade over the recipient's intelligence profile: the first
//! matching rule wins. Suppression rules protect sender reputation; defer
//! rules protect engagement metrics; send-later aligns delivery with the
//! recipient's best hour.

use chrono::{DateTime, Datelike, Timelike, Utc};

use cadence_common::{
    audience::{MailboxState, RecipientProfile},
    decision::{Classification, ContentStrategy},
};

/// Hours of circular distance beyond which a send is pushed to the
/// recipient's optimal hour.
const HOUR_TOLERANCE: u32 = 2;

/// History depth required before the no-opens-this-month defer applies.
const MONTH_RULE_MIN_DAYS: i64 = 730;

/// Circular distance between two hours of day, in `[0, 12]`.
fn circular_hour_distance(a: u32, b: u32) -> u32 {
    let diff = a.abs_diff(b) % 24;
    diff.min(24 - diff)
}

/// Classify one recipient at `now`.
#[must_use]
pub fn classify(profile: &RecipientProfile, now: DateTime<Utc>) -> Classification {
    // Suppress rules, hardest first.
    if profile
        .send_suspended_until
        .is_some_and(|until| until > now)
    {
        return Classification::Suppress;
    }
    if profile.mailbox_state == MailboxState::Full {
        return Classification::Suppress;
    }
    if profile.consecutive_bounces >= 5 {
        return Classification::Suppress;
    }
    if profile.has_complained {
        return Classification::Suppress;
    }
    if profile.engagement_score < 0.05 && profile.total_sends > 20 {
        return Classification::Suppress;
    }

    // Defer rules.
    if profile.mailbox_state == MailboxState::Degraded {
        return Classification::Defer;
    }
    if profile.engagement_score < 0.15 && profile.total_sends > 10 {
        return Classification::Defer;
    }
    let has_long_history = profile
        .first_seen_at
        .is_some_and(|first| (now - first).num_days() >= MONTH_RULE_MIN_DAYS);
    let opened_this_calendar_month = profile
        .last_open_at
        .is_some_and(|open| open.month() == now.month());
    if has_long_history && !opened_this_calendar_month {
        return Classification::Defer;
    }
    if profile.total_opens == 0 && profile.total_sends > 5 {
        return Classification::Defer;
    }

    // Send-later when the recipient's best hour is far from now.
    if let Some(optimal) = profile.optimal_hour {
        if circular_hour_distance(now.hour(), u32::from(optimal)) > HOUR_TOLERANCE {
            return Classification::SendLater;
        }
    }

    Classification::SendNow
}

/// Pick the content strategy for a non-suppressed recipient.
///
/// Image-rich content needs a confident preference margin; anywhere
/// inside the ambiguous band the lighter text form wins, matching
/// [`ContentStrategy`]'s own default.
#[must_use]
pub fn content_strategy(profile: &RecipientProfile) -> ContentStrategy {
    let image_margin = profile.image_preference - (1.0 - profile.image_preference);
    let image = image_margin > 0.15;
    let personalized = profile.personalization_preference > 0.5;

    match (image, personalized) {
        (true, true) => ContentStrategy::ImagePersonalized,
        (true, false) => ContentStrategy::ImageGeneric,
        (false, true) => ContentStrategy::TextPersonalized,
        (false, false) => ContentStrategy::TextGeneric,
    }
}

/// Send priority in `[0, 100]`: engagement carries most of the weight,
/// purchase history adds a flat bonus, trend and open rate fine-tune.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn priority(profile: &RecipientProfile) -> u8 {
    let revenue_bonus = if profile.has_purchased { 20.0 } else { 0.0 };
    let score = profile.engagement_score * 60.0
        + revenue_bonus
        + profile.engagement_trend.clamp(-1.0, 1.0) * 10.0
        + profile.open_rate * 10.0;
    score.clamp(0.0, 100.0) as u8
}
