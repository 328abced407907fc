//! Per-organization throttle configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::OrgId;

/// Hour/day/burst caps for one ISP family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IspLimits {
    pub hour: u64,
    pub day: u64,
    /// Messages allowed in any rolling minute.
    pub burst: u64,
}

/// Per-ISP rule: limits plus the domains the rule governs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IspRule {
    /// ISP key, e.g. `"gmail"`.
    pub isp: String,
    pub limits: IspLimits,
    /// Member domains. Populated from the process-wide ISP table when the
    /// rule is created from defaults.
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Hour/day caps for one destination domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLimits {
    pub hour: u64,
    pub day: u64,
}

impl Default for DomainLimits {
    fn default() -> Self {
        // Applied when an org has no explicit rule for a domain.
        Self {
            hour: 5_000,
            day: 50_000,
        }
    }
}

/// Per-domain rule within an org's throttle envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRule {
    pub domain: String,
    pub limits: DomainLimits,
}

/// The complete throttle envelope for one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgThrottleConfig {
    pub org_id: OrgId,
    /// Optional global caps across every destination.
    pub global_hour: Option<u64>,
    pub global_day: Option<u64>,
    #[serde(default)]
    pub isp_rules: Vec<IspRule>,
    #[serde(default)]
    pub domain_rules: Vec<DomainRule>,
    /// When set, bounce/complaint feedback rewrites the rules automatically.
    #[serde(default = "default_auto_adjust")]
    pub auto_adjust: bool,
    pub updated_at: DateTime<Utc>,
}

const fn default_auto_adjust() -> bool {
    true
}

impl OrgThrottleConfig {
    /// An empty envelope: no org-level caps, defaults apply per domain.
    #[must_use]
    pub fn empty(org_id: OrgId, now: DateTime<Utc>) -> Self {
        Self {
            org_id,
            global_hour: None,
            global_day: None,
            isp_rules: Vec::new(),
            domain_rules: Vec::new(),
            auto_adjust: true,
            updated_at: now,
        }
    }

    /// The rule covering `domain`, if the org has one.
    #[must_use]
    pub fn domain_rule(&self, domain: &str) -> Option<&DomainRule> {
        self.domain_rules.iter().find(|rule| rule.domain == domain)
    }

    /// The ISP rule covering `isp`, if the org has one.
    #[must_use]
    pub fn isp_rule(&self, isp: &str) -> Option<&IspRule> {
        self.isp_rules.iter().find(|rule| rule.isp == isp)
    }
}

/// One day of per-domain outcome counts, used by the weekly raise pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyDomainStats {
    pub day: chrono::NaiveDate,
    pub sent: u64,
    pub bounced: u64,
    pub complained: u64,
}
