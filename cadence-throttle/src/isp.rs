//! The process-wide ISP membership table.
//!
//! Mailbox operators group many consumer domains under one reputation
//! system, so throttle treatment is per ISP family, not per domain. The
//! table is closed: built once at startup, immutable afterwards.

use std::{collections::HashMap, sync::LazyLock};

use cadence_common::throttle::IspLimits;

struct IspEntry {
    domains: &'static [&'static str],
    defaults: IspLimits,
}

static ISP_TABLE: LazyLock<HashMap<&'static str, IspEntry>> = LazyLock::new(|| {
    let mut table = HashMap::new();
    table.insert(
        "gmail",
        IspEntry {
            domains: &["gmail.com", "googlemail.com"],
            defaults: IspLimits {
                hour: 20_000,
                day: 200_000,
                burst: 500,
            },
        },
    );
    table.insert(
        "microsoft",
        IspEntry {
            domains: &["outlook.com", "hotmail.com", "live.com", "msn.com"],
            defaults: IspLimits {
                hour: 10_000,
                day: 100_000,
                burst: 300,
            },
        },
    );
    table.insert(
        "yahoo",
        IspEntry {
            domains: &["yahoo.com", "ymail.com", "rocketmail.com"],
            defaults: IspLimits {
                hour: 8_000,
                day: 80_000,
                burst: 250,
            },
        },
    );
    table.insert(
        "apple",
        IspEntry {
            domains: &["icloud.com", "me.com", "mac.com"],
            defaults: IspLimits {
                hour: 5_000,
                day: 50_000,
                burst: 200,
            },
        },
    );
    table.insert(
        "aol",
        IspEntry {
            domains: &["aol.com"],
            defaults: IspLimits {
                hour: 3_000,
                day: 30_000,
                burst: 100,
            },
        },
    );
    table.insert(
        "comcast",
        IspEntry {
            domains: &["comcast.net"],
            defaults: IspLimits {
                hour: 2_000,
                day: 20_000,
                burst: 100,
            },
        },
    );
    table.insert(
        "att",
        IspEntry {
            domains: &["att.net", "sbcglobal.net", "bellsouth.net"],
            defaults: IspLimits {
                hour: 2_000,
                day: 20_000,
                burst: 100,
            },
        },
    );
    table
});

static DOMAIN_TO_ISP: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    ISP_TABLE
        .iter()
        .flat_map(|(isp, entry)| entry.domains.iter().map(move |domain| (*domain, *isp)))
        .collect()
});

/// The ISP family owning `domain`, when it is a known consumer domain.
#[must_use]
pub fn isp_for_domain(domain: &str) -> Option<&'static str> {
    DOMAIN_TO_ISP.get(domain).copied()
}

/// Built-in default limits for a known ISP family.
#[must_use]
pub fn default_isp_limits(isp: &str) -> Option<IspLimits> {
    ISP_TABLE.get(isp).map(|entry| entry.defaults)
}

/// The member domains of a known ISP family.
#[must_use]
pub fn domains_for_isp(isp: &str) -> &'static [&'static str] {
    ISP_TABLE.get(isp).map_or(&[], |entry| entry.domains)
}
