//! Typed identifiers for every durable entity in the pipeline.
//!
//! All identifiers are ULIDs: lexicographically sortable by creation time,
//! collision-resistant, and cheap to generate without coordination. Each
//! entity gets its own newtype so a campaign id can never be passed where a
//! queue-row id is expected.

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Wrap an existing ULID.
            #[must_use]
            pub const fn from_ulid(id: ulid::Ulid) -> Self {
                Self(id)
            }

            /// The underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> ulid::Ulid {
                self.0
            }

            /// Milliseconds since the Unix epoch encoded in this id.
            #[must_use]
            pub const fn timestamp_ms(&self) -> u64 {
                self.0.timestamp_ms()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                ulid::Ulid::from_string(s).map(Self)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                ulid::Ulid::from_string(&s)
                    .map(Self)
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

ulid_id! {
    /// Identifies an organization (tenant).
    OrgId
}

ulid_id! {
    /// Identifies an authored campaign.
    CampaignId
}

ulid_id! {
    /// Identifies a subscriber (recipient).
    SubscriberId
}

ulid_id! {
    /// Identifies one `(campaign, recipient)` queue row.
    QueueRowId
}

ulid_id! {
    /// Identifies a send worker within the cluster.
    WorkerId
}

ulid_id! {
    /// Identifies a static recipient list.
    ListId
}

ulid_id! {
    /// Identifies a stored segment definition.
    SegmentId
}

ulid_id! {
    /// Identifies a sending profile (ESP credentials).
    SendingProfileId
}

ulid_id! {
    /// Identifies a named suppression list.
    SuppressionListId
}

ulid_id! {
    /// Identifies an A/B test variant.
    VariantId
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn round_trips_through_display() {
        let id = CampaignId::generate();
        let parsed = CampaignId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn round_trips_through_serde() {
        let id = QueueRowId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: QueueRowId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn rejects_invalid_input() {
        assert!(CampaignId::from_str("not-a-ulid").is_err());
        assert!(serde_json::from_str::<WorkerId>("\"!!!\"").is_err());
    }

    #[test]
    fn ids_are_sortable_by_creation() {
        let a = QueueRowId::generate();
        let b = QueueRowId::generate();
        // ULIDs generated in sequence never sort backwards.
        assert!(a <= b);
    }
}
