//! Tracking URL construction and parsing.
//!
//! URL grammar, shared with the companion tracking service:
//!
//! ```text
//! {base}/track/open/{b64(data)}/{mac}
//! {base}/track/click/{b64(data)}/{mac}
//! {base}/track/unsubscribe/{b64(data)}/{mac}
//! data = "{org}|{campaign}|{recipient}|{message}[|{url}]"
//! mac  = first 16 hex of HMAC-SHA256(key, data)
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use cadence_common::ids::{CampaignId, OrgId, QueueRowId, SubscriberId};

use crate::{error::TrackingError, signer::Signer};

/// The identity tuple embedded in every tracking URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingData {
    pub org: OrgId,
    pub campaign: CampaignId,
    pub recipient: SubscriberId,
    pub message: QueueRowId,
    /// Original destination, present only on click payloads.
    pub url: Option<String>,
}

impl TrackingData {
    fn encode(&self) -> String {
        let mut data = format!(
            "{}|{}|{}|{}",
            self.org, self.campaign, self.recipient, self.message
        );
        if let Some(url) = &self.url {
            data.push('|');
            data.push_str(url);
        }
        data
    }

    fn decode(data: &str) -> Result<Self, TrackingError> {
        let mut parts = data.splitn(5, '|');
        let mut next = |what: &str| {
            parts
                .next()
                .ok_or_else(|| TrackingError::MalformedPayload(format!("missing {what}")))
        };

        let org = next("org")?
            .parse()
            .map_err(|_| TrackingError::MalformedPayload("org id".to_string()))?;
        let campaign = next("campaign")?
            .parse()
            .map_err(|_| TrackingError::MalformedPayload("campaign id".to_string()))?;
        let recipient = next("recipient")?
            .parse()
            .map_err(|_| TrackingError::MalformedPayload("recipient id".to_string()))?;
        let message = next("message")?
            .parse()
            .map_err(|_| TrackingError::MalformedPayload("message id".to_string()))?;
        let url = parts.next().map(str::to_string);

        Ok(Self {
            org,
            campaign,
            recipient,
            message,
            url,
        })
    }
}

/// Builds and parses the three tracking endpoints for one organization.
#[derive(Debug, Clone)]
pub struct TrackingLinks {
    base_url: String,
    org: OrgId,
    signer: Signer,
}

impl TrackingLinks {
    /// A link builder for `org` against the companion service at
    /// `base_url` (no trailing slash required).
    #[must_use]
    pub fn new(base_url: &str, signing_key: &str, org: OrgId) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            org,
            signer: Signer::new(signing_key),
        }
    }

    /// The organization these links identify.
    #[must_use]
    pub const fn org(&self) -> OrgId {
        self.org
    }

    /// The service base URL. Used to recognize already-rewritten links.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(&self, endpoint: &str, data: &TrackingData) -> String {
        let encoded = data.encode();
        let mac = self.signer.sign(&encoded);
        let b64 = URL_SAFE_NO_PAD.encode(encoded.as_bytes());
        format!("{}/track/{endpoint}/{b64}/{mac}", self.base_url)
    }

    /// The 1x1 open-pixel URL.
    #[must_use]
    pub fn open_url(
        &self,
        campaign: CampaignId,
        recipient: SubscriberId,
        message: QueueRowId,
    ) -> String {
        self.build(
            "open",
            &TrackingData {
                org: self.org,
                campaign,
                recipient,
                message,
                url: None,
            },
        )
    }

    /// A click-redirect URL carrying the original destination.
    #[must_use]
    pub fn click_url(
        &self,
        campaign: CampaignId,
        recipient: SubscriberId,
        message: QueueRowId,
        original: &str,
    ) -> String {
        self.build(
            "click",
            &TrackingData {
                org: self.org,
                campaign,
                recipient,
                message,
                url: Some(original.to_string()),
            },
        )
    }

    /// The signed one-click unsubscribe URL.
    #[must_use]
    pub fn unsubscribe_url(
        &self,
        campaign: CampaignId,
        recipient: SubscriberId,
        message: QueueRowId,
    ) -> String {
        self.build(
            "unsubscribe",
            &TrackingData {
                org: self.org,
                campaign,
                recipient,
                message,
                url: None,
            },
        )
    }

    /// Decode and verify the `{b64}/{mac}` tail of a tracking URL.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackingError`] when the payload is not base64, does not
    /// follow the grammar, or fails MAC verification.
    pub fn parse(&self, b64: &str, mac: &str) -> Result<TrackingData, TrackingError> {
        let raw = URL_SAFE_NO_PAD
            .decode(b64.as_bytes())
            .map_err(|_| TrackingError::InvalidEncoding)?;
        let data = String::from_utf8(raw).map_err(|_| TrackingError::InvalidEncoding)?;
        self.signer.verify(&data, mac)?;
        TrackingData::decode(&data)
    }

    /// Split a full tracking URL into its `{b64}/{mac}` tail and parse it.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::MalformedPayload`] when the URL does not
    /// look like one of ours, or the tail errors above.
    pub fn parse_url(&self, url: &str) -> Result<TrackingData, TrackingError> {
        let tail = url
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix("/track/"))
            .ok_or_else(|| TrackingError::MalformedPayload("not a tracking URL".to_string()))?;

        let mut segments = tail.split('/');
        let _endpoint = segments.next();
        let b64 = segments
            .next()
            .ok_or_else(|| TrackingError::MalformedPayload("missing payload".to_string()))?;
        let mac = segments
            .next()
            .ok_or_else(|| TrackingError::MalformedPayload("missing mac".to_string()))?;
        self.parse(b64, mac)
    }
}
