//! HTML tracking injection.
//!
//! Applied to every outbound HTML body after merge-field substitution:
//!
//! 1. preheader text in a hidden span directly after `<body>`
//! 2. every `href` rewritten to a signed click redirect
//! 3. a 1x1 open pixel just before `</body>`
//! 4. `List-Unsubscribe` / `List-Unsubscribe-Post` / `X-Job` headers

use std::sync::LazyLock;

use regex::Regex;

use cadence_common::ids::{CampaignId, QueueRowId, SubscriberId};

use crate::links::TrackingLinks;

static BODY_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<body[^>]*>").expect("static regex"));
static BODY_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</body>").expect("static regex"));
static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex")
});

/// An HTML body with tracking applied, plus the headers to attach.
#[derive(Debug, Clone)]
pub struct InjectedMessage {
    pub html: String,
    pub headers: Vec<(String, String)>,
}

/// Whether a destination should be left alone by the click rewriter.
fn skip_rewrite(url: &str, links: &TrackingLinks) -> bool {
    url.is_empty()
        || url.starts_with('#')
        || url.starts_with("mailto:")
        || url.starts_with("tel:")
        || url.starts_with(links.base_url())
}

fn insert_preheader(html: &str, preheader: &str) -> String {
    let span = format!(
        "<span style=\"display:none;font-size:1px;color:#ffffff;line-height:1px;\
         max-height:0px;max-width:0px;opacity:0;overflow:hidden;\">{preheader}</span>"
    );

    BODY_OPEN.find(html).map_or_else(
        || format!("{span}{html}"),
        |open| {
            let mut out = String::with_capacity(html.len() + span.len());
            out.push_str(&html[..open.end()]);
            out.push_str(&span);
            out.push_str(&html[open.end()..]);
            out
        },
    )
}

fn insert_pixel(html: &str, pixel_url: &str) -> String {
    let pixel = format!(
        "<img src=\"{pixel_url}\" width=\"1\" height=\"1\" border=\"0\" alt=\"\" \
         style=\"height:1px;width:1px;border:0;\" />"
    );

    BODY_CLOSE.find(html).map_or_else(
        || format!("{html}{pixel}"),
        |close| {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..close.start()]);
            out.push_str(&pixel);
            out.push_str(&html[close.start()..]);
            out
        },
    )
}

fn rewrite_links(
    html: &str,
    links: &TrackingLinks,
    campaign: CampaignId,
    recipient: SubscriberId,
    message: QueueRowId,
) -> String {
    HREF.replace_all(html, |captures: &regex::Captures<'_>| {
        let original = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map_or("", |m| m.as_str());

        if skip_rewrite(original, links) {
            captures[0].to_string()
        } else {
            let tracked = links.click_url(campaign, recipient, message, original);
            format!("href=\"{tracked}\"")
        }
    })
    .into_owned()
}

/// The headers every outbound message carries, HTML or not: one-click
/// unsubscribe plus the campaign job marker.
#[must_use]
pub fn tracking_headers(
    links: &TrackingLinks,
    campaign: CampaignId,
    recipient: SubscriberId,
    message: QueueRowId,
) -> Vec<(String, String)> {
    let unsubscribe = links.unsubscribe_url(campaign, recipient, message);
    vec![
        ("List-Unsubscribe".to_string(), format!("<{unsubscribe}>")),
        (
            "List-Unsubscribe-Post".to_string(),
            "List-Unsubscribe=One-Click".to_string(),
        ),
        ("X-Job".to_string(), campaign.to_string()),
    ]
}

/// Apply the full injection pass to one message's HTML.
#[must_use]
pub fn inject_tracking(
    html: &str,
    preheader: Option<&str>,
    links: &TrackingLinks,
    campaign: CampaignId,
    recipient: SubscriberId,
    message: QueueRowId,
) -> InjectedMessage {
    let mut html = rewrite_links(html, links, campaign, recipient, message);

    if let Some(preheader) = preheader {
        if !preheader.is_empty() {
            html = insert_preheader(&html, preheader);
        }
    }

    html = insert_pixel(&html, &links.open_url(campaign, recipient, message));

    InjectedMessage {
        html,
        headers: tracking_headers(links, campaign, recipient, message),
    }
}

#[cfg(test)]
mod tests {
    use cadence_common::ids::OrgId;

    use super::*;

    fn links() -> TrackingLinks {
        TrackingLinks::new("https://t.example.com", "key", OrgId::generate())
    }

    fn inject(html: &str, preheader: Option<&str>) -> InjectedMessage {
        inject_tracking(
            html,
            preheader,
            &links(),
            CampaignId::generate(),
            SubscriberId::generate(),
            QueueRowId::generate(),
        )
    }

    #[test]
    fn pixel_lands_before_body_close() {
        let out = inject("<html><body><p>Hi</p></body></html>", None);
        let pixel_at = out.html.find("/track/open/").unwrap();
        let body_close_at = out.html.find("</body>").unwrap();
        assert!(pixel_at < body_close_at);
    }

    #[test]
    fn pixel_appends_when_no_body_tag() {
        let out = inject("<p>Hi</p>", None);
        assert!(out.html.starts_with("<p>Hi</p>"));
        assert!(out.html.contains("/track/open/"));
    }

    #[test]
    fn preheader_follows_body_open() {
        let out = inject("<body class=\"x\"><p>Hi</p></body>", Some("Fresh deals inside"));
        let body_end = out.html.find('>').unwrap();
        let span_at = out.html.find("Fresh deals inside").unwrap();
        assert!(span_at > body_end);
        assert!(out.html.contains("display:none"));
        // The preheader precedes the visible content.
        assert!(span_at < out.html.find("<p>Hi</p>").unwrap());
    }

    #[test]
    fn hrefs_are_rewritten_to_click_redirects() {
        let builder = links();
        let out = inject_tracking(
            "<body><a href=\"https://acme.example/pricing\">Pricing</a></body>",
            None,
            &builder,
            CampaignId::generate(),
            SubscriberId::generate(),
            QueueRowId::generate(),
        );
        assert!(!out.html.contains("href=\"https://acme.example/pricing\""));

        // The original destination survives inside the payload.
        let start = out.html.find("https://t.example.com/track/click/").unwrap();
        let end = out.html[start..].find('"').unwrap() + start;
        let data = builder.parse_url(&out.html[start..end]).unwrap();
        assert_eq!(data.url.as_deref(), Some("https://acme.example/pricing"));
    }

    #[test]
    fn mailto_anchor_and_tracking_urls_are_left_alone() {
        let html = "<body>\
            <a href=\"mailto:hi@acme.example\">mail</a>\
            <a href=\"#top\">top</a>\
            <a href=\"https://t.example.com/track/click/abc/def\">done</a>\
            </body>";
        let out = inject(html, None);
        assert!(out.html.contains("href=\"mailto:hi@acme.example\""));
        assert!(out.html.contains("href=\"#top\""));
        assert!(
            out.html
                .contains("href=\"https://t.example.com/track/click/abc/def\"")
        );
    }

    #[test]
    fn single_quoted_hrefs_are_rewritten_too() {
        let out = inject("<body><a href='https://acme.example/'>x</a></body>", None);
        assert!(out.html.contains("/track/click/"));
        assert!(!out.html.contains("href='https://acme.example/'"));
    }

    #[test]
    fn unsubscribe_headers_are_attached() {
        let out = inject("<body></body>", None);
        let headers: std::collections::HashMap<_, _> = out.headers.into_iter().collect();
        assert!(headers["List-Unsubscribe"].starts_with('<'));
        assert!(headers["List-Unsubscribe"].contains("/track/unsubscribe/"));
        assert_eq!(headers["List-Unsubscribe-Post"], "List-Unsubscribe=One-Click");
        assert!(headers.contains_key("X-Job"));
    }

    #[test]
    fn full_round_trip_recovers_identity_from_pixel() {
        let builder = links();
        let campaign = CampaignId::generate();
        let recipient = SubscriberId::generate();
        let message = QueueRowId::generate();

        let out = inject_tracking(
            "<html><body><p>Hello</p></body></html>",
            None,
            &builder,
            campaign,
            recipient,
            message,
        );

        // Extract the pixel URL back out of the HTML.
        let start = out.html.find("https://t.example.com/track/open/").unwrap();
        let end = out.html[start..].find('"').unwrap() + start;
        let data = builder.parse_url(&out.html[start..end]).unwrap();

        assert_eq!(data.org, builder.org());
        assert_eq!(data.campaign, campaign);
        assert_eq!(data.recipient, recipient);
        assert_eq!(data.message, message);
    }
}
