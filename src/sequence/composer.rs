//! Message composition: subject, HTML body, thread headers, tracking pixel.
//!
//! Composition is pure. The only clock input is the fallback timestamp used
//! in the "On ... wrote:" line of a quoted reply.

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::sequence::StepKey;

/// The thread root a reply step quotes and references.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadContext {
    pub root_message_id: String,
    pub root_body: String,
    pub root_sent_at: Option<DateTime<Utc>>,
}

/// Identifies the step an open-tracking hit belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingCorrelation {
    pub recipient: String,
    pub step_key: StepKey,
    pub prospect_id: String,
}

/// Everything needed to compose one outgoing message.
#[derive(Debug, Clone)]
pub struct ComposeRequest<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub thread: Option<&'a ThreadContext>,
    /// Shown in the quoted-reply header.
    pub sender_display: &'a str,
    pub tracking: &'a TrackingCorrelation,
    pub tracking_base: &'a Url,
    pub now: DateTime<Utc>,
}

/// Threading headers for a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadHeaders {
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

impl ThreadHeaders {
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }
}

/// A transport-ready message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub subject: String,
    pub html_body: String,
    pub headers: ThreadHeaders,
}

/// Path of the open-tracking endpoint, relative to the public base URL.
pub const TRACKING_PATH: &str = "track";

/// Compose the message for one step.
pub fn compose(req: &ComposeRequest<'_>) -> ComposedMessage {
    let pixel = tracking_pixel(req.tracking_base, req.tracking);

    let Some(thread) = req.thread else {
        return ComposedMessage {
            subject: req.subject.to_string(),
            html_body: format!("{}{}", req.body, pixel),
            headers: ThreadHeaders::default(),
        };
    };

    let quoted_at = thread.root_sent_at.unwrap_or(req.now);
    let quote = format!(
        "<br><br><div class=\"gmail_quote\">\
         <div class=\"gmail_attr\">On {}, {} wrote:</div>\
         <blockquote class=\"gmail_quote\" style=\"margin:0 0 0 .8ex;border-left:1px solid #ccc;padding-left:1ex\">{}</blockquote>\
         </div>",
        quoted_at.format("%a, %b %-d, %Y at %-I:%M %p"),
        html_escape(req.sender_display),
        thread.root_body,
    );

    ComposedMessage {
        subject: reply_subject(req.subject),
        html_body: format!("{}{}{}", req.body, quote, pixel),
        headers: ThreadHeaders {
            in_reply_to: Some(thread.root_message_id.clone()),
            references: Some(thread.root_message_id.clone()),
        },
    }
}

/// `Re: ` prefix, without stacking onto an existing one.
pub fn reply_subject(subject: &str) -> String {
    let already_reply = subject
        .trim_start()
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
    if already_reply {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Absolute URL of the tracking pixel for a step.
pub fn tracking_url(base: &Url, tracking: &TrackingCorrelation) -> Url {
    let mut url = base.clone();
    {
        // Keep any path prefix the service is mounted under.
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{path}/{TRACKING_PATH}"));
    }
    url.query_pairs_mut()
        .clear()
        .append_pair("email", &tracking.recipient)
        .append_pair("emailKey", tracking.step_key.as_str())
        .append_pair("id", &tracking.prospect_id);
    url
}

fn tracking_pixel(base: &Url, tracking: &TrackingCorrelation) -> String {
    format!(
        "<img src=\"{}\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none\" />",
        html_escape(tracking_url(base, tracking).as_str())
    )
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
