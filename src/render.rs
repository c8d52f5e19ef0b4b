//! Digest and confirmation email rendering.
use crate::model::{Post, Subscription};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SHORTENER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://t\.co/[A-Za-z0-9]+").expect("valid shortener regex"));

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("post {external_id} has an undecodable payload: {source}")]
    Payload {
        external_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Subject of the message that carries an address confirmation link.
pub const CONFIRMATION_SUBJECT: &str = "Confirm your digest email address";

/// Render the digest for `posts`, which are shown in the given order.
pub fn render_digest(
    subscription: &Subscription,
    date: NaiveDate,
    posts: &[Post],
) -> Result<RenderedEmail, RenderError> {
    let subject = subscription.subject(date);
    let mut html = page_head(&subject);
    html.push_str(&format!("<h1>{}</h1>", html_escape::encode_text(&subscription.title)));

    for post in posts {
        let payload = post.decode_payload().map_err(|source| RenderError::Payload {
            external_id: post.external_id.clone(),
            source,
        })?;
        html.push_str("<div class=\"post\">");
        if !payload.author_avatar_url.is_empty() {
            html.push_str(&format!(
                "<img class=\"avatar\" src=\"{}\" width=\"48\" height=\"48\" alt=\"\">",
                html_escape::encode_double_quoted_attribute(&payload.author_avatar_url)
            ));
        }
        html.push_str(&format!(
            "<p class=\"author\"><b>{}</b> @{}</p><p class=\"text\">{}</p></div>",
            html_escape::encode_text(&payload.author_name),
            html_escape::encode_text(&payload.author_screen_name),
            linkify(payload.body())
        ));
    }
    html.push_str("</body></html>");

    Ok(RenderedEmail { subject, html })
}

/// Render the message asking the recipient to open `link`.
pub fn render_confirmation(link: &str) -> RenderedEmail {
    let subject = CONFIRMATION_SUBJECT.to_string();
    let link = html_escape::encode_double_quoted_attribute(link);
    let mut html = page_head(&subject);
    html.push_str("<p>Please confirm that you want to receive digests at this address.</p>");
    html.push_str(&format!("<p><a href=\"{link}\">Confirm email address</a></p>"));
    html.push_str("<p>If you did not sign up for digests, ignore this message.</p>");
    html.push_str("</body></html>");
    RenderedEmail { subject, html }
}

fn page_head(subject: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title></head><body>",
        html_escape::encode_text(subject)
    )
}

/// Escape `text` for HTML and turn shortened links into anchors.
fn linkify(text: &str) -> String {
    let escaped = html_escape::encode_text(text);
    SHORTENER
        .replace_all(&escaped, |caps: &regex::Captures<'_>| {
            format!("<a href=\"{0}\">{0}</a>", &caps[0])
        })
        .into_owned()
}
