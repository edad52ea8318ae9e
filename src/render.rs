use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::archive::{write_atomic, Message};
use crate::config::SiteConfig;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const STYLE: &str = r#"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 1000px;
            margin: 0 auto;
            padding: 20px;
            line-height: 1.6;
            color: #333;
            background-color: #f5f5f5;
        }
        .container {
            background: white;
            border-radius: 8px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.1);
            padding: 20px;
        }
        .header {
            text-align: center;
            margin-bottom: 30px;
            border-bottom: 1px solid #eee;
            padding-bottom: 20px;
        }
        .stats {
            background: #e8f4fc;
            padding: 10px;
            border-radius: 4px;
            margin-bottom: 20px;
        }
        .message {
            border-left: 4px solid #4a90e2;
            padding: 15px;
            margin-bottom: 15px;
            background-color: #f9f9f9;
            border-radius: 0 4px 4px 0;
        }
        .sender {
            font-weight: bold;
            color: #4a90e2;
            margin-right: 8px;
        }
        .text {
            margin: 8px 0;
            white-space: pre-wrap;
            line-height: 1.5;
        }
        .timestamp {
            color: #888;
            font-size: 0.85em;
            display: block;
            margin-top: 5px;
        }
        .footer {
            text-align: center;
            margin-top: 30px;
            color: #888;
            font-size: 0.9em;
            border-top: 1px solid #eee;
            padding-top: 20px;
        }
        @media (max-width: 600px) {
            body { padding: 15px; }
            .container { padding: 15px; }
            .message { padding: 10px; }
        }
"#;

/// Escape text for use in HTML content and attribute values
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Parse an IANA timezone name, falling back to UTC
pub fn resolve_timezone(name: &str) -> Tz {
    match name.trim().parse::<Tz>() {
        Ok(tz) => tz,
        Err(e) => {
            warn!("Invalid timezone {:?}, falling back to UTC: {}", name, e);
            Tz::UTC
        }
    }
}

fn format_timestamp(timestamp: i64, tz: &Tz) -> String {
    if timestamp == 0 {
        return "unknown time".to_string();
    }
    match tz.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.format(TIME_FORMAT).to_string(),
        None => "unknown time".to_string(),
    }
}

/// Render the archive page: the newest `items_per_page` messages, newest first.
pub fn render_page(messages: &[Message], site: &SiteConfig, now: DateTime<Utc>) -> String {
    let tz = resolve_timezone(&site.timezone);

    let mut recent: Vec<&Message> = messages.iter().collect();
    recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    recent.truncate(site.items_per_page);

    let title = escape_html(&site.title);

    let mut html = String::with_capacity(4096 + recent.len() * 256);
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    html.push_str("    <meta charset=\"UTF-8\">\n");
    html.push_str(
        "    <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n",
    );
    html.push_str(&format!("    <title>{}</title>\n", title));
    html.push_str(&format!("    <style>{}    </style>\n", STYLE));
    html.push_str("</head>\n<body>\n    <div class=\"container\">\n");

    html.push_str(&format!(
        "        <div class=\"header\">\n            <h1>{}</h1>\n            <p>Messages collected automatically from Telegram</p>\n        </div>\n",
        title
    ));

    html.push_str(&format!(
        "        <div class=\"stats\">\n            <strong>{}</strong> messages archived, showing the latest <strong>{}</strong>\n        </div>\n",
        messages.len(),
        recent.len()
    ));

    html.push_str("        <div id=\"messages\">\n");
    for message in &recent {
        html.push_str(&format!(
            "            <div class=\"message\">\n                <span class=\"sender\">{}</span>\n                <div class=\"text\">{}</div>\n                <span class=\"timestamp\">{}</span>\n            </div>\n",
            escape_html(&message.sender_name),
            escape_html(&message.text),
            format_timestamp(message.timestamp, &tz)
        ));
    }
    html.push_str("        </div>\n");

    html.push_str(&format!(
        "        <div class=\"footer\">\n            <p>Generated automatically | Last updated: {} ({})</p>\n        </div>\n",
        now.with_timezone(&tz).format(TIME_FORMAT),
        tz.name()
    ));

    html.push_str("    </div>\n</body>\n</html>\n");
    html
}

/// Render the page and write it to the configured output path
pub fn write_page(messages: &[Message], site: &SiteConfig, now: DateTime<Utc>) -> Result<()> {
    let html = render_page(messages, site, now);
    write_atomic(&site.output_path, html.as_bytes())
        .with_context(|| format!("Failed to write page: {}", site.output_path.display()))?;

    info!(
        "Generated {} with {} of {} messages",
        site.output_path.display(),
        messages.len().min(site.items_per_page),
        messages.len()
    );
    Ok(())
}
