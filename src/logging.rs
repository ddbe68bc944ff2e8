//! Tracing setup plus helpers that keep base64 image payloads out of logs.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let result = match config.format {
        LogFormat::Json => fmt().json().with_env_filter(filter).try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn looks_like_base64(s: &str) -> bool {
    s.len() > 100
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Short preview of a possibly huge base64 string.
pub fn preview_base64(data: &str) -> String {
    if data.len() > 50 {
        format!("{}...[{} chars total]", clip(data, 50), data.len())
    } else {
        data.to_string()
    }
}

/// Replaces long base64 strings anywhere in a JSON tree with a preview.
pub fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for val in map.values_mut() {
                truncate_base64_in_json(val);
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        serde_json::Value::String(s) if looks_like_base64(s) => {
            *s = format!("{}...[truncated {} chars]", clip(s, 50), s.len() - 50);
        }
        _ => {}
    }
}

/// Loggable form of a raw JSON body.
pub fn loggable_body(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(mut value) => {
            truncate_base64_in_json(&mut value);
            value.to_string()
        }
        Err(_) if body.len() > 1000 => format!("{}...", clip(body, 1000)),
        Err(_) => body.to_string(),
    }
}

/// Guess of the image container from the first base64 characters.
pub fn sniff_image_kind(data: &str) -> &'static str {
    if data.starts_with("iVBORw0KGgo") {
        "PNG"
    } else if data.starts_with("/9j/") {
        "JPEG"
    } else if data.starts_with("PHN2Zy") || data.starts_with("PD94bWwg") {
        "SVG"
    } else if data.starts_with("UklGR") {
        "WEBP"
    } else {
        "Unknown"
    }
}

fn clip(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
