//! Current date and time.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, SecondsFormat, TimeZone, Utc};
use relayclaw_core::error::ToolError;
use relayclaw_core::tool::Tool;

pub struct DateTimeTool;

/// A timezone the tool knows how to render.
#[derive(Debug, Clone, PartialEq)]
enum Zone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

/// Accepts `UTC`, `local`, and fixed offsets such as `+08:00`, `-0530`,
/// `UTC+8` or `GMT-3`. Anything else is unknown.
fn parse_zone(tz: &str) -> Option<Zone> {
    let tz = tz.trim();
    match tz.to_ascii_lowercase().as_str() {
        "" | "local" | "system" => return Some(Zone::Local),
        "utc" | "z" | "gmt" | "etc/utc" => return Some(Zone::Utc),
        _ => {}
    }

    let offset = tz
        .strip_prefix("UTC")
        .or_else(|| tz.strip_prefix("GMT"))
        .unwrap_or(tz);
    let (sign, rest) = match offset.chars().next()? {
        '+' => (1, &offset[1..]),
        '-' => (-1, &offset[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest[..2].parse().ok()?, rest[2..].parse().ok()?),
        None => (rest.parse().ok()?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(Zone::Fixed)
}

fn format_in<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%A, %B %-d, %Y, %H:%M:%S").to_string()
}

fn render(now: DateTime<Utc>, requested: Option<&str>) -> serde_json::Value {
    let requested = requested.unwrap_or("local");
    let (zone, note) = match parse_zone(requested) {
        Some(z) => (z, None),
        None => (
            Zone::Utc,
            Some(format!("Unknown timezone '{requested}', showing UTC")),
        ),
    };

    let (formatted, timezone) = match &zone {
        Zone::Utc => (format_in(&now), "UTC".to_string()),
        Zone::Local => {
            let local = now.with_timezone(&Local);
            (format_in(&local), local.format("%:z").to_string())
        }
        Zone::Fixed(offset) => (format_in(&now.with_timezone(offset)), offset.to_string()),
    };

    let mut out = serde_json::json!({
        "iso": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "formatted": formatted,
        "timezone": timezone,
        "unixMs": now.timestamp_millis(),
    });
    if let Some(note) = note {
        out["note"] = serde_json::json!(note);
    }
    out
}

#[async_trait]
impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Get the current date, time, and timezone information"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "description": "Timezone: 'UTC', 'local', or a UTC offset such as '+08:00'. Defaults to the system timezone."
                }
            },
            "required": []
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let tz = arguments["timezone"].as_str().filter(|s| !s.is_empty());
        Ok(render(Utc::now(), tz).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 4, 5, 6).unwrap()
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(parse_zone("UTC"), Some(Zone::Utc));
        assert_eq!(parse_zone("local"), Some(Zone::Local));
        assert_eq!(parse_zone("+08:00"), Some(Zone::Fixed(FixedOffset::east_opt(8 * 3600).unwrap())));
        assert_eq!(parse_zone("UTC-5"), Some(Zone::Fixed(FixedOffset::west_opt(5 * 3600).unwrap())));
        assert_eq!(parse_zone("+0530"), Some(Zone::Fixed(FixedOffset::east_opt(5 * 3600 + 1800).unwrap())));
        assert_eq!(parse_zone("Mars/Olympus"), None);
        assert_eq!(parse_zone("+25:00"), None);
    }

    #[test]
    fn renders_utc() {
        let v = render(fixed_now(), Some("UTC"));
        assert_eq!(v["iso"], "2026-10-18T04:05:06.000Z");
        assert_eq!(v["formatted"], "Sunday, October 18, 2026, 04:05:06");
        assert_eq!(v["timezone"], "UTC");
        assert_eq!(v["unixMs"], fixed_now().timestamp_millis());
        assert!(v.get("note").is_none());
    }

    #[test]
    fn renders_fixed_offset() {
        let v = render(fixed_now(), Some("+08:00"));
        assert_eq!(v["formatted"], "Sunday, October 18, 2026, 12:05:06");
        assert_eq!(v["timezone"], "+08:00");
        // iso stays in UTC
        assert_eq!(v["iso"], "2026-10-18T04:05:06.000Z");
    }

    #[test]
    fn unknown_zone_falls_back_to_utc_with_note() {
        let v = render(fixed_now(), Some("Asia/Atlantis"));
        assert_eq!(v["timezone"], "UTC");
        assert!(v["note"].as_str().unwrap().contains("Asia/Atlantis"));
    }

    #[tokio::test]
    async fn execute_returns_json() {
        let out = DateTimeTool.execute(serde_json::json!({})).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["unixMs"].as_i64().unwrap() > 0);
        assert!(v["iso"].as_str().unwrap().ends_with('Z'));
    }
}
