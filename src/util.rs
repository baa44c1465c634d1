use time::PrimitiveDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

const ISO_SECONDS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DISPLAY: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

/// Render an archived ISO-8601 timestamp as `YYYY-MM-DD HH:MM`. Fractional
/// seconds and offsets are ignored; anything unparseable is returned as is.
pub fn format_timestamp(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let seconds = trimmed.get(..19).unwrap_or(trimmed);
    PrimitiveDateTime::parse(seconds, ISO_SECONDS)
        .ok()
        .and_then(|datetime| datetime.format(DISPLAY).ok())
        .unwrap_or_else(|| trimmed.to_string())
}

pub fn format_percent(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}

pub fn truncate(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        input.to_string()
    } else {
        let mut out = input.chars().take(max.saturating_sub(1)).collect::<String>();
        out.push('…');
        out
    }
}
