//! Event-date detection for study cards that print their session dates as free
//! text ("Mar 5-9, 2026", "3/14", "Apr 30 - May 2").

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

const MONTHS: &str = r"(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|Jun(?:e)?|Jul(?:y)?|Aug(?:ust)?|Sep(?:t(?:ember)?)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)";
const DAY: &str = r"\d{1,2}(?:st|nd|rd|th)?";
const YEAR: &str = r"(?:,\s*\d{4})?";

static POSTED_STAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Posted:\s*\d{1,2}/\d{1,2}/\d{2,4}").expect("valid regex"));

/// Candidate patterns, most specific first.
static CANDIDATES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"(?i)\b{MONTHS}\.?\s+{DAY}\s*[-–]\s*{DAY}{YEAR}"),
        format!(r"(?i)\b{MONTHS}\.?\s+{DAY}\s*[-–]\s*{MONTHS}\.?\s+{DAY}{YEAR}"),
        format!(r"(?i)\b{MONTHS}\.?\s+{DAY}{YEAR}"),
        r"\b\d{1,2}/\d{1,2}/\d{2,4}\b".to_string(),
        r"\b\d{1,2}/\d{1,2}\s*[-–]\s*\d{1,2}/\d{1,2}(?:/\d{2,4})?\b".to_string(),
        r"\b\d{1,2}/\d{1,2}\b".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)(?:st|nd|rd|th)").expect("valid regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static MONTH_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([A-Za-z]+)\.?\s+(\d{1,2})\s*[-–]\s*([A-Za-z]+)\.?\s+(\d{1,2})(?:,\s*(\d{4}))?$")
        .expect("valid regex")
});
static DAY_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([A-Za-z]+)\.?\s+(\d{1,2})\s*[-–]\s*(\d{1,2})(?:,\s*(\d{4}))?$").expect("valid regex")
});
static SINGLE_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([A-Za-z]+)\.?\s+(\d{1,2})(?:,\s*(\d{4}))?$").expect("valid regex")
});
static NUMERIC_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?\s*[-–]\s*(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?$")
        .expect("valid regex")
});
static NUMERIC_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?$").expect("valid regex"));

/// Inclusive range of days a study runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl EventRange {
    pub fn has_ended(&self, today: NaiveDate) -> bool {
        self.end < today
    }

    /// Human label: `Mar 05, 2026`, `Mar 5–9, 2026`, `Mar 30 – Apr 02, 2026`.
    pub fn label(&self) -> String {
        let (start, end) = (self.start, self.end);
        if start == end {
            start.format("%b %d, %Y").to_string()
        } else if start.year() == end.year() && start.month() == end.month() {
            format!("{} {}–{}, {}", start.format("%b"), start.day(), end.day(), start.year())
        } else if start.year() == end.year() {
            format!("{} – {}, {}", start.format("%b %d"), end.format("%b %d"), start.year())
        } else {
            format!("{} – {}", start.format("%b %d, %Y"), end.format("%b %d, %Y"))
        }
    }
}

/// Finds and parses the first event date in `text`, ignoring "Posted: m/d/y"
/// stamps. Years default to `today`'s year.
pub fn detect_event(text: &str, today: NaiveDate) -> Option<EventRange> {
    let cleaned = POSTED_STAMP.replace_all(text, "");
    let candidate = find_event_date_text(&cleaned)?;
    parse_event_range(candidate, today)
}

pub fn find_event_date_text(text: &str) -> Option<&str> {
    CANDIDATES
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str())
}

pub fn parse_event_range(raw: &str, today: NaiveDate) -> Option<EventRange> {
    let stripped = ORDINAL.replace_all(raw, "$1");
    let s = SPACES.replace_all(stripped.trim(), " ");
    if s.is_empty() {
        return None;
    }
    let default_year = today.year();

    if let Some(c) = MONTH_RANGE.captures(&s) {
        let year = opt_year(c.get(5).map(|m| m.as_str())).unwrap_or(default_year);
        let start = ymd(year, month_number(&c[1])?, num(&c[2])?)?;
        let end = ymd(year, month_number(&c[3])?, num(&c[4])?)?;
        return Some(EventRange { start, end });
    }
    if let Some(c) = DAY_RANGE.captures(&s) {
        let year = opt_year(c.get(4).map(|m| m.as_str())).unwrap_or(default_year);
        let month = month_number(&c[1])?;
        let start = ymd(year, month, num(&c[2])?)?;
        let end = ymd(year, month, num(&c[3])?)?;
        return Some(EventRange { start, end });
    }
    if let Some(c) = SINGLE_DAY.captures(&s) {
        let year = opt_year(c.get(3).map(|m| m.as_str())).unwrap_or(default_year);
        let day = ymd(year, month_number(&c[1])?, num(&c[2])?)?;
        return Some(EventRange { start: day, end: day });
    }
    if let Some(c) = NUMERIC_RANGE.captures(&s) {
        let start_year = opt_year(c.get(3).map(|m| m.as_str())).unwrap_or(default_year);
        let end_year = opt_year(c.get(6).map(|m| m.as_str())).unwrap_or(start_year);
        let start = ymd(start_year, num(&c[1])?, num(&c[2])?)?;
        let end = ymd(end_year, num(&c[4])?, num(&c[5])?)?;
        return Some(EventRange { start, end });
    }
    if let Some(c) = NUMERIC_DAY.captures(&s) {
        let year = opt_year(c.get(3).map(|m| m.as_str())).unwrap_or(default_year);
        let day = ymd(year, num(&c[1])?, num(&c[2])?)?;
        return Some(EventRange { start: day, end: day });
    }
    None
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "jan" | "january" => 1,
        "feb" | "february" => 2,
        "mar" | "march" => 3,
        "apr" | "april" => 4,
        "may" => 5,
        "jun" | "june" => 6,
        "jul" | "july" => 7,
        "aug" | "august" => 8,
        "sep" | "sept" | "september" => 9,
        "oct" | "october" => 10,
        "nov" | "november" => 11,
        "dec" | "december" => 12,
        _ => return None,
    };
    Some(month)
}

// two-digit years are 20xx
fn opt_year(raw: Option<&str>) -> Option<i32> {
    let raw = raw?;
    let value: i32 = raw.parse().ok()?;
    Some(if raw.len() == 2 { value + 2000 } else { value })
}

fn num(raw: &str) -> Option<u32> {
    raw.parse().ok()
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    #[test]
    fn month_name_forms() {
        assert_eq!(
            detect_event("Sessions on March 5th - 9th", today()),
            Some(EventRange { start: d(3, 5), end: d(3, 9) })
        );
        assert_eq!(
            detect_event("Apr 30 – May 2, 2026 in Chicago", today()),
            Some(EventRange { start: d(4, 30), end: d(5, 2) })
        );
        assert_eq!(
            detect_event("Held Sept. 12", today()),
            Some(EventRange { start: d(9, 12), end: d(9, 12) })
        );
    }

    #[test]
    fn numeric_forms_and_posted_stamp_is_ignored() {
        assert_eq!(
            detect_event("Posted: 01/02/2026 Study date 3/14", today()),
            Some(EventRange { start: d(3, 14), end: d(3, 14) })
        );
        assert_eq!(
            detect_event("Runs 3/20/26", today()),
            Some(EventRange { start: d(3, 20), end: d(3, 20) })
        );
        assert_eq!(detect_event("Posted: 2/1/2026 online anytime", today()), None);
    }

    #[test]
    fn impossible_dates_are_dropped() {
        assert_eq!(parse_event_range("Feb 30", today()), None);
        assert_eq!(parse_event_range("13/40", today()), None);
    }

    #[test]
    fn labels_follow_range_shape() {
        assert_eq!(EventRange { start: d(3, 5), end: d(3, 5) }.label(), "Mar 05, 2026");
        assert_eq!(EventRange { start: d(3, 5), end: d(3, 9) }.label(), "Mar 5–9, 2026");
        assert_eq!(
            EventRange { start: d(3, 30), end: d(4, 2) }.label(),
            "Mar 30 – Apr 02, 2026"
        );
    }

    #[test]
    fn ended_is_strictly_before_today() {
        let range = EventRange { start: d(2, 20), end: d(3, 1) };
        assert!(!range.has_ended(today()));
        assert!(range.has_ended(d(3, 2)));
    }
}
