use once_cell::sync::Lazy;
use regex::Regex;

static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{4}-\d{2}-\d{2}|tomorrow|today|next week|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
    )
    .unwrap()
});

static RE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2}:\d{2}|\d{1,2}\s*(?:am|pm))\b").unwrap());

static RE_PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap());

/// Fields recognized in a single utterance. All best-effort substrings,
/// not validated or normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub date: Option<String>,
    pub time: Option<String>,
    pub phone: Option<String>,
}

/// Pulls appointment fields out of free caller speech.
///
/// Abstracted so the naive pattern matching can be swapped for real entity
/// extraction without touching the stage machine.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, text: &str) -> ExtractedFields;
}

/// Default extractor: date-like, time-like, and phone-like substrings via
/// regex. No locale handling, no validation of the matched values.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexExtractor;

impl FieldExtractor for RegexExtractor {
    fn extract(&self, text: &str) -> ExtractedFields {
        ExtractedFields {
            date: RE_DATE.find(text).map(|m| m.as_str().to_string()),
            time: RE_TIME.find(text).map(|m| m.as_str().to_string()),
            phone: RE_PHONE.find(text).map(|m| m.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_relative_date_time_and_phone() {
        let fields = RegexExtractor
            .extract("I need to book an appointment tomorrow at 2pm, my number is 415-555-0100");
        assert_eq!(fields.date.as_deref(), Some("tomorrow"));
        assert_eq!(fields.time.as_deref(), Some("2pm"));
        assert_eq!(fields.phone.as_deref(), Some("415-555-0100"));
    }

    #[test]
    fn extracts_iso_date_and_clock_time() {
        let fields = RegexExtractor.extract("How about 2025-03-14 at 10:30?");
        assert_eq!(fields.date.as_deref(), Some("2025-03-14"));
        assert_eq!(fields.time.as_deref(), Some("10:30"));
        assert_eq!(fields.phone, None);
    }

    #[test]
    fn phone_digits_do_not_leak_into_other_fields() {
        let fields = RegexExtractor.extract("call me back on 4155550100");
        assert_eq!(fields.phone.as_deref(), Some("4155550100"));
        assert_eq!(fields.date, None);
        assert_eq!(fields.time, None);
    }

    #[test]
    fn weekday_names_count_as_dates() {
        let fields = RegexExtractor.extract("Saturday morning works best");
        assert_eq!(fields.date.as_deref(), Some("Saturday"));
    }

    #[test]
    fn plain_chatter_extracts_nothing() {
        assert_eq!(
            RegexExtractor.extract("do you take walk-ins?"),
            ExtractedFields::default()
        );
    }
}
