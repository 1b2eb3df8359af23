//! Post links and the weekly calendar.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, Utc};
use regex::Regex;

static SHORTCODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"instagram\.com/(?:p|reel)/([^/?#]+)").expect("shortcode pattern is valid")
});

/// Extract the post key from a submitted link.
///
/// Accepts `/p/<code>` and `/reel/<code>` links with or without scheme,
/// trailing slash or query string.
pub fn extract_shortcode(link: &str) -> Option<String> {
    SHORTCODE
        .captures(link)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|code| !code.is_empty())
}

/// Monday of the week containing `now`, in the program's local offset.
pub fn week_start(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    let local = now.with_timezone(&offset).date_naive();
    let since_monday = u64::from(local.weekday().num_days_from_monday());
    local
        .checked_sub_days(Days::new(since_monday))
        .unwrap_or(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn shortcode_from_post_and_reel_links() {
        assert_eq!(
            extract_shortcode("https://www.instagram.com/p/ABC123/").as_deref(),
            Some("ABC123")
        );
        assert_eq!(
            extract_shortcode("instagram.com/reel/Xy_z-9?igsh=abc").as_deref(),
            Some("Xy_z-9")
        );
        assert_eq!(
            extract_shortcode("https://instagram.com/p/Q1w2#frag").as_deref(),
            Some("Q1w2")
        );
    }

    #[test]
    fn non_post_links_have_no_shortcode() {
        assert_eq!(extract_shortcode("https://www.instagram.com/alice/"), None);
        assert_eq!(extract_shortcode("https://example.com/p/ABC"), None);
        assert_eq!(extract_shortcode("https://instagram.com/p/"), None);
    }

    #[test]
    fn week_starts_on_monday_in_local_offset() {
        let kst = FixedOffset::east_opt(9 * 3600).unwrap();

        // Sunday 20:00 UTC is already Monday morning in KST.
        let now = Utc.with_ymd_and_hms(2026, 10, 11, 20, 0, 0).unwrap();
        assert_eq!(week_start(now, kst), NaiveDate::from_ymd_opt(2026, 10, 12).unwrap());

        // Friday stays in the same week.
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap();
        assert_eq!(week_start(now, kst), NaiveDate::from_ymd_opt(2026, 10, 12).unwrap());

        let utc = FixedOffset::east_opt(0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 11, 20, 0, 0).unwrap();
        assert_eq!(week_start(now, utc), NaiveDate::from_ymd_opt(2026, 10, 5).unwrap());
    }
}
