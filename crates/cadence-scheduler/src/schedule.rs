//! Three-field `second minute hour` schedule expressions.
//!
//! | Term   | Meaning                                  |
//! |--------|------------------------------------------|
//! | `*`    | every position                           |
//! | `*/K`  | positions 0, K, 2K, … (0 < K < range)    |
//! | `A-B`  | inclusive range, A < B                   |
//! | `N`    | single position                          |
//!
//! Terms are comma separated within a field, e.g. `"0,30 */5 9-17"`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local, NaiveDateTime, Offset, TimeZone, Timelike};

use crate::error::{Result, SchedulerError};

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Presence bitmap for one field; `N` positions, bit `i` set when position
/// `i` matches.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldBits<const N: usize>(u64);

impl<const N: usize> FieldBits<N> {
    fn all() -> Self {
        Self(u64::MAX >> (64 - N))
    }

    fn set(&mut self, pos: usize) {
        debug_assert!(pos < N);
        self.0 |= 1 << pos;
    }

    pub fn contains(&self, pos: u32) -> bool {
        (pos as usize) < N && self.0 & (1 << pos) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// First set position at or after `from`.
    pub fn next_at_or_after(&self, from: u32) -> Option<u32> {
        if from as usize >= N {
            return None;
        }
        let masked = self.0 & (u64::MAX << from);
        (masked != 0).then(|| masked.trailing_zeros())
    }

    pub fn first(&self) -> Option<u32> {
        self.next_at_or_after(0)
    }

    fn parse_field(field: &str) -> std::result::Result<Self, String> {
        let mut bits = Self::default();
        for term in field.split(',') {
            bits.apply_term(term)?;
        }
        Ok(bits)
    }

    fn apply_term(&mut self, term: &str) -> std::result::Result<(), String> {
        if term == "*" {
            *self = Self::all();
            return Ok(());
        }

        if let Some(step) = term.strip_prefix("*/") {
            let step = parse_position(step, term)?;
            if step == 0 || step >= N {
                return Err(format!("step out of range in {term:?}"));
            }
            for pos in (0..N).step_by(step) {
                self.set(pos);
            }
            return Ok(());
        }

        if let Some((from, to)) = term.split_once('-') {
            let from = parse_position(from, term)?;
            let to = parse_position(to, term)?;
            if to >= N || from >= to {
                return Err(format!("bad range {term:?}"));
            }
            for pos in from..=to {
                self.set(pos);
            }
            return Ok(());
        }

        let pos = parse_position(term, term)?;
        if pos >= N {
            return Err(format!("position out of range in {term:?}"));
        }
        self.set(pos);
        Ok(())
    }
}

fn parse_position(digits: &str, term: &str) -> std::result::Result<usize, String> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("malformed term {term:?}"));
    }
    digits
        .parse::<usize>()
        .map_err(|_| format!("malformed term {term:?}"))
}

impl<const N: usize> fmt::Debug for FieldBits<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Highest position first, like a bitset dump.
        for pos in (0..N).rev() {
            f.write_str(if self.0 & (1 << pos) != 0 { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Parsed schedule: which seconds, minutes and hours of the day match.
///
/// Every bitmap has at least one position set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    seconds: FieldBits<60>,
    minutes: FieldBits<60>,
    hours: FieldBits<24>,
}

impl TimeSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            text: text.to_string(),
            reason,
        };

        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(invalid(format!("expected 3 fields, got {}", fields.len())));
        }

        let seconds = FieldBits::<60>::parse_field(fields[0])
            .map_err(|e| invalid(format!("second field: {e}")))?;
        let minutes = FieldBits::<60>::parse_field(fields[1])
            .map_err(|e| invalid(format!("minute field: {e}")))?;
        let hours = FieldBits::<24>::parse_field(fields[2])
            .map_err(|e| invalid(format!("hour field: {e}")))?;

        if seconds.is_empty() || minutes.is_empty() || hours.is_empty() {
            return Err(invalid("matches nothing".to_string()));
        }

        Ok(Self {
            seconds,
            minutes,
            hours,
        })
    }

    pub fn seconds(&self) -> &FieldBits<60> {
        &self.seconds
    }

    pub fn minutes(&self) -> &FieldBits<60> {
        &self.minutes
    }

    pub fn hours(&self) -> &FieldBits<24> {
        &self.hours
    }

    /// Unix timestamp of the next matching instant strictly after `from`,
    /// evaluated in `from`'s time zone.
    pub fn next_trigger<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<i64> {
        let (day_carry, hour, minute, second) =
            self.next_slot(from.hour(), from.minute(), from.second())?;

        let date = from.date_naive() + Duration::days(day_carry);
        let naive = date.and_hms_opt(hour, minute, second)?;
        let mut target = resolve_local(&from.timezone(), &naive, from)?;
        if target <= from.timestamp() {
            target += SECONDS_PER_DAY;
        }
        Some(target)
    }

    /// Whole seconds from `from` until [`TimeSpec::next_trigger`].
    ///
    /// Returns `None` when no matching instant can be computed.
    pub fn next_interval<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<u32> {
        let delta = self.next_trigger(from)? - from.timestamp();
        u32::try_from(delta).ok().filter(|d| *d > 0)
    }

    /// `next_interval` from the current local time.
    pub fn next_interval_from_now(&self) -> Option<u32> {
        self.next_interval(&Local::now())
    }

    /// Earliest (hour, minute, second) after the given one, with a day carry
    /// of 1 when the search wraps past midnight.
    fn next_slot(&self, hour: u32, minute: u32, second: u32) -> Option<(i64, u32, u32, u32)> {
        if self.hours.contains(hour) {
            if self.minutes.contains(minute) {
                if let Some(s) = self.seconds.next_at_or_after(second + 1) {
                    return Some((0, hour, minute, s));
                }
            }
            if let Some(m) = self.minutes.next_at_or_after(minute + 1) {
                return Some((0, hour, m, self.seconds.first()?));
            }
        }
        if let Some(h) = self.hours.next_at_or_after(hour + 1) {
            return Some((0, h, self.minutes.first()?, self.seconds.first()?));
        }
        Some((
            1,
            self.hours.first()?,
            self.minutes.first()?,
            self.seconds.first()?,
        ))
    }
}

/// Epoch seconds of a local wall-clock time. Times skipped by a DST jump
/// fall back to `from`'s UTC offset.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: &NaiveDateTime, from: &DateTime<Tz>) -> Option<i64> {
    if let Some(dt) = tz.from_local_datetime(naive).earliest() {
        return Some(dt.timestamp());
    }
    let offset = from.offset().fix();
    offset
        .from_local_datetime(naive)
        .single()
        .map(|dt| dt.timestamp())
}

impl FromStr for TimeSpec {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        TimeSpec::parse(s)
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sec:  {:?}", self.seconds)?;
        writeln!(f, "min:  {:?}", self.minutes)?;
        write!(f, "hour: {:?}", self.hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    /// 2018-04-30 00:00:00 at UTC+8.
    const FROM: i64 = 1_525_017_600;

    fn at(epoch: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .timestamp_opt(epoch, 0)
            .unwrap()
    }

    fn next(text: &str, epoch: i64) -> u32 {
        TimeSpec::parse(text).unwrap().next_interval(&at(epoch)).unwrap()
    }

    #[test]
    fn parses_basic_expressions() {
        for text in ["* * *", "0 3 4", "0 0 0", "*/15 0-30 9,12,18", " 1\t2  3 "] {
            assert!(TimeSpec::parse(text).is_ok(), "{text} should parse");
        }
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(TimeSpec::parse("* *").is_err());
        assert!(TimeSpec::parse("* * * *").is_err());
        assert!(TimeSpec::parse("").is_err());
    }

    #[test]
    fn rejects_out_of_range_terms() {
        for text in [
            "60 * *", "* 60 *", "* * 24", "*/0 * *", "*/60 * *", "* * */24", "5-3 * *",
            "3-3 * *", "0-60 * *", "a * *", "-1 * *", "1,,2 * *", "*/ * *", "*x * *",
        ] {
            assert!(TimeSpec::parse(text).is_err(), "{text} should fail");
        }
    }

    #[test]
    fn bitmaps_reflect_terms() {
        let spec = TimeSpec::parse("*/20 5-7,9 23").unwrap();
        assert_eq!(spec.seconds().count(), 3);
        assert!(spec.seconds().contains(40));
        assert!(!spec.seconds().contains(41));
        assert_eq!(spec.minutes().count(), 4);
        assert!(spec.minutes().contains(9));
        assert_eq!(spec.hours().first(), Some(23));
    }

    #[test]
    fn next_from_midnight() {
        assert_eq!(next("*/3 * *", FROM), 3);
        assert_eq!(next("12,24 * *", FROM), 12);
        assert_eq!(next("* */2 *", FROM), 1);
        assert_eq!(next("* 2 *", FROM), 120);
    }

    #[test]
    fn next_near_minute_boundary() {
        assert_eq!(next("*/3 * *", FROM + 58), 2);
        assert_eq!(next("12,24 * *", FROM + 58), 14);
        assert_eq!(next("* */2 *", FROM + 58), 1);
        assert_eq!(next("* 2 *", FROM + 58), 62);
    }

    #[test]
    fn next_wraps_past_midnight() {
        assert_eq!(next("* 2 *", FROM + SECONDS_PER_DAY - 2), 122);
        assert_eq!(next("0 0 0", FROM + 1), (SECONDS_PER_DAY - 1) as u32);
    }

    #[test]
    fn next_skips_to_later_hour() {
        // 00:00:00 -> 04:03:00
        assert_eq!(next("0 3 4", FROM), 4 * 3600 + 3 * 60);
    }

    #[test]
    fn next_stays_within_a_day() {
        let specs = ["* * *", "0 0 0", "*/7 */11 */5", "59 59 23", "30 15-20 8-10"];
        for text in specs {
            for offset in [0, 1, 59, 3599, 43_200, 86_399] {
                let n = next(text, FROM + offset);
                assert!(n > 0 && n as i64 <= SECONDS_PER_DAY, "{text} @ +{offset}: {n}");
            }
        }
    }

    #[test]
    fn trigger_ignores_sub_second_offset() {
        let spec = TimeSpec::parse("* * *").unwrap();
        let late = at(FROM) + Duration::milliseconds(900);
        assert_eq!(spec.next_trigger(&late), Some(FROM + 1));
        assert_eq!(spec.next_trigger(&at(FROM + 1)), Some(FROM + 2));

        let daily = TimeSpec::parse("0 0 0").unwrap();
        assert_eq!(daily.next_trigger(&at(FROM)), Some(FROM + SECONDS_PER_DAY));
    }

    #[test]
    fn field_bits_search() {
        let bits = FieldBits::<24>::parse_field("3,10").unwrap();
        assert_eq!(bits.next_at_or_after(0), Some(3));
        assert_eq!(bits.next_at_or_after(4), Some(10));
        assert_eq!(bits.next_at_or_after(11), None);
        assert_eq!(bits.next_at_or_after(24), None);
    }
}
