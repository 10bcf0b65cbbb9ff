use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

const DEFAULT_DURATION_MINUTES: i64 = 30;

/// Parses `"H:MM AM|PM"` (meridiem case-insensitive) or bare `"HH:MM"`
/// (24-hour) onto the given calendar day. Malformed input is rejected,
/// never clamped.
pub fn parse_time(base: NaiveDate, text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    let (clock, meridiem) = match text.rsplit_once(char::is_whitespace) {
        Some((clock, suffix)) if suffix.eq_ignore_ascii_case("am") => (clock.trim_end(), Some(false)),
        Some((clock, suffix)) if suffix.eq_ignore_ascii_case("pm") => (clock.trim_end(), Some(true)),
        _ => (text, None),
    };

    let (hour_text, minute_text) = clock.split_once(':')?;
    let hour = hour_text.parse::<u32>().ok()?;
    let minute = minute_text.parse::<u32>().ok()?;

    let hour = match meridiem {
        Some(is_pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (is_pm, hour) {
                (false, 12) => 0,
                (true, value) if value != 12 => value + 12,
                (_, value) => value,
            }
        }
        None => hour,
    };

    Some(base.and_time(NaiveTime::from_hms_opt(hour, minute, 0)?))
}

/// Duration text to minutes: `hr`/`h` suffixes are hours, `min`/`m` are
/// literal minutes. Absent or unparseable text falls back to 30 minutes.
pub fn parse_duration_minutes(text: Option<&str>) -> i64 {
    let Some(text) = text else {
        return DEFAULT_DURATION_MINUTES;
    };
    let normalized = text.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(rest) = normalized.strip_suffix("hr") {
        (rest, 60)
    } else if let Some(rest) = normalized.strip_suffix("min") {
        (rest, 1)
    } else if let Some(rest) = normalized.strip_suffix('m') {
        (rest, 1)
    } else if let Some(rest) = normalized.strip_suffix('h') {
        (rest, 60)
    } else {
        return DEFAULT_DURATION_MINUTES;
    };

    digits
        .trim()
        .parse::<i64>()
        .map(|value| value * scale)
        .unwrap_or(DEFAULT_DURATION_MINUTES)
}

/// Minutes to display text, preferring whole hours: `"{h}hr"` when the
/// count divides evenly, `"{m}m"` otherwise.
pub fn format_duration(minutes: i64) -> String {
    if minutes % 60 == 0 {
        format!("{}hr", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

/// `"h:mm AM|PM"` rendering for notification bodies and derived end times.
pub fn format_time_12h(time: NaiveTime) -> String {
    time.format("%-I:%M %p").to_string()
}

/// Countdown text for an end instant. Negative remainders clamp to zero.
pub fn format_remaining(end: NaiveDateTime, now: NaiveDateTime) -> String {
    let total_seconds = (end - now).num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Elapsed-minutes derivation for an edited start/end pair. A zero or
/// negative difference assumes the end falls on the next calendar day.
/// Never less than one minute.
pub fn derive_duration_minutes(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    let mut minutes = (end - start).num_minutes();
    if minutes <= 0 {
        minutes = (end + Duration::days(1) - start).num_minutes();
    }
    minutes.max(1)
}

/// Concrete start/end window of one task occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpan {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TaskSpan {
    pub fn in_progress(&self, now: NaiveDateTime) -> bool {
        self.start <= now && now <= self.end
    }

    /// Fraction of the span elapsed at `now`, clamped to [0, 1].
    pub fn progress(&self, now: NaiveDateTime) -> f64 {
        let total = (self.end - self.start).num_milliseconds();
        if total <= 0 {
            return if now >= self.start { 1.0 } else { 0.0 };
        }
        let elapsed = (now - self.start).num_milliseconds();
        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn remaining(&self, now: NaiveDateTime) -> String {
        format_remaining(self.end, now)
    }
}

/// Span for a task occurrence on `date` with the given start text and
/// optional duration text. `None` when the start text does not parse.
pub fn span_for(date: NaiveDate, time: &str, duration: Option<&str>) -> Option<TaskSpan> {
    let start = parse_time(date, time)?;
    let end = start + Duration::minutes(parse_duration_minutes(duration));
    Some(TaskSpan { start, end })
}

/// First day of the week containing `date`.
pub fn week_start(date: NaiveDate, week_starts_on: Weekday) -> NaiveDate {
    let offset = (7 + date.weekday().num_days_from_sunday()
        - week_starts_on.num_days_from_sunday())
        % 7;
    date - Duration::days(i64::from(offset))
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

pub fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Resolves wall-clock evaluation for the configured timezone. The UTC
/// instant is always supplied by the caller so time-dependent logic stays
/// deterministic under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockContext {
    pub timezone: Tz,
}

impl ClockContext {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    pub fn local_now(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.timezone).naive_local()
    }
}

impl Default for ClockContext {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}
