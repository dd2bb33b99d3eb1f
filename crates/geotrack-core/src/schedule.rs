//! Schedule parsing and next-transition computation.
//!
//! A schedule entry has the form `<days-or-date> <HH:MM>-<HH:MM> [mode]`:
//!
//! - `1-5 09:00-17:00`: weekday range (1 = Sunday, 7 = Saturday)
//! - `1,3,5 08:00-12:00 geofence`: weekday list with a tracking mode
//! - `2024-06-01 22:00-06:00`: one literal date (overnight windows roll over)
//! - `2024-06-01-09:00 2024-06-03-18:00`: literal date range
//!
//! Everything here is pure: [`next_transition`] takes `now` and returns the
//! instant of the next enable/disable switch. Wall-clock instants are
//! interpreted in the UTC offset carried by `now`.

use std::collections::BTreeSet;
use std::fmt;

use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::{debug, warn};

use geotrack_types::TrackingMode;

/// How far ahead the evaluator searches before giving up.
pub const LOOKAHEAD_DAYS: i64 = 7;

/// A schedule string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid schedule '{spec}': {reason}")]
pub struct ScheduleError {
    pub spec: String,
    pub reason: String,
}

impl ScheduleError {
    pub fn new(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}

/// When a window is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowKind {
    /// Recurs on the given weekdays (1 = Sunday .. 7 = Saturday).
    Weekly {
        days: BTreeSet<u8>,
        on: Time,
        off: Time,
    },
    /// A single fixed span of wall-clock time.
    Literal {
        on: PrimitiveDateTime,
        off: PrimitiveDateTime,
    },
}

/// One parsed schedule entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub kind: WindowKind,
    pub tracking_mode: TrackingMode,
}

impl ScheduleWindow {
    /// Parse a single schedule string.
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let err = |reason: &str| ScheduleError::new(spec, reason);
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        let Some(&head) = tokens.first() else {
            return Err(err("empty schedule"));
        };

        let (kind, rest) = if starts_with_date(head) {
            if head.len() > 10 {
                // YYYY-MM-DD-HH:MM YYYY-MM-DD-HH:MM
                let on = parse_date_time(head).ok_or_else(|| err("invalid start date-time"))?;
                let tail = tokens.get(1).ok_or_else(|| err("missing end date-time"))?;
                let off = parse_date_time(tail).ok_or_else(|| err("invalid end date-time"))?;
                if off <= on {
                    return Err(err("window ends before it starts"));
                }
                (WindowKind::Literal { on, off }, &tokens[2..])
            } else {
                let date = parse_date(head).ok_or_else(|| err("invalid date"))?;
                let range = tokens.get(1).ok_or_else(|| err("missing time range"))?;
                let (on, off) = parse_time_range(range).ok_or_else(|| err("invalid time range"))?;
                let on = PrimitiveDateTime::new(date, on);
                let mut off = PrimitiveDateTime::new(date, off);
                if off <= on {
                    off += Duration::days(1);
                }
                (WindowKind::Literal { on, off }, &tokens[2..])
            }
        } else {
            let days = parse_days(head).map_err(|reason| err(&reason))?;
            let range = tokens.get(1).ok_or_else(|| err("missing time range"))?;
            let (on, off) = parse_time_range(range).ok_or_else(|| err("invalid time range"))?;
            (WindowKind::Weekly { days, on, off }, &tokens[2..])
        };

        let tracking_mode = match rest {
            [] => TrackingMode::Location,
            [mode] if mode.to_ascii_lowercase().contains("geofence") => TrackingMode::Geofence,
            [_] => TrackingMode::Location,
            _ => return Err(err("unexpected trailing tokens")),
        };

        Ok(Self {
            kind,
            tracking_mode,
        })
    }

    pub fn is_literal_date(&self) -> bool {
        matches!(self.kind, WindowKind::Literal { .. })
    }

    /// Weekdays this window recurs on; empty for literal dates.
    pub fn days(&self) -> BTreeSet<u8> {
        match &self.kind {
            WindowKind::Weekly { days, .. } => days.clone(),
            WindowKind::Literal { .. } => BTreeSet::new(),
        }
    }

    /// On/off instants for a given evaluation date.
    ///
    /// Weekly windows only produce instants on their weekdays; `off` is moved
    /// to the following day when it does not come after `on`. Literal windows
    /// ignore the date.
    pub fn instants_for(&self, date: Date, at: &OffsetDateTime) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let offset = at.offset();
        match &self.kind {
            WindowKind::Weekly { days, on, off } => {
                if !days.contains(&date.weekday().number_from_sunday()) {
                    return None;
                }
                let on = PrimitiveDateTime::new(date, *on).assume_offset(offset);
                let mut off = PrimitiveDateTime::new(date, *off).assume_offset(offset);
                if off <= on {
                    off += Duration::days(1);
                }
                Some((on, off))
            }
            WindowKind::Literal { on, off } => {
                Some((on.assume_offset(offset), off.assume_offset(offset)))
            }
        }
    }

    /// The instance of this window that is current or upcoming at `at`.
    ///
    /// Overnight windows that began on the previous day are still current.
    fn active_or_next(&self, at: &OffsetDateTime) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let today = at.date();
        let dates = match today.previous_day() {
            Some(yesterday) if !self.is_literal_date() => vec![yesterday, today],
            _ => vec![today],
        };
        dates
            .into_iter()
            .filter_map(|date| self.instants_for(date, at))
            .find(|(_, off)| at < off)
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WindowKind::Weekly { days, on, off } => {
                let days: Vec<String> = days.iter().map(u8::to_string).collect();
                write!(
                    f,
                    "{} {:02}:{:02}-{:02}:{:02}",
                    days.join(","),
                    on.hour(),
                    on.minute(),
                    off.hour(),
                    off.minute()
                )?;
            }
            WindowKind::Literal { on, off } => {
                write!(
                    f,
                    "{}-{:02}:{:02} {}-{:02}:{:02}",
                    on.date(),
                    on.hour(),
                    on.minute(),
                    off.date(),
                    off.hour(),
                    off.minute()
                )?;
            }
        }
        write!(f, " {}", self.tracking_mode)
    }
}

/// A scheduled enable/disable switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// When to apply the switch; equal to the evaluation instant for
    /// "switch now".
    pub fire_at: OffsetDateTime,
    pub enabled: bool,
    pub tracking_mode: TrackingMode,
}

/// Compute the next transition from the current enabled state.
///
/// Returns `None` when no window is found within [`LOOKAHEAD_DAYS`] of
/// `now`, or when `windows` is empty.
pub fn next_transition(
    windows: &[ScheduleWindow],
    now: OffsetDateTime,
    currently_enabled: bool,
) -> Option<Transition> {
    if windows.is_empty() {
        return None;
    }

    let give_up_at = now + Duration::days(LOOKAHEAD_DAYS);
    let mut at = now;

    while at < give_up_at {
        let next = windows
            .iter()
            .filter_map(|w| w.active_or_next(&at).map(|(on, off)| (on, off, w.tracking_mode)))
            .min_by_key(|(on, _, _)| *on);

        match next {
            Some((on, off, tracking_mode)) if at >= on => {
                debug!("Inside schedule window until {}", off);
                return Some(if currently_enabled {
                    Transition {
                        fire_at: off,
                        enabled: false,
                        tracking_mode,
                    }
                } else {
                    Transition {
                        fire_at: at,
                        enabled: true,
                        tracking_mode,
                    }
                });
            }
            Some((on, _, tracking_mode)) => {
                debug!("Next schedule window opens at {}", on);
                return Some(if currently_enabled {
                    Transition {
                        fire_at: at,
                        enabled: false,
                        tracking_mode,
                    }
                } else {
                    Transition {
                        fire_at: on,
                        enabled: true,
                        tracking_mode,
                    }
                });
            }
            None if currently_enabled => {
                return Some(Transition {
                    fire_at: at,
                    enabled: false,
                    tracking_mode: TrackingMode::Location,
                });
            }
            None => {
                debug!("No schedule window on {}; trying next day", at.date());
                at = at.replace_time(Time::MIDNIGHT) + Duration::days(1);
            }
        }
    }

    warn!("Failed to find a schedule window within {} days; giving up", LOOKAHEAD_DAYS);
    None
}

/// The parsed set of schedule windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    windows: Vec<ScheduleWindow>,
}

impl Schedule {
    /// Parse every entry, keeping the valid ones.
    ///
    /// Rejected entries are returned alongside so callers can report them;
    /// they never prevent the remaining windows from running.
    pub fn parse_all<S: AsRef<str>>(specs: &[S]) -> (Self, Vec<ScheduleError>) {
        let mut windows = Vec::new();
        let mut errors = Vec::new();
        for spec in specs {
            match ScheduleWindow::parse(spec.as_ref()) {
                Ok(window) => windows.push(window),
                Err(e) => {
                    warn!("Skipping schedule entry: {}", e);
                    errors.push(e);
                }
            }
        }
        (Self { windows }, errors)
    }

    pub fn windows(&self) -> &[ScheduleWindow] {
        &self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// See [`next_transition`].
    pub fn next_transition(&self, now: OffsetDateTime, currently_enabled: bool) -> Option<Transition> {
        next_transition(&self.windows, now, currently_enabled)
    }
}

fn starts_with_date(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

fn parse_date(token: &str) -> Option<Date> {
    if token.len() != 10 {
        return None;
    }
    let year: i32 = token.get(0..4)?.parse().ok()?;
    let month: u8 = token.get(5..7)?.parse().ok()?;
    let day: u8 = token.get(8..10)?.parse().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn parse_time(token: &str) -> Option<Time> {
    let (hour, minute) = token.split_once(':')?;
    Time::from_hms(hour.parse().ok()?, minute.parse().ok()?, 0).ok()
}

fn parse_time_range(token: &str) -> Option<(Time, Time)> {
    let (on, off) = token.split_once('-')?;
    Some((parse_time(on)?, parse_time(off)?))
}

/// `YYYY-MM-DD-HH:MM`
fn parse_date_time(token: &str) -> Option<PrimitiveDateTime> {
    let date = parse_date(token.get(0..10)?)?;
    if token.as_bytes().get(10) != Some(&b'-') {
        return None;
    }
    let time = parse_time(token.get(11..)?)?;
    Some(PrimitiveDateTime::new(date, time))
}

fn parse_day(token: &str) -> Result<u8, String> {
    match token.trim().parse::<u8>() {
        Ok(day @ 1..=7) => Ok(day),
        _ => Err(format!("invalid weekday '{}' (expected 1-7)", token.trim())),
    }
}

fn parse_days(token: &str) -> Result<BTreeSet<u8>, String> {
    if let Some((start, end)) = token.split_once('-') {
        let (start, end) = (parse_day(start)?, parse_day(end)?);
        if start > end {
            return Err(format!("weekday range {}-{} is reversed", start, end));
        }
        return Ok((start..=end).collect());
    }
    token.split(',').map(parse_day).collect()
}
