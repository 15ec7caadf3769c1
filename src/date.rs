use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{Error, Result};

/// Parse date-like inputs, anchoring partial forms at the start of the period:
/// - "YYYY", "YYYY-MM", "YYYYMMDD", "YYYY-MM-DD"
/// - "YYYY-MM-DD HH:MM[:SS]" (a `T` separator is accepted too)
pub fn parse_date_like(s: &str) -> Result<NaiveDateTime> {
    let trimmed = s.trim();
    let invalid = || Error::Configuration(format!("unsupported date format: {trimmed}"));
    let all_digits = !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit());

    if all_digits && trimmed.len() == 4 {
        let year: i32 = trimmed.parse().map_err(|_| invalid())?;
        return midnight(year, 1, 1).ok_or_else(invalid);
    }

    if all_digits && trimmed.len() == 8 {
        let year: i32 = trimmed[0..4].parse().map_err(|_| invalid())?;
        let month: u32 = trimmed[4..6].parse().map_err(|_| invalid())?;
        let day: u32 = trimmed[6..8].parse().map_err(|_| invalid())?;
        return midnight(year, month, day).ok_or_else(invalid);
    }

    if let Some((y, m)) = trimmed.split_once('-') {
        if y.len() == 4 && !m.contains('-') {
            let year: i32 = y.parse().map_err(|_| invalid())?;
            let month: u32 = m.parse().map_err(|_| invalid())?;
            return midnight(year, month, 1).ok_or_else(invalid);
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(d.and_time(NaiveTime::MIN));
    }

    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(dt);
        }
    }

    Err(invalid())
}

fn midnight(year: i32, month: u32, day: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.and_time(NaiveTime::MIN))
}

/// Number of days in the given month, honouring leap years.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return 0;
    };
    let next = first
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX);
    (next - first).num_days() as u32
}

/// Sampling frequency alias: `6H`, `1D`, `M`, `Y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hours(u32),
    Days(u32),
    Months(u32),
    Years(u32),
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let t = s.trim();
        let split = t
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::Configuration(format!("frequency has no unit: {t}")))?;
        let (n, unit) = t.split_at(split);
        let n: u32 = if n.is_empty() {
            1
        } else {
            n.parse()
                .map_err(|_| Error::Configuration(format!("invalid frequency multiple: {t}")))?
        };
        if n == 0 {
            return Err(Error::Configuration(format!("frequency must be >0, got {t}")));
        }
        match unit {
            "H" | "h" => Ok(Frequency::Hours(n)),
            "D" | "d" => Ok(Frequency::Days(n)),
            "M" | "MS" => Ok(Frequency::Months(n)),
            "Y" | "YS" | "A" | "AS" => Ok(Frequency::Years(n)),
            _ => Err(Error::Configuration(format!("unsupported frequency: {t}"))),
        }
    }
}

impl Frequency {
    /// The `k`-th step from `anchor` (negative `k` steps backwards).
    ///
    /// Stepping is always relative to the anchor so month ends do not drift.
    pub fn nth(self, anchor: NaiveDateTime, k: i64) -> Option<NaiveDateTime> {
        let months = |m: i64| {
            let span = Months::new(u32::try_from(m.unsigned_abs()).ok()?);
            if m >= 0 {
                anchor.checked_add_months(span)
            } else {
                anchor.checked_sub_months(span)
            }
        };
        match self {
            Frequency::Hours(n) => anchor.checked_add_signed(Duration::try_hours(k * n as i64)?),
            Frequency::Days(n) => anchor.checked_add_signed(Duration::try_days(k * n as i64)?),
            Frequency::Months(n) => months(k * n as i64),
            Frequency::Years(n) => months(k * 12 * n as i64),
        }
    }
}

/// An inclusive span of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl DateRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if end < start {
            return Err(Error::Configuration(format!(
                "range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range between two date-like strings (see [`parse_date_like`]).
    pub fn between(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_date_like(start)?, parse_date_like(end)?)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }
}

/// Date sampling request: exactly three of start/end/periods/freq must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateSpec {
    pub start: Option<String>,
    pub end: Option<String>,
    pub periods: Option<usize>,
    pub freq: Option<String>,
}

impl DateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, v: impl Into<String>) -> Self {
        self.start = Some(v.into());
        self
    }

    pub fn end(mut self, v: impl Into<String>) -> Self {
        self.end = Some(v.into());
        self
    }

    pub fn periods(mut self, v: usize) -> Self {
        self.periods = Some(v);
        self
    }

    pub fn freq(mut self, v: impl Into<String>) -> Self {
        self.freq = Some(v.into());
        self
    }

    /// Expand into the sampled instants, in ascending order.
    pub fn instants(&self) -> Result<Vec<NaiveDateTime>> {
        let given = [
            self.start.is_some(),
            self.end.is_some(),
            self.periods.is_some(),
            self.freq.is_some(),
        ]
        .iter()
        .filter(|x| **x)
        .count();
        if given != 3 {
            return Err(Error::Configuration(format!(
                "exactly three of start, end, periods and freq must be given, got {given}"
            )));
        }

        let start = self.start.as_deref().map(parse_date_like).transpose()?;
        let end = self.end.as_deref().map(parse_date_like).transpose()?;
        let freq = self.freq.as_deref().map(Frequency::from_str).transpose()?;

        let out = match (start, end, self.periods, freq) {
            (Some(start), Some(end), None, Some(freq)) => {
                let mut out = Vec::new();
                let mut k = 0;
                while let Some(cur) = freq.nth(start, k) {
                    if cur > end {
                        break;
                    }
                    out.push(cur);
                    k += 1;
                }
                out
            }
            (Some(start), None, Some(periods), Some(freq)) => (0..periods as i64)
                .map(|k| freq.nth(start, k))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::Configuration("date range out of bounds".into()))?,
            (None, Some(end), Some(periods), Some(freq)) => (0..periods as i64)
                .rev()
                .map(|k| freq.nth(end, -k))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::Configuration("date range out of bounds".into()))?,
            (Some(start), Some(end), Some(periods), None) => linspace(start, end, periods)?,
            _ => {
                return Err(Error::Configuration(
                    "start, end, periods and freq do not form a date range".into(),
                ));
            }
        };

        if out.is_empty() {
            return Err(Error::Configuration("date range is empty".into()));
        }
        Ok(out)
    }

    pub fn range(&self) -> Result<DateRange> {
        let instants = self.instants()?;
        DateRange::new(instants[0], instants[instants.len() - 1])
    }
}

fn linspace(start: NaiveDateTime, end: NaiveDateTime, periods: usize) -> Result<Vec<NaiveDateTime>> {
    if end < start {
        return Err(Error::Configuration(format!(
            "range end {end} precedes start {start}"
        )));
    }
    match periods {
        0 => Ok(Vec::new()),
        1 if start == end => Ok(vec![start]),
        1 => Err(Error::Configuration(
            "a single period needs start == end".into(),
        )),
        _ => {
            let span = (end - start).num_seconds();
            let steps = (periods - 1) as i64;
            Ok((0..periods as i64)
                .map(|i| start + Duration::seconds(span * i / steps))
                .collect())
        }
    }
}

/// Year/month/day/time tokens in the form the archive expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarGrid {
    pub years: Vec<String>,
    pub months: Vec<String>,
    pub days: Vec<String>,
    pub times: Vec<String>,
}

impl CalendarGrid {
    /// Tokens for every calendar day touched by `spec`. `times` defaults to
    /// all 24 on-the-hour slots.
    pub fn generate(spec: &DateSpec, times: Option<&[&str]>) -> Result<Self> {
        let instants = spec.instants()?;
        let tokens = |fmt: &str| -> Vec<String> {
            instants
                .iter()
                .map(|d| d.format(fmt).to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        let times = match times {
            Some(ts) => canonical_times(ts)?,
            None => all_hours(),
        };

        Ok(Self {
            years: tokens("%Y"),
            months: tokens("%m"),
            days: tokens("%d"),
            times,
        })
    }

    /// Build a grid from explicit tokens, canonicalising and validating them.
    pub fn from_tokens<S: AsRef<str>>(
        years: &[S],
        months: &[S],
        days: &[S],
        times: &[S],
    ) -> Result<Self> {
        let numeric = |xs: &[S], width: usize, lo: u32, hi: u32, what: &str| {
            let mut out = BTreeSet::new();
            for x in xs {
                let x = x.as_ref().trim();
                let n: u32 = x
                    .parse()
                    .map_err(|_| Error::Configuration(format!("invalid {what}: {x}")))?;
                if n < lo || n > hi {
                    return Err(Error::Configuration(format!("{what} out of range: {x}")));
                }
                out.insert(format!("{n:0width$}"));
            }
            if out.is_empty() {
                return Err(Error::Configuration(format!("no {what} given")));
            }
            Ok(out.into_iter().collect::<Vec<_>>())
        };
        let times: Vec<&str> = times.iter().map(|t| t.as_ref()).collect();

        Ok(Self {
            years: numeric(years, 4, 1, 9999, "year")?,
            months: numeric(months, 2, 1, 12, "month")?,
            days: numeric(days, 2, 1, 31, "day")?,
            times: canonical_times(&times)?,
        })
    }
}

pub fn all_hours() -> Vec<String> {
    (0..24).map(|h| format!("{h:02}:00")).collect()
}

fn canonical_times(times: &[&str]) -> Result<Vec<String>> {
    let mut out = BTreeSet::new();
    for t in times {
        let parsed = NaiveTime::parse_from_str(t.trim(), "%H:%M")
            .map_err(|_| Error::Configuration(format!("invalid time of day: {t}")))?;
        out.insert(parsed.format("%H:%M").to_string());
    }
    if out.is_empty() {
        return Err(Error::Configuration("time list is empty".into()));
    }
    Ok(out.into_iter().collect())
}
