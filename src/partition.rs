//! Splitting a calendar grid into archive requests that respect the item quota.
//!
//! Windows are chosen coarsest-first: the whole grid, then one window per year,
//! then one window per month with that month's real calendar days. A month that
//! is still too large is cut into runs of consecutive days.

use chrono::NaiveDate;
use tracing::debug;

use crate::date::{days_in_month, CalendarGrid};
use crate::error::{Error, Result};
use crate::request::Request;

/// One archive request worth of calendar tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestWindow {
    pub years: Vec<String>,
    pub months: Vec<String>,
    pub days: Vec<String>,
    pub times: Vec<String>,
    pub items_per_timestep: usize,
}

impl RequestWindow {
    /// Items the archive will count against the quota for this window.
    pub fn item_count(&self) -> usize {
        [
            self.times.len(),
            self.days.len(),
            self.months.len(),
            self.years.len(),
        ]
        .iter()
        .fold(self.items_per_timestep, |acc, n| acc.saturating_mul(*n))
    }

    /// Calendar-valid dates covered by the window's year x month x day product.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        for y in &self.years {
            for m in &self.months {
                for d in &self.days {
                    let (Ok(y), Ok(m), Ok(d)) = (y.parse(), m.parse(), d.parse()) else {
                        continue;
                    };
                    if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                        out.push(date);
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// `YYYYMMDD` built from the first year, month and day tokens.
    pub fn first_token(&self) -> String {
        join_first(&self.years, &self.months, &self.days)
    }

    /// `YYYYMMDD` built from the last year, month and day tokens.
    pub fn last_token(&self) -> String {
        join_last(&self.years, &self.months, &self.days)
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.first_token(), self.last_token())
    }

    /// Fill the calendar keywords of `base`.
    pub fn to_request(&self, base: &Request) -> Request {
        base.clone()
            .year(self.years.clone())
            .month(self.months.clone())
            .day(self.days.clone())
            .time(self.times.clone())
    }
}

fn join_first(years: &[String], months: &[String], days: &[String]) -> String {
    let pick = |xs: &[String]| xs.first().cloned().unwrap_or_default();
    format!("{}{}{}", pick(years), pick(months), pick(days))
}

fn join_last(years: &[String], months: &[String], days: &[String]) -> String {
    let pick = |xs: &[String]| xs.last().cloned().unwrap_or_default();
    format!("{}{}{}", pick(years), pick(months), pick(days))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    quota: usize,
}

impl Partitioner {
    pub fn new(quota: usize) -> Result<Self> {
        if quota == 0 {
            return Err(Error::Configuration("quota must be >0".into()));
        }
        Ok(Self { quota })
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Split `grid` into windows whose item counts fit the quota.
    ///
    /// `items_per_timestep` is the number of variable x level combinations
    /// requested for every timestamp and is the same for every window.
    pub fn split(&self, grid: &CalendarGrid, items_per_timestep: usize) -> Result<Vec<RequestWindow>> {
        if items_per_timestep == 0 {
            return Err(Error::Configuration("items per timestep must be >0".into()));
        }
        if grid.years.is_empty()
            || grid.months.is_empty()
            || grid.days.is_empty()
            || grid.times.is_empty()
        {
            return Err(Error::Configuration("calendar grid has an empty axis".into()));
        }

        let window = |years: Vec<String>, months: Vec<String>, days: Vec<String>| RequestWindow {
            years,
            months,
            days,
            times: grid.times.clone(),
            items_per_timestep,
        };

        let per_day = estimate(&[items_per_timestep, grid.times.len()])?;
        let per_month = estimate(&[per_day, grid.days.len()])?;
        let per_year = estimate(&[per_month, grid.months.len()])?;
        let whole = estimate(&[per_year, grid.years.len()])?;

        if whole < self.quota {
            debug!(items = whole, quota = self.quota, "single window covers the grid");
            return Ok(vec![window(
                grid.years.clone(),
                grid.months.clone(),
                grid.days.clone(),
            )]);
        }

        if per_year < self.quota {
            debug!(items = per_year, quota = self.quota, "one window per year");
            return Ok(grid
                .years
                .iter()
                .map(|y| window(vec![y.clone()], grid.months.clone(), grid.days.clone()))
                .collect());
        }

        if per_day > self.quota {
            return Err(Error::Configuration(format!(
                "a single day needs {per_day} items, above the quota of {}",
                self.quota
            )));
        }
        let max_days = self.quota / per_day;
        debug!(items = per_year, quota = self.quota, max_days, "one window per month");

        let mut out = Vec::new();
        for y in &grid.years {
            let year: i32 = y
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid year token: {y}")))?;
            for m in &grid.months {
                let month: u32 = m
                    .parse()
                    .map_err(|_| Error::Configuration(format!("invalid month token: {m}")))?;
                let last_day = days_in_month(year, month);
                let days: Vec<String> = grid
                    .days
                    .iter()
                    .filter(|d| d.parse::<u32>().is_ok_and(|d| d >= 1 && d <= last_day))
                    .cloned()
                    .collect();

                for chunk in days.chunks(max_days) {
                    out.push(window(vec![y.clone()], vec![m.clone()], chunk.to_vec()));
                }
            }
        }
        Ok(out)
    }
}

/// Product of `factors`, failing instead of wrapping.
fn estimate(factors: &[usize]) -> Result<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, f| acc.checked_mul(*f))
        .ok_or_else(|| Error::Configuration("request item estimate overflows".into()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::date::{all_hours, DateSpec};

    fn tokens(range: std::ops::RangeInclusive<u32>, width: usize) -> Vec<String> {
        range.map(|x| format!("{x:0width$}")).collect()
    }

    fn grid(years: Vec<String>, months: Vec<String>, days: Vec<String>) -> CalendarGrid {
        CalendarGrid {
            years,
            months,
            days,
            times: all_hours(),
        }
    }

    /// Every valid date of the grid's full product, for coverage checks.
    fn valid_dates(g: &CalendarGrid) -> BTreeSet<NaiveDate> {
        RequestWindow {
            years: g.years.clone(),
            months: g.months.clone(),
            days: g.days.clone(),
            times: g.times.clone(),
            items_per_timestep: 1,
        }
        .dates()
        .into_iter()
        .collect()
    }

    fn assert_exact_cover(g: &CalendarGrid, windows: &[RequestWindow], quota: usize) {
        let mut seen = BTreeSet::new();
        for w in windows {
            assert!(w.item_count() <= quota, "{} exceeds quota", w.label());
            for d in w.dates() {
                assert!(seen.insert(d), "{d} covered twice");
            }
        }
        assert_eq!(seen, valid_dates(g));
    }

    #[test]
    fn single_month_fits_one_window() {
        let g = grid(vec!["2020".into()], vec!["01".into()], tokens(1..=31, 2));
        let windows = Partitioner::new(120_000).unwrap().split(&g, 2).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].item_count(), 1488);
        assert_eq!(windows[0].label(), "20200101-20200131");
    }

    #[test]
    fn multi_year_splits_per_year() {
        let g = grid(tokens(2017..=2023, 4), tokens(1..=12, 2), tokens(1..=31, 2));
        let p = Partitioner::new(120_000).unwrap();
        let windows = p.split(&g, 2).unwrap();
        assert_eq!(windows.len(), 7);
        assert!(windows.iter().all(|w| w.years.len() == 1 && w.months.len() == 12));
        assert_eq!(windows[0].item_count(), 17_856);
        assert_exact_cover(&g, &windows, p.quota());
    }

    #[test]
    fn large_per_year_splits_per_month_with_real_days() {
        // 16 levels x 2 variables: a full year is 285_696 items.
        let g = grid(vec!["2020".into(), "2021".into()], tokens(1..=12, 2), tokens(1..=31, 2));
        let p = Partitioner::new(120_000).unwrap();
        let windows = p.split(&g, 32).unwrap();
        assert_eq!(windows.len(), 24);

        let feb_2020 = &windows[1];
        assert_eq!(feb_2020.days.len(), 29);
        assert_eq!(feb_2020.label(), "20200201-20200229");
        let feb_2021 = &windows[13];
        assert_eq!(feb_2021.days.len(), 28);
        assert_eq!(windows[3].days.len(), 30);
        assert_exact_cover(&g, &windows, p.quota());
    }

    #[test]
    fn months_without_requested_days_are_skipped() {
        let g = grid(vec!["2021".into()], tokens(1..=3, 2), vec!["30".into(), "31".into()]);
        let p = Partitioner::new(100).unwrap();
        let windows = p.split(&g, 1).unwrap();
        let labels: Vec<String> = windows.iter().map(|w| w.label()).collect();
        assert_eq!(labels, vec!["20210130-20210131", "20210330-20210331"]);
        assert_exact_cover(&g, &windows, p.quota());
    }

    #[test]
    fn oversized_months_are_chunked_by_day() {
        let g = grid(vec!["2020".into()], vec!["02".into(), "03".into()], tokens(1..=31, 2));
        // 24 times x 10 items = 240 per day; 10 days fit in 2400.
        let p = Partitioner::new(2_400).unwrap();
        let windows = p.split(&g, 10).unwrap();
        let feb: Vec<usize> = windows
            .iter()
            .filter(|w| w.months == ["02"])
            .map(|w| w.days.len())
            .collect();
        assert_eq!(feb, vec![10, 10, 9]);
        assert_exact_cover(&g, &windows, p.quota());
    }

    #[test]
    fn single_day_over_quota_is_rejected() {
        let g = grid(vec!["2020".into()], vec!["01".into()], tokens(1..=2, 2));
        let err = Partitioner::new(100).unwrap().split(&g, 10).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn cover_holds_across_quotas_and_shapes() {
        let specs = [
            DateSpec::new().start("2019-11-15").end("2021-03-02").freq("D"),
            DateSpec::new().start("2020-02-27").periods(40).freq("6H"),
            DateSpec::new().start("2016-01-31").periods(14).freq("M"),
        ];
        for spec in &specs {
            let g = CalendarGrid::generate(spec, None).unwrap();
            for quota in [500, 5_000, 50_000, 120_000, 10_000_000] {
                for items in [1, 2, 7] {
                    let p = Partitioner::new(quota).unwrap();
                    let windows = p.split(&g, items).unwrap();
                    assert_exact_cover(&g, &windows, quota);
                }
            }
        }
    }

    #[test]
    fn oversized_item_estimate_is_a_configuration_error() {
        let g = grid(vec!["2020".into()], vec!["01".into()], vec!["01".into()]);
        let err = Partitioner::new(120_000).unwrap().split(&g, usize::MAX / 2).unwrap_err();
        assert!(matches!(err, Error::Configuration(m) if m.contains("overflow")));
    }

    #[test]
    fn to_request_fills_calendar_keywords() {
        let g = grid(vec!["2020".into()], vec!["01".into()], vec!["01".into()]);
        let windows = Partitioner::new(120_000).unwrap().split(&g, 1).unwrap();
        let r = windows[0].to_request(&Request::new().variable("2m_temperature"));
        assert_eq!(r.get("year").unwrap().as_strings(), vec!["2020"]);
        assert_eq!(r.get("time").unwrap().as_strings().len(), 24);
        assert_eq!(r.get("variable").unwrap().as_strings(), vec!["2m_temperature"]);
    }
}
