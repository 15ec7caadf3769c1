//! In-memory gridded dataset and its on-disk encoding.
//!
//! A dataset is a set of named coordinates (each one its own dimension) and
//! variables laid out row-major over a list of those dimensions. Time
//! coordinates carry a CF-style `<unit> since <epoch>` encoding.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const TIME: &str = "time";
pub const STANDARD_CALENDAR: &str = "standard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn seconds(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 3_600,
            TimeUnit::Days => 86_400,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
        }
    }
}

/// How a time coordinate is stored: `<unit> since <epoch>` on a calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeEncoding {
    pub unit: TimeUnit,
    pub epoch: NaiveDateTime,
    pub calendar: String,
}

impl TimeEncoding {
    /// `seconds since 1970-01-01 00:00:00` on the standard calendar.
    pub fn epoch_seconds() -> Self {
        Self {
            unit: TimeUnit::Seconds,
            epoch: DateTime::<Utc>::UNIX_EPOCH.naive_utc(),
            calendar: STANDARD_CALENDAR.to_string(),
        }
    }

    pub fn parse(units: &str, calendar: Option<&str>) -> Result<Self> {
        let (unit, epoch) = units
            .split_once(" since ")
            .ok_or_else(|| Error::Format(format!("not a time unit: {units}")))?;
        let unit = match unit.trim() {
            "seconds" | "second" | "s" => TimeUnit::Seconds,
            "minutes" | "minute" => TimeUnit::Minutes,
            "hours" | "hour" | "h" => TimeUnit::Hours,
            "days" | "day" | "d" => TimeUnit::Days,
            other => return Err(Error::Format(format!("unsupported time unit: {other}"))),
        };

        let calendar = calendar.unwrap_or(STANDARD_CALENDAR);
        if !matches!(calendar, "standard" | "gregorian" | "proleptic_gregorian") {
            return Err(Error::Format(format!("unsupported calendar: {calendar}")));
        }

        Ok(Self {
            unit,
            epoch: parse_epoch(epoch)?,
            calendar: calendar.to_string(),
        })
    }

    pub fn units(&self) -> String {
        format!(
            "{} since {}",
            self.unit.name(),
            self.epoch.format("%Y-%m-%d %H:%M:%S")
        )
    }

    pub fn decode(&self, value: f64) -> Result<NaiveDateTime> {
        if !value.is_finite() {
            return Err(Error::Format(format!("non-finite time value: {value}")));
        }
        let secs = (value * self.unit.seconds() as f64).round() as i64;
        Duration::try_seconds(secs)
            .and_then(|d| self.epoch.checked_add_signed(d))
            .ok_or_else(|| Error::Format(format!("time value out of range: {value}")))
    }

    pub fn encode(&self, t: NaiveDateTime) -> f64 {
        (t - self.epoch).num_seconds() as f64 / self.unit.seconds() as f64
    }
}

fn parse_epoch(s: &str) -> Result<NaiveDateTime> {
    let t = s.trim().trim_end_matches('Z').trim_end_matches(" UTC").trim();
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN))
        .map_err(|_| Error::Format(format!("invalid time epoch: {s}")))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Coordinate {
    Values(Vec<f64>),
    Time {
        values: Vec<NaiveDateTime>,
        encoding: TimeEncoding,
    },
}

impl Coordinate {
    pub fn len(&self) -> usize {
        match self {
            Coordinate::Values(v) => v.len(),
            Coordinate::Time { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub data: Vec<f64>,
    pub attrs: BTreeMap<String, Value>,
}

impl Variable {
    pub fn new(dims: &[&str], data: Vec<f64>) -> Self {
        Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            data,
            attrs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub coords: BTreeMap<String, Coordinate>,
    pub variables: BTreeMap<String, Variable>,
    pub attrs: BTreeMap<String, Value>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.coords.contains_key(name) || self.variables.contains_key(name)
    }

    pub fn times(&self) -> Option<&[NaiveDateTime]> {
        match self.coords.get(TIME) {
            Some(Coordinate::Time { values, .. }) => Some(values),
            _ => None,
        }
    }

    /// Dimension lengths of `var`, looked up from the coordinates.
    pub fn shape(&self, var: &Variable) -> Result<Vec<usize>> {
        var.dims
            .iter()
            .map(|d| {
                self.coords
                    .get(d)
                    .map(Coordinate::len)
                    .ok_or_else(|| Error::Format(format!("dimension {d} has no coordinate")))
            })
            .collect()
    }

    /// Check every variable's data length against its dimensions.
    pub fn validate(&self) -> Result<()> {
        for (name, var) in &self.variables {
            let expected: usize = self.shape(var)?.iter().product();
            if var.data.len() != expected {
                return Err(Error::Format(format!(
                    "variable {name} holds {} values, dimensions need {expected}",
                    var.data.len()
                )));
            }
        }
        Ok(())
    }
}

/// A container format for datasets.
pub trait DatasetFormat {
    /// File extension, without the dot.
    fn extension(&self) -> &str;

    /// Value of the `format` keyword that makes the archive answer in this
    /// container.
    fn wire_format(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<Dataset>;

    fn encode(&self, dataset: &Dataset, w: &mut dyn Write) -> Result<()>;
}

/// Self-describing JSON encoding. Missing values are stored as `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

#[derive(Serialize, Deserialize)]
struct DatasetRecord {
    #[serde(default)]
    coords: BTreeMap<String, CoordRecord>,
    #[serde(default)]
    variables: BTreeMap<String, VariableRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct CoordRecord {
    values: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    calendar: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct VariableRecord {
    dims: Vec<String>,
    data: Vec<Option<f64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, Value>,
}

impl DatasetFormat for JsonFormat {
    fn extension(&self) -> &str {
        "json"
    }

    fn wire_format(&self) -> &str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Dataset> {
        let record: DatasetRecord = serde_json::from_slice(bytes)?;

        let mut coords = BTreeMap::new();
        for (name, c) in record.coords {
            let coord = match c.units.as_deref() {
                Some(units) if units.contains(" since ") => {
                    let encoding = TimeEncoding::parse(units, c.calendar.as_deref())?;
                    let values = c
                        .values
                        .iter()
                        .map(|v| encoding.decode(*v))
                        .collect::<Result<Vec<_>>>()?;
                    Coordinate::Time { values, encoding }
                }
                _ => Coordinate::Values(c.values),
            };
            coords.insert(name, coord);
        }

        let variables = record
            .variables
            .into_iter()
            .map(|(name, v)| {
                let var = Variable {
                    dims: v.dims,
                    data: v.data.into_iter().map(|x| x.unwrap_or(f64::NAN)).collect(),
                    attrs: v.attrs,
                };
                (name, var)
            })
            .collect();

        let ds = Dataset {
            coords,
            variables,
            attrs: record.attrs,
        };
        ds.validate()?;
        Ok(ds)
    }

    fn encode(&self, dataset: &Dataset, w: &mut dyn Write) -> Result<()> {
        let coords = dataset
            .coords
            .iter()
            .map(|(name, c)| {
                let record = match c {
                    Coordinate::Values(v) => CoordRecord {
                        values: v.clone(),
                        units: None,
                        calendar: None,
                    },
                    Coordinate::Time { values, encoding } => CoordRecord {
                        values: values.iter().map(|t| encoding.encode(*t)).collect(),
                        units: Some(encoding.units()),
                        calendar: Some(encoding.calendar.clone()),
                    },
                };
                (name.clone(), record)
            })
            .collect();

        let variables = dataset
            .variables
            .iter()
            .map(|(name, v)| {
                let record = VariableRecord {
                    dims: v.dims.clone(),
                    data: v.data.iter().map(|x| x.is_finite().then_some(*x)).collect(),
                    attrs: v.attrs.clone(),
                };
                (name.clone(), record)
            })
            .collect();

        let record = DatasetRecord {
            coords,
            variables,
            attrs: dataset.attrs.clone(),
        };
        serde_json::to_writer(w, &record)?;
        Ok(())
    }
}
