//! netCDF container, read and written through libnetcdf.
//!
//! libnetcdf works on paths only, so bytes are staged through a temporary
//! file in both directions. Packed variables (`scale_factor`/`add_offset`)
//! are unpacked and fill values become NaN on read; writes are plain `f64`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use netcdf::AttributeValue;
use serde_json::{Number, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::dataset::{Coordinate, Dataset, DatasetFormat, TimeEncoding, Variable};
use crate::error::Result;

/// Attributes consumed by unpacking.
const PACKING_ATTRS: [&str; 4] = ["scale_factor", "add_offset", "_FillValue", "missing_value"];

#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfFormat;

impl DatasetFormat for NetcdfFormat {
    fn extension(&self) -> &str {
        "nc"
    }

    fn wire_format(&self) -> &str {
        "netcdf"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Dataset> {
        let mut staged = NamedTempFile::new()?;
        staged.write_all(bytes)?;
        staged.flush()?;
        let file = netcdf::open(staged.path())?;
        read_dataset(&file)
    }

    fn encode(&self, dataset: &Dataset, w: &mut dyn Write) -> Result<()> {
        dataset.validate()?;
        let staged = tempfile::Builder::new().suffix(".nc").tempfile()?;
        {
            let mut file = netcdf::create(staged.path())?;
            write_dataset(&mut file, dataset)?;
        }
        w.write_all(&fs::read(staged.path())?)?;
        Ok(())
    }
}

fn read_dataset(file: &netcdf::File) -> Result<Dataset> {
    let mut ds = Dataset::new();
    for attr in file.attributes() {
        if let Some(v) = json_value(attr.value()?) {
            ds.attrs.insert(attr.name().to_string(), v);
        }
    }

    for var in file.variables() {
        let name = var.name().to_string();
        let raw = match var.get_values::<f64, _>(..) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(%name, error = %e, "skipping non-numeric variable");
                continue;
            }
        };
        let dims: Vec<String> = var.dimensions().iter().map(|d| d.name().to_string()).collect();

        let mut attrs = BTreeMap::new();
        for attr in var.attributes() {
            if let Some(v) = json_value(attr.value()?) {
                attrs.insert(attr.name().to_string(), v);
            }
        }
        let data = unpack(raw, &attrs);
        for key in PACKING_ATTRS {
            attrs.remove(key);
        }

        if dims.len() == 1 && dims[0] == name {
            let coord = coordinate(data, &attrs)?;
            ds.coords.insert(name, coord);
        } else {
            ds.variables.insert(name, Variable { dims, data, attrs });
        }
    }

    // Dimensions without a coordinate variable are indexed 0..n.
    for dim in file.dimensions() {
        ds.coords
            .entry(dim.name().to_string())
            .or_insert_with(|| Coordinate::Values((0..dim.len()).map(|i| i as f64).collect()));
    }

    ds.validate()?;
    Ok(ds)
}

fn coordinate(data: Vec<f64>, attrs: &BTreeMap<String, Value>) -> Result<Coordinate> {
    match attrs.get("units").and_then(Value::as_str) {
        Some(units) if units.contains(" since ") => {
            let calendar = attrs.get("calendar").and_then(Value::as_str);
            let encoding = TimeEncoding::parse(units, calendar)?;
            let values = data
                .iter()
                .map(|v| encoding.decode(*v))
                .collect::<Result<Vec<_>>>()?;
            Ok(Coordinate::Time { values, encoding })
        }
        _ => Ok(Coordinate::Values(data)),
    }
}

fn unpack(raw: Vec<f64>, attrs: &BTreeMap<String, Value>) -> Vec<f64> {
    let number = |key: &str| attrs.get(key).and_then(Value::as_f64);
    let fills: Vec<f64> = ["_FillValue", "missing_value"]
        .into_iter()
        .filter_map(number)
        .collect();
    let scale = number("scale_factor").unwrap_or(1.0);
    let offset = number("add_offset").unwrap_or(0.0);

    raw.into_iter()
        .map(|x| {
            if x.is_nan() || fills.contains(&x) {
                f64::NAN
            } else {
                x * scale + offset
            }
        })
        .collect()
}

fn write_dataset(file: &mut netcdf::FileMut, ds: &Dataset) -> Result<()> {
    for (name, value) in &ds.attrs {
        if let Some(v) = attribute_value(value) {
            file.add_attribute(name, v)?;
        }
    }

    for (name, coord) in &ds.coords {
        file.add_dimension(name, coord.len())?;
    }

    for (name, coord) in &ds.coords {
        let mut var = file.add_variable::<f64>(name, &[name.as_str()])?;
        match coord {
            Coordinate::Values(values) => {
                if !values.is_empty() {
                    var.put_values(values, ..)?;
                }
            }
            Coordinate::Time { values, encoding } => {
                var.put_attribute("units", encoding.units())?;
                var.put_attribute("calendar", encoding.calendar.as_str())?;
                let encoded: Vec<f64> = values.iter().map(|t| encoding.encode(*t)).collect();
                if !encoded.is_empty() {
                    var.put_values(&encoded, ..)?;
                }
            }
        }
    }

    for (name, v) in &ds.variables {
        let dims: Vec<&str> = v.dims.iter().map(String::as_str).collect();
        let mut var = file.add_variable::<f64>(name, &dims)?;
        for (key, value) in &v.attrs {
            if let Some(a) = attribute_value(value) {
                var.put_attribute(key, a)?;
            }
        }
        if !v.data.is_empty() {
            var.put_values(&v.data, ..)?;
        }
    }
    Ok(())
}

fn json_value(value: AttributeValue) -> Option<Value> {
    match value {
        AttributeValue::Str(s) => Some(Value::String(s)),
        AttributeValue::Strs(v) => Some(Value::from(v)),
        other => f64::try_from(other)
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
    }
}

fn attribute_value(value: &Value) -> Option<AttributeValue> {
    match value {
        Value::String(s) => Some(AttributeValue::Str(s.clone())),
        Value::Number(n) => n.as_f64().map(AttributeValue::Double),
        _ => None,
    }
}
