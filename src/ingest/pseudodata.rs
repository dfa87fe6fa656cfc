//! Reading of pseudodata individuals from JSON.
//!
//! The document is either an array of objects or an object holding that
//! array under `"individuals"`.  Every object describes one individual; the
//! identifier is taken from a configurable key and all other keys are kept as
//! open attributes.  An optional `"biosamples"` array declares which variant
//! file samples belong to the individual.

use std::path::Path;

use chrono::{Datelike, NaiveDate};
use serde_json::Value;

use crate::{
    common::io::open_read_maybe_gz,
    err::LoadError,
    ingest::ds::{Attributes, Individual, ProtoBiosample},
};

/// Key holding the declared sample linkage.
pub const BIOSAMPLES_KEY: &str = "biosamples";

/// Disease categories checked in order when deriving the summary disease.
const DISEASE_CATEGORIES: &[&str] = &[
    "bloodRelatedDisorders",
    "respiratorySystem",
    "circulatorySystem",
];

/// Options for reading pseudodata.
#[derive(Debug, Clone)]
pub struct Options {
    /// Name of the identifier field.
    pub id_key: String,
    /// Date that ages are computed against.
    pub reference_date: NaiveDate,
}

/// One individual together with its declared samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudodataRecord {
    /// 0-based position in the source document.
    pub index: usize,
    pub individual: Individual,
    pub biosamples: Vec<ProtoBiosample>,
}

/// Read pseudodata records from the (possibly gzip-compressed) file at `path`.
pub fn read_path<P: AsRef<Path>>(
    path: P,
    options: &Options,
) -> Result<Vec<PseudodataRecord>, LoadError> {
    let reader = open_read_maybe_gz(path.as_ref())?;
    let doc: Value = serde_json::from_reader(reader)?;
    let records = from_value(doc, options)?;
    tracing::debug!(
        "read {} pseudodata entries from {}",
        records.len(),
        path.as_ref().display()
    );
    Ok(records)
}

/// Convert a parsed JSON document into pseudodata records.
pub fn from_value(doc: Value, options: &Options) -> Result<Vec<PseudodataRecord>, LoadError> {
    let entries = match doc {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("individuals") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(LoadError::InvalidDocument(serde::de::Error::custom(
                    "expected an array of individuals or an object with an \"individuals\" array",
                )))
            }
        },
        _ => {
            return Err(LoadError::InvalidDocument(serde::de::Error::custom(
                "expected an array of individuals",
            )))
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| from_entry(index, entry, options))
        .collect()
}

/// Convert one entry of the document.
fn from_entry(index: usize, entry: Value, options: &Options) -> Result<PseudodataRecord, LoadError> {
    let missing = || LoadError::MissingIdentifier {
        index,
        key: options.id_key.clone(),
    };
    let Value::Object(map) = entry else {
        return Err(missing());
    };

    let mut stable_id = None;
    let mut biosamples = Vec::new();
    let mut attributes = Attributes::new();
    for (key, value) in map {
        if key == options.id_key {
            stable_id = identifier(&value);
        } else if key == BIOSAMPLES_KEY {
            biosamples = proto_biosamples(&value);
        } else {
            attributes.insert(key, value);
        }
    }
    let stable_id = stable_id.ok_or_else(missing)?;

    let individual = Individual {
        sex: derive_sex(&attributes),
        age_of_onset: derive_age(&attributes, options.reference_date),
        disease: Some(derive_disease(&attributes)),
        stable_id,
        attributes,
    };
    Ok(PseudodataRecord {
        index,
        individual,
        biosamples,
    })
}

/// Identifiers may be strings or numbers; empty strings are not identifiers.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn proto_biosamples(value: &Value) -> Vec<ProtoBiosample> {
    let Value::Array(entries) = value else {
        tracing::warn!("ignoring non-array {} value: {}", BIOSAMPLES_KEY, value);
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::Object(map) => {
                let stable_id = map.get("id").and_then(identifier)?;
                let tissue = map
                    .get("tissue")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let collection = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "tissue")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Some(ProtoBiosample {
                    stable_id,
                    tissue,
                    collection,
                })
            }
            other => identifier(other).map(|stable_id| ProtoBiosample {
                stable_id,
                tissue: None,
                collection: Attributes::new(),
            }),
        })
        .collect()
}

/// Look up a nested value by a sequence of keys.
fn lookup<'a>(attributes: &'a Attributes, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(attributes.get(*first)?, |value, key| value.get(key))
}

fn derive_sex(attributes: &Attributes) -> Option<String> {
    lookup(attributes, &["sex"])
        .or_else(|| lookup(attributes, &["demographic", "biologicalSex"]))
        .and_then(Value::as_str)
        .map(str::to_lowercase)
}

fn derive_age(attributes: &Attributes, reference_date: NaiveDate) -> Option<i32> {
    let raw = lookup(attributes, &["demographic", "age"])
        .or_else(|| lookup(attributes, &["dateOfBirth"]))
        .and_then(Value::as_str)?;
    let dob = ["%d-%b-%y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())?;
    let mut years = reference_date.year() - dob.year();
    if (reference_date.month(), reference_date.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    (years >= 0).then_some(years)
}

fn derive_disease(attributes: &Attributes) -> String {
    DISEASE_CATEGORIES
        .iter()
        .copied()
        .find(|category| {
            lookup(attributes, &["diseases", *category])
                .and_then(|answers| answers.get(0))
                .and_then(Value::as_str)
                .map(|answer| answer != "Never" && answer != "No")
                .unwrap_or(false)
        })
        .map(|category| category.to_string())
        .unwrap_or_default()
}
