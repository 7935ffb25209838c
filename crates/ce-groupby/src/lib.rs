#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use ce_runtime::RuntimePolicy;
use ce_types::{Row, RowId, TypeError, Value, cmp_missing_first};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregation {
    Sum,
    Average,
    Min,
    Max,
    Count,
    CountUnique,
}

impl Aggregation {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::CountUnique => "countUnique",
        }
    }
}

impl FromStr for Aggregation {
    type Err = GroupByError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sum" => Ok(Self::Sum),
            "average" => Ok(Self::Average),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "countUnique" => Ok(Self::CountUnique),
            other => Err(GroupByError::UnknownAggregation(other.to_owned())),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("Unknown aggregation type: {0}")]
    UnknownAggregation(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Aggregates keyed by composite group key, in first-seen key order.
///
/// Serializes as a JSON object whose members keep that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupTable {
    entries: Vec<(String, f64)>,
    index: HashMap<String, usize>,
}

impl GroupTable {
    /// A repeated key keeps its first position and takes the later value.
    #[must_use]
    pub fn new(entries: Vec<(String, f64)>) -> Self {
        let mut table = Self::default();
        for (key, value) in entries {
            table.insert(key, value);
        }
        table
    }

    fn insert(&mut self, key: String, value: f64) {
        if let Some(&slot) = self.index.get(&key) {
            self.entries[slot].1 = value;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, value));
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.index.get(key).map(|&slot| self.entries[slot].1)
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|(_, value)| *value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for GroupTable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.entries.iter().map(|(key, value)| (key, value)))
    }
}

impl<'de> Deserialize<'de> for GroupTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GroupTableVisitor;
        impl<'de> de::Visitor<'de> for GroupTableVisitor {
            type Value = GroupTable;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of group keys to numbers")
            }

            fn visit_map<A>(self, mut map: A) -> Result<GroupTable, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut table = GroupTable::default();
                while let Some((key, value)) = map.next_entry::<String, f64>()? {
                    table.insert(key, value);
                }
                Ok(table)
            }
        }
        deserializer.deserialize_map(GroupTableVisitor)
    }
}

pub type RankTable = BTreeMap<RowId, f64>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankOptions {
    pub normalized: bool,
    pub cumulative: bool,
}

/// Composite key for `row`: each `group_by` field rendered with
/// [`Value::key_string`] (missing fields as empty text), joined by
/// `delimiter`. Lossy when a rendered value contains the delimiter.
#[must_use]
pub fn group_key(row: &Row, group_by: &[String], delimiter: &str) -> String {
    group_by
        .iter()
        .map(|field| row.get(field).map(Value::key_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(delimiter)
}

/// Partition `rows` by `group_by` and aggregate `value_field` per group.
pub fn group_rows(
    rows: &[Row],
    group_by: &[String],
    aggregation: Aggregation,
    value_field: &str,
    policy: &RuntimePolicy,
) -> Result<GroupTable, GroupByError> {
    let mut ordering = Vec::<String>::new();
    let mut slots = HashMap::<String, Vec<&Row>>::new();

    for row in rows {
        let key = group_key(row, group_by, &policy.group_key_delimiter);
        slots
            .entry(key)
            .or_insert_with_key(|key| {
                ordering.push(key.clone());
                Vec::new()
            })
            .push(row);
    }

    let mut entries = Vec::with_capacity(ordering.len());
    for key in ordering {
        let members = slots.remove(&key).unwrap_or_default();
        let value = aggregate(&members, aggregation, value_field, policy)?;
        entries.push((key, value));
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(
        rows = rows.len(),
        groups = entries.len(),
        aggregation = aggregation.name(),
        "group pass complete"
    );

    Ok(GroupTable::new(entries))
}

/// Stable-sort `rows` by the `rank_by` tuple and assign 1-based ranks.
///
/// Normalization divides by the row count; the cumulative pass replaces each
/// rank by the running sum in the same sorted order, so ties resolve by
/// original row order in both passes.
#[must_use]
pub fn rank_rows(rows: &[Row], rank_by: &[String], options: RankOptions) -> RankTable {
    let mut order: Vec<&Row> = rows.iter().collect();
    order.sort_by(|left, right| compare_rows(left, right, rank_by));

    let row_count = order.len() as f64;
    let mut running = 0.0;
    let mut ranks = RankTable::new();
    for (position, row) in order.iter().enumerate() {
        let mut rank = (position + 1) as f64;
        if options.normalized {
            rank /= row_count;
        }
        if options.cumulative {
            running += rank;
            rank = running;
        }
        ranks.insert(row.id, rank);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(
        rows = rows.len(),
        normalized = options.normalized,
        cumulative = options.cumulative,
        "rank pass complete"
    );

    ranks
}

/// Lexicographic comparison over `fields`; the first differing field decides.
#[must_use]
pub fn compare_rows(left: &Row, right: &Row, fields: &[String]) -> Ordering {
    for field in fields {
        match cmp_missing_first(left.get(field), right.get(field)) {
            Ordering::Equal => continue,
            decided => return decided,
        }
    }
    Ordering::Equal
}

/// Minimum that propagates NaN; `+inf` for an empty slice.
#[must_use]
pub fn nan_propagating_min(values: &[f64]) -> f64 {
    values.iter().fold(f64::INFINITY, |acc, value| {
        if acc.is_nan() || value.is_nan() {
            f64::NAN
        } else {
            acc.min(*value)
        }
    })
}

/// Maximum that propagates NaN; `-inf` for an empty slice.
#[must_use]
pub fn nan_propagating_max(values: &[f64]) -> f64 {
    values.iter().fold(f64::NEG_INFINITY, |acc, value| {
        if acc.is_nan() || value.is_nan() {
            f64::NAN
        } else {
            acc.max(*value)
        }
    })
}

fn aggregate(
    members: &[&Row],
    aggregation: Aggregation,
    value_field: &str,
    policy: &RuntimePolicy,
) -> Result<f64, GroupByError> {
    match aggregation {
        Aggregation::Count => Ok(members.len() as f64),
        Aggregation::CountUnique => {
            let distinct: HashSet<ValueKey<'_>> = members
                .iter()
                .map(|row| ValueKey::from_field(row.get(value_field)))
                .collect();
            Ok(distinct.len() as f64)
        }
        Aggregation::Sum => Ok(numeric_values(members, value_field, policy)?
            .iter()
            .sum()),
        Aggregation::Average => {
            let values = numeric_values(members, value_field, policy)?;
            Ok(values.iter().sum::<f64>() / values.len() as f64)
        }
        Aggregation::Min => Ok(nan_propagating_min(&numeric_values(
            members,
            value_field,
            policy,
        )?)),
        Aggregation::Max => Ok(nan_propagating_max(&numeric_values(
            members,
            value_field,
            policy,
        )?)),
    }
}

fn numeric_values(
    members: &[&Row],
    value_field: &str,
    policy: &RuntimePolicy,
) -> Result<Vec<f64>, GroupByError> {
    members
        .iter()
        .map(|row| match row.get(value_field) {
            Some(value) if policy.is_lenient() => Ok(value.coerce_number()),
            Some(value) => value.to_f64().map_err(GroupByError::from),
            None if policy.is_lenient() => Ok(f64::NAN),
            None => Err(GroupByError::Type(TypeError::MissingField {
                row: row.id,
                field: value_field.to_owned(),
            })),
        })
        .collect()
}

/// Identity used for distinct counting: NaN equals NaN and `0 == -0`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum ValueKey<'a> {
    Bool(bool),
    NumberBits(u64),
    Text(&'a str),
    Missing,
}

impl<'a> ValueKey<'a> {
    fn from_field(value: Option<&'a Value>) -> Self {
        match value {
            Some(Value::Bool(v)) => Self::Bool(*v),
            Some(Value::Number(v)) => Self::NumberBits(if v.is_nan() {
                f64::NAN.to_bits()
            } else if *v == 0.0 {
                0.0_f64.to_bits()
            } else {
                v.to_bits()
            }),
            Some(Value::Text(v)) => Self::Text(v.as_str()),
            None => Self::Missing,
        }
    }
}
