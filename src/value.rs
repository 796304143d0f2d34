//! Typed values flowing into and out of the database.
//!
//! [`ParamValue`] is the closed set of types a caller may bind to a query
//! placeholder. [`GraphValue`] is everything a transport may hand back,
//! including graph-native structures and temporal types.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};

/// A value bound to a named query parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Boolean(_) => "boolean",
            ParamValue::Integer(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::String(_) => "string",
            ParamValue::List(_) => "list",
            ParamValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    /// JSON form used when a transport stores lists and maps as text.
    /// Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            ParamValue::Null => Value::Null,
            ParamValue::Boolean(b) => Value::Bool(*b),
            ParamValue::Integer(i) => Value::from(*i),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::String(s) => Value::String(s.clone()),
            ParamValue::List(items) => Value::Array(items.iter().map(ParamValue::to_json).collect()),
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Boolean(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Integer(i64::from(value))
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Integer(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParamValue::Null, Into::into)
    }
}

impl<T: Into<ParamValue>> From<BTreeMap<String, T>> for ParamValue {
    fn from(map: BTreeMap<String, T>) -> Self {
        ParamValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<serde_json::Value> for ParamValue {
    /// Integers that fit `i64` stay integers; every other number becomes a float.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ParamValue::Null,
            serde_json::Value::Bool(b) => ParamValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Integer(i),
                None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ParamValue::String(s),
            serde_json::Value::Array(items) => {
                ParamValue::List(items.into_iter().map(ParamValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                ParamValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Calendar-aware duration as graph databases model it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GraphDuration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i32,
}

impl GraphDuration {
    const NANOS_PER_SECOND: i64 = 1_000_000_000;

    /// Folds `seconds` and `nanoseconds` so that `0 <= nanoseconds < 1e9` and
    /// the sign is carried by `seconds`.
    pub fn normalized(self) -> Self {
        let total = self.total_nanos();
        Self {
            seconds: total.div_euclid(Self::NANOS_PER_SECOND as i128) as i64,
            nanoseconds: total.rem_euclid(Self::NANOS_PER_SECOND as i128) as i32,
            ..self
        }
    }

    fn total_nanos(&self) -> i128 {
        self.seconds as i128 * Self::NANOS_PER_SECOND as i128 + self.nanoseconds as i128
    }

    /// ISO-8601 rendering, e.g. `P1M2DT3.5S` or `P0M0DT-0.5S`.
    pub fn to_iso8601(&self) -> String {
        let total = self.total_nanos();
        let sign = if total < 0 { "-" } else { "" };
        let abs = total.unsigned_abs();
        let secs = abs / Self::NANOS_PER_SECOND as u128;
        let nanos = abs % Self::NANOS_PER_SECOND as u128;
        let mut out = format!("P{}M{}DT{sign}{secs}", self.months, self.days);
        if nanos != 0 {
            let frac = format!("{nanos:09}");
            out.push('.');
            out.push_str(frac.trim_end_matches('0'));
        }
        out.push('S');
        out
    }

    /// Parses the shape produced by [`GraphDuration::to_iso8601`] into the
    /// [normalized](GraphDuration::normalized) form.
    pub fn parse_iso8601(text: &str) -> Option<Self> {
        let rest = text.strip_prefix('P')?;
        let (months, rest) = rest.split_once('M')?;
        let (days, rest) = rest.split_once('D')?;
        let rest = rest.strip_prefix('T')?.strip_suffix('S')?;
        let (negative, rest) = match rest.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let (secs, frac) = match rest.split_once('.') {
            Some((secs, frac)) => (secs, Some(frac)),
            None => (rest, None),
        };
        if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let secs: i64 = secs.parse().ok()?;
        let nanos: i32 = match frac {
            Some(frac)
                if !frac.is_empty() && frac.len() <= 9 && frac.bytes().all(|b| b.is_ascii_digit()) =>
            {
                format!("{frac:0<9}").parse().ok()?
            }
            Some(_) => return None,
            None => 0,
        };
        let (seconds, nanoseconds) = if negative {
            (secs.checked_neg()?, -nanos)
        } else {
            (secs, nanos)
        };
        Some(
            Self {
                months: months.parse().ok()?,
                days: days.parse().ok()?,
                seconds,
                nanoseconds,
            }
            .normalized(),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, GraphValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relationship {
    pub id: i64,
    pub rel_type: String,
    pub start: i64,
    pub end: i64,
    pub properties: BTreeMap<String, GraphValue>,
}

/// An alternating walk: `nodes[i]` and `nodes[i + 1]` are joined by `relationships[i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

/// A value produced by query execution.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<GraphValue>),
    Map(BTreeMap<String, GraphValue>),
    Date(NaiveDate),
    LocalDateTime(NaiveDateTime),
    DateTime(DateTime<FixedOffset>),
    Duration(GraphDuration),
    Node(Node),
    Relationship(Relationship),
    Path(Path),
}

impl GraphValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            GraphValue::Null => "null",
            GraphValue::Boolean(_) => "boolean",
            GraphValue::Integer(_) => "integer",
            GraphValue::Float(_) => "float",
            GraphValue::String(_) => "string",
            GraphValue::Bytes(_) => "bytes",
            GraphValue::List(_) => "list",
            GraphValue::Map(_) => "map",
            GraphValue::Date(_) => "date",
            GraphValue::LocalDateTime(_) => "local_datetime",
            GraphValue::DateTime(_) => "datetime",
            GraphValue::Duration(_) => "duration",
            GraphValue::Node(_) => "node",
            GraphValue::Relationship(_) => "relationship",
            GraphValue::Path(_) => "path",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            GraphValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GraphValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GraphValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, GraphValue::Null)
    }
}

impl From<ParamValue> for GraphValue {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Null => GraphValue::Null,
            ParamValue::Boolean(b) => GraphValue::Boolean(b),
            ParamValue::Integer(i) => GraphValue::Integer(i),
            ParamValue::Float(f) => GraphValue::Float(f),
            ParamValue::String(s) => GraphValue::String(s),
            ParamValue::List(items) => {
                GraphValue::List(items.into_iter().map(GraphValue::from).collect())
            }
            ParamValue::Map(map) => {
                GraphValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<i64> for GraphValue {
    fn from(value: i64) -> Self {
        GraphValue::Integer(value)
    }
}

impl From<f64> for GraphValue {
    fn from(value: f64) -> Self {
        GraphValue::Float(value)
    }
}

impl From<&str> for GraphValue {
    fn from(value: &str) -> Self {
        GraphValue::String(value.to_string())
    }
}

impl From<bool> for GraphValue {
    fn from(value: bool) -> Self {
        GraphValue::Boolean(value)
    }
}
