//! Conversion between graph results and API-facing JSON.
//!
//! Shapes produced by [`ResultMapper::map_value`]:
//!
//! | graph value      | JSON                                                          |
//! |------------------|---------------------------------------------------------------|
//! | null/bool/string | the same JSON scalar                                          |
//! | integer          | JSON integer (never rendered as a float)                      |
//! | float            | JSON float, `1.0` stays `1.0`; NaN and infinities are refused |
//! | bytes            | array of integers `0..=255`                                   |
//! | list / map       | array / object, recursively, order preserved                  |
//! | temporal         | `{"$temporal": "date", "value": "2024-05-01"}`                |
//! | node             | `{"id", "labels", "properties"}`                              |
//! | relationship     | `{"id", "type", "start", "end", "properties"}`                |
//! | path             | `{"nodes": [...], "relationships": [...]}`                    |

use std::collections::BTreeMap;

use ahash::AHashSet;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Number, Value, json};

use crate::{
    errors::GraphDbError,
    record::Record,
    value::{GraphDuration, GraphValue, Node, Path, Relationship},
};

const TEMPORAL_TAG: &str = "$temporal";
const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Maps records to JSON objects and JSON back to graph values.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResultMapper;

impl ResultMapper {
    pub fn new() -> Self {
        ResultMapper
    }

    /// One record as a JSON object with fields in column order.
    pub fn map(&self, record: &Record) -> Result<Value, GraphDbError> {
        let mut object = Map::with_capacity(record.len());
        for (key, value) in record.iter() {
            let mapped = self
                .map_value(value)
                .map_err(|e| annotate(e, key))?;
            object.insert(key.to_string(), mapped);
        }
        Ok(Value::Object(object))
    }

    pub fn map_all(&self, records: &[Record]) -> Result<Value, GraphDbError> {
        records
            .iter()
            .map(|record| self.map(record))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    pub fn map_value(&self, value: &GraphValue) -> Result<Value, GraphDbError> {
        Ok(match value {
            GraphValue::Null => Value::Null,
            GraphValue::Boolean(b) => Value::Bool(*b),
            GraphValue::Integer(i) => Value::Number((*i).into()),
            GraphValue::Float(f) => Value::Number(Number::from_f64(*f).ok_or_else(|| {
                GraphDbError::unmappable(format!("float {f} has no JSON representation"))
            })?),
            GraphValue::String(s) => Value::String(s.clone()),
            GraphValue::Bytes(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect())
            }
            GraphValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.map_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            GraphValue::Map(map) => Value::Object(self.map_properties(map)?),
            GraphValue::Date(date) => temporal("date", date.format("%Y-%m-%d").to_string()),
            GraphValue::LocalDateTime(dt) => {
                temporal("local_datetime", dt.format(LOCAL_DATETIME_FORMAT).to_string())
            }
            GraphValue::DateTime(dt) => temporal("datetime", dt.to_rfc3339()),
            GraphValue::Duration(duration) => temporal("duration", duration.to_iso8601()),
            GraphValue::Node(node) => self.map_node(node)?,
            GraphValue::Relationship(rel) => self.map_relationship(rel)?,
            GraphValue::Path(path) => self.map_path(path)?,
        })
    }

    /// Inverse of [`ResultMapper::map_value`] for scalars, lists, maps and
    /// tagged temporals. Nodes, relationships and byte arrays come back as the
    /// maps and lists they were rendered to.
    pub fn unmap(&self, value: &Value) -> Result<GraphValue, GraphDbError> {
        Ok(match value {
            Value::Null => GraphValue::Null,
            Value::Bool(b) => GraphValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => GraphValue::Integer(i),
                None => GraphValue::Float(n.as_f64().ok_or_else(|| {
                    GraphDbError::unmappable(format!("number {n} is out of range"))
                })?),
            },
            Value::String(s) => GraphValue::String(s.clone()),
            Value::Array(items) => GraphValue::List(
                items
                    .iter()
                    .map(|item| self.unmap(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(object) => match tagged_temporal(object) {
                Some((tag, text)) => parse_temporal(tag, text)?,
                None => GraphValue::Map(
                    object
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), self.unmap(v)?)))
                        .collect::<Result<_, GraphDbError>>()?,
                ),
            },
        })
    }

    fn map_properties(
        &self,
        properties: &BTreeMap<String, GraphValue>,
    ) -> Result<Map<String, Value>, GraphDbError> {
        let mut object = Map::with_capacity(properties.len());
        for (key, value) in properties {
            let mapped = self.map_value(value).map_err(|e| annotate(e, key))?;
            object.insert(key.clone(), mapped);
        }
        Ok(object)
    }

    fn map_node(&self, node: &Node) -> Result<Value, GraphDbError> {
        Ok(json!({
            "id": node.id,
            "labels": node.labels,
            "properties": self.map_properties(&node.properties)?,
        }))
    }

    fn map_relationship(&self, rel: &Relationship) -> Result<Value, GraphDbError> {
        Ok(json!({
            "id": rel.id,
            "type": rel.rel_type,
            "start": rel.start,
            "end": rel.end,
            "properties": self.map_properties(&rel.properties)?,
        }))
    }

    fn map_path(&self, path: &Path) -> Result<Value, GraphDbError> {
        check_path(path)?;
        let nodes = path
            .nodes
            .iter()
            .map(|node| self.map_node(node))
            .collect::<Result<Vec<_>, _>>()?;
        let relationships = path
            .relationships
            .iter()
            .map(|rel| self.map_relationship(rel))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "nodes": nodes, "relationships": relationships }))
    }
}

/// A path must alternate node, relationship, node and never revisit a node.
fn check_path(path: &Path) -> Result<(), GraphDbError> {
    if path.nodes.is_empty() {
        return if path.relationships.is_empty() {
            Ok(())
        } else {
            Err(GraphDbError::unmappable("path has relationships but no nodes"))
        };
    }
    if path.relationships.len() + 1 != path.nodes.len() {
        return Err(GraphDbError::unmappable(format!(
            "path with {} nodes cannot have {} relationships",
            path.nodes.len(),
            path.relationships.len()
        )));
    }
    let mut seen = AHashSet::with_capacity(path.nodes.len());
    for node in &path.nodes {
        if !seen.insert(node.id) {
            return Err(GraphDbError::unmappable(format!(
                "cyclic path revisits node {}",
                node.id
            )));
        }
    }
    for (i, rel) in path.relationships.iter().enumerate() {
        let (a, b) = (path.nodes[i].id, path.nodes[i + 1].id);
        let joins = (rel.start == a && rel.end == b) || (rel.start == b && rel.end == a);
        if !joins {
            return Err(GraphDbError::unmappable(format!(
                "relationship {} does not connect nodes {a} and {b}",
                rel.id
            )));
        }
    }
    Ok(())
}

fn temporal(tag: &str, value: String) -> Value {
    json!({ TEMPORAL_TAG: tag, "value": value })
}

fn tagged_temporal(object: &Map<String, Value>) -> Option<(&str, &str)> {
    if object.len() != 2 {
        return None;
    }
    let tag = object.get(TEMPORAL_TAG)?.as_str()?;
    let text = object.get("value")?.as_str()?;
    Some((tag, text))
}

fn parse_temporal(tag: &str, text: &str) -> Result<GraphValue, GraphDbError> {
    let bad = || GraphDbError::unmappable(format!("invalid {tag} value {text:?}"));
    match tag {
        "date" => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(GraphValue::Date)
            .map_err(|_| bad()),
        "local_datetime" => NaiveDateTime::parse_from_str(text, LOCAL_DATETIME_FORMAT)
            .map(GraphValue::LocalDateTime)
            .map_err(|_| bad()),
        "datetime" => DateTime::parse_from_rfc3339(text)
            .map(GraphValue::DateTime)
            .map_err(|_| bad()),
        "duration" => GraphDuration::parse_iso8601(text)
            .map(GraphValue::Duration)
            .ok_or_else(bad),
        other => Err(GraphDbError::unmappable(format!(
            "unknown temporal type {other:?}"
        ))),
    }
}

fn annotate(err: GraphDbError, field: &str) -> GraphDbError {
    match err {
        GraphDbError::UnmappableType(msg) => {
            GraphDbError::UnmappableType(format!("field {field:?}: {msg}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn node(id: i64) -> Node {
        Node {
            id,
            labels: vec!["Person".into()],
            properties: BTreeMap::from([("name".to_string(), GraphValue::from("n"))]),
        }
    }

    fn rel(id: i64, start: i64, end: i64) -> Relationship {
        Relationship {
            id,
            rel_type: "KNOWS".into(),
            start,
            end,
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_integers_and_floats_keep_their_type() {
        let mapper = ResultMapper::new();
        let record = Record::from_pairs(vec![
            ("i", GraphValue::Integer(1)),
            ("f", GraphValue::Float(1.0)),
            ("n", GraphValue::Null),
        ]);
        let mapped = mapper.map(&record).unwrap();
        assert!(mapped["i"].is_i64());
        assert!(mapped["f"].is_f64());
        assert_eq!(mapped.to_string(), r#"{"i":1,"f":1.0,"n":null}"#);
    }

    #[test]
    fn test_temporals_are_tagged() {
        let mapper = ResultMapper::new();
        let date = GraphValue::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(
            mapper.map_value(&date).unwrap(),
            json!({"$temporal": "date", "value": "2024-05-01"})
        );
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let dt = GraphValue::DateTime(offset.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        let mapped = mapper.map_value(&dt).unwrap();
        assert_eq!(mapped["value"], "2024-05-01T12:30:00+02:00");
        assert_eq!(mapper.unmap(&mapped).unwrap(), dt);
    }

    #[test]
    fn test_nan_is_unmappable_with_field_name() {
        let mapper = ResultMapper::new();
        let record = Record::from_pairs(vec![("score", GraphValue::Float(f64::NAN))]);
        let err = mapper.map(&record).unwrap_err();
        assert!(matches!(err, GraphDbError::UnmappableType(_)));
        assert!(err.to_string().contains("score"));
    }

    #[test]
    fn test_path_shape_and_validation() {
        let mapper = ResultMapper::new();
        let path = Path {
            nodes: vec![node(1), node(2)],
            relationships: vec![rel(10, 2, 1)],
        };
        let mapped = mapper.map_value(&GraphValue::Path(path)).unwrap();
        assert_eq!(mapped["relationships"][0]["type"], "KNOWS");
        assert_eq!(mapped["nodes"][1]["labels"][0], "Person");

        let cyclic = Path {
            nodes: vec![node(1), node(2), node(1)],
            relationships: vec![rel(10, 1, 2), rel(11, 2, 1)],
        };
        assert!(mapper.map_value(&GraphValue::Path(cyclic)).is_err());

        let disconnected = Path {
            nodes: vec![node(1), node(2)],
            relationships: vec![rel(10, 3, 4)],
        };
        assert!(mapper.map_value(&GraphValue::Path(disconnected)).is_err());
    }

    #[test]
    fn test_bytes_render_as_integer_array() {
        let mapper = ResultMapper::new();
        let mapped = mapper.map_value(&GraphValue::Bytes(vec![0, 255])).unwrap();
        assert_eq!(mapped, json!([0, 255]));
    }

    #[test]
    fn test_untagged_objects_stay_maps() {
        let mapper = ResultMapper::new();
        let value = json!({"$temporal": "date", "value": "2024-05-01", "extra": 1});
        assert!(matches!(mapper.unmap(&value).unwrap(), GraphValue::Map(_)));
        let bad = json!({"$temporal": "date", "value": "not a date"});
        assert!(mapper.unmap(&bad).is_err());
    }
}
