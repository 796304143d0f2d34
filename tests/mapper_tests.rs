use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};
use graph_db_api::{
    ErrorKind, GraphDuration, GraphValue, Node, Path, Record, Relationship, ResultMapper,
};
use serde_json::json;

fn node(id: i64, label: &str, name: &str) -> Node {
    Node {
        id,
        labels: vec![label.to_string()],
        properties: BTreeMap::from([("name".to_string(), GraphValue::from(name))]),
    }
}

fn knows(id: i64, start: i64, end: i64) -> Relationship {
    Relationship {
        id,
        rel_type: "KNOWS".to_string(),
        start,
        end,
        properties: BTreeMap::from([("since".to_string(), GraphValue::Integer(2019))]),
    }
}

#[test]
fn test_record_round_trips_through_json_text() {
    let mapper = ResultMapper::new();
    let record = Record::from_pairs(vec![
        ("count", GraphValue::Integer(42)),
        ("ratio", GraphValue::Float(1.0)),
        ("missing", GraphValue::Null),
        (
            "nested",
            GraphValue::List(vec![
                GraphValue::Integer(1),
                GraphValue::List(vec![GraphValue::Float(2.5), GraphValue::from("x")]),
                GraphValue::Null,
            ]),
        ),
    ]);

    let text = serde_json::to_string(&mapper.map(&record).unwrap()).unwrap();
    assert_eq!(
        text,
        r#"{"count":42,"ratio":1.0,"missing":null,"nested":[1,[2.5,"x"],null]}"#
    );

    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    let restored = mapper.unmap(&parsed).unwrap();
    let GraphValue::Map(fields) = restored else {
        panic!("expected a map");
    };
    assert_eq!(fields["count"], GraphValue::Integer(42));
    assert_eq!(fields["ratio"], GraphValue::Float(1.0));
    assert_eq!(fields["missing"], GraphValue::Null);
    assert_eq!(fields["nested"], record.get("nested").cloned().unwrap());
}

#[test]
fn test_field_order_follows_columns() {
    let record = Record::from_pairs(vec![
        ("zeta", GraphValue::Integer(1)),
        ("alpha", GraphValue::Integer(2)),
        ("mid", GraphValue::Integer(3)),
    ]);
    let mapped = ResultMapper::new().map(&record).unwrap();
    let keys: Vec<&String> = mapped.as_object().unwrap().keys().collect();
    assert_eq!(keys, ["zeta", "alpha", "mid"]);
}

#[test]
fn test_temporals_survive_round_trip() {
    let mapper = ResultMapper::new();
    let values = [
        GraphValue::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()),
        GraphValue::LocalDateTime(
            NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_milli_opt(9, 30, 0, 250)
                .unwrap(),
        ),
        GraphValue::DateTime(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0)
                .unwrap()
                .fixed_offset(),
        ),
        GraphValue::Duration(GraphDuration {
            months: 1,
            days: 2,
            seconds: 3,
            nanoseconds: 500_000_000,
        }),
        GraphValue::Duration(GraphDuration {
            months: 0,
            days: 0,
            seconds: -1,
            nanoseconds: 500_000_000,
        }),
        GraphValue::Duration(GraphDuration {
            months: -2,
            days: 0,
            seconds: -4,
            nanoseconds: 1,
        }),
    ];
    for value in values {
        let mapped = mapper.map_value(&value).unwrap();
        assert!(mapped.get("$temporal").is_some(), "{mapped}");
        assert_eq!(mapper.unmap(&mapped).unwrap(), value);
    }

    let half_back = GraphValue::Duration(GraphDuration {
        seconds: -1,
        nanoseconds: 500_000_000,
        ..GraphDuration::default()
    });
    assert_eq!(
        mapper.map_value(&half_back).unwrap(),
        json!({"$temporal": "duration", "value": "P0M0DT-0.5S"})
    );
}

#[test]
fn test_path_renders_nodes_and_relationships() {
    let path = Path {
        nodes: vec![node(1, "Person", "Ada"), node(2, "Person", "Grace")],
        relationships: vec![knows(10, 1, 2)],
    };
    let mapped = ResultMapper::new()
        .map_value(&GraphValue::Path(path))
        .unwrap();
    assert_eq!(
        mapped,
        json!({
            "nodes": [
                {"id": 1, "labels": ["Person"], "properties": {"name": "Ada"}},
                {"id": 2, "labels": ["Person"], "properties": {"name": "Grace"}},
            ],
            "relationships": [
                {"id": 10, "type": "KNOWS", "start": 1, "end": 2, "properties": {"since": 2019}},
            ],
        })
    );
}

#[test]
fn test_cyclic_path_is_unmappable() {
    let path = Path {
        nodes: vec![node(1, "Person", "Ada"), node(2, "Person", "Grace"), node(1, "Person", "Ada")],
        relationships: vec![knows(10, 1, 2), knows(11, 2, 1)],
    };
    let record = Record::from_pairs(vec![("p", GraphValue::Path(path))]);
    let err = ResultMapper::new().map(&record).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnmappableType);
    assert_eq!(err.http_status(), 500);
    assert!(err.to_string().contains("field \"p\""));
    assert!(err.to_string().contains("cyclic"));
}

#[test]
fn test_non_finite_float_names_the_field() {
    let records = vec![
        Record::from_pairs(vec![("score", GraphValue::Float(0.5))]),
        Record::from_pairs(vec![("score", GraphValue::Float(f64::INFINITY))]),
    ];
    let err = ResultMapper::new().map_all(&records).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnmappableType);
    assert!(err.to_string().contains("field \"score\""));
}
