//! Value codec between `FieldValue` and the Firestore wire envelope.
//!
//! Integers travel as decimal strings (`{"integerValue":"42"}`) so 64-bit
//! values survive JSON. `FieldValue::Timestamp` always encodes as
//! `timestampValue`.
//!
//! # Timestamp promotion
//!
//! `encode` also promotes *strings* that are complete RFC 3339 date-times
//! (`2024-05-01T00:00:00Z`, `2024-05-01T10:30:00.5+02:00`) to
//! `timestampValue`. This is a deliberate policy so ISO strings coming from
//! JSON payloads are stored as queryable timestamps. A promoted string
//! decodes back as `FieldValue::Timestamp`, not `Str`. Use
//! `encode_with(value, StringPolicy::Verbatim)` to keep strings as strings.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{ArrayValue, MapValue, Value};
use crate::value::{FieldValue, Fields};

/// How `Str` values are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringPolicy {
    /// RFC 3339 date-time strings become `timestampValue`.
    #[default]
    PromoteTimestamps,
    /// Strings are always `stringValue`.
    Verbatim,
}

/// Encode with timestamp promotion.
pub fn encode(value: &FieldValue) -> Value {
    encode_with(value, StringPolicy::PromoteTimestamps)
}

/// Encode a native value to the wire envelope.
pub fn encode_with(value: &FieldValue, policy: StringPolicy) -> Value {
    match value {
        FieldValue::Null => Value::NullValue(()),
        FieldValue::Bool(b) => Value::BooleanValue(*b),
        FieldValue::Int(i) => Value::IntegerValue(i.to_string()),
        FieldValue::Double(f) => Value::DoubleValue(*f),
        FieldValue::Str(s) => match policy {
            StringPolicy::PromoteTimestamps => match parse_promotable_timestamp(s) {
                Some(ts) => Value::TimestampValue(format_timestamp(&ts)),
                None => Value::StringValue(s.clone()),
            },
            StringPolicy::Verbatim => Value::StringValue(s.clone()),
        },
        FieldValue::Timestamp(ts) => Value::TimestampValue(format_timestamp(ts)),
        FieldValue::Map(fields) => Value::MapValue(MapValue {
            fields: Some(encode_fields_with(fields, policy)),
        }),
        FieldValue::List(items) => Value::ArrayValue(ArrayValue {
            values: Some(items.iter().map(|v| encode_with(v, policy)).collect()),
        }),
    }
}

/// Encode a field map with timestamp promotion.
pub fn encode_fields(fields: &Fields) -> HashMap<String, Value> {
    encode_fields_with(fields, StringPolicy::PromoteTimestamps)
}

pub fn encode_fields_with(fields: &Fields, policy: StringPolicy) -> HashMap<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), encode_with(v, policy)))
        .collect()
}

/// Decode a wire value.
///
/// `referenceValue` decodes to `Str`. Bytes and geo points have no native
/// representation and are rejected.
pub fn decode(value: &Value) -> FirestoreResult<FieldValue> {
    Ok(match value {
        Value::NullValue(()) => FieldValue::Null,
        Value::BooleanValue(b) => FieldValue::Bool(*b),
        Value::IntegerValue(s) => FieldValue::Int(
            s.parse()
                .map_err(|_| FirestoreError::codec(format!("invalid integerValue {:?}", s)))?,
        ),
        Value::DoubleValue(f) => FieldValue::Double(*f),
        Value::StringValue(s) => FieldValue::Str(s.clone()),
        Value::ReferenceValue(s) => FieldValue::Str(s.clone()),
        Value::TimestampValue(s) => FieldValue::Timestamp(
            parse_timestamp(s)
                .ok_or_else(|| FirestoreError::codec(format!("invalid timestampValue {:?}", s)))?,
        ),
        Value::MapValue(map) => FieldValue::Map(match &map.fields {
            Some(fields) => decode_fields(fields)?,
            None => Fields::new(),
        }),
        Value::ArrayValue(array) => FieldValue::List(match &array.values {
            Some(values) => values.iter().map(decode).collect::<FirestoreResult<_>>()?,
            None => Vec::new(),
        }),
        Value::BytesValue(_) => return Err(FirestoreError::codec("bytesValue is not supported")),
        Value::GeoPointValue(_) => {
            return Err(FirestoreError::codec("geoPointValue is not supported"))
        }
    })
}

pub fn decode_fields(fields: &HashMap<String, Value>) -> FirestoreResult<Fields> {
    fields
        .iter()
        .map(|(k, v)| {
            decode(v)
                .map(|decoded| (k.clone(), decoded))
                .map_err(|e| FirestoreError::codec(format!("field {:?}: {}", k, e)))
        })
        .collect()
}

/// Wire format for timestamps: RFC 3339 in UTC with `Z`, sub-second digits only when needed.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Strings eligible for promotion: full `YYYY-MM-DDTHH:MM:SS` date-times with an offset.
fn parse_promotable_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let bytes = s.as_bytes();
    if bytes.len() < 20 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return None;
    }
    parse_timestamp(s)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn sample_map() -> Fields {
        let mut nested = Fields::new();
        nested.insert("enabled".to_string(), FieldValue::Bool(true));
        nested.insert("ratio".to_string(), FieldValue::Double(0.25));

        let mut fields = Fields::new();
        fields.insert("nested".to_string(), FieldValue::Map(nested));
        fields.insert(
            "tags".to_string(),
            FieldValue::List(vec![FieldValue::from("a"), FieldValue::Int(2), FieldValue::Null]),
        );
        fields
    }

    #[test]
    fn test_roundtrip_supported_shapes() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let values = vec![
            FieldValue::Null,
            FieldValue::Bool(false),
            FieldValue::Int(i64::MAX),
            FieldValue::Int(-17),
            FieldValue::Double(3.5),
            FieldValue::Str("hello".into()),
            FieldValue::Str("2024-05-01".into()),
            FieldValue::Timestamp(ts),
            FieldValue::Map(sample_map()),
            FieldValue::Map(Fields::new()),
            FieldValue::List(vec![]),
            FieldValue::List(vec![FieldValue::Map(sample_map())]),
        ];

        for value in values {
            assert_eq!(decode(&encode(&value)).unwrap(), value, "roundtrip of {:?}", value);
        }
    }

    #[test]
    fn test_iso_string_promoted_to_timestamp() {
        let encoded = encode(&FieldValue::from("2024-05-01T00:00:00Z"));
        assert!(matches!(encoded, Value::TimestampValue(_)));
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            json!({"timestampValue": "2024-05-01T00:00:00Z"})
        );

        let decoded = decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_offset_string_promoted_and_normalized_to_utc() {
        let encoded = encode(&FieldValue::from("2024-05-01T02:00:00+02:00"));
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            json!({"timestampValue": "2024-05-01T00:00:00Z"})
        );
    }

    #[test]
    fn test_verbatim_policy_keeps_strings() {
        let encoded = encode_with(&FieldValue::from("2024-05-01T00:00:00Z"), StringPolicy::Verbatim);
        assert!(matches!(encoded, Value::StringValue(_)));
    }

    #[test]
    fn test_non_timestamp_strings_not_promoted() {
        for s in ["2024-05-01", "2024-05-01 00:00:00Z", "order 2024-05-01T00:00:00Z", "T"] {
            assert!(
                matches!(encode(&FieldValue::from(s)), Value::StringValue(_)),
                "{} should stay a string",
                s
            );
        }
    }

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            serde_json::to_value(encode(&FieldValue::Int(42))).unwrap(),
            json!({"integerValue": "42"})
        );
        assert_eq!(
            serde_json::to_value(encode(&FieldValue::Null)).unwrap(),
            json!({"nullValue": null})
        );
        assert_eq!(
            serde_json::to_value(encode(&FieldValue::Double(1.5))).unwrap(),
            json!({"doubleValue": 1.5})
        );
        assert_eq!(
            serde_json::to_value(encode(&FieldValue::List(vec![FieldValue::Bool(true)]))).unwrap(),
            json!({"arrayValue": {"values": [{"booleanValue": true}]}})
        );

        let mut fields = Fields::new();
        fields.insert("code".to_string(), FieldValue::from("SAVE10"));
        assert_eq!(
            serde_json::to_value(encode(&FieldValue::Map(fields))).unwrap(),
            json!({"mapValue": {"fields": {"code": {"stringValue": "SAVE10"}}}})
        );
    }

    #[test]
    fn test_decode_wire_json() {
        let wire: Value = serde_json::from_value(json!({
            "mapValue": {"fields": {
                "usageCount": {"integerValue": "5"},
                "empty": {"mapValue": {}},
                "list": {"arrayValue": {}},
                "ref": {"referenceValue": "projects/p/databases/(default)/documents/coupons/X"}
            }}
        }))
        .unwrap();

        let decoded = decode(&wire).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(map["usageCount"], FieldValue::Int(5));
        assert_eq!(map["empty"], FieldValue::Map(Fields::new()));
        assert_eq!(map["list"], FieldValue::List(vec![]));
        assert!(map["ref"].as_str().unwrap().ends_with("coupons/X"));
    }

    #[test]
    fn test_decode_rejects_bad_values() {
        assert!(decode(&Value::IntegerValue("4.2".into())).is_err());
        assert!(decode(&Value::TimestampValue("yesterday".into())).is_err());
        assert!(decode(&Value::BytesValue("AAEC".into())).is_err());
    }
}
