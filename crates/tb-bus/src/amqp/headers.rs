//! Conversion between AMQP field tables and [`Headers`]

use lapin::types::{AMQPValue, FieldArray, FieldTable, ShortString};
use serde_json::Value;

use crate::pipeline::{Headers, PipeContext};
use crate::Result;

pub fn value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::from(*b),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => Value::Array(items.as_slice().iter().map(value_to_json).collect()),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), value_to_json(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

pub fn json_to_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(json_to_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (k, v) in map {
                table.insert(ShortString::from(k.as_str()), json_to_value(v));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

pub fn headers_from_table(table: Option<&FieldTable>) -> Headers {
    table
        .map(|t| {
            t.inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), value_to_json(v)))
                .collect()
        })
        .unwrap_or_default()
}

pub fn table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (k, v) in headers {
        table.insert(ShortString::from(k.as_str()), json_to_value(v));
    }
    table
}

/// Materialize an inbound delivery: JSON body, headers, retry info and context
pub fn decode_delivery(
    tenant_id: &str,
    exchange: &str,
    routing_key: &str,
    headers: Option<&FieldTable>,
    data: &[u8],
) -> Result<PipeContext> {
    let body: Value = if data.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(data)?
    };

    Ok(PipeContext::new(
        tenant_id,
        exchange,
        routing_key,
        headers_from_table(headers),
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{MESSAGE_CONTEXT_HEADER, NUMBER_OF_RETRIES_HEADER, X_DEATH_HEADER};
    use lapin::types::LongString;
    use tb_common::CorrelationContext;

    #[test]
    fn test_decode_delivery_with_context_and_retries() {
        let ctx = CorrelationContext::new().with_tenant("acme");
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(MESSAGE_CONTEXT_HEADER),
            AMQPValue::LongString(LongString::from(serde_json::to_string(&ctx).unwrap())),
        );
        table.insert(ShortString::from(NUMBER_OF_RETRIES_HEADER), AMQPValue::LongInt(2));

        let pipe = decode_delivery("acme", "acme", "acme.order_placed", Some(&table), br#"{"orderId":"o-1"}"#)
            .unwrap();

        assert_eq!(pipe.body["orderId"], "o-1");
        assert_eq!(pipe.retry.number_of_retries, 2);
        assert_eq!(pipe.correlation().map(|c| c.id), Some(ctx.id));
    }

    #[test]
    fn test_x_death_table_is_counted() {
        let mut death = FieldTable::default();
        death.insert(ShortString::from("count"), AMQPValue::LongLongInt(3));
        death.insert(ShortString::from("queue"), AMQPValue::LongString("svc/acme.x".into()));

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(X_DEATH_HEADER),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
        );

        let pipe = decode_delivery("acme", "acme", "acme.x", Some(&table), b"").unwrap();
        assert_eq!(pipe.retry.number_of_retries, 3);
        assert!(pipe.body.is_null());
    }

    #[test]
    fn test_headers_survive_table_conversion() {
        let mut headers = Headers::new();
        headers.insert("x-number-of-retries".into(), Value::from(5));
        headers.insert("x-exception".into(), Value::from("boom"));
        headers.insert("flags".into(), serde_json::json!([true, 1.5]));

        let back = headers_from_table(Some(&table_from_headers(&headers)));
        assert_eq!(back, headers);
    }

    #[test]
    fn test_invalid_body_is_an_error() {
        assert!(decode_delivery("acme", "acme", "acme.x", None, b"not json").is_err());
    }
}
