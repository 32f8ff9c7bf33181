// ABOUTME: SqlValue - generically typed column value carried from source rows to local writes
// ABOUTME: Encodes itself for whatever column type the destination statement declares

use anyhow::{bail, Result};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::error::Error;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

type BoxError = Box<dyn Error + Sync + Send>;

/// A single column value read from the remote source.
///
/// Values are passed to local statements as parameters. Encoding adapts to the
/// parameter type the server inferred for the destination column, so a remote
/// `integer` can land in a local `bigint`, and anything can land in `text`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text rendering used by string-normalizing writes and text destinations.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Decimal(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            SqlValue::TimestampTz(v) => Some(v.to_rfc3339()),
            SqlValue::Uuid(v) => Some(v.to_string()),
            SqlValue::Json(v) => Some(v.to_string()),
            SqlValue::Bytes(v) => {
                let hex: String = v.iter().map(|b| format!("{:02x}", b)).collect();
                Some(format!("\\x{}", hex))
            }
        }
    }

    /// Convert to the text-normalized form (`Null` stays `Null`).
    pub fn into_text(self) -> SqlValue {
        match self {
            SqlValue::Text(_) | SqlValue::Null => self,
            other => other.to_text().map(SqlValue::Text).unwrap_or(SqlValue::Null),
        }
    }

    /// Interpret the value as an integer surrogate key.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Decimal(v) if v.fract().is_zero() => v.to_i64(),
            SqlValue::Float(v) if v.fract() == 0.0 => {
                Decimal::from_f64(*v).and_then(|d| d.to_i64())
            }
            SqlValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if is_text_type(ty) {
            return match self.to_text() {
                Some(text) => text.to_sql(ty, out),
                None => Ok(IsNull::Yes),
            };
        }

        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => match *ty {
                Type::BOOL => v.to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => encode_int(i64::from(*v), ty, out),
                _ => Err(mismatch("boolean", ty)),
            },
            SqlValue::Int(v) => encode_int(*v, ty, out),
            SqlValue::Float(v) => encode_float(*v, ty, out),
            SqlValue::Decimal(v) => match *ty {
                Type::NUMERIC => v.to_sql(ty, out),
                Type::FLOAT4 | Type::FLOAT8 => {
                    let f = v.to_f64().ok_or_else(|| mismatch("numeric", ty))?;
                    encode_float(f, ty, out)
                }
                Type::INT2 | Type::INT4 | Type::INT8 if v.fract().is_zero() => {
                    let i = v.to_i64().ok_or_else(|| mismatch("numeric", ty))?;
                    encode_int(i, ty, out)
                }
                _ => Err(mismatch("numeric", ty)),
            },
            SqlValue::Text(v) => encode_text(v, ty, out),
            SqlValue::Date(v) => match *ty {
                Type::DATE => v.to_sql(ty, out),
                Type::TIMESTAMP => v.and_hms_opt(0, 0, 0).unwrap_or_default().to_sql(ty, out),
                Type::TIMESTAMPTZ => v
                    .and_hms_opt(0, 0, 0)
                    .unwrap_or_default()
                    .and_utc()
                    .to_sql(ty, out),
                _ => Err(mismatch("date", ty)),
            },
            SqlValue::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.to_sql(ty, out),
                Type::TIMESTAMPTZ => v.and_utc().to_sql(ty, out),
                Type::DATE => v.date().to_sql(ty, out),
                _ => Err(mismatch("timestamp", ty)),
            },
            SqlValue::TimestampTz(v) => match *ty {
                Type::TIMESTAMPTZ => v.to_sql(ty, out),
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                Type::DATE => v.date_naive().to_sql(ty, out),
                _ => Err(mismatch("timestamptz", ty)),
            },
            SqlValue::Uuid(v) => match *ty {
                Type::UUID => v.to_sql(ty, out),
                _ => Err(mismatch("uuid", ty)),
            },
            SqlValue::Json(v) => match *ty {
                Type::JSON | Type::JSONB => v.to_sql(ty, out),
                _ => Err(mismatch("json", ty)),
            },
            SqlValue::Bytes(v) => match *ty {
                Type::BYTEA => v.as_slice().to_sql(ty, out),
                _ => Err(mismatch("bytea", ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_text_type(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn mismatch(kind: &str, ty: &Type) -> BoxError {
    format!("cannot encode {} value as {}", kind, ty).into()
}

fn encode_int(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::INT8 => v.to_sql(ty, out),
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::FLOAT8 => (v as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        Type::BOOL => (v != 0).to_sql(ty, out),
        _ => Err(mismatch("integer", ty)),
    }
}

fn encode_float(v: f64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::FLOAT8 => v.to_sql(ty, out),
        Type::NUMERIC => Decimal::from_f64(v)
            .ok_or_else(|| mismatch("float", ty))?
            .to_sql(ty, out),
        Type::INT2 | Type::INT4 | Type::INT8 if v.fract() == 0.0 => encode_int(v as i64, ty, out),
        _ => Err(mismatch("float", ty)),
    }
}

fn encode_text(v: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    let trimmed = v.trim();
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 => encode_int(trimmed.parse::<i64>()?, ty, out),
        Type::FLOAT4 | Type::FLOAT8 => encode_float(trimmed.parse::<f64>()?, ty, out),
        Type::NUMERIC => {
            let decimal = Decimal::from_str(trimmed)
                .or_else(|_| Decimal::from_scientific(trimmed))?;
            decimal.to_sql(ty, out)
        }
        Type::BOOL => parse_bool(trimmed)
            .ok_or_else(|| format!("invalid boolean literal '{}'", trimmed))?
            .to_sql(ty, out),
        Type::DATE => parse_date(trimmed)
            .ok_or_else(|| format!("invalid date literal '{}'", trimmed))?
            .to_sql(ty, out),
        Type::TIMESTAMP => parse_timestamp(trimmed)
            .ok_or_else(|| format!("invalid timestamp literal '{}'", trimmed))?
            .to_sql(ty, out),
        Type::TIMESTAMPTZ => {
            let parsed = DateTime::parse_from_rfc3339(trimmed)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_timestamp(trimmed).map(|ts| ts.and_utc()))
                .ok_or_else(|| format!("invalid timestamptz literal '{}'", trimmed))?;
            parsed.to_sql(ty, out)
        }
        Type::UUID => uuid::Uuid::parse_str(trimmed)?.to_sql(ty, out),
        Type::JSON | Type::JSONB => {
            let json = serde_json::from_str(v)
                .unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
            json.to_sql(ty, out)
        }
        Type::BYTEA => v.as_bytes().to_sql(ty, out),
        _ => Err(mismatch("text", ty)),
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "y" | "yes" | "s" | "sim" => Some(true),
        "f" | "false" | "0" | "n" | "no" | "nao" => Some(false),
        _ => None,
    }
}

/// Parse a date in `yyyy-MM-dd` or compact `yyyyMMdd` form, ignoring any time part.
pub fn parse_date(v: &str) -> Option<NaiveDate> {
    let v = v.trim();
    if v.len() == 8 && v.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(v, "%Y%m%d").ok();
    }
    v.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

fn parse_timestamp(v: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(v, fmt).ok())
        .or_else(|| parse_date(v).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Decode column `idx` of a PostgreSQL-wire row into a [`SqlValue`].
///
/// Only the types listed here are decoded natively; readers cast anything else
/// to text before it reaches this function.
pub fn from_row(row: &Row, idx: usize) -> Result<SqlValue> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(SqlValue::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        }
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(SqlValue::Date),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(SqlValue::TimestampTz),
        Type::UUID => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(SqlValue::Uuid),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(SqlValue::Json),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        other => bail!(
            "Unsupported column type {} for column '{}'",
            other,
            row.columns()[idx].name()
        ),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
