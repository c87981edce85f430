//! PostgreSQL column values → [`CellValue`].

use std::error::Error;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres::Row;
use postgres::types::{FromSql, Type};
use qgate_pool::CellValue;

type BoxError = Box<dyn Error + Sync + Send>;

pub(crate) fn decode(row: &Row, i: usize, ty: &Type) -> Result<CellValue, postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(i)?.map(CellValue::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(i)?.map(|v| CellValue::Int(v.into())),
        Type::INT4 => row.try_get::<_, Option<i32>>(i)?.map(|v| CellValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(CellValue::Int),
        Type::OID => row.try_get::<_, Option<u32>>(i)?.map(|v| CellValue::Int(v.into())),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(i)?.map(|v| CellValue::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(i)?.map(CellValue::Float),
        Type::NUMERIC => row.try_get::<_, Option<Numeric>>(i)?.map(|n| CellValue::Decimal(n.0)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(i)?.map(CellValue::Text)
        }
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(i)?.map(CellValue::Date),
        Type::TIMESTAMP => row.try_get::<_, Option<NaiveDateTime>>(i)?.map(CellValue::DateTime),
        Type::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(i)?.map(CellValue::Timestamp),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(i)?.map(CellValue::Bytes),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(i)?
            .map(|u| CellValue::Text(u.to_string())),
        _ => row.try_get::<_, Option<Raw>>(i)?.map(Raw::into_cell),
    };
    Ok(value.unwrap_or(CellValue::Null))
}

/// NUMERIC in its exact decimal text form.
struct Numeric(String);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digit groups.
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let word = |at: usize| -> Result<u16, BoxError> {
        raw.get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "numeric value truncated".into())
    };

    let ndigits = usize::from(word(0)?);
    let weight = word(2)? as i16;
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);

    match sign {
        0xC000 => return Ok("NaN".into()),
        0xD000 => return Ok("Infinity".into()),
        0xF000 => return Ok("-Infinity".into()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|k| word(8 + 2 * k))
        .collect::<Result<Vec<u16>, _>>()?;
    let group = |g: i32| -> u16 {
        usize::try_from(g)
            .ok()
            .and_then(|g| digits.get(g).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for g in 0..=i32::from(weight) {
            if g == 0 {
                out.push_str(&group(g).to_string());
            } else {
                out.push_str(&format!("{:04}", group(g)));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut g = i32::from(weight) + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(g)));
            g += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

/// Any other type, taken as its binary wire form.
struct Raw {
    ty: Type,
    bytes: Vec<u8>,
}

impl Raw {
    fn into_cell(self) -> CellValue {
        let text = match self.ty {
            // jsonb is prefixed with a one-byte format version
            Type::JSONB => self.bytes.get(1..).unwrap_or_default().to_vec(),
            _ => self.bytes,
        };
        match String::from_utf8(text) {
            Ok(s) => CellValue::Text(s),
            Err(e) => CellValue::Bytes(e.into_bytes()),
        }
    }
}

impl<'a> FromSql<'a> for Raw {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Raw {
            ty: ty.clone(),
            bytes: raw.to_vec(),
        })
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}
