//! Text rendering of driver values for CSV output.
//!
//! Temporal values follow SQL Server's own string conversions so that a
//! watermark rendered here compares correctly when sent back as a literal:
//! `datetime` keeps milliseconds, `datetime2`/`time`/`datetimeoffset` keep
//! seven fractional digits, `smalldatetime` has none.

use crate::error::{ExtractorError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use tiberius::{ColumnData, FromSql};

fn convert<'a, T: FromSql<'a>>(data: &'a ColumnData<'static>) -> Result<Option<T>> {
    T::from_sql(data).map_err(|e| ExtractorError::query_failed("convert column value", e))
}

fn seven_digit_fraction(nanosecond: u32) -> String {
    // leap seconds are encoded as nanosecond >= 1e9
    format!("{:07}", (nanosecond % 1_000_000_000) / 100)
}

/// `datetime` text from its wire form: days since 1900-01-01 and 1/300
/// second ticks. Milliseconds round the way SQL Server displays them, so
/// ticks land on .000, .003 and .007.
fn datetime_text(days: i32, fragments: u32) -> Result<String> {
    let millis = (u64::from(fragments) * 10 + 1) / 3;
    let date = NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|epoch| epoch.checked_add_signed(TimeDelta::days(i64::from(days))));
    let time = u32::try_from(millis / 1000).ok().and_then(|seconds| {
        NaiveTime::from_num_seconds_from_midnight_opt(seconds, (millis % 1000) as u32 * 1_000_000)
    });
    match (date, time) {
        (Some(date), Some(time)) => Ok(date.and_time(time).format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        _ => Err(ExtractorError::user_input(format!(
            "datetime value out of range ({days} days, {fragments} ticks)"
        ))),
    }
}

/// Decimal text of an unscaled value: one leading sign, `scale` fraction digits.
fn decimal_text(value: i128, scale: u8) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let digits = value.unsigned_abs();
    if scale == 0 {
        return format!("{sign}{digits}");
    }
    let divisor = 10u128.pow(u32::from(scale));
    format!(
        "{sign}{}.{:0width$}",
        digits / divisor,
        digits % divisor,
        width = usize::from(scale)
    )
}

/// CSV text of one value. NULL renders as an empty field.
///
/// # Errors
/// Returns a query error if a temporal value cannot be decoded
pub fn render_value(data: &ColumnData<'static>) -> Result<String> {
    let text = match data {
        ColumnData::U8(v) => v.map(|v| v.to_string()),
        ColumnData::I16(v) => v.map(|v| v.to_string()),
        ColumnData::I32(v) => v.map(|v| v.to_string()),
        ColumnData::I64(v) => v.map(|v| v.to_string()),
        ColumnData::F32(v) => v.map(|v| v.to_string()),
        ColumnData::F64(v) => v.map(|v| v.to_string()),
        ColumnData::Bit(v) => v.map(|v| if v { "1" } else { "0" }.to_string()),
        ColumnData::String(v) => v.as_ref().map(|s| s.to_string()),
        ColumnData::Guid(v) => v.as_ref().map(|g| g.to_string().to_uppercase()),
        ColumnData::Binary(v) => v.as_ref().map(hex::encode_upper),
        ColumnData::Numeric(v) => v.map(|n| decimal_text(n.value(), n.scale())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|xml| tiberius::xml::XmlData::clone(xml).into_string()),
        ColumnData::DateTime(v) => v
            .map(|dt| datetime_text(dt.days(), dt.seconds_fragments()))
            .transpose()?,
        ColumnData::SmallDateTime(_) => {
            convert::<NaiveDateTime>(data)?.map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        ColumnData::DateTime2(_) => convert::<NaiveDateTime>(data)?.map(|dt| {
            format!(
                "{}.{}",
                dt.format("%Y-%m-%d %H:%M:%S"),
                seven_digit_fraction(dt.nanosecond())
            )
        }),
        ColumnData::Date(_) => {
            convert::<NaiveDate>(data)?.map(|date| date.format("%Y-%m-%d").to_string())
        }
        ColumnData::Time(_) => convert::<NaiveTime>(data)?.map(|time| {
            format!(
                "{}.{}",
                time.format("%H:%M:%S"),
                seven_digit_fraction(time.nanosecond())
            )
        }),
        ColumnData::DateTimeOffset(_) => convert::<DateTime<FixedOffset>>(data)?.map(|dt| {
            format!(
                "{}.{} {}",
                dt.format("%Y-%m-%d %H:%M:%S"),
                seven_digit_fraction(dt.nanosecond()),
                dt.format("%:z")
            )
        }),
        #[allow(unreachable_patterns)]
        other => {
            return Err(ExtractorError::user_input(format!(
                "cannot render column value of type {}",
                column_data_name(other)
            )));
        }
    };
    Ok(text.unwrap_or_default())
}

fn column_data_name(data: &ColumnData<'static>) -> String {
    let debug = format!("{data:?}");
    debug
        .split('(')
        .next()
        .map_or_else(|| debug.clone(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tiberius::numeric::Numeric;

    #[test]
    fn test_scalars() {
        assert_eq!(render_value(&ColumnData::I32(Some(-42))).unwrap(), "-42");
        assert_eq!(render_value(&ColumnData::I64(None)).unwrap(), "");
        assert_eq!(render_value(&ColumnData::F64(Some(0.5))).unwrap(), "0.5");
        assert_eq!(render_value(&ColumnData::Bit(Some(true))).unwrap(), "1");
        assert_eq!(render_value(&ColumnData::Bit(Some(false))).unwrap(), "0");
        assert_eq!(
            render_value(&ColumnData::String(Some(Cow::Borrowed("a \"b\"")))).unwrap(),
            "a \"b\""
        );
        assert_eq!(
            render_value(&ColumnData::Binary(Some(Cow::Owned(vec![0x00, 0xAB, 0x1f])))).unwrap(),
            "00AB1F"
        );
    }

    #[test]
    fn test_negative_decimals_keep_one_sign() {
        let numeric = |value, scale| ColumnData::Numeric(Some(Numeric::new_with_scale(value, scale)));
        assert_eq!(render_value(&numeric(-5, 1)).unwrap(), "-0.5");
        assert_eq!(render_value(&numeric(-15, 1)).unwrap(), "-1.5");
        assert_eq!(render_value(&numeric(-1005, 3)).unwrap(), "-1.005");
        assert_eq!(render_value(&numeric(7, 2)).unwrap(), "0.07");
        assert_eq!(render_value(&numeric(-42, 0)).unwrap(), "-42");
        assert_eq!(render_value(&numeric(0, 2)).unwrap(), "0.00");
        assert_eq!(render_value(&ColumnData::Numeric(None)).unwrap(), "");
    }

    #[test]
    fn test_datetime_ticks_round_like_sql_server() {
        let datetime = |days, fragments| {
            render_value(&ColumnData::DateTime(Some(tiberius::time::DateTime::new(days, fragments))))
                .unwrap()
        };
        // 2024-01-01 is day 45290
        assert_eq!(datetime(45290, 0), "2024-01-01 00:00:00.000");
        assert_eq!(datetime(45290, 1), "2024-01-01 00:00:00.003");
        assert_eq!(datetime(45290, 2), "2024-01-01 00:00:00.007");
        assert_eq!(datetime(45290, 300 * 36_000 + 299), "2024-01-01 10:00:00.997");
        assert_eq!(datetime(0, 0), "1900-01-01 00:00:00.000");
    }

    #[test]
    fn test_fraction_digits() {
        assert_eq!(seven_digit_fraction(0), "0000000");
        assert_eq!(seven_digit_fraction(123_456_700), "1234567");
        assert_eq!(seven_digit_fraction(1_000_000_000), "0000000");
    }
}
