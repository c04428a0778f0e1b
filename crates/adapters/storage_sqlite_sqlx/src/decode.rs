//! Column decoding helpers shared by the repositories.

use std::error::Error;
use std::str::FromStr;

use homebus_domain::time::{Timestamp, parse_rfc3339};

fn decode_error(err: impl Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

pub(crate) fn parse<T>(value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Error + Send + Sync + 'static,
{
    T::from_str(value).map_err(decode_error)
}

pub(crate) fn timestamp(value: &str) -> Result<Timestamp, sqlx::Error> {
    parse_rfc3339(value).map_err(decode_error)
}

pub(crate) fn index(value: i64) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(decode_error)
}
