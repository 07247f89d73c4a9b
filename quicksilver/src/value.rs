//! Values that can cross the SQL boundary.
//!
//! Every user-supplied argument is normalized into a [SqlValue] before it
//! gets anywhere near a bind call; the `From` impls below are the single
//! sanctioned conversion path.  Sequences and sets become [SqlValue::List],
//! which is only meaningful at a `#?` multi-bind site and is refused by the
//! binder itself.
use std::collections::{BTreeSet, HashSet};

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

/// A tagged value bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Bool(bool),
    Real(f64),
    Text(String),
    /// Seconds since the Unix epoch, stored as a double.
    Timestamp(f64),
    Blob(Vec<u8>),
    /// An ordered sequence (or set; order then unspecified) consumed by one
    /// `#?` site.
    List(Vec<SqlValue>),
}

impl SqlValue {
    /// Coerce an arbitrary displayable value to text.  The last-resort path
    /// for types without a dedicated variant.
    pub fn text_from_display(value: &impl std::fmt::Display) -> SqlValue {
        SqlValue::Text(value.to_string())
    }

    pub fn is_list(&self) -> bool {
        matches!(self, SqlValue::List(_))
    }

    /// Build a [SqlValue] from a raw sqlite value.
    pub(crate) fn from_value_ref(vref: ValueRef<'_>) -> SqlValue {
        match vref {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }

}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Bool(b) => ToSqlOutput::Borrowed(ValueRef::Integer(*b as i64)),
            SqlValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlValue::Timestamp(secs) => ToSqlOutput::Borrowed(ValueRef::Real(*secs)),
            SqlValue::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::List(_) => {
                // Lists are consumed by multi-bind expansion; one reaching a
                // bind point means the statement had no site for it.
                return Err(rusqlite::Error::ToSqlConversionFailure(
                    "sequence bound outside of a #? site".into(),
                ));
            }
        })
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl From<uuid::Uuid> for SqlValue {
    fn from(v: uuid::Uuid) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&uuid::Uuid> for SqlValue {
    fn from(v: &uuid::Uuid) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(x) => x.into(),
            None => SqlValue::Null,
        }
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(v: Vec<T>) -> Self {
        SqlValue::List(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<SqlValue>> From<BTreeSet<T>> for SqlValue {
    fn from(v: BTreeSet<T>) -> Self {
        SqlValue::List(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<SqlValue> + Eq + std::hash::Hash> From<HashSet<T>> for SqlValue {
    fn from(v: HashSet<T>) -> Self {
        SqlValue::List(v.into_iter().map(|x| x.into()).collect())
    }
}

/// Seconds since the Unix epoch, as a double.  The timestamp representation
/// used everywhere in this crate.
pub fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("Shouldn't be before the Unix epoch")
        .as_secs_f64()
}
