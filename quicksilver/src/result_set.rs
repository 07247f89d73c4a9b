//! Forward-only cursors.
//!
//! A [ResultSet] exists only inside [crate::IoHandle::with_cursor]: its
//! lifetime is bounded by the database-lock guard, so holding a cursor *is*
//! holding the lock and dropping it releases the lock.  That makes "at most
//! one open cursor per handle" structural; a second query while a cursor is
//! live simply blocks on the lock.
//!
//! [ResultSet::next] lends a [RowView] for the current row; the borrow ends
//! before the next step, which is the same shape as iterating
//! `rusqlite::Rows` directly.
use std::sync::atomic::{AtomicU64, Ordering};

use log::*;
use rusqlite::types::{Type, ValueRef};
use smallvec::SmallVec;

use crate::value::SqlValue;

pub struct ResultSet<'s> {
    rows: rusqlite::Rows<'s>,

    /// Case-folded column names, in select order.
    columns: SmallVec<[String; 8]>,

    errors: &'s AtomicU64,
    done: bool,
}

/// One row of a result set.  Accessors take a zero-based column index or a
/// column name (either case).
pub struct RowView<'r> {
    row: &'r rusqlite::Row<'r>,
    columns: &'r [String],
}

impl<'s> ResultSet<'s> {
    pub(crate) fn new(
        rows: rusqlite::Rows<'s>,
        columns: SmallVec<[String; 8]>,
        errors: &'s AtomicU64,
    ) -> ResultSet<'s> {
        ResultSet {
            rows,
            columns,
            errors,
            done: false,
        }
    }

    /// Step the cursor.  Yields `None` once the rows are exhausted, and also
    /// on a native error, which is counted on the handle and logged.  Busy
    /// handling happens below us: sqlite's busy timeout covers the
    /// configured retry budget, so an error here means the budget ran out.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<RowView<'_>> {
        if self.done {
            return None;
        }

        match self.rows.next() {
            Ok(Some(row)) => Some(RowView {
                row,
                columns: &self.columns,
            }),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!("Cursor step failed: {}", e);
                None
            }
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

impl<'r> RowView<'r> {
    /// Index of a named column, accepting either case.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let folded = name.to_lowercase();
        self.columns.iter().position(|c| *c == folded)
    }

    fn value_ref(&self, index: usize) -> Option<ValueRef<'_>> {
        self.row.get_ref(index).ok()
    }

    /// The raw value at a column, as a [SqlValue].
    pub fn value_at(&self, index: usize) -> Option<SqlValue> {
        self.value_ref(index).map(SqlValue::from_value_ref)
    }

    pub fn string_at(&self, index: usize) -> Option<String> {
        match self.value_ref(index)? {
            ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Integer(i) => Some(i.to_string()),
            ValueRef::Real(f) => Some(f.to_string()),
            _ => None,
        }
    }

    pub fn int64_at(&self, index: usize) -> Option<i64> {
        match self.value_ref(index)? {
            ValueRef::Integer(i) => Some(i),
            ValueRef::Real(f) => Some(f as i64),
            ValueRef::Text(t) => std::str::from_utf8(t).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn int_at(&self, index: usize) -> Option<i32> {
        self.int64_at(index)?.try_into().ok()
    }

    pub fn bool_at(&self, index: usize) -> Option<bool> {
        Some(self.int64_at(index)? != 0)
    }

    pub fn double_at(&self, index: usize) -> Option<f64> {
        match self.value_ref(index)? {
            ValueRef::Real(f) => Some(f),
            ValueRef::Integer(i) => Some(i as f64),
            _ => None,
        }
    }

    /// Generic numeric accessor, dispatching on the column's runtime type.
    pub fn number_at(&self, index: usize) -> Option<f64> {
        let vref = self.value_ref(index)?;
        match vref.data_type() {
            Type::Integer | Type::Real => self.double_at(index),
            Type::Text => match vref {
                ValueRef::Text(t) => std::str::from_utf8(t).ok()?.parse().ok(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn blob_at(&self, index: usize) -> Option<Vec<u8>> {
        match self.value_ref(index)? {
            ValueRef::Blob(b) => Some(b.to_vec()),
            _ => None,
        }
    }

    /// Seconds-since-epoch timestamp.  Only a genuine NULL yields `None`;
    /// a stored value is returned as-is, even within a millisecond of zero.
    /// The typed value carries the distinction, not the magnitude.
    pub fn timestamp_at(&self, index: usize) -> Option<f64> {
        match self.value_ref(index)? {
            ValueRef::Real(f) => Some(f),
            ValueRef::Integer(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn string_named(&self, name: &str) -> Option<String> {
        self.string_at(self.column_index(name)?)
    }

    pub fn int64_named(&self, name: &str) -> Option<i64> {
        self.int64_at(self.column_index(name)?)
    }

    pub fn int_named(&self, name: &str) -> Option<i32> {
        self.int_at(self.column_index(name)?)
    }

    pub fn bool_named(&self, name: &str) -> Option<bool> {
        self.bool_at(self.column_index(name)?)
    }

    pub fn double_named(&self, name: &str) -> Option<f64> {
        self.double_at(self.column_index(name)?)
    }

    pub fn number_named(&self, name: &str) -> Option<f64> {
        self.number_at(self.column_index(name)?)
    }

    pub fn blob_named(&self, name: &str) -> Option<Vec<u8>> {
        self.blob_at(self.column_index(name)?)
    }

    pub fn timestamp_named(&self, name: &str) -> Option<f64> {
        self.timestamp_at(self.column_index(name)?)
    }
}
