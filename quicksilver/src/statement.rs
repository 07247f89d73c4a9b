//! SQL statement templates.
//!
//! A template is classified once, at construction.  Templates containing the
//! literal token `#?` are *multi-bind*: each `#?` site consumes one sequence
//! argument whose cardinality N turns into a run of `?,?,…,?` (N question
//! marks) at execution time, so the final SQL depends on the arguments and
//! must be re-prepared on every run.  Plain templates have stable text and
//! are handed to the connection's prepared-statement cache instead.
use std::borrow::Cow;

use anyhow::Result;
use log::*;
use smallvec::SmallVec;

use crate::value::SqlValue;

/// The multi-bind token.
const MULTI_BIND_TOKEN: &str = "#?";

/// A parsed SQL template.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: String,

    /// The template split on `#?`.  Empty for plain templates.
    fragments: Vec<String>,

    /// `?` bind points outside of `#?` sites.
    fixed_bind_points: usize,

    multi_bind_sites: usize,
}

/// One execution's worth of expanded SQL plus the flattened bind list.
///
/// Binds borrow the caller's arguments; list elements are borrowed from
/// inside their list.
pub(crate) struct Expanded<'a> {
    pub(crate) sql: Cow<'a, str>,
    pub(crate) binds: SmallVec<[&'a SqlValue; 8]>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Statement {
        let sql = sql.into();
        if !sql.contains(MULTI_BIND_TOKEN) {
            return Statement {
                sql,
                fragments: vec![],
                fixed_bind_points: 0,
                multi_bind_sites: 0,
            };
        }

        let fragments: Vec<String> = sql.split(MULTI_BIND_TOKEN).map(|s| s.to_string()).collect();
        let fixed_bind_points = fragments
            .iter()
            .map(|f| f.matches('?').count())
            .sum::<usize>();
        let multi_bind_sites = fragments.len() - 1;
        Statement {
            sql,
            fragments,
            fixed_bind_points,
            multi_bind_sites,
        }
    }

    pub fn get_sql(&self) -> &str {
        &self.sql
    }

    pub fn is_multi_bind(&self) -> bool {
        self.multi_bind_sites > 0
    }

    /// Number of arguments one execution expects.  For plain templates this
    /// is only known exactly once the statement is prepared; the `?` count
    /// is the same thing for the SQL this crate composes.
    pub fn expected_arguments(&self) -> usize {
        if self.is_multi_bind() {
            self.fixed_bind_points + self.multi_bind_sites
        } else {
            self.sql.matches('?').count()
        }
    }

    /// Expand the template against one execution's arguments.
    ///
    /// An arity mismatch is logged but execution still proceeds with
    /// whatever arguments are present.  A non-sequence value at a `#?` site
    /// is an error; the null sentinel counts as the empty sequence.
    pub(crate) fn expand<'a>(&'a self, args: &'a [SqlValue]) -> Result<Expanded<'a>> {
        let expected = self.expected_arguments();
        if args.len() != expected {
            warn!(
                "{:?}: expected {} arguments, got {}; attempting anyway",
                self.sql,
                expected,
                args.len()
            );
        }

        if !self.is_multi_bind() {
            return Ok(Expanded {
                sql: Cow::Borrowed(&self.sql),
                binds: args.iter().collect(),
            });
        }

        let mut out = String::with_capacity(self.sql.len() + 16);
        let mut binds: SmallVec<[&SqlValue; 8]> = SmallVec::new();
        let mut remaining = args.iter();

        for (i, fragment) in self.fragments.iter().enumerate() {
            out.push_str(fragment);
            for _ in 0..fragment.matches('?').count() {
                if let Some(a) = remaining.next() {
                    binds.push(a);
                }
            }

            if i == self.fragments.len() - 1 {
                break;
            }

            // This is a `#?` site; it consumes one sequence argument.
            match remaining.next() {
                Some(SqlValue::List(items)) => {
                    let marks = (0..items.len()).map(|_| "?").collect::<Vec<_>>().join(",");
                    out.push_str(&marks);
                    binds.extend(items.iter());
                }
                Some(SqlValue::Null) | None => {
                    // Empty: the site contributes nothing.  Note this can
                    // leave `IN ()` in the SQL, which callers must guard.
                }
                Some(other) => {
                    anyhow::bail!(
                        "{:?}: argument at #? site must be a sequence, got {:?}",
                        self.sql,
                        other
                    );
                }
            }
        }

        // Leftover arguments are part of the arity mismatch already logged.
        Ok(Expanded {
            sql: Cow::Owned(out),
            binds,
        })
    }
}
