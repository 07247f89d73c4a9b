//! Table descriptors.
//!
//! A table consists of some number of columns, each with a logical type that
//! maps onto one of sqlite's storage classes.  Every table managed by this
//! crate carries three reserved columns: `uuid` (the primary identity of a
//! row), `created` and `modified` (seconds since the Unix epoch as doubles).
//! The builder seeds them so that a descriptor without them cannot be built.
//!
//! Column names are folded to lower case when added; lookups accept either
//! case.
use std::collections::HashMap;

use anyhow::Result;
use itertools::Itertools;

/// Logical types of a table's columns.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ColumnType {
    /// 64-bit signed integer which is also the table's primary key.
    IntegerPk,
    /// 64-bit signed integer.
    Integer,
    /// Boolean, stored as an integer.
    Bool,
    /// Double-precision float.
    Decimal,
    /// Text.
    Varchar,
    /// Text which is also the table's primary key.
    VarcharPk,
    /// Seconds since the Unix epoch as a double.
    Timestamp,
    /// Same storage as [ColumnType::Timestamp]; kept distinct so callers can
    /// mark columns whose values were already coarsened to whole seconds.
    TimestampAsSeconds,
    /// Raw bytes.
    Blob,
}

/// Per-column option flags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnOption {
    None,
    /// Create an index over this column when the entity registers its table.
    CreateIndex,
    /// Exclude this column from whole-row selects; it is only fetched on
    /// demand through the typed one-row getters.
    LazyLoad,
}

/// A column in a table.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    name: String,
    column_type: ColumnType,
    option: ColumnOption,
}

/// Description of a table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    name: String,
    columns: Vec<ColumnDescriptor>,
    by_name: HashMap<String, usize>,
}

lazy_static::lazy_static! {
    static ref NAME_VALIDATOR: regex::Regex = {
        regex::Regex::new(r"^[a-zA-Z](\d|_|[a-zA-Z])*$").unwrap()
    };
}

/// Names of the three reserved columns, in declaration order.
pub const RESERVED_COLUMNS: [&str; 3] = ["uuid", "created", "modified"];

/// Whether a string is usable as a table, column, or index identifier.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    NAME_VALIDATOR.is_match(name)
}

impl ColumnType {
    /// The sqlite column type used in `CREATE TABLE`.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::IntegerPk => "INTEGER PRIMARY KEY",
            ColumnType::Integer | ColumnType::Bool => "INTEGER",
            ColumnType::Decimal => "REAL",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::VarcharPk => "VARCHAR PRIMARY KEY",
            ColumnType::Timestamp | ColumnType::TimestampAsSeconds => "TIMESTAMP",
            ColumnType::Blob => "BLOB",
        }
    }

    fn is_primary_key(&self) -> bool {
        matches!(self, ColumnType::IntegerPk | ColumnType::VarcharPk)
    }
}

impl ColumnDescriptor {
    fn new(name: String, column_type: ColumnType, option: ColumnOption) -> Result<Self> {
        if !NAME_VALIDATOR.is_match(&name) {
            anyhow::bail!("Column name {:?} contains invalid characters", name);
        }

        Ok(Self {
            name: name.to_lowercase(),
            column_type,
            option,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn get_option(&self) -> ColumnOption {
        self.option
    }

    pub fn is_lazy(&self) -> bool {
        self.option == ColumnOption::LazyLoad
    }
}

impl TableDescriptor {
    fn new(name: String, columns: Vec<ColumnDescriptor>) -> Result<Self> {
        if !NAME_VALIDATOR.is_match(&name) {
            anyhow::bail!("Invalid table name {:?}", name);
        }

        for reserved in RESERVED_COLUMNS {
            if !columns.iter().any(|c| c.name == reserved) {
                anyhow::bail!("{}: missing reserved column {}", name, reserved);
            }
        }

        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        Ok(Self {
            name,
            columns,
            by_name,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn iter_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter()
    }

    /// Find a column by name, accepting either case.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDescriptor> {
        let folded = name.to_lowercase();
        self.by_name.get(&folded).map(|i| &self.columns[*i])
    }

    /// The `CREATE TABLE IF NOT EXISTS` statement for this table.
    pub fn create_table_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.column_type.sql_type()))
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {}({})", self.name, cols)
    }

    /// Column names for whole-row selects: everything except lazy-load
    /// columns, `uuid` first.
    pub fn select_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.is_lazy())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// All column names, in declaration order.  Used for inserts, which
    /// always write every column.
    pub fn all_columns(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns flagged for index creation.
    pub fn indexed_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.option == ColumnOption::CreateIndex)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// A builder for table descriptors.
///
/// The three reserved columns are seeded at construction: `uuid` as the text
/// primary key and the two timestamps.  If a later column claims a primary
/// key type, `uuid` is demoted to plain `VARCHAR` at build time; sqlite
/// allows only one column-level primary key.
#[derive(Debug)]
pub struct TableDescriptorBuilder {
    name: String,
    columns: Vec<ColumnDescriptor>,
}

impl TableDescriptorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let columns = vec![
            ColumnDescriptor {
                name: "uuid".into(),
                column_type: ColumnType::VarcharPk,
                option: ColumnOption::None,
            },
            ColumnDescriptor {
                name: "created".into(),
                column_type: ColumnType::Timestamp,
                option: ColumnOption::None,
            },
            ColumnDescriptor {
                name: "modified".into(),
                column_type: ColumnType::Timestamp,
                option: ColumnOption::None,
            },
        ];
        Self {
            name: name.into(),
            columns,
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        let folded = name.to_lowercase();
        if self.columns.iter().any(|x| x.name == folded) {
            anyhow::bail!("{}: duplicate column {}", self.name, name);
        }
        Ok(())
    }

    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        option: ColumnOption,
    ) -> Result<&mut Self> {
        let name = name.into();
        self.check_name(&name)?;
        self.columns
            .push(ColumnDescriptor::new(name, column_type, option)?);
        Ok(self)
    }

    pub fn build(mut self) -> Result<TableDescriptor> {
        // The seeded uuid column is always one of these.
        let pk_count = self
            .columns
            .iter()
            .filter(|c| c.column_type.is_primary_key())
            .count();
        if pk_count > 2 {
            anyhow::bail!("{}: more than one primary key column", self.name);
        }
        if pk_count == 2 {
            // Another column claimed the primary key; uuid stays the row
            // identity but loses the constraint.
            self.columns[0].column_type = ColumnType::Varchar;
        }

        TableDescriptor::new(self.name, self.columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Check that column validation only allows valid things through.
    #[test]
    fn column_validation() {
        for (name, is_good) in [
            ("test", true),
            ("1test", false),
            ("a b", false),
            ("numbers_at_end_work1", true),
            ("", false),
            ("has-dash", false),
        ] {
            assert!(
                ColumnDescriptor::new(name.to_string(), ColumnType::Integer, ColumnOption::None)
                    .is_ok()
                    == is_good,
                "{}",
                name
            );
        }
    }

    #[test]
    fn reserved_columns_are_seeded() {
        let desc = TableDescriptorBuilder::new("jobs").build().unwrap();
        for reserved in RESERVED_COLUMNS {
            assert!(desc.get_column(reserved).is_some(), "{}", reserved);
        }
        assert_eq!(
            desc.get_column("uuid").unwrap().get_column_type(),
            ColumnType::VarcharPk
        );
    }

    #[test]
    fn lookups_fold_case() {
        let mut b = TableDescriptorBuilder::new("jobs");
        b.add_column("Title", ColumnType::Varchar, ColumnOption::None)
            .unwrap();
        let desc = b.build().unwrap();
        assert!(desc.get_column("title").is_some());
        assert!(desc.get_column("TITLE").is_some());
        assert_eq!(desc.get_column("TITLE").unwrap().get_name(), "title");
    }

    #[test]
    fn integer_pk_demotes_uuid() {
        let mut b = TableDescriptorBuilder::new("seq");
        b.add_column("ordinal", ColumnType::IntegerPk, ColumnOption::None)
            .unwrap();
        let desc = b.build().unwrap();
        assert_eq!(
            desc.get_column("uuid").unwrap().get_column_type(),
            ColumnType::Varchar
        );
        let sql = desc.create_table_sql();
        assert!(sql.contains("ordinal INTEGER PRIMARY KEY"), "{}", sql);
        assert!(!sql.contains("uuid VARCHAR PRIMARY KEY"), "{}", sql);
    }

    #[test]
    fn lazy_columns_left_out_of_selects() {
        let mut b = TableDescriptorBuilder::new("jobs");
        b.add_column("title", ColumnType::Varchar, ColumnOption::None)
            .unwrap();
        b.add_column("resume", ColumnType::Blob, ColumnOption::LazyLoad)
            .unwrap();
        let desc = b.build().unwrap();
        assert_eq!(
            desc.select_columns(),
            vec!["uuid", "created", "modified", "title"]
        );
        assert_eq!(
            desc.all_columns(),
            vec!["uuid", "created", "modified", "title", "resume"]
        );
    }

    #[test]
    fn create_table_sql_shape() {
        let mut b = TableDescriptorBuilder::new("test_table");
        b.add_column("flag", ColumnType::Bool, ColumnOption::None)
            .unwrap();
        b.add_column("score", ColumnType::Decimal, ColumnOption::CreateIndex)
            .unwrap();
        let desc = b.build().unwrap();
        assert_eq!(
            desc.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS test_table(uuid VARCHAR PRIMARY KEY, \
             created TIMESTAMP, modified TIMESTAMP, flag INTEGER, score REAL)"
        );
        assert_eq!(desc.indexed_columns(), vec!["score"]);
    }
}
