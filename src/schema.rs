// ABOUTME: Table and column metadata shared by source and target stores
// ABOUTME: Parses PostgreSQL type names into the value kinds the engine can copy

use std::fmt;

use crate::error::{Result, SyncError};
use crate::utils::{quote_ident, validate_postgres_identifier};

/// Schema used when a table name is given without one.
pub const DEFAULT_SCHEMA: &str = "public";

/// A validated, optionally schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    /// Parse `table` or `schema.table`, validating both parts.
    pub fn parse(qualified: &str) -> Result<Self> {
        let qualified = qualified.trim();
        let (schema, name) = match qualified.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => (DEFAULT_SCHEMA, qualified),
        };
        validate_postgres_identifier(schema)?;
        validate_postgres_identifier(name)?;
        Ok(Self {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }

    /// `"schema"."table"`, ready to splice into SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Value kinds the engine reads from the source and binds on the target.
///
/// Types without a native decoder (`interval`, arrays, `inet`, enums,
/// extension types) travel as their text form: read with `::text` and cast
/// back on the target, see [`ColumnType::Raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Bytea,
    /// Text transport for every other type.
    Raw,
}

impl ColumnType {
    /// Map a PostgreSQL type name (as printed by `format_type`) to a kind.
    ///
    /// Returns `None` for types with no native decoder; those columns are
    /// copied through their text representation.
    pub fn from_pg_type(type_name: &str) -> Option<Self> {
        // Drop type modifiers wherever they appear: `numeric(10,2)`,
        // `timestamp(3) with time zone`.
        let mut depth = 0usize;
        let stripped: String = type_name
            .chars()
            .filter(|c| match c {
                '(' => {
                    depth += 1;
                    false
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    false
                }
                _ => depth == 0,
            })
            .collect();
        let base = stripped
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();

        let kind = match base.as_str() {
            "boolean" | "bool" => Self::Bool,
            "smallint" | "int2" => Self::Int2,
            "integer" | "int" | "int4" => Self::Int4,
            "bigint" | "int8" => Self::Int8,
            "real" | "float4" => Self::Float4,
            "double precision" | "float8" => Self::Float8,
            "numeric" | "decimal" => Self::Numeric,
            "text" | "character varying" | "varchar" | "character" | "char" | "name"
            | "bpchar" => Self::Text,
            "uuid" => Self::Uuid,
            "date" => Self::Date,
            "time without time zone" | "time" => Self::Time,
            "timestamp without time zone" | "timestamp" => Self::Timestamp,
            "timestamp with time zone" | "timestamptz" => Self::TimestampTz,
            "json" | "jsonb" => Self::Json,
            "bytea" => Self::Bytea,
            _ => return None,
        };
        Some(kind)
    }
}

/// One column as introspected from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Full type as the store prints it, e.g. `character varying(64)`.
    pub data_type: String,
    pub is_nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable,
        }
    }

    pub fn kind(&self) -> ColumnType {
        ColumnType::from_pg_type(&self.data_type).unwrap_or(ColumnType::Raw)
    }

    /// Select-list expression for this column.
    pub fn select_expr(&self) -> String {
        let name = quote_ident(&self.name);
        match self.kind() {
            ColumnType::Raw => format!("{0}::text AS {0}", name),
            _ => name,
        }
    }

    /// Bind placeholder `$idx`; text-transported values are cast back to
    /// the column type.
    pub fn placeholder(&self, idx: usize) -> String {
        match self.kind() {
            ColumnType::Raw => format!("${}::text::{}", idx, self.data_type),
            _ => format!("${}", idx),
        }
    }
}

/// Column set and key of one table, derived fresh at the start of every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<ColumnInfo>,
    /// Key columns in constraint order; empty when the table has no primary key.
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Kinds of every column in order.
    pub fn column_kinds(&self) -> Vec<ColumnType> {
        self.columns.iter().map(ColumnInfo::kind).collect()
    }

    /// `CREATE TABLE` statement reproducing this column set on another store.
    pub fn create_table_sql(&self) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.is_nullable { "" } else { " NOT NULL" };
                format!("{} {}{}", quote_ident(&c.name), c.data_type, null)
            })
            .collect();

        if self.has_primary_key() {
            let keys: Vec<String> = self.primary_key.iter().map(|k| quote_ident(k)).collect();
            defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        format!("CREATE TABLE {} ({})", self.table.quoted(), defs.join(", "))
    }
}
