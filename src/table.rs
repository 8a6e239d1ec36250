// src/table.rs
// Table descriptor, identifier quoting and catalog introspection.

use anyhow::Result;
use postgres::Client;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
}

/// A column of the origin table, with the SQL type name used for casts
/// when replaying text-encoded log values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimaryKey {
    pub name: String,
    pub sql_type: String,
}

/// A secondary index harvested from pg_indexes: the SQL that recreates it
/// and its current name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDef {
    pub definition: String,
    pub name: String,
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl FromStr for Table {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((schema, name)) = s.split_once('.') {
            Ok(Table {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            })
        } else {
            Ok(Table {
                schema: None,
                name: s.to_string(),
            })
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Table {
    pub fn new(full_name: &str) -> Self {
        full_name.parse().unwrap()
    }

    /// Sibling table derived by appending a suffix to the name, keeping the
    /// schema part.
    pub fn suffixed(&self, suffix: &str) -> Table {
        Table {
            schema: self.schema.clone(),
            name: format!("{}{}", self.name, suffix),
        }
    }

    /// Quoted form for interpolation into SQL. Schema and name are quoted
    /// separately so a hostile table name cannot break out of the identifier.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }

    pub fn columns(&self, client: &mut Client) -> Result<Vec<Column>> {
        let rows = client.query(
            "SELECT a.attname, format_type(a.atttypid, a.atttypmod)
             FROM pg_attribute a
             WHERE a.attrelid = ($1)::text::regclass
               AND a.attnum > 0
               AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&self.to_string()],
        )?;
        Ok(rows
            .iter()
            .map(|row| Column {
                name: row.get(0),
                sql_type: row.get(1),
            })
            .collect())
    }

    pub fn primary_key(&self, client: &mut Client) -> Result<PrimaryKey> {
        let row = client.query_one(
            "SELECT a.attname, a.atttypid::regtype::text
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = ($1)::text::regclass AND i.indisprimary
             LIMIT 1",
            &[&self.to_string()],
        )?;
        Ok(PrimaryKey {
            name: row.get(0),
            sql_type: row.get(1),
        })
    }

    pub fn indexes(&self, client: &mut Client) -> Result<Vec<IndexDef>> {
        let rows = client.query(
            "SELECT indexdef, indexname FROM pg_indexes
             WHERE schemaname = $1 AND tablename = $2",
            &[&self.schema.as_deref().unwrap_or("public"), &self.name],
        )?;
        Ok(rows
            .iter()
            .map(|row| IndexDef {
                definition: row.get(0),
                name: row.get(1),
            })
            .collect())
    }
}
