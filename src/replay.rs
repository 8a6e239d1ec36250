// src/replay.rs
// Applies pending change-log rows to the live table after the swap.

use crate::{Column, PrimaryKey, Table, quote_ident};
use anyhow::{Result, anyhow, bail};
use itertools::Itertools;
use postgres::types::ToSql;
use postgres::{Client, Transaction};

/// One captured mutation, decoded from a change-log row. Insert and Update
/// carry the full post-image in column order; Delete carries the pre-image
/// primary key.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Insert(Vec<Option<String>>),
    Update(Vec<Option<String>>),
    Delete(Option<String>),
}

#[derive(Clone)]
pub struct LogReplay {
    /// The live table: the post-swap identity of the former shadow.
    pub table: Table,
    pub log_table: Table,
    pub columns: Vec<Column>,
    pub primary_key: PrimaryKey,
}

impl LogReplay {
    /// Every origin column is read back as text; the apply statements cast
    /// each bound value to the real column type server-side.
    pub fn fetch_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|column| format!("{}::text", quote_ident(&column.name)))
            .join(", ");
        format!("SELECT {}, action FROM {}", cols, self.log_table.quoted())
    }

    pub fn insert_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .join(", ");
        let values = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("${}::text::{}", i + 1, column.sql_type))
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            self.table.quoted(),
            cols,
            values,
            quote_ident(&self.primary_key.name)
        )
    }

    pub fn update_sql(&self) -> String {
        let set_clause = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                format!(
                    "{} = ${}::text::{}",
                    quote_ident(&column.name),
                    i + 1,
                    column.sql_type
                )
            })
            .join(", ");
        format!(
            "UPDATE {} SET {} WHERE {} = ${}::text::{}",
            self.table.quoted(),
            set_clause,
            quote_ident(&self.primary_key.name),
            self.columns.len() + 1,
            self.primary_key.sql_type
        )
    }

    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} = $1::text::{}",
            self.table.quoted(),
            quote_ident(&self.primary_key.name),
            self.primary_key.sql_type
        )
    }

    fn pk_index(&self) -> Result<usize> {
        self.columns
            .iter()
            .position(|column| column.name == self.primary_key.name)
            .ok_or_else(|| {
                anyhow!(
                    "primary key column {} not found among columns of {}",
                    self.primary_key.name,
                    self.table
                )
            })
    }

    pub fn row2action(&self, row: &postgres::Row) -> Result<Action> {
        let n = self.columns.len();
        let values: Vec<Option<String>> = (0..n).map(|i| row.get(i)).collect();
        let action: String = row.get(n);
        match action.as_str() {
            "INSERT" => Ok(Action::Insert(values)),
            "UPDATE" => Ok(Action::Update(values)),
            "DELETE" => Ok(Action::Delete(values[self.pk_index()?].clone())),
            other => bail!("unknown action {:?} in {}", other, self.log_table),
        }
    }

    fn apply(&self, transaction: &mut Transaction, action: &Action) -> Result<()> {
        match action {
            Action::Delete(pk) => {
                transaction.execute(&self.delete_sql(), &[pk])?;
            }
            Action::Insert(values) => {
                transaction.execute(&self.insert_sql(), &as_params(values))?;
            }
            Action::Update(values) => {
                let pk = values[self.pk_index()?].clone();
                let mut values = values.clone();
                values.push(pk);
                transaction.execute(&self.update_sql(), &as_params(&values))?;
            }
        }
        Ok(())
    }

    /// Applies the whole log in one transaction. The log is read-only here;
    /// a failure rolls back every applied row and propagates, since the swap
    /// has already committed.
    pub fn replay(&self, client: &mut Client) -> Result<()> {
        let mut transaction = client.transaction()?;
        let rows = transaction.query(&self.fetch_sql(), &[])?;
        for row in &rows {
            let action = self.row2action(row)?;
            self.apply(&mut transaction, &action)?;
        }
        transaction.commit()?;
        log::info!(
            "replayed {} pending log entries onto {}",
            rows.len(),
            self.table
        );
        Ok(())
    }
}

fn as_params(values: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    values
        .iter()
        .map(|value| value as &(dyn ToSql + Sync))
        .collect()
}
