// src/repack.rs
// The repack workflow: shadow build, change capture, bulk copy, swap, replay.

use crate::copy::{BulkCopier, Copier};
use crate::replay::LogReplay;
use crate::table::{Column, IndexDef, PrimaryKey, Table, quote_ident};
use anyhow::Result;
use postgres::Client;
use std::time::Instant;

/// Clones a table's structure under a new name, dropping any leftover clone
/// first and moving ownership of the origin's serial sequences onto the
/// clone so they survive the origin's eventual drop.
const CLONE_TABLE_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION repack_clone_table(_tbl regclass, _newtbl text)
RETURNS void AS
$func$
DECLARE
    _sql text;
BEGIN
    PERFORM repack_release_sequences(_newtbl, _tbl);
    EXECUTE format('DROP TABLE IF EXISTS %I', _newtbl);
    EXECUTE format('CREATE TABLE %I (LIKE %s INCLUDING DEFAULTS EXCLUDING STORAGE)', _newtbl, _tbl);
    SELECT INTO _sql
        string_agg(format('ALTER SEQUENCE %s OWNED BY %I.%I', seq, _newtbl, a.attname), E';\n')
    FROM pg_attribute a
       , pg_get_serial_sequence(_tbl::text, a.attname) AS seq
    WHERE a.attrelid = _tbl
      AND a.attnum > 0
      AND NOT a.attisdropped
      AND seq IS NOT NULL;
    IF _sql IS NOT NULL THEN
        EXECUTE _sql;
    END IF;
END
$func$ LANGUAGE plpgsql VOLATILE;
"#;

/// If a leftover clone from an earlier attempt exists, hand the sequences it
/// owns back to the origin, so dropping the clone cannot take them down.
const RELEASE_SEQUENCES_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION repack_release_sequences(_tbl text, _owner regclass)
RETURNS void AS
$func$
DECLARE
    _sql text;
BEGIN
    IF EXISTS (
        SELECT FROM information_schema.tables
        WHERE table_schema = current_schema()
          AND table_name = _tbl
    ) THEN
        SELECT INTO _sql
            string_agg(format('ALTER SEQUENCE %s OWNED BY %s.%I', seq, _owner, a.attname), E';\n')
        FROM pg_attribute a
           , pg_get_serial_sequence(quote_ident(_tbl), a.attname) AS seq
        WHERE a.attrelid = quote_ident(_tbl)::regclass
          AND a.attnum > 0
          AND NOT a.attisdropped
          AND seq IS NOT NULL;
        IF _sql IS NOT NULL THEN
            EXECUTE _sql;
        END IF;
    END IF;
END
$func$ LANGUAGE plpgsql VOLATILE;
"#;

pub struct Repack {
    pub table: Table,
    pub shadow_table: Table,
    pub retired_table: Table,
    pub log_table: Table,
    pub columns: Vec<Column>,
    pub primary_key: PrimaryKey,
}

impl Repack {
    /// Introspects the origin up front; a catalog failure aborts before any
    /// mutation has been issued.
    pub fn new(table: Table, client: &mut Client) -> Result<Self> {
        let columns = table.columns(client)?;
        let primary_key = table.primary_key(client)?;
        Ok(Repack {
            shadow_table: table.suffixed("_temp"),
            retired_table: table.suffixed("_temp_temp"),
            log_table: table.suffixed("_log"),
            table,
            columns,
            primary_key,
        })
    }

    pub fn install_helpers(&self, client: &mut Client) -> Result<()> {
        client.batch_execute(RELEASE_SEQUENCES_FUNCTION)?;
        client.batch_execute(CLONE_TABLE_FUNCTION)?;
        Ok(())
    }

    pub fn build_shadow(&self, client: &mut Client) -> Result<()> {
        client.execute(
            "SELECT repack_clone_table(($1)::text::regclass, $2)",
            &[&self.table.to_string(), &self.shadow_table.name],
        )?;
        Ok(())
    }

    pub fn create_log_table(&self, client: &mut Client) -> Result<()> {
        client.simple_query(&format!(
            "DROP TABLE IF EXISTS {log}; \
             CREATE TABLE {log} (LIKE {origin} INCLUDING DEFAULTS EXCLUDING STORAGE)",
            log = self.log_table.quoted(),
            origin = self.table.quoted()
        ))?;
        // Tolerating duplicate_column keeps this re-runnable after a failed
        // attempt that got past the CREATE.
        client.batch_execute(&format!(
            r#"
            DO $$
            BEGIN
                BEGIN
                    ALTER TABLE {log} ADD COLUMN action VARCHAR(200);
                EXCEPTION
                    WHEN duplicate_column THEN RAISE NOTICE 'column action already exists';
                END;
            END;
            $$
            "#,
            log = self.log_table.quoted()
        ))?;
        Ok(())
    }

    pub fn install_trigger(&self, client: &mut Client) -> Result<()> {
        client.batch_execute(&self.change_capture_sql())?;
        Ok(())
    }

    fn trigger_name(&self) -> String {
        format!("{}_trigger", self.table.name)
    }

    fn function_name(&self) -> String {
        format!("{}_func", self.table.name)
    }

    /// The capture procedure compacts update chains: an UPDATE wipes earlier
    /// log rows for the same key before appending its post-image, so the log
    /// holds at most one live UPDATE row per key.
    pub fn change_capture_sql(&self) -> String {
        format!(
            r#"
            CREATE OR REPLACE FUNCTION {func}() RETURNS trigger AS $$
            BEGIN
                IF TG_OP = 'INSERT' THEN
                    INSERT INTO {log} VALUES (NEW.*, TG_OP);
                    RETURN NEW;
                ELSIF TG_OP = 'UPDATE' THEN
                    DELETE FROM {log} WHERE {pk} = NEW.{pk};
                    INSERT INTO {log} VALUES (NEW.*, TG_OP);
                    RETURN NEW;
                ELSIF TG_OP = 'DELETE' THEN
                    INSERT INTO {log} VALUES (OLD.*, TG_OP);
                    RETURN OLD;
                END IF;
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS {trigger} ON {table};
            CREATE TRIGGER {trigger}
                AFTER INSERT OR UPDATE OR DELETE ON {table}
                FOR EACH ROW EXECUTE FUNCTION {func}();
            "#,
            func = quote_ident(&self.function_name()),
            trigger = quote_ident(&self.trigger_name()),
            table = self.table.quoted(),
            log = self.log_table.quoted(),
            pk = quote_ident(&self.primary_key.name),
        )
    }

    /// Rename statements that move the retired table's indexes aside so the
    /// original names are free for re-creation on the live table. A name the
    /// substitution leaves unchanged gets a plain suffix instead, so the
    /// rename can never collide with itself.
    pub fn index_renames(&self, indexes: &[IndexDef]) -> Vec<String> {
        indexes
            .iter()
            .map(|index| {
                let renamed = index.name.replace(&self.table.name, &self.retired_table.name);
                let renamed = if renamed == index.name {
                    format!("{}_temp_temp", index.name)
                } else {
                    renamed
                };
                let qualified = match &self.table.schema {
                    Some(schema) => {
                        format!("{}.{}", quote_ident(schema), quote_ident(&index.name))
                    }
                    None => quote_ident(&index.name),
                };
                format!("ALTER INDEX {} RENAME TO {}", qualified, quote_ident(&renamed))
            })
            .collect()
    }

    /// The swap itself. One transaction renames the origin out and the shadow
    /// in, drops the capture trigger and its procedure, and moves the retired
    /// table's index names aside. Any failure rolls the whole block back,
    /// leaving the pre-swap state intact.
    pub fn swap(&self, client: &mut Client, indexes: &[IndexDef]) -> Result<()> {
        let mut transaction = client.transaction()?;
        transaction.batch_execute(&format!(
            "ALTER TABLE {} RENAME TO {}",
            self.table.quoted(),
            quote_ident(&self.retired_table.name)
        ))?;
        transaction.batch_execute(&format!(
            "ALTER TABLE {} RENAME TO {}",
            self.shadow_table.quoted(),
            quote_ident(&self.table.name)
        ))?;
        transaction.batch_execute(&format!(
            "DROP TRIGGER {} ON {}",
            quote_ident(&self.trigger_name()),
            self.retired_table.quoted()
        ))?;
        transaction.batch_execute(&format!(
            "DROP FUNCTION {}()",
            quote_ident(&self.function_name())
        ))?;
        for statement in self.index_renames(indexes) {
            transaction.batch_execute(&statement)?;
        }
        transaction.commit()?;
        Ok(())
    }

    /// Re-establish secondary indexes on the live table from the definitions
    /// collected before the swap. Individual failures are reported and
    /// skipped.
    pub fn recreate_indexes(&self, client: &mut Client, indexes: &[IndexDef]) {
        for index in indexes {
            if let Err(e) = client.batch_execute(&index.definition) {
                log::error!("failed to recreate index {}: {e}", index.name);
            }
        }
    }

    pub fn log_replay(&self) -> LogReplay {
        LogReplay {
            table: self.table.clone(),
            log_table: self.log_table.clone(),
            columns: self.columns.clone(),
            primary_key: self.primary_key.clone(),
        }
    }

    /// The full pipeline: shadow, change capture, bulk copy, swap, index
    /// re-creation, catch-up replay. The trigger must be live before the copy
    /// starts so no mutation can slip between the copy snapshot and capture.
    pub fn run(&self, client: &mut Client) -> Result<()> {
        log::info!("repacking {}", self.table);
        self.install_helpers(client)?;
        timed("building shadow table", || self.build_shadow(client))?;
        timed("creating change log table", || self.create_log_table(client))?;
        timed("installing capture trigger", || self.install_trigger(client))?;
        timed("bulk copying rows", || {
            BulkCopier.copy(&self.table, &self.shadow_table, client)
        })?;
        let indexes = self.table.indexes(client)?;
        timed("swapping tables", || self.swap(client, &indexes))?;
        self.recreate_indexes(client, &indexes);
        let replay = self.log_replay();
        if let Err(e) = timed("replaying change log", || replay.replay(client)) {
            log::error!(
                "replay failed after the swap committed; {} still holds pending \
                 mutations that must be applied manually",
                self.log_table
            );
            return Err(e);
        }
        log::info!(
            "repack of {} complete; run CLEAN once readers have drained to drop {} and {}",
            self.table,
            self.retired_table,
            self.log_table
        );
        Ok(())
    }
}

/// Drops the retired table and the change log. Safe to run repeatedly.
pub fn clean(table: &Table, client: &mut Client) -> Result<()> {
    let retired = table.suffixed("_temp_temp");
    let log_table = table.suffixed("_log");
    let started = Instant::now();
    client.simple_query(&format!("DROP TABLE IF EXISTS {}", retired.quoted()))?;
    client.simple_query(&format!("DROP TABLE IF EXISTS {}", log_table.quoted()))?;
    log::info!(
        "dropped {} and {} in {:?}",
        retired,
        log_table,
        started.elapsed()
    );
    Ok(())
}

fn timed<T>(label: &str, run: impl FnOnce() -> Result<T>) -> Result<T> {
    log::info!("{label}");
    let started = Instant::now();
    let value = run()?;
    log::info!("{label} finished in {:?}", started.elapsed());
    Ok(value)
}
