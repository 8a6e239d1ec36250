// End-to-end repack tests against a live PostgreSQL server.

mod common;

use postgres_repack::copy::{BulkCopier, Copier};
use postgres_repack::{Repack, Table, clean};
use serial_test::serial;

fn create_accounts(client: &mut postgres::Client) {
    client
        .simple_query("CREATE TABLE accounts (id SERIAL PRIMARY KEY, name TEXT)")
        .unwrap();
}

fn preload_letters(client: &mut postgres::Client, n: u8) {
    for i in 0..n {
        let name = ((b'a' + i) as char).to_string();
        client
            .execute("INSERT INTO accounts (name) VALUES ($1)", &[&name])
            .unwrap();
    }
}

fn account_rows(client: &mut postgres::Client) -> Vec<(i32, Option<String>)> {
    client
        .query("SELECT id, name FROM accounts ORDER BY id", &[])
        .unwrap()
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect()
}

fn regclass_exists(client: &mut postgres::Client, name: &str) -> bool {
    client
        .query_one("SELECT to_regclass($1) IS NOT NULL AS present", &[&name])
        .unwrap()
        .get("present")
}

fn assert_unique_pks(client: &mut postgres::Client) {
    let unique: bool = client
        .query_one(
            "SELECT count(*) = count(DISTINCT id) AS unique_pks FROM accounts",
            &[],
        )
        .unwrap()
        .get("unique_pks");
    assert!(unique, "duplicate primary keys after repack");
}

#[test]
#[serial]
fn repacks_an_empty_table_and_clean_is_idempotent() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);

    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.run(&mut client).unwrap();

    assert_eq!(account_rows(&mut client).len(), 0);
    let columns = Table::new("accounts").columns(&mut client).unwrap();
    let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "name"]);
    assert!(regclass_exists(&mut client, "accounts_temp_temp"));
    assert!(regclass_exists(&mut client, "accounts_log"));

    clean(&Table::new("accounts"), &mut client).unwrap();
    assert!(!regclass_exists(&mut client, "accounts_temp_temp"));
    assert!(!regclass_exists(&mut client, "accounts_log"));
    // running CLEAN again is a no-op
    clean(&Table::new("accounts"), &mut client).unwrap();
}

#[test]
#[serial]
fn repacks_a_static_table_without_changing_rows() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    preload_letters(&mut client, 10);
    let before = account_rows(&mut client);

    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.run(&mut client).unwrap();

    assert_eq!(account_rows(&mut client), before);
    assert_unique_pks(&mut client);
}

#[test]
#[serial]
fn insert_after_capture_starts_is_preserved() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    preload_letters(&mut client, 10);

    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.install_helpers(&mut client).unwrap();
    repack.build_shadow(&mut client).unwrap();
    repack.create_log_table(&mut client).unwrap();
    repack.install_trigger(&mut client).unwrap();

    // Lands in both the copy snapshot and the log; replay must not duplicate it.
    client
        .execute("INSERT INTO accounts (id, name) VALUES (11, 'k')", &[])
        .unwrap();

    BulkCopier
        .copy(&repack.table, &repack.shadow_table, &mut client)
        .unwrap();
    let indexes = repack.table.indexes(&mut client).unwrap();
    repack.swap(&mut client, &indexes).unwrap();
    repack.recreate_indexes(&mut client, &indexes);
    repack.log_replay().replay(&mut client).unwrap();

    let rows = account_rows(&mut client);
    assert_eq!(rows.len(), 11);
    assert!(rows.contains(&(11, Some("k".to_string()))));
    assert_unique_pks(&mut client);
}

#[test]
#[serial]
fn delete_after_copy_is_replayed() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    preload_letters(&mut client, 10);

    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.install_helpers(&mut client).unwrap();
    repack.build_shadow(&mut client).unwrap();
    repack.create_log_table(&mut client).unwrap();
    repack.install_trigger(&mut client).unwrap();
    BulkCopier
        .copy(&repack.table, &repack.shadow_table, &mut client)
        .unwrap();

    // Only the log knows about this one.
    client
        .execute("DELETE FROM accounts WHERE id = 5", &[])
        .unwrap();

    let indexes = repack.table.indexes(&mut client).unwrap();
    repack.swap(&mut client, &indexes).unwrap();
    repack.recreate_indexes(&mut client, &indexes);
    repack.log_replay().replay(&mut client).unwrap();

    let rows = account_rows(&mut client);
    assert_eq!(rows.len(), 9);
    assert!(!rows.iter().any(|(id, _)| *id == 5));
}

#[test]
#[serial]
fn update_chain_collapses_to_the_terminal_value() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    preload_letters(&mut client, 10);

    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.install_helpers(&mut client).unwrap();
    repack.build_shadow(&mut client).unwrap();
    repack.create_log_table(&mut client).unwrap();
    repack.install_trigger(&mut client).unwrap();
    BulkCopier
        .copy(&repack.table, &repack.shadow_table, &mut client)
        .unwrap();

    for name in ["c1", "c2", "c3"] {
        client
            .execute("UPDATE accounts SET name = $1 WHERE id = 3", &[&name])
            .unwrap();
    }

    // The capture trigger compacts the chain down to one live row.
    let pending: i64 = client
        .query_one("SELECT count(*) FROM accounts_log WHERE id = 3", &[])
        .unwrap()
        .get(0);
    assert_eq!(pending, 1);
    let action: String = client
        .query_one("SELECT action FROM accounts_log WHERE id = 3", &[])
        .unwrap()
        .get(0);
    assert_eq!(action, "UPDATE");

    let indexes = repack.table.indexes(&mut client).unwrap();
    repack.swap(&mut client, &indexes).unwrap();
    repack.recreate_indexes(&mut client, &indexes);
    repack.log_replay().replay(&mut client).unwrap();

    let name: Option<String> = client
        .query_one("SELECT name FROM accounts WHERE id = 3", &[])
        .unwrap()
        .get(0);
    assert_eq!(name.as_deref(), Some("c3"));
}

#[test]
#[serial]
fn interrupted_before_replay_leaves_the_log_pending() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    preload_letters(&mut client, 10);

    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.install_helpers(&mut client).unwrap();
    repack.build_shadow(&mut client).unwrap();
    repack.create_log_table(&mut client).unwrap();
    repack.install_trigger(&mut client).unwrap();
    BulkCopier
        .copy(&repack.table, &repack.shadow_table, &mut client)
        .unwrap();
    client
        .execute("INSERT INTO accounts (id, name) VALUES (11, 'k')", &[])
        .unwrap();
    let indexes = repack.table.indexes(&mut client).unwrap();
    repack.swap(&mut client, &indexes).unwrap();
    repack.recreate_indexes(&mut client, &indexes);
    // Simulated crash: no replay. The live table is the copy snapshot.
    assert_eq!(account_rows(&mut client).len(), 10);
    assert!(regclass_exists(&mut client, "accounts_log"));
    let pending: i64 = client
        .query_one("SELECT count(*) FROM accounts_log", &[])
        .unwrap()
        .get(0);
    assert_eq!(pending, 1);

    // A manual replay brings the table up to date.
    repack.log_replay().replay(&mut client).unwrap();
    let rows = account_rows(&mut client);
    assert_eq!(rows.len(), 11);
    assert!(rows.contains(&(11, Some("k".to_string()))));
}

#[test]
#[serial]
fn rerun_after_a_partial_attempt_converges() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    preload_letters(&mut client, 10);

    // First attempt dies after the bulk copy, leaving shadow, log and trigger.
    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.install_helpers(&mut client).unwrap();
    repack.build_shadow(&mut client).unwrap();
    repack.create_log_table(&mut client).unwrap();
    repack.install_trigger(&mut client).unwrap();
    BulkCopier
        .copy(&repack.table, &repack.shadow_table, &mut client)
        .unwrap();

    // Second attempt starts from scratch and completes.
    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.run(&mut client).unwrap();

    let rows = account_rows(&mut client);
    assert_eq!(rows.len(), 10);
    assert_unique_pks(&mut client);
}

#[test]
#[serial]
fn round_trip_with_concurrent_traffic() {
    let db = common::setup_test_db();
    let mut client = db.client();
    create_accounts(&mut client);
    for i in 0..50 {
        client
            .execute(
                "INSERT INTO accounts (name) VALUES ($1)",
                &[&format!("preload_{i}")],
            )
            .unwrap();
    }

    const ROUNDS: usize = 30;
    let traffic = common::spawn_traffic(db.pool.clone(), "accounts".to_string(), ROUNDS);
    let repack = Repack::new(Table::new("accounts"), &mut client).unwrap();
    repack.run(&mut client).unwrap();
    traffic.join().unwrap();

    // 50 preloaded + 30 inserts - 6 deletes; the generator's updates only
    // ever touch the oldest row and its deletes only the newest, so the
    // preloaded rows 2..=50 are untouched in every interleaving.
    let rows = account_rows(&mut client);
    assert_eq!(rows.len(), 74);
    assert_unique_pks(&mut client);
    for i in 2..=50 {
        assert!(
            rows.contains(&(i, Some(format!("preload_{}", i - 1)))),
            "preloaded row {i} was lost or changed"
        );
    }
    let oldest = rows.iter().find(|(id, _)| *id == 1).expect("row 1 missing");
    assert!(
        oldest.1.as_deref().unwrap().starts_with("updated_"),
        "oldest row should carry a traffic update"
    );
}
