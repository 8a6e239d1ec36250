//! Main binary entry point for postgres-repack.

use anyhow::Result;
use postgres_repack::args::{Mode, get_args};
use postgres_repack::{Repack, Table, clean};
use r2d2::Pool;
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls as R2d2NoTls};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = get_args()?;
    let uri = format!(
        "postgres://{}:{}@{}/{}",
        args.user, args.password, args.host, args.database
    );
    let manager = PostgresConnectionManager::new(uri.parse()?, R2d2NoTls);
    let pool = Pool::builder().max_size(10).build(manager)?;
    log::info!("connecting to database {}", args.database);
    let mut client = pool.get()?;
    let table = Table::new(&args.table);
    match args.action {
        Mode::New => {
            let repack = Repack::new(table, &mut client)?;
            repack.run(&mut client)?;
        }
        Mode::Clean => clean(&table, &mut client)?,
    }
    Ok(())
}
