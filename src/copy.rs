use crate::Table;
use anyhow::Result;
use postgres::Client;

pub trait Copier {
    fn copy(&self, origin: &Table, shadow: &Table, client: &mut Client) -> Result<()>;
}

/// Populates the shadow in a single server-side statement. Writers that land
/// after the statement's snapshot are captured by the change log and
/// reconciled during replay.
pub struct BulkCopier;

impl Copier for BulkCopier {
    fn copy(&self, origin: &Table, shadow: &Table, client: &mut Client) -> Result<()> {
        let statement = format!(
            "INSERT INTO {} SELECT * FROM {}",
            shadow.quoted(),
            origin.quoted()
        );
        log::debug!("bulk copy: {statement}");
        client.simple_query(&statement)?;
        Ok(())
    }
}
