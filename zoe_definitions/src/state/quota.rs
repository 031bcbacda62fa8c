use postgres::Row;

use super::StateStore;
use crate::Result;

/// Hard limits on what a class of users can consume at once
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Quota {
    pub id: i32,
    pub name: String,
    pub concurrent_executions: i32,
    pub cores: i32,
    /// In bytes
    pub memory: i64,
    /// In hours, 0 disables the limit
    pub runtime_limit: i32,
}

pub struct QuotaTable<'a> {
    store: &'a StateStore,
}

impl<'a> QuotaTable<'a> {
    pub(super) fn new(store: &'a StateStore) -> QuotaTable<'a> {
        QuotaTable { store }
    }

    pub fn create(&self) -> Result<()> {
        self.store.with_conn(|c| {
            c.batch_execute(
                "CREATE TABLE IF NOT EXISTS quota (
                    id SERIAL PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    concurrent_executions INTEGER NOT NULL,
                    cores INTEGER NOT NULL,
                    memory BIGINT NOT NULL,
                    runtime_limit INTEGER NOT NULL
                )",
            )
        })
    }

    pub fn get(&self, id: i32) -> Result<Option<Quota>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM quota WHERE id = $1", &[&id]))?;
        Ok(row.as_ref().map(from_row))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Quota>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM quota WHERE name = $1", &[&name]))?;
        Ok(row.as_ref().map(from_row))
    }

    pub fn all(&self) -> Result<Vec<Quota>> {
        let rows = self
            .store
            .with_conn(|c| c.query("SELECT * FROM quota ORDER BY id", &[]))?;
        Ok(rows.iter().map(from_row).collect())
    }

    pub fn insert(&self, quota: &Quota) -> Result<Quota> {
        if quota.concurrent_executions <= 0 || quota.cores <= 0 || quota.memory <= 0 {
            bail!("quota limits must be positive");
        }
        let row = self.store.with_conn(|c| {
            c.query_one(
                "INSERT INTO quota (name, concurrent_executions, cores, memory, runtime_limit)
                 VALUES ($1, $2, $3, $4, $5) RETURNING *",
                &[
                    &quota.name,
                    &quota.concurrent_executions,
                    &quota.cores,
                    &quota.memory,
                    &quota.runtime_limit,
                ],
            )
        })?;
        Ok(from_row(&row))
    }

    pub fn delete(&self, id: i32) -> Result<()> {
        self.store
            .with_conn(|c| c.execute("DELETE FROM quota WHERE id = $1", &[&id]).map(|_| ()))
    }
}

fn from_row(row: &Row) -> Quota {
    Quota {
        id: row.get("id"),
        name: row.get("name"),
        concurrent_executions: row.get("concurrent_executions"),
        cores: row.get("cores"),
        memory: row.get("memory"),
        runtime_limit: row.get("runtime_limit"),
    }
}
