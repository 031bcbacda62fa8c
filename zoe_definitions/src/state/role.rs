use postgres::Row;

use super::StateStore;
use crate::Result;

/// What a class of users is allowed to do
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Role {
    pub id: i32,
    pub name: String,
    pub can_see_status: bool,
    pub can_change_config: bool,
    pub can_operate_others: bool,
    pub can_delete_executions: bool,
    pub can_access_api: bool,
    pub can_customize_resources: bool,
    pub can_access_full_zapp_shop: bool,
}

pub struct RoleTable<'a> {
    store: &'a StateStore,
}

impl<'a> RoleTable<'a> {
    pub(super) fn new(store: &'a StateStore) -> RoleTable<'a> {
        RoleTable { store }
    }

    pub fn create(&self) -> Result<()> {
        self.store.with_conn(|c| {
            c.batch_execute(
                "CREATE TABLE IF NOT EXISTS role (
                    id SERIAL PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    can_see_status BOOLEAN NOT NULL DEFAULT FALSE,
                    can_change_config BOOLEAN NOT NULL DEFAULT FALSE,
                    can_operate_others BOOLEAN NOT NULL DEFAULT FALSE,
                    can_delete_executions BOOLEAN NOT NULL DEFAULT FALSE,
                    can_access_api BOOLEAN NOT NULL DEFAULT FALSE,
                    can_customize_resources BOOLEAN NOT NULL DEFAULT FALSE,
                    can_access_full_zapp_shop BOOLEAN NOT NULL DEFAULT FALSE
                )",
            )
        })
    }

    pub fn get(&self, id: i32) -> Result<Option<Role>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM role WHERE id = $1", &[&id]))?;
        Ok(row.as_ref().map(from_row))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Role>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM role WHERE name = $1", &[&name]))?;
        Ok(row.as_ref().map(from_row))
    }

    pub fn all(&self) -> Result<Vec<Role>> {
        let rows = self.store.with_conn(|c| c.query("SELECT * FROM role ORDER BY id", &[]))?;
        Ok(rows.iter().map(from_row).collect())
    }

    pub fn insert(&self, role: &Role) -> Result<Role> {
        let row = self.store.with_conn(|c| {
            c.query_one(
                "INSERT INTO role (name, can_see_status, can_change_config, can_operate_others,
                                   can_delete_executions, can_access_api, can_customize_resources,
                                   can_access_full_zapp_shop)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
                &[
                    &role.name,
                    &role.can_see_status,
                    &role.can_change_config,
                    &role.can_operate_others,
                    &role.can_delete_executions,
                    &role.can_access_api,
                    &role.can_customize_resources,
                    &role.can_access_full_zapp_shop,
                ],
            )
        })?;
        Ok(from_row(&row))
    }

    pub fn delete(&self, id: i32) -> Result<()> {
        self.store
            .with_conn(|c| c.execute("DELETE FROM role WHERE id = $1", &[&id]).map(|_| ()))
    }
}

fn from_row(row: &Row) -> Role {
    Role {
        id: row.get("id"),
        name: row.get("name"),
        can_see_status: row.get("can_see_status"),
        can_change_config: row.get("can_change_config"),
        can_operate_others: row.get("can_operate_others"),
        can_delete_executions: row.get("can_delete_executions"),
        can_access_api: row.get("can_access_api"),
        can_customize_resources: row.get("can_customize_resources"),
        can_access_full_zapp_shop: row.get("can_access_full_zapp_shop"),
    }
}
