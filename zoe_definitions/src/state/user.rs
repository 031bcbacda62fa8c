use std::str::FromStr;

use postgres::Row;
use postgres::types::ToSql;

use super::StateStore;
use crate::{Error, Result};

/// Where a user's credentials are checked
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthSource {
    Internal,
    Textfile,
    Pam,
    Ldap,
    LdapSasl,
}

impl AuthSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthSource::Internal => "internal",
            AuthSource::Textfile => "textfile",
            AuthSource::Pam => "pam",
            AuthSource::Ldap => "ldap",
            AuthSource::LdapSasl => "ldap+sasl",
        }
    }
}

impl FromStr for AuthSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<AuthSource> {
        Ok(match s {
            "internal" => AuthSource::Internal,
            "textfile" => AuthSource::Textfile,
            "pam" => AuthSource::Pam,
            "ldap" => AuthSource::Ldap,
            "ldap+sasl" => AuthSource::LdapSasl,
            other => bail!("unknown auth source '{}' in the state store", other),
        })
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: Option<String>,
    /// Unix uid owning the user's workspace directory
    pub fs_uid: i32,
    /// Disabled users cannot authenticate
    pub enabled: bool,
    pub priority: i32,
    pub auth_source: AuthSource,
    pub role_id: i32,
    pub quota_id: i32,
}

pub struct UserTable<'a> {
    store: &'a StateStore,
}

impl<'a> UserTable<'a> {
    pub(super) fn new(store: &'a StateStore) -> UserTable<'a> {
        UserTable { store }
    }

    pub fn create(&self) -> Result<()> {
        // "user" is a reserved word, hence the table name
        self.store.with_conn(|c| {
            c.batch_execute(
                "CREATE TABLE IF NOT EXISTS zoe_user (
                    id SERIAL PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT,
                    fs_uid INTEGER NOT NULL,
                    enabled BOOLEAN NOT NULL DEFAULT TRUE,
                    priority INTEGER NOT NULL DEFAULT 0,
                    auth_source TEXT NOT NULL,
                    role_id INTEGER NOT NULL REFERENCES role(id),
                    quota_id INTEGER NOT NULL REFERENCES quota(id)
                )",
            )
        })
    }

    pub fn get(&self, id: i32) -> Result<Option<User>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM zoe_user WHERE id = $1", &[&id]))?;
        row.as_ref().map(from_row).transpose()
    }

    pub fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM zoe_user WHERE username = $1", &[&username]))?;
        row.as_ref().map(from_row).transpose()
    }

    pub fn all(&self) -> Result<Vec<User>> {
        let rows = self
            .store
            .with_conn(|c| c.query("SELECT * FROM zoe_user ORDER BY id", &[]))?;
        rows.iter().map(from_row).collect()
    }

    pub fn insert(
        &self,
        username: &str,
        fs_uid: i32,
        auth_source: AuthSource,
        role_id: i32,
        quota_id: i32,
    ) -> Result<User> {
        let source = auth_source.as_str();
        let row = self.store.with_conn(|c| {
            c.query_one(
                "INSERT INTO zoe_user (username, fs_uid, auth_source, role_id, quota_id)
                 VALUES ($1, $2, $3, $4, $5) RETURNING *",
                &[&username, &fs_uid, &source, &role_id, &quota_id],
            )
        })?;
        from_row(&row)
    }

    pub fn set_enabled(&self, id: i32, enabled: bool) -> Result<()> {
        self.update_field(id, "enabled", &enabled)
    }

    pub fn set_email(&self, id: i32, email: &str) -> Result<()> {
        self.update_field(id, "email", &email)
    }

    pub fn set_priority(&self, id: i32, priority: i32) -> Result<()> {
        self.update_field(id, "priority", &priority)
    }

    pub fn set_role(&self, id: i32, role_id: i32) -> Result<()> {
        self.update_field(id, "role_id", &role_id)
    }

    pub fn set_quota(&self, id: i32, quota_id: i32) -> Result<()> {
        self.update_field(id, "quota_id", &quota_id)
    }

    fn update_field(&self, id: i32, field: &str, value: &(dyn ToSql + Sync)) -> Result<()> {
        let sql = format!("UPDATE zoe_user SET {} = $1 WHERE id = $2", field);
        self.store
            .with_conn(|c| c.execute(sql.as_str(), &[value, &id]).map(|_| ()))
    }

    pub fn delete(&self, id: i32) -> Result<()> {
        self.store
            .with_conn(|c| c.execute("DELETE FROM zoe_user WHERE id = $1", &[&id]).map(|_| ()))
    }
}

fn from_row(row: &Row) -> Result<User> {
    let auth_source: String = row.get("auth_source");
    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        fs_uid: row.get("fs_uid"),
        enabled: row.get("enabled"),
        priority: row.get("priority"),
        auth_source: auth_source.parse()?,
        role_id: row.get("role_id"),
        quota_id: row.get("quota_id"),
    })
}
