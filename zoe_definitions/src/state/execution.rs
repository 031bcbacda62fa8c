use std::str::FromStr;

use chrono::{DateTime, Utc};
use postgres::Row;
use postgres::types::ToSql;

use super::{Service, StateStore, TerminationLock, User};
use crate::application::AppDescription;
use crate::state::service::ServiceStatus;
use crate::{Error, Result};

/// The scheduler state machine for executions
///
/// `Terminated`, `Finished` and `Error` are absorbing.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Submitted,
    Queued,
    Starting,
    Running,
    CleaningUp,
    Terminated,
    Finished,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Starting => "starting",
            ExecutionStatus::Running => "running",
            ExecutionStatus::CleaningUp => "cleaning up",
            ExecutionStatus::Terminated => "terminated",
            ExecutionStatus::Finished => "finished",
            ExecutionStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Terminated | ExecutionStatus::Finished | ExecutionStatus::Error
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<ExecutionStatus> {
        Ok(match s {
            "submitted" => ExecutionStatus::Submitted,
            "queued" => ExecutionStatus::Queued,
            "starting" => ExecutionStatus::Starting,
            "running" => ExecutionStatus::Running,
            "cleaning up" => ExecutionStatus::CleaningUp,
            "terminated" => ExecutionStatus::Terminated,
            "finished" => ExecutionStatus::Finished,
            "error" => ExecutionStatus::Error,
            other => bail!("unknown execution status '{}' in the state store", other),
        })
    }
}

/// A user submission, scheduled as a unit
#[derive(Clone, Debug)]
pub struct Execution {
    pub id: i32,
    pub name: String,
    pub user_id: i32,
    pub description: AppDescription,
    pub status: ExecutionStatus,
    /// Time-remaining proxy used by the SIZE policy, refreshed by the scheduler
    pub size: f64,
    pub error_message: Option<String>,
    pub time_submit: DateTime<Utc>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    /// Held while the execution is being placed or torn down
    pub termination_lock: TerminationLock,
}

impl Execution {
    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    pub fn services_count(&self) -> usize {
        self.description.services_count()
    }

    pub fn original_size_unit(&self) -> f64 {
        self.description.original_size_unit()
    }

    pub fn priority(&self) -> u32 {
        self.description.priority
    }

    pub fn owner(&self, state: &StateStore) -> Result<Option<User>> {
        state.users().get(self.user_id)
    }

    pub fn services(&self, state: &StateStore) -> Result<Vec<Service>> {
        state.services().by_execution(self.id)
    }

    pub fn running_services_count(&self, state: &StateStore) -> Result<usize> {
        Ok(self
            .services(state)?
            .iter()
            .filter(|s| s.status == ServiceStatus::Active)
            .count())
    }

    /// True when every service of the execution, elastic ones included, is up
    pub fn all_services_active(&self, state: &StateStore) -> Result<bool> {
        Ok(self
            .services(state)?
            .iter()
            .all(|s| s.status == ServiceStatus::Active))
    }

    /// True when every essential service is up
    pub fn essential_services_running(&self, state: &StateStore) -> Result<bool> {
        Ok(self
            .services(state)?
            .iter()
            .filter(|s| s.essential)
            .all(|s| s.status == ServiceStatus::Active))
    }

    pub fn set_scheduled(&mut self, state: &StateStore) -> Result<()> {
        self.transition(state, ExecutionStatus::Queued)
    }

    pub fn set_starting(&mut self, state: &StateStore) -> Result<()> {
        self.transition(state, ExecutionStatus::Starting)
    }

    pub fn set_running(&mut self, state: &StateStore) -> Result<()> {
        self.transition(state, ExecutionStatus::Running)?;
        if self.time_start.is_none() {
            let now = Utc::now();
            state.executions().set_time_start(self.id, now)?;
            self.time_start = Some(now);
        }
        Ok(())
    }

    pub fn set_cleaning_up(&mut self, state: &StateStore) -> Result<()> {
        self.transition(state, ExecutionStatus::CleaningUp)
    }

    pub fn set_terminated(&mut self, state: &StateStore) -> Result<()> {
        self.transition(state, ExecutionStatus::Terminated)?;
        self.finish(state)
    }

    pub fn set_finished(&mut self, state: &StateStore) -> Result<()> {
        self.transition(state, ExecutionStatus::Finished)?;
        self.finish(state)
    }

    pub fn set_error(&mut self, state: &StateStore, message: &str) -> Result<()> {
        error!("Execution {} failed: {}", self.id, message);
        state.executions().set_error_message(self.id, message)?;
        self.error_message = Some(message.to_string());
        self.transition(state, ExecutionStatus::Error)?;
        self.finish(state)
    }

    fn transition(&mut self, state: &StateStore, to: ExecutionStatus) -> Result<()> {
        if self.status.is_terminal() {
            debug!(
                "Execution {} is already {}, ignoring transition to {}",
                self.id,
                self.status.as_str(),
                to.as_str()
            );
            return Ok(());
        }
        state.executions().update_status(self.id, to)?;
        self.status = to;
        Ok(())
    }

    fn finish(&mut self, state: &StateStore) -> Result<()> {
        let now = Utc::now();
        state.executions().set_time_end(self.id, now)?;
        self.time_end = Some(now);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub user_id: Option<i32>,
    pub name: Option<String>,
}

pub struct ExecutionTable<'a> {
    store: &'a StateStore,
}

impl<'a> ExecutionTable<'a> {
    pub(super) fn new(store: &'a StateStore) -> ExecutionTable<'a> {
        ExecutionTable { store }
    }

    pub fn create(&self) -> Result<()> {
        self.store.with_conn(|c| {
            c.batch_execute(
                "CREATE TABLE IF NOT EXISTS execution (
                    id SERIAL PRIMARY KEY,
                    name TEXT NOT NULL,
                    user_id INTEGER NOT NULL REFERENCES zoe_user(id),
                    description JSONB NOT NULL,
                    status TEXT NOT NULL,
                    size DOUBLE PRECISION NOT NULL,
                    error_message TEXT,
                    time_submit TIMESTAMP WITH TIME ZONE NOT NULL,
                    time_start TIMESTAMP WITH TIME ZONE,
                    time_end TIMESTAMP WITH TIME ZONE
                )",
            )
        })
    }

    pub fn select(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut sql = "SELECT * FROM execution".to_string();
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let status = filter.status.map(|s| s.as_str());
        if let Some(ref s) = status {
            params.push(s);
            clauses.push(format!("status = ${}", params.len()));
        }
        if let Some(ref uid) = filter.user_id {
            params.push(uid);
            clauses.push(format!("user_id = ${}", params.len()));
        }
        if let Some(ref name) = filter.name {
            params.push(name);
            clauses.push(format!("name = ${}", params.len()));
        }
        if !clauses.is_empty() {
            sql = format!("{} WHERE {}", sql, clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        let rows = self.store.with_conn(|c| c.query(sql.as_str(), &params))?;
        rows.iter().map(|r| self.from_row(r)).collect()
    }

    pub fn select_one(&self, filter: &ExecutionFilter) -> Result<Option<Execution>> {
        Ok(self.select(filter)?.into_iter().next())
    }

    pub fn get(&self, id: i32) -> Result<Option<Execution>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM execution WHERE id = $1", &[&id]))?;
        row.map(|r| self.from_row(&r)).transpose()
    }

    pub fn insert(&self, name: &str, user_id: i32, description: &AppDescription) -> Result<Execution> {
        let desc_json = serde_json::to_value(description)?;
        let size = description.initial_size();
        let status = ExecutionStatus::Submitted.as_str();
        let row = self.store.with_conn(|c| {
            c.query_one(
                "INSERT INTO execution (name, user_id, description, status, size, time_submit)
                 VALUES ($1, $2, $3, $4, $5, now()) RETURNING *",
                &[&name, &user_id, &desc_json, &status, &size],
            )
        })?;
        self.from_row(&row)
    }

    pub fn update_status(&self, id: i32, status: ExecutionStatus) -> Result<()> {
        let status = status.as_str();
        self.store.with_conn(|c| {
            c.execute("UPDATE execution SET status = $1 WHERE id = $2", &[&status, &id])
                .map(|_| ())
        })
    }

    pub fn update_size(&self, id: i32, size: f64) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("UPDATE execution SET size = $1 WHERE id = $2", &[&size, &id])
                .map(|_| ())
        })
    }

    pub fn set_time_start(&self, id: i32, when: DateTime<Utc>) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("UPDATE execution SET time_start = $1 WHERE id = $2", &[&when, &id])
                .map(|_| ())
        })
    }

    pub fn set_time_end(&self, id: i32, when: DateTime<Utc>) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("UPDATE execution SET time_end = $1 WHERE id = $2", &[&when, &id])
                .map(|_| ())
        })
    }

    pub fn set_error_message(&self, id: i32, message: &str) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("UPDATE execution SET error_message = $1 WHERE id = $2", &[&message, &id])
                .map(|_| ())
        })
    }

    /// Delete an execution and everything it owns
    pub fn delete(&self, id: i32) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("DELETE FROM execution WHERE id = $1", &[&id]).map(|_| ())
        })?;
        self.store.forget_lock(id);
        Ok(())
    }

    fn from_row(&self, row: &Row) -> Result<Execution> {
        let id: i32 = row.get("id");
        let status: String = row.get("status");
        let description: serde_json::Value = row.get("description");
        Ok(Execution {
            id,
            name: row.get("name"),
            user_id: row.get("user_id"),
            description: serde_json::from_value(description)?,
            status: status.parse()?,
            size: row.get("size"),
            error_message: row.get("error_message"),
            time_submit: row.get("time_submit"),
            time_start: row.get("time_start"),
            time_end: row.get("time_end"),
            termination_lock: self.store.termination_lock(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in &[
            ExecutionStatus::Submitted,
            ExecutionStatus::Queued,
            ExecutionStatus::Starting,
            ExecutionStatus::Running,
            ExecutionStatus::CleaningUp,
            ExecutionStatus::Terminated,
            ExecutionStatus::Finished,
            ExecutionStatus::Error,
        ] {
            assert_eq!(*status, status.as_str().parse::<ExecutionStatus>().unwrap());
        }
        assert!("vanished".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        assert!(ExecutionStatus::Terminated.is_terminal());
        assert!(ExecutionStatus::Finished.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
