use std::str::FromStr;

use postgres::Row;
use postgres::types::ToSql;

use super::StateStore;
use crate::application::ServiceDescription;
use crate::structs::ResourceReservation;
use crate::{Error, Result};

/// Scheduler-side service state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    Created,
    Active,
    Error,
    Destroyed,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Created => "created",
            ServiceStatus::Active => "active",
            ServiceStatus::Error => "error",
            ServiceStatus::Destroyed => "destroyed",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<ServiceStatus> {
        Ok(match s {
            "created" => ServiceStatus::Created,
            "active" => ServiceStatus::Active,
            "error" => ServiceStatus::Error,
            "destroyed" => ServiceStatus::Destroyed,
            other => bail!("unknown service status '{}' in the state store", other),
        })
    }
}

/// Backend-side container state, advanced only by the monitor threads
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendStatus {
    Undefined,
    Start,
    Started,
    Die,
    Destroy,
}

impl BackendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendStatus::Undefined => "undefined",
            BackendStatus::Start => "start",
            BackendStatus::Started => "started",
            BackendStatus::Die => "die",
            BackendStatus::Destroy => "destroy",
        }
    }
}

impl FromStr for BackendStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<BackendStatus> {
        Ok(match s {
            "undefined" => BackendStatus::Undefined,
            "start" => BackendStatus::Start,
            "started" => BackendStatus::Started,
            "die" => BackendStatus::Die,
            "destroy" => BackendStatus::Destroy,
            other => bail!("unknown backend status '{}' in the state store", other),
        })
    }
}

/// One long-lived container belonging to an execution
#[derive(Clone, Debug)]
pub struct Service {
    pub id: i32,
    pub execution_id: i32,
    pub name: String,
    /// Unique within the execution; equals the description name today
    pub unique_name: String,
    pub description: ServiceDescription,
    pub essential: bool,
    pub is_monitor: bool,
    pub status: ServiceStatus,
    pub backend_status: BackendStatus,
    /// Present iff a container exists for this service
    pub backend_id: Option<String>,
    pub backend_host: Option<String>,
    pub ip_address: Option<String>,
    pub error_message: Option<String>,
}

impl Service {
    /// The DNS name the container is reachable at inside the overlay
    pub fn dns_name(&self, deployment_name: &str) -> String {
        format!("{}-{}-{}", deployment_name, self.unique_name, self.execution_id)
    }

    pub fn reservation(&self) -> ResourceReservation {
        self.description.reservation()
    }

    pub fn is_active(&self) -> bool {
        self.status == ServiceStatus::Active
    }

    pub fn set_active(&mut self, state: &StateStore, backend_id: &str, ip_address: Option<&str>) -> Result<()> {
        state
            .services()
            .set_spawned(self.id, backend_id, ip_address, ServiceStatus::Active)?;
        self.status = ServiceStatus::Active;
        self.backend_id = Some(backend_id.to_string());
        self.ip_address = ip_address.map(|s| s.to_string());
        Ok(())
    }

    pub fn set_error(&mut self, state: &StateStore, message: &str) -> Result<()> {
        warn!("Service {} ({}) failed: {}", self.id, self.name, message);
        state.services().set_error(self.id, message)?;
        self.status = ServiceStatus::Error;
        self.error_message = Some(message.to_string());
        Ok(())
    }

    pub fn set_destroyed(&mut self, state: &StateStore) -> Result<()> {
        state.services().set_destroyed(self.id)?;
        self.status = ServiceStatus::Destroyed;
        self.backend_id = None;
        self.ip_address = None;
        Ok(())
    }

    pub fn set_backend_host(&mut self, state: &StateStore, host: &str) -> Result<()> {
        state.services().update_backend_host(self.id, host)?;
        self.backend_host = Some(host.to_string());
        Ok(())
    }

    /// Only monitor threads call this; the scheduler never touches it
    pub fn set_backend_status(&mut self, state: &StateStore, status: BackendStatus) -> Result<()> {
        state.services().update_backend_status(self.id, status)?;
        self.backend_status = status;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct ServiceFilter {
    pub execution_id: Option<i32>,
    pub backend_host: Option<String>,
    pub backend_status: Option<BackendStatus>,
    pub essential: Option<bool>,
}

pub struct ServiceTable<'a> {
    store: &'a StateStore,
}

impl<'a> ServiceTable<'a> {
    pub(super) fn new(store: &'a StateStore) -> ServiceTable<'a> {
        ServiceTable { store }
    }

    pub fn create(&self) -> Result<()> {
        self.store.with_conn(|c| {
            c.batch_execute(
                "CREATE TABLE IF NOT EXISTS service (
                    id SERIAL PRIMARY KEY,
                    execution_id INTEGER NOT NULL REFERENCES execution(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    unique_name TEXT NOT NULL,
                    description JSONB NOT NULL,
                    essential BOOLEAN NOT NULL,
                    is_monitor BOOLEAN NOT NULL,
                    status TEXT NOT NULL,
                    backend_status TEXT NOT NULL,
                    backend_id TEXT,
                    backend_host TEXT,
                    ip_address TEXT,
                    error_message TEXT,
                    UNIQUE (execution_id, unique_name)
                )",
            )
        })
    }

    pub fn select(&self, filter: &ServiceFilter) -> Result<Vec<Service>> {
        let mut sql = "SELECT * FROM service".to_string();
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(ref eid) = filter.execution_id {
            params.push(eid);
            clauses.push(format!("execution_id = ${}", params.len()));
        }
        if let Some(ref host) = filter.backend_host {
            params.push(host);
            clauses.push(format!("backend_host = ${}", params.len()));
        }
        let backend_status = filter.backend_status.map(|s| s.as_str());
        if let Some(ref bs) = backend_status {
            params.push(bs);
            clauses.push(format!("backend_status = ${}", params.len()));
        }
        if let Some(ref essential) = filter.essential {
            params.push(essential);
            clauses.push(format!("essential = ${}", params.len()));
        }
        if !clauses.is_empty() {
            sql = format!("{} WHERE {}", sql, clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        let rows = self.store.with_conn(|c| c.query(sql.as_str(), &params))?;
        rows.iter().map(from_row).collect()
    }

    pub fn by_execution(&self, execution_id: i32) -> Result<Vec<Service>> {
        self.select(&ServiceFilter {
            execution_id: Some(execution_id),
            ..ServiceFilter::default()
        })
    }

    pub fn get(&self, id: i32) -> Result<Option<Service>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM service WHERE id = $1", &[&id]))?;
        row.as_ref().map(from_row).transpose()
    }

    pub fn get_by_backend_id(&self, backend_id: &str) -> Result<Option<Service>> {
        let row = self
            .store
            .with_conn(|c| c.query_opt("SELECT * FROM service WHERE backend_id = $1", &[&backend_id]))?;
        row.as_ref().map(from_row).transpose()
    }

    pub fn insert(&self, execution_id: i32, description: &ServiceDescription) -> Result<Service> {
        let desc_json = serde_json::to_value(description)?;
        let status = ServiceStatus::Created.as_str();
        let backend_status = BackendStatus::Undefined.as_str();
        let row = self.store.with_conn(|c| {
            c.query_one(
                "INSERT INTO service
                    (execution_id, name, unique_name, description, essential, is_monitor, status, backend_status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
                &[
                    &execution_id,
                    &description.name,
                    &description.name,
                    &desc_json,
                    &description.essential,
                    &description.monitor,
                    &status,
                    &backend_status,
                ],
            )
        })?;
        from_row(&row)
    }

    pub fn set_spawned(
        &self,
        id: i32,
        backend_id: &str,
        ip_address: Option<&str>,
        status: ServiceStatus,
    ) -> Result<()> {
        let status = status.as_str();
        self.store.with_conn(|c| {
            c.execute(
                "UPDATE service SET backend_id = $1, ip_address = $2, status = $3, error_message = NULL
                 WHERE id = $4",
                &[&backend_id, &ip_address, &status, &id],
            )
            .map(|_| ())
        })
    }

    pub fn set_error(&self, id: i32, message: &str) -> Result<()> {
        let status = ServiceStatus::Error.as_str();
        self.store.with_conn(|c| {
            c.execute(
                "UPDATE service SET status = $1, error_message = $2 WHERE id = $3",
                &[&status, &message, &id],
            )
            .map(|_| ())
        })
    }

    pub fn set_destroyed(&self, id: i32) -> Result<()> {
        let status = ServiceStatus::Destroyed.as_str();
        self.store.with_conn(|c| {
            c.execute(
                "UPDATE service SET status = $1, backend_id = NULL, ip_address = NULL WHERE id = $2",
                &[&status, &id],
            )
            .map(|_| ())
        })
    }

    pub fn update_backend_host(&self, id: i32, host: &str) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("UPDATE service SET backend_host = $1 WHERE id = $2", &[&host, &id])
                .map(|_| ())
        })
    }

    pub fn update_backend_status(&self, id: i32, status: BackendStatus) -> Result<()> {
        let status = status.as_str();
        self.store.with_conn(|c| {
            c.execute("UPDATE service SET backend_status = $1 WHERE id = $2", &[&status, &id])
                .map(|_| ())
        })
    }

    pub fn delete_by_execution(&self, execution_id: i32) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute("DELETE FROM service WHERE execution_id = $1", &[&execution_id])
                .map(|_| ())
        })
    }
}

fn from_row(row: &Row) -> Result<Service> {
    let status: String = row.get("status");
    let backend_status: String = row.get("backend_status");
    let description: serde_json::Value = row.get("description");
    Ok(Service {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        name: row.get("name"),
        unique_name: row.get("unique_name"),
        description: serde_json::from_value(description)?,
        essential: row.get("essential"),
        is_monitor: row.get("is_monitor"),
        status: status.parse()?,
        backend_status: backend_status.parse()?,
        backend_id: row.get("backend_id"),
        backend_host: row.get("backend_host"),
        ip_address: row.get("ip_address"),
        error_message: row.get("error_message"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_status_strings_round_trip() {
        for status in &[
            BackendStatus::Undefined,
            BackendStatus::Start,
            BackendStatus::Started,
            BackendStatus::Die,
            BackendStatus::Destroy,
        ] {
            assert_eq!(*status, status.as_str().parse::<BackendStatus>().unwrap());
        }
    }

    #[test]
    fn dns_name_is_namespaced_by_deployment() {
        let desc: ServiceDescription = serde_json::from_str(
            r#"{"name": "master", "docker_image": "img", "required_resources": {"memory": 1024}}"#,
        )
        .unwrap();
        let svc = Service {
            id: 7,
            execution_id: 42,
            name: "master".into(),
            unique_name: "master".into(),
            description: desc,
            essential: true,
            is_monitor: false,
            status: ServiceStatus::Created,
            backend_status: BackendStatus::Undefined,
            backend_id: None,
            backend_host: None,
            ip_address: None,
            error_message: None,
        };
        assert_eq!(svc.dns_name("prod"), "prod-master-42");
    }
}
