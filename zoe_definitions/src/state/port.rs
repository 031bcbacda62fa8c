use postgres::Row;

use super::StateStore;
use crate::structs::PortDescription;
use crate::Result;

/// A port of a service, with its external mapping once the container runs
#[derive(Clone, Debug)]
pub struct Port {
    pub id: i32,
    pub service_id: i32,
    pub internal_number: i32,
    pub protocol: String,
    pub description: PortDescription,
    pub external_ip: Option<String>,
    pub external_port: Option<i32>,
}

impl Port {
    pub fn is_main_endpoint(&self) -> bool {
        self.description.is_main_endpoint
    }
}

pub struct PortTable<'a> {
    store: &'a StateStore,
}

impl<'a> PortTable<'a> {
    pub(super) fn new(store: &'a StateStore) -> PortTable<'a> {
        PortTable { store }
    }

    pub fn create(&self) -> Result<()> {
        self.store.with_conn(|c| {
            c.batch_execute(
                "CREATE TABLE IF NOT EXISTS port (
                    id SERIAL PRIMARY KEY,
                    service_id INTEGER NOT NULL REFERENCES service(id) ON DELETE CASCADE,
                    internal_number INTEGER NOT NULL,
                    protocol TEXT NOT NULL,
                    description JSONB NOT NULL,
                    external_ip TEXT,
                    external_port INTEGER
                )",
            )
        })
    }

    pub fn by_service(&self, service_id: i32) -> Result<Vec<Port>> {
        let rows = self.store.with_conn(|c| {
            c.query("SELECT * FROM port WHERE service_id = $1 ORDER BY id", &[&service_id])
        })?;
        rows.iter().map(from_row).collect()
    }

    pub fn insert(&self, service_id: i32, description: &PortDescription) -> Result<Port> {
        let desc_json = serde_json::to_value(description)?;
        let internal = i32::from(description.port_number);
        let proto = description.backend_protocol();
        let row = self.store.with_conn(|c| {
            c.query_one(
                "INSERT INTO port (service_id, internal_number, protocol, description)
                 VALUES ($1, $2, $3, $4) RETURNING *",
                &[&service_id, &internal, &proto, &desc_json],
            )
        })?;
        from_row(&row)
    }

    /// Record the host mapping the backend picked for a port
    pub fn set_external(&self, id: i32, ip: &str, port: i32) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute(
                "UPDATE port SET external_ip = $1, external_port = $2 WHERE id = $3",
                &[&ip, &port, &id],
            )
            .map(|_| ())
        })
    }

    /// Forget the mapping when the container goes away
    pub fn clear_external(&self, service_id: i32) -> Result<()> {
        self.store.with_conn(|c| {
            c.execute(
                "UPDATE port SET external_ip = NULL, external_port = NULL WHERE service_id = $1",
                &[&service_id],
            )
            .map(|_| ())
        })
    }
}

fn from_row(row: &Row) -> Result<Port> {
    let description: serde_json::Value = row.get("description");
    Ok(Port {
        id: row.get("id"),
        service_id: row.get("service_id"),
        internal_number: row.get("internal_number"),
        protocol: row.get("protocol"),
        description: serde_json::from_value(description)?,
        external_ip: row.get("external_ip"),
        external_port: row.get("external_port"),
    })
}
