use std::collections::HashMap;
use std::sync::Mutex;

use postgres::{Client, NoTls};

use crate::application::AppDescription;
use crate::config::Config;

/// Executions, the unit of scheduling
pub mod execution;
pub use self::execution::{Execution, ExecutionFilter, ExecutionStatus, ExecutionTable};

/// Services, the containers of an execution
pub mod service;
pub use self::service::{BackendStatus, Service, ServiceFilter, ServiceStatus, ServiceTable};

/// Ports exposed by services
pub mod port;
pub use self::port::{Port, PortTable};

/// Users, roles and quotas
pub mod user;
pub use self::user::{AuthSource, User, UserTable};
pub mod role;
pub use self::role::{Role, RoleTable};
pub mod quota;
pub use self::quota::{Quota, QuotaTable};

/// The per-execution termination lock
pub mod lock;
pub use self::lock::TerminationLock;

/// Bump on every table change; `public.versions` gates startup on it
pub const SQL_SCHEMA_VERSION: i32 = 4;

// All main errors that can happen from the state store

// New failure error type
#[derive(Debug)]
pub struct StateError {
    inner: Context<StErrKind>,
}
// its associated enum
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum StErrKind {
    #[fail(display = "SQL schema version mismatch: need {}, found {}", _0, _1)]
    SchemaMismatch(i32, i32),

    #[fail(display = "state database for deployment '{}' is not initialized", _0)]
    SchemaMissing(String),

    #[fail(display = "could not connect to the state database")]
    ConnectionFailure,
}
use failure::{Backtrace, Context, Error, Fail, ResultExt};
use std::fmt::{self, Display};

// boilerplate error wrapping (might go away)
impl Fail for StateError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl StateError {
    pub fn kind(&self) -> &StErrKind {
        self.inner.get_context()
    }
}
impl From<StErrKind> for StateError {
    fn from(kind: StErrKind) -> StateError {
        StateError { inner: Context::new(kind) }
    }
}
impl From<Context<StErrKind>> for StateError {
    fn from(inner: Context<StErrKind>) -> StateError {
        StateError { inner }
    }
}
type Result<T> = std::result::Result<T, Error>;

/// Persistent, transactional record of everything Zoe knows
///
/// One logical operation is one transaction; a broken connection is repaired
/// transparently by retrying the operation once on a fresh connection. Every
/// connection gets its search path pinned to the deployment schema.
pub struct StateStore {
    params: String,
    schema: String,
    conn: Mutex<Client>,
    // termination locks, one per execution, shared by everyone who fetches it
    locks: Mutex<HashMap<i32, TerminationLock>>,
}

impl StateStore {
    /// Connect and refuse to serve unless the schema version matches
    pub fn connect(conf: &Config) -> Result<StateStore> {
        let store = Self::raw_connect(conf)?;
        store.check_schema_version()?;
        Ok(store)
    }

    /// Connect without the schema gate; only `init_db` should use this
    fn raw_connect(conf: &Config) -> Result<StateStore> {
        let params = format!(
            "host={} port={} user={} password={} dbname={}",
            conf.dbhost, conf.dbport, conf.dbuser, conf.dbpass, conf.dbname
        );
        let client = Self::open(&params, &conf.deployment_name).context(StErrKind::ConnectionFailure)?;
        Ok(StateStore {
            params,
            schema: conf.deployment_name.clone(),
            conn: Mutex::new(client),
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn open(params: &str, schema: &str) -> std::result::Result<Client, postgres::Error> {
        let mut client = Client::connect(params, NoTls)?;
        // deployment_name is validated by Config::verify, safe to interpolate
        client.batch_execute(&format!("SET search_path TO {},public", schema))?;
        Ok(client)
    }

    /// Run `op` on the shared connection, reconnecting once if it broke
    pub(crate) fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&mut Client) -> std::result::Result<T, postgres::Error>,
    {
        let mut guard = self.conn.lock().unwrap();
        match op(&mut guard) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_closed() {
                    warn!("State database connection lost, reconnecting");
                    *guard = Self::open(&self.params, &self.schema)?;
                    Ok(op(&mut guard)?)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn check_schema_version(&self) -> Result<()> {
        let found = self
            .with_conn(|c| {
                c.query_opt(
                    "SELECT version FROM public.versions WHERE deployment = $1",
                    &[&self.schema],
                )
            })
            .map_err(|_| StateError::from(StErrKind::SchemaMissing(self.schema.clone())))?;
        match found {
            None => Err(StateError::from(StErrKind::SchemaMissing(self.schema.clone())).into()),
            Some(row) => {
                let version: i32 = row.get(0);
                if version == SQL_SCHEMA_VERSION {
                    Ok(())
                } else {
                    Err(StateError::from(StErrKind::SchemaMismatch(SQL_SCHEMA_VERSION, version)).into())
                }
            }
        }
    }

    /// Initialize the per-deployment schema; running it twice is a no-op
    pub fn init_db(conf: &Config, force: bool) -> Result<()> {
        let store = Self::raw_connect(conf)?;
        let schema = store.schema.clone();
        store.with_conn(|c| {
            c.batch_execute("CREATE TABLE IF NOT EXISTS public.versions (deployment TEXT, version INTEGER)")
        })?;
        if force {
            info!("Dropping the whole schema for deployment {}", schema);
            store.with_conn(|c| {
                c.execute("DELETE FROM public.versions WHERE deployment = $1", &[&schema])?;
                c.batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            })?;
        }
        let row = store.with_conn(|c| {
            c.query_opt("SELECT version FROM public.versions WHERE deployment = $1", &[&schema])
        })?;
        match row {
            Some(row) => {
                let version: i32 = row.get(0);
                if version != SQL_SCHEMA_VERSION {
                    return Err(StateError::from(StErrKind::SchemaMismatch(SQL_SCHEMA_VERSION, version)).into());
                }
                debug!("Schema for deployment {} is already at version {}", schema, version);
            }
            None => {
                info!("Creating tables for deployment {}", schema);
                store.with_conn(|c| {
                    c.execute(
                        "INSERT INTO public.versions (deployment, version) VALUES ($1, $2)",
                        &[&schema, &SQL_SCHEMA_VERSION],
                    )?;
                    c.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))?;
                    c.batch_execute(&format!("SET search_path TO {},public", schema))
                })?;
                store.create_tables()?;
            }
        }
        Ok(())
    }

    pub fn create_tables(&self) -> Result<()> {
        self.quotas().create()?;
        self.roles().create()?;
        self.users().create()?;
        self.executions().create()?;
        self.services().create()?;
        self.ports().create()?;
        Ok(())
    }

    /// The per-execution termination lock; callers sharing an id share the lock
    pub fn termination_lock(&self, execution_id: i32) -> TerminationLock {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(execution_id).or_insert_with(TerminationLock::new).clone()
    }

    pub(crate) fn forget_lock(&self, execution_id: i32) {
        self.locks.lock().unwrap().remove(&execution_id);
    }

    pub fn executions(&self) -> ExecutionTable<'_> {
        ExecutionTable::new(self)
    }

    pub fn services(&self) -> ServiceTable<'_> {
        ServiceTable::new(self)
    }

    pub fn ports(&self) -> PortTable<'_> {
        PortTable::new(self)
    }

    pub fn users(&self) -> UserTable<'_> {
        UserTable::new(self)
    }

    pub fn roles(&self) -> RoleTable<'_> {
        RoleTable::new(self)
    }

    pub fn quotas(&self) -> QuotaTable<'_> {
        QuotaTable::new(self)
    }

    /// Materialize an execution with its services and ports from a description
    ///
    /// This is the submit path used by the API collaborator; one transaction
    /// covers the execution and everything it owns.
    pub fn create_execution(&self, name: &str, owner: &User, description: &AppDescription) -> Result<Execution> {
        description.verify()?;
        let desc_json = serde_json::to_value(description)?;
        let size = description.initial_size();
        let mut service_jsons = Vec::new();
        let mut port_jsons = Vec::new();
        for proc_ in &description.processes {
            service_jsons.push(serde_json::to_value(proc_)?);
            let mut ports = Vec::new();
            for port in &proc_.ports {
                ports.push(serde_json::to_value(port)?);
            }
            port_jsons.push(ports);
        }
        let exec_status = ExecutionStatus::Submitted.as_str();
        let svc_status = ServiceStatus::Created.as_str();
        let backend_status = BackendStatus::Undefined.as_str();

        let execution_id = self.with_conn(|c| {
            let mut tx = c.transaction()?;
            let row = tx.query_one(
                "INSERT INTO execution (name, user_id, description, status, size, time_submit)
                 VALUES ($1, $2, $3, $4, $5, now()) RETURNING id",
                &[&name, &owner.id, &desc_json, &exec_status, &size],
            )?;
            let execution_id: i32 = row.get(0);
            for (idx, proc_) in description.processes.iter().enumerate() {
                let service_row = tx.query_one(
                    "INSERT INTO service
                        (execution_id, name, unique_name, description, essential, is_monitor, status, backend_status)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
                    &[
                        &execution_id,
                        &proc_.name,
                        &proc_.name,
                        &service_jsons[idx],
                        &proc_.essential,
                        &proc_.monitor,
                        &svc_status,
                        &backend_status,
                    ],
                )?;
                let service_id: i32 = service_row.get(0);
                for (port, port_json) in proc_.ports.iter().zip(&port_jsons[idx]) {
                    let internal = i32::from(port.port_number);
                    let proto = port.backend_protocol();
                    tx.execute(
                        "INSERT INTO port (service_id, internal_number, protocol, description)
                         VALUES ($1, $2, $3, $4)",
                        &[&service_id, &internal, &proto, port_json],
                    )?;
                }
            }
            tx.commit()?;
            Ok(execution_id)
        })?;
        self.executions()
            .get(execution_id)?
            .ok_or_else(|| format_err!("freshly created execution {} vanished", execution_id))
    }
}
