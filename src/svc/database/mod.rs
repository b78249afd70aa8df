//! # Database module
//!
//! This module drives the life of an instance's postgres: the initialization
//! of a fresh server and the cloning of another instance's data. Both wait
//! for the server to accept connections before issuing any statement.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
};
use kube::api::ObjectMeta;
use tokio_postgres::{config::SslMode, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use crate::svc::{
    blackduck::builder::{self, POSTGRES_PASSWORD_KEY},
    cfg,
    k8s::{client::ResourceClient, resource::ObjectKey},
    retry::{poll, Attempts, Outcome, Step},
};

pub mod statements;

// -----------------------------------------------------------------------------
// Constants

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SUPERUSER: &str = "postgres";
pub const DEFAULT_BACKOFF_LIMIT: i32 = 6;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect to database '{0}', {1}")]
    Connect(String, String),
    #[error("failed to execute statement on database '{0}', {1}")]
    Execute(String, String),
    #[error("failed to find the namespace of prototype instance '{0}'")]
    Prototype(String),
    #[error("failed to read postgres password of prototype instance '{0}', {1}")]
    Password(String, String),
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to clone database from '{0}', copy job did not succeed")]
    Clone(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

// -----------------------------------------------------------------------------
// Credentials structure

/// passwords of the three postgres roles an instance relies on
#[derive(PartialEq, Eq, Clone, Default)]
pub struct Credentials {
    pub admin: String,
    pub user: String,
    pub postgres: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("admin", &"<redacted>")
            .field("user", &"<redacted>")
            .field("postgres", &"<redacted>")
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Dsn structure

#[derive(PartialEq, Eq, Clone)]
pub struct Dsn {
    pub host: String,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl Dsn {
    pub fn new(host: &str, dbname: &str, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            dbname: dbname.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// returns the same target on another database
    pub fn with_dbname(&self, dbname: &str) -> Self {
        Self {
            dbname: dbname.to_string(),
            ..self.to_owned()
        }
    }

    fn config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .ssl_mode(SslMode::Disable)
            .connect_timeout(CONNECT_TIMEOUT);

        config
    }
}

impl Display for Dsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} dbname={} user={} password={} sslmode=disable connect_timeout={}",
            self.host,
            self.dbname,
            self.user,
            self.password,
            CONNECT_TIMEOUT.as_secs()
        )
    }
}

impl Debug for Dsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "host={} dbname={} user={}", self.host, self.dbname, self.user)
    }
}

/// returns the address of the instance's postgres service
pub fn host(key: &ObjectKey) -> String {
    format!("{}.{}.svc", builder::name(&key.name, "postgres"), key.namespace)
}

// -----------------------------------------------------------------------------
// Session and Connector traits

#[async_trait]
pub trait Session: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<(), Error>;

    /// returns if the query yields at least one row
    async fn exists(&self, query: &str) -> Result<bool, Error>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, dsn: &Dsn) -> Result<Box<dyn Session>, Error>;
}

// -----------------------------------------------------------------------------
// PostgresConnector structure

#[derive(Clone, Copy, Debug, Default)]
pub struct PostgresConnector;

struct PostgresSession {
    dbname: String,
    client: tokio_postgres::Client,
}

#[async_trait]
impl Connector for PostgresConnector {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn connect(&self, dsn: &Dsn) -> Result<Box<dyn Session>, Error> {
        let (client, connection) = dsn
            .config()
            .connect(NoTls)
            .await
            .map_err(|err| Error::Connect(dsn.dbname.to_owned(), err.to_string()))?;

        let dbname = dsn.dbname.to_owned();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(database = &dbname, error = err.to_string(), "Database connection closed with an error");
            }
        });

        Ok(Box::new(PostgresSession {
            dbname: dsn.dbname.to_owned(),
            client,
        }))
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn execute(&self, statement: &str) -> Result<(), Error> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(|err| Error::Execute(self.dbname.to_owned(), err.to_string()))
    }

    async fn exists(&self, query: &str) -> Result<bool, Error> {
        let messages = self
            .client
            .simple_query(query)
            .await
            .map_err(|err| Error::Execute(self.dbname.to_owned(), err.to_string()))?;

        Ok(messages
            .iter()
            .any(|message| matches!(message, SimpleQueryMessage::Row(_))))
    }
}

// -----------------------------------------------------------------------------
// Lifecycle trait

#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// set up databases and roles of a fresh server, skipped when the server
    /// was already initialized
    async fn initialize(&self, key: &ObjectKey, credentials: &Credentials) -> Result<(), Error>;

    /// copy the databases of the `prototype` instance into the instance ones
    async fn clone_database(
        &self,
        prototype: &str,
        key: &ObjectKey,
        credentials: &Credentials,
    ) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// Helper structure

pub struct Helper {
    client: Arc<dyn ResourceClient>,
    connector: Arc<dyn Connector>,
    config: cfg::Database,
}

impl Helper {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        connector: Arc<dyn Connector>,
        config: cfg::Database,
    ) -> Self {
        Self {
            client,
            connector,
            config,
        }
    }

    /// blocks until the server accepts connections and answers a ping, there
    /// is no bound on the number of attempts
    async fn wait(&self, dsn: &Dsn) -> Option<Box<dyn Session>> {
        let interval = Duration::from_secs(self.config.interval);

        poll(Attempts::Unbounded, interval, |attempt| {
            let connector = &self.connector;
            async move {
                let session = match connector.connect(dsn).await {
                    Ok(session) => session,
                    Err(err) => {
                        debug!(host = &dsn.host, attempt = attempt, error = err.to_string(), "Database is not reachable yet");
                        return Step::Retry;
                    }
                };

                match session.execute(statements::PING).await {
                    Ok(()) => Step::Ready(session),
                    Err(err) => {
                        debug!(host = &dsn.host, attempt = attempt, error = err.to_string(), "Database is not ready yet");
                        Step::Retry
                    }
                }
            }
        })
        .await
        .ready()
    }

    /// runs every statement, a failing statement is logged and skipped
    async fn run(&self, session: &dyn Session, database: &str, statements: &[String]) -> usize {
        let mut failures = 0;
        for statement in statements {
            if let Err(err) = session.execute(statement).await {
                failures += 1;
                warn!(database = database, error = err.to_string(), "Failed to execute initialization statement, continue");
            }
        }

        failures
    }
}

#[async_trait]
impl Lifecycle for Helper {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, credentials)))]
    async fn initialize(&self, key: &ObjectKey, credentials: &Credentials) -> Result<(), Error> {
        let dsn = Dsn::new(&host(key), SUPERUSER, SUPERUSER, &credentials.postgres);

        info!(namespace = &key.namespace, name = &key.name, host = &dsn.host, "Wait for database to accept connections");
        let Some(session) = self.wait(&dsn).await else {
            return Err(Error::Connect(dsn.dbname, "server never became reachable".into()));
        };

        if session.exists(statements::INITIALIZED).await? {
            info!(namespace = &key.namespace, name = &key.name, "Database is already initialized, skip initialization");
            return Ok(());
        }

        let mut failures = 0;
        for batch in statements::initialization(credentials) {
            failures += if batch.database == SUPERUSER {
                self.run(session.as_ref(), batch.database, &batch.statements).await
            } else {
                let target = dsn.with_dbname(batch.database);
                let Some(session) = self.wait(&target).await else {
                    return Err(Error::Connect(target.dbname, "server never became reachable".into()));
                };

                self.run(session.as_ref(), batch.database, &batch.statements).await
            };
        }

        info!(namespace = &key.namespace, name = &key.name, failures = failures, "Database initialized");
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, credentials)))]
    async fn clone_database(
        &self,
        prototype: &str,
        key: &ObjectKey,
        credentials: &Credentials,
    ) -> Result<(), Error> {
        let target = Dsn::new(&host(key), SUPERUSER, SUPERUSER, &credentials.postgres);
        info!(namespace = &key.namespace, name = &key.name, host = &target.host, "Wait for database to accept connections");
        if let Some(session) = self.wait(&target).await {
            if session.exists(statements::INITIALIZED).await? {
                info!(namespace = &key.namespace, name = &key.name, prototype = prototype, "Database already holds data, skip copy");
                return Ok(());
            }
        }

        let source = self
            .client
            .list_namespaces(&builder::namespace_label(prototype))
            .await?
            .into_iter()
            .find_map(|namespace| namespace.metadata.name)
            .ok_or_else(|| Error::Prototype(prototype.to_string()))?;

        let secret = self
            .client
            .get_secret(&source, &builder::credentials_name(prototype))
            .await?
            .ok_or_else(|| Error::Password(prototype.to_string(), "secret does not exist".into()))?;

        let password = secret
            .data
            .as_ref()
            .and_then(|data| data.get(POSTGRES_PASSWORD_KEY))
            .map(|value| String::from_utf8_lossy(&value.0).to_string())
            .ok_or_else(|| Error::Password(prototype.to_string(), format!("key '{POSTGRES_PASSWORD_KEY}' is missing")))?;

        let source = ObjectKey::new(source, prototype.to_string());
        let job = clone_job(&self.config.clone_image, &source, key, &password, credentials);
        let job_name = job.metadata.name.to_owned().unwrap_or_default();

        info!(namespace = &key.namespace, name = &key.name, prototype = prototype, job = &job_name, "Start database copy job");
        match self.client.create_job(&key.namespace, &job).await {
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(namespace = &key.namespace, job = &job_name, "Copy job already exists, wait for it");
            }
            result => result?,
        }

        let outcome = poll(
            Attempts::Bounded(self.config.clone_attempts),
            Duration::from_secs(self.config.clone_interval),
            |_| {
                let client = &self.client;
                let namespace = &key.namespace;
                let job_name = &job_name;
                async move {
                    match client.get_job(namespace, job_name).await {
                        Ok(Some(job)) if job_failed(&job) => {
                            warn!(namespace = namespace, job = job_name, "Copy job failed, give up");
                            Step::Abort
                        }
                        Ok(Some(job)) => {
                            let succeeded = job
                                .status
                                .and_then(|status| status.succeeded)
                                .unwrap_or(0);

                            if succeeded > 0 {
                                Step::Ready(())
                            } else {
                                Step::Retry
                            }
                        }
                        Ok(None) => Step::Abort,
                        Err(err) => {
                            warn!(namespace = namespace, job = job_name, error = err.to_string(), "Failed to read copy job");
                            Step::Retry
                        }
                    }
                }
            },
        )
        .await;

        self.client.delete_job(&key.namespace, &job_name).await?;
        if !matches!(outcome, Outcome::Ready(())) {
            return Err(Error::Clone(prototype.to_string()));
        }

        // roles were copied along with the data, so are their passwords
        let dsn = Dsn::new(&host(key), SUPERUSER, SUPERUSER, &password);
        let Some(session) = self.wait(&dsn).await else {
            return Err(Error::Connect(dsn.dbname, "server never became reachable".into()));
        };

        for statement in statements::credentials(credentials) {
            session.execute(&statement).await?;
        }

        info!(namespace = &key.namespace, name = &key.name, prototype = prototype, "Database cloned");
        Ok(())
    }
}

/// returns if the job reports a `Failed` condition or ran out of retries
fn job_failed(job: &Job) -> bool {
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|spec| spec.backoff_limit)
        .unwrap_or(DEFAULT_BACKOFF_LIMIT);

    job.status.as_ref().map_or(false, |status| {
        status.failed.unwrap_or(0) > backoff_limit
            || status.conditions.iter().flatten().any(|condition| {
                condition.type_ == "Failed" && condition.status == "True"
            })
    })
}

/// returns the job piping a dump of the source server into the target one
pub fn clone_job(
    image: &str,
    source: &ObjectKey,
    target: &ObjectKey,
    source_password: &str,
    credentials: &Credentials,
) -> Job {
    let name = builder::name(&target.name, "clone-job");
    let labels = builder::labels(&target.name, "clone-job");
    let command = format!(
        "pg_dumpall -h {} -U {SUPERUSER} | PGPASSWORD=\"$TARGET_PASSWORD\" psql -h {} -U {SUPERUSER}",
        host(source),
        host(target),
    );

    let env = BTreeMap::from([
        ("PGPASSWORD", source_password),
        ("TARGET_PASSWORD", credentials.postgres.as_str()),
    ])
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    })
    .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(target.namespace.to_owned()),
            labels: Some(labels.to_owned()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".into()),
                    containers: vec![Container {
                        name: "clone".into(),
                        image: Some(image.to_string()),
                        command: Some(vec!["/bin/bash".into(), "-c".into(), command]),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
