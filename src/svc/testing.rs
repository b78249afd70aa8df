//! # Testing module
//!
//! This module provide in-memory implementations of the cluster, deployer,
//! database and probe seams so that the reconciliation logic can be exercised
//! without a cluster.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::{Job, JobStatus},
    core::v1::{Namespace, PersistentVolumeClaim, Secret, Service},
};
use kube::{api::ObjectMeta, core::ErrorResponse};
use serde_json::Value;

use crate::svc::{
    cfg::{self, Configuration},
    crd::blackduck::{Blackduck, BlackduckSpec},
    database::{self, statements, Connector, Credentials, Dsn, Lifecycle, Session},
    k8s::{
        client::ResourceClient,
        deployer::{self, Change, Deployer, Report},
        manifest::{Manifest, Object},
        recorder::Level,
        resource::ObjectKey,
    },
    prober::Probe,
};

// -----------------------------------------------------------------------------
// Helpers

pub fn instance(namespace: &str, name: &str) -> Blackduck {
    let mut obj = Blackduck::new(name, BlackduckSpec::default());
    obj.metadata.namespace = Some(namespace.to_string());
    obj
}

pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// returns a configuration with short polling intervals
pub fn configuration() -> Configuration {
    Configuration {
        operator: cfg::Operator {
            namespace: cfg::OPERATOR_NAMESPACE.into(),
            listen: ([127, 0, 0, 1], 8000).into(),
            workers: 2,
            resync: 300,
            cluster_scoped: true,
            credentials: cfg::OPERATOR_CREDENTIALS.into(),
        },
        queue: cfg::Queue {
            base_delay: 5,
            max_delay: 10,
            max_retries: 3,
        },
        prober: cfg::Prober {
            attempts: 3,
            interval: 1,
            timeout: 1,
            path: cfg::PROBER_PATH.into(),
        },
        network: cfg::Network {
            attempts: 2,
            interval: 1,
        },
        database: cfg::Database {
            interval: 1,
            clone_attempts: 3,
            clone_interval: 1,
            clone_image: cfg::CLONE_IMAGE.into(),
        },
        defaults: cfg::Defaults {
            version: None,
            size: "small".into(),
            expose_service: "LoadBalancer".into(),
            persistent_storage: false,
            liveness_probes: false,
            certificate_name: "default".into(),
            pvc_storage_class: None,
        },
        sentry: cfg::Sentry::default(),
    }
}

/// returns a kubernetes api error with the given status code
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("{reason} (injected)"),
        reason: reason.into(),
        code,
    })
}

/// returns if the labels match a selector made of `key=value` and `key` terms
pub fn matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.to_owned().unwrap_or_default()
}

// -----------------------------------------------------------------------------
// FakeClient structure

#[derive(Clone, Debug, Default)]
pub struct ClientState {
    pub instances: BTreeMap<ObjectKey, Blackduck>,
    pub namespaces: BTreeMap<String, Namespace>,
    pub secrets: BTreeMap<(String, String), Secret>,
    pub services: BTreeMap<(String, String), Service>,
    pub routes: BTreeMap<(String, String), String>,
    pub claims: Vec<PersistentVolumeClaim>,
    pub jobs: BTreeMap<(String, String), Job>,
    pub job_status: Option<JobStatus>,
    pub created_jobs: Vec<String>,
    pub deleted_namespaces: Vec<String>,
    pub deleted_volumes: Vec<String>,
    /// `(level, action, message)` of recorded events
    pub events: Vec<(String, String, String)>,
    pub writes: usize,
    pub crd_deleted: bool,
}

#[derive(Debug, Default)]
pub struct FakeClient {
    state: Mutex<ClientState>,
}

impl FakeClient {
    pub fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn with_state<F>(&self, f: F)
    where
        F: FnOnce(&mut ClientState),
    {
        f(&mut self.state())
    }
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn get_instance(&self, key: &ObjectKey) -> Result<Option<Blackduck>, kube::Error> {
        Ok(self.state().instances.get(key).cloned())
    }

    async fn patch_instance_status(
        &self,
        origin: &Blackduck,
        modified: &Blackduck,
    ) -> Result<(), kube::Error> {
        if origin.status == modified.status {
            return Ok(());
        }

        let mut state = self.state();
        state.writes += 1;
        if let Some(key) = ObjectKey::of(modified) {
            if let Some(obj) = state.instances.get_mut(&key) {
                obj.status = modified.status.to_owned();
            }
        }

        Ok(())
    }

    async fn crd_active(&self) -> Result<bool, kube::Error> {
        Ok(!self.state().crd_deleted)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        Ok(self.state().namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>, kube::Error> {
        Ok(self
            .state()
            .namespaces
            .values()
            .filter(|namespace| matches(&labels_of(&namespace.metadata), selector))
            .cloned()
            .collect())
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<(), kube::Error> {
        let mut state = self.state();
        state.writes += 1;

        let obj = state
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| namespace(name, &[]));

        let current = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            match value {
                Some(value) => current.insert(key, value),
                None => current.remove(&key),
            };
        }

        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state();
        state.namespaces.remove(name);
        state.deleted_namespaces.push(name.to_string());
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Ok(self
            .state()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        Ok(self
            .state()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_route_host(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, kube::Error> {
        Ok(self
            .state()
            .routes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, kube::Error> {
        Ok(self
            .state()
            .claims
            .iter()
            .filter(|claim| claim.metadata.namespace.as_deref() == Some(namespace))
            .filter(|claim| matches(&labels_of(&claim.metadata), selector))
            .cloned()
            .collect())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<(), kube::Error> {
        self.state().deleted_volumes.push(name.to_string());
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error> {
        let name = job.metadata.name.to_owned().unwrap_or_default();
        let mut state = self.state();

        let key = (namespace.to_string(), name.to_owned());
        if state.jobs.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }

        state.jobs.insert(key, job.to_owned());
        state.created_jobs.push(format!("{namespace}/{name}"));
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        let state = self.state();

        Ok(state
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .map(|mut job| {
                job.status = state.job_status.to_owned();
                job
            }))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.state()
            .jobs
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn record_event(
        &self,
        _obj: &Blackduck,
        level: Level,
        action: &str,
        message: &str,
    ) -> Result<(), kube::Error> {
        self.state()
            .events
            .push((level.to_string(), action.to_string(), message.to_string()));
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// FakeDeployer structure

#[derive(Clone, Debug, Default)]
pub struct DeployerState {
    /// live objects keyed by namespace and `Kind/name` reference
    pub objects: BTreeMap<(String, String), (BTreeMap<String, String>, Value)>,
    pub writes: usize,
    /// references whose apply is answered with an error
    pub failing: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct FakeDeployer {
    state: Mutex<DeployerState>,
}

impl FakeDeployer {
    pub fn state(&self) -> MutexGuard<'_, DeployerState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn with_state<F>(&self, f: F)
    where
        F: FnOnce(&mut DeployerState),
    {
        f(&mut self.state())
    }

    /// returns the `Kind/name` references live in the namespace
    pub fn references(&self, namespace: &str) -> BTreeSet<String> {
        self.state()
            .objects
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, reference)| reference.to_owned())
            .collect()
    }
}

fn serialize(object: &Object) -> Value {
    let value = match object {
        Object::Secret(obj) => serde_json::to_value(obj),
        Object::ConfigMap(obj) => serde_json::to_value(obj),
        Object::ServiceAccount(obj) => serde_json::to_value(obj),
        Object::PersistentVolumeClaim(obj) => serde_json::to_value(obj),
        Object::Service(obj) => serde_json::to_value(obj),
        Object::Deployment(obj) => serde_json::to_value(obj),
        Object::Route(obj) => serde_json::to_value(obj),
    };

    value.unwrap_or(Value::Null)
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn apply(&self, namespace: &str, manifests: &[Manifest]) -> Result<Report, deployer::Error> {
        let mut state = self.state();
        let mut report = Report::default();

        for manifest in manifests {
            let reference = manifest.reference();
            if state.failing.contains(&reference) {
                return Err(deployer::Error::Apply(reference, api_error(500, "InternalError")));
            }

            let value = serialize(&manifest.object);
            let labels: BTreeMap<String, String> = value
                .pointer("/metadata/labels")
                .and_then(|labels| serde_json::from_value(labels.to_owned()).ok())
                .unwrap_or_default();

            let key = (namespace.to_string(), reference.to_owned());
            let change = match state.objects.get(&key) {
                None => Change::Created,
                Some((_, existing)) if existing == &value => Change::Unchanged,
                Some(_) => Change::Updated,
            };

            if change != Change::Unchanged {
                state.writes += 1;
                state.objects.insert(key, (labels, value));
            }

            report.record(reference, change);
        }

        Ok(report)
    }

    async fn prune(
        &self,
        namespace: &str,
        selector: &str,
        keep: &[Manifest],
    ) -> Result<Report, deployer::Error> {
        let mut state = self.state();
        let keep: HashSet<String> = keep.iter().map(Manifest::reference).collect();

        let deleted: Vec<(String, String)> = state
            .objects
            .iter()
            .filter(|((ns, reference), (labels, _))| {
                ns == namespace && !keep.contains(reference) && matches(labels, selector)
            })
            .map(|(key, _)| key.to_owned())
            .collect();

        let mut report = Report::default();
        for key in deleted {
            state.objects.remove(&key);
            state.writes += 1;
            report.deleted.push(key.1);
        }

        Ok(report)
    }
}

// -----------------------------------------------------------------------------
// FakeConnector structure

#[derive(Clone, Debug, Default)]
pub struct DatabaseState {
    pub databases: BTreeSet<String>,
    /// `(database, statement)` in execution order
    pub executed: Vec<(String, String)>,
    pub passwords: BTreeMap<String, String>,
    /// `user:password` of each successful connection
    pub logins: Vec<String>,
    /// databases holding their own settings
    pub configured: BTreeSet<String>,
    /// number of connection attempts to refuse before accepting
    pub unreachable: u32,
    /// same as `unreachable`, for a single database
    pub refused: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<DatabaseState>>,
}

impl FakeConnector {
    pub fn unreachable(attempts: u32) -> Self {
        let connector = Self::default();
        connector.with_state(|state| state.unreachable = attempts);
        connector
    }

    pub fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn with_state<F>(&self, f: F)
    where
        F: FnOnce(&mut DatabaseState),
    {
        f(&mut self.state())
    }
}

struct FakeSession {
    dbname: String,
    state: Arc<Mutex<DatabaseState>>,
}

impl FakeSession {
    fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, dsn: &Dsn) -> Result<Box<dyn Session>, database::Error> {
        let mut state = self.state();
        if state.unreachable > 0 {
            state.unreachable -= 1;
            return Err(database::Error::Connect(dsn.dbname.to_owned(), "connection refused".into()));
        }

        if let Some(refusals) = state.refused.get_mut(&dsn.dbname).filter(|refusals| **refusals > 0) {
            *refusals -= 1;
            return Err(database::Error::Connect(dsn.dbname.to_owned(), "transient".into()));
        }

        state.logins.push(format!("{}:{}", dsn.user, dsn.password));
        Ok(Box::new(FakeSession {
            dbname: dsn.dbname.to_owned(),
            state: self.state.to_owned(),
        }))
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&self, statement: &str) -> Result<(), database::Error> {
        let mut state = self.state();
        state.executed.push((self.dbname.to_owned(), statement.to_string()));

        if let Some(rest) = statement.strip_prefix("CREATE DATABASE ") {
            if let Some(name) = rest.split_whitespace().next() {
                state.databases.insert(name.to_string());
            }
        }

        if let Some((database, _)) = statement
            .strip_prefix("ALTER DATABASE ")
            .and_then(|rest| rest.split_once(" SET "))
        {
            state.configured.insert(database.to_string());
        }

        if let Some((user, password)) = statement
            .strip_prefix("ALTER USER ")
            .and_then(|rest| rest.split_once(" WITH password "))
        {
            let password = password
                .trim_end_matches(';')
                .trim_matches('\'')
                .replace("''", "'");
            state.passwords.insert(user.to_string(), password);
        }

        Ok(())
    }

    async fn exists(&self, query: &str) -> Result<bool, database::Error> {
        Ok(query == statements::INITIALIZED && self.state().configured.contains("bdio"))
    }
}

// -----------------------------------------------------------------------------
// FakeProbe structure

#[derive(Debug, Default)]
pub struct FakeProbe {
    answers: Mutex<VecDeque<bool>>,
    fallback: bool,
    calls: AtomicUsize,
}

impl From<Vec<bool>> for FakeProbe {
    fn from(answers: Vec<bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            fallback: false,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self {
            fallback: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn probe(&self, _address: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

// -----------------------------------------------------------------------------
// FakeLifecycle structure

#[derive(Clone, Debug, Default)]
pub struct LifecycleState {
    pub initialized: Vec<ObjectKey>,
    /// `(prototype, target)` of each clone
    pub cloned: Vec<(String, ObjectKey)>,
    pub fail: bool,
}

#[derive(Debug, Default)]
pub struct FakeLifecycle {
    state: Mutex<LifecycleState>,
}

impl FakeLifecycle {
    pub fn state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl Lifecycle for FakeLifecycle {
    async fn initialize(&self, key: &ObjectKey, _credentials: &Credentials) -> Result<(), database::Error> {
        let mut state = self.state();
        if state.fail {
            return Err(database::Error::Connect("postgres".into(), "connection refused".into()));
        }

        state.initialized.push(key.to_owned());
        Ok(())
    }

    async fn clone_database(
        &self,
        prototype: &str,
        key: &ObjectKey,
        _credentials: &Credentials,
    ) -> Result<(), database::Error> {
        let mut state = self.state();
        if state.fail {
            return Err(database::Error::Clone(prototype.to_string()));
        }

        state.cloned.push((prototype.to_string(), key.to_owned()));
        Ok(())
    }
}
