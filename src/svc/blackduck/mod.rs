//! # Black Duck module
//!
//! This module provide the reconciler of the black duck custom resource. It
//! drives an instance through its lifecycle: the spec is merged with the
//! operator defaults, the deployment plan is applied group by group, the
//! database is initialized or cloned on the first deployment, and the web
//! server is probed before the instance is reported as running.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use tracing::{debug, info, warn};

use crate::svc::{
    blackduck::{
        builder::{ResourceBuilder, StandardBuilder},
        catalog::Catalog,
        defaults::{Defaults, Resolved},
    },
    cfg::Configuration,
    crd::blackduck::{Blackduck, BlackduckStatus, DesiredState, ExposeService, State},
    database::{self, Credentials, Lifecycle},
    k8s::{
        self,
        client::ResourceClient,
        deployer::{self, Deployer},
        manifest::Group,
        recorder::Level,
        resource::ObjectKey,
    },
    prober::{self, Probe},
    retry::{poll, Attempts, Step},
};

pub mod builder;
pub mod catalog;
pub mod defaults;
pub mod flavor;

// -----------------------------------------------------------------------------
// Constants

/// keys of the operator-wide credentials secret
pub const OPERATOR_ADMIN_PASSWORD: &str = "ADMIN_PASSWORD";
pub const OPERATOR_USER_PASSWORD: &str = "USER_PASSWORD";
pub const OPERATOR_POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";

pub const NODE_ADDRESS_PLACEHOLDER: &str = "<<NODE_IP_ADDRESS>>";

// -----------------------------------------------------------------------------
// BlackduckAction enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum BlackduckAction {
    Deploy,
    Stop,
    Migrate,
    InitializeDatabase,
    CloneDatabase,
    Ready,
    Failed,
}

impl Display for BlackduckAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => write!(f, "Deploy"),
            Self::Stop => write!(f, "Stop"),
            Self::Migrate => write!(f, "Migrate"),
            Self::InitializeDatabase => write!(f, "InitializeDatabase"),
            Self::CloneDatabase => write!(f, "CloneDatabase"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enumeration

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to resolve black duck spec, {0}")]
    Resolve(defaults::Error),
    #[error("failed to compute deployment plan, {0}")]
    Build(builder::Error),
    #[error("failed to deploy manifests, {0}")]
    Deploy(deployer::Error),
    #[error("failed to set up database, {0}")]
    Database(database::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to resolve database credentials, no {0} is available")]
    Credentials(&'static str),
}

impl ReconcilerError {
    /// returns if the error comes from the spec itself, retrying without a
    /// spec change would fail the same way
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Resolve(_) | Self::Build(_))
    }
}

impl From<defaults::Error> for ReconcilerError {
    fn from(err: defaults::Error) -> Self {
        Self::Resolve(err)
    }
}

impl From<builder::Error> for ReconcilerError {
    fn from(err: builder::Error) -> Self {
        Self::Build(err)
    }
}

impl From<deployer::Error> for ReconcilerError {
    fn from(err: deployer::Error) -> Self {
        Self::Deploy(err)
    }
}

impl From<database::Error> for ReconcilerError {
    fn from(err: database::Error) -> Self {
        Self::Database(err)
    }
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

// -----------------------------------------------------------------------------
// Observed structure

/// addresses read back from the cluster once the plan is applied
#[derive(PartialEq, Eq, Clone, Debug, Default)]
struct Observed {
    ip: Option<String>,
    fqdn: Option<String>,
    volumes: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler {
    client: Arc<dyn ResourceClient>,
    deployer: Arc<dyn Deployer>,
    lifecycle: Arc<dyn Lifecycle>,
    probe: Arc<dyn Probe>,
    builder: Arc<dyn ResourceBuilder>,
    defaults: Defaults,
    catalog: Catalog,
    config: Arc<Configuration>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        deployer: Arc<dyn Deployer>,
        lifecycle: Arc<dyn Lifecycle>,
        probe: Arc<dyn Probe>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            client,
            deployer,
            lifecycle,
            probe,
            builder: Arc::new(StandardBuilder),
            defaults: Defaults::from(&config.defaults),
            catalog: Catalog::default(),
            config,
        }
    }

    /// re-reads the instance and writes its status when `f` changed it.
    /// Returns none if the instance no longer exists.
    async fn write_status<F>(&self, key: &ObjectKey, f: F) -> Result<Option<Blackduck>, ReconcilerError>
    where
        F: FnOnce(&mut BlackduckStatus) + Send,
    {
        let Some(origin) = self.client.get_instance(key).await? else {
            debug!(namespace = &key.namespace, name = &key.name, "Instance no longer exists, skip status update");
            return Ok(None);
        };

        let mut modified = origin.to_owned();
        f(modified.status.get_or_insert_with(BlackduckStatus::default));

        if origin.status != modified.status {
            debug!(namespace = &key.namespace, name = &key.name, "Update status of custom resource");
            self.client.patch_instance_status(&origin, &modified).await?;
        }

        Ok(Some(modified))
    }

    async fn transition(&self, key: &ObjectKey, state: State) -> Result<(), ReconcilerError> {
        info!(namespace = &key.namespace, name = &key.name, state = %state, "Transition custom resource");
        self.write_status(key, |status| {
            status.state = Some(state);
            status.error_message = None;
        })
        .await
        .map(|_| ())
    }

    async fn record(
        &self,
        obj: &Blackduck,
        level: Level,
        action: BlackduckAction,
        message: &str,
    ) -> Result<(), ReconcilerError> {
        self.client
            .record_event(obj, level, &action.to_string(), message)
            .await
            .map_err(ReconcilerError::from)
    }

    /// moves the instance to the error state, keeping the error text
    async fn fail(&self, key: &ObjectKey, obj: &Blackduck, err: &ReconcilerError) -> Result<(), ReconcilerError> {
        let message = err.to_string();
        warn!(namespace = &key.namespace, name = &key.name, error = &message, "Failed to reconcile custom resource, set error state");

        self.write_status(key, |status| {
            status.state = Some(State::Error);
            status.error_message = Some(message.to_owned());
        })
        .await?;

        self.record(obj, Level::Warning, BlackduckAction::Failed, &message).await
    }

    async fn run(&self, key: &ObjectKey, obj: &Blackduck) -> Result<(), ReconcilerError> {
        // ---------------------------------------------------------------------
        // Step 1: merge the spec with the defaults

        let resolved = self.defaults.resolve(&obj.spec, &self.catalog)?;

        // the cached object may lag behind, decisions are taken on a fresh read
        let Some(current) = self.client.get_instance(key).await? else {
            debug!(namespace = &key.namespace, name = &key.name, "Instance no longer exists, skip reconciliation");
            return Ok(());
        };

        // ---------------------------------------------------------------------
        // Step 2: dispatch on the desired state

        match resolved.spec.desired_state {
            DesiredState::Stop => self.stop(key, obj, current.state(), &resolved).await,
            DesiredState::DbMigrate => self.migrate(key, obj, current.state(), &resolved).await,
            DesiredState::Start => self.start(key, obj, current.state(), &resolved).await,
        }
    }

    async fn stop(
        &self,
        key: &ObjectKey,
        obj: &Blackduck,
        prior: Option<State>,
        resolved: &Resolved,
    ) -> Result<(), ReconcilerError> {
        if prior == Some(State::Stopped) {
            debug!(namespace = &key.namespace, name = &key.name, "Instance is already stopped");
            return Ok(());
        }

        // objects are kept by name only, so placeholder credentials are enough
        let plan = self.builder.build(obj, resolved, &Credentials::default())?;
        let credentials = format!("Secret/{}", builder::credentials_name(&key.name));
        let keep: Vec<_> = plan
            .manifests()
            .iter()
            .filter(|manifest| manifest.group == Group::Storage || manifest.reference() == credentials)
            .cloned()
            .collect();

        info!(namespace = &key.namespace, name = &key.name, "Remove every owned object but persistent volume claims and database credentials");
        let report = self
            .deployer
            .prune(&key.namespace, &builder::selector(&key.name), &keep)
            .await?;

        self.transition(key, State::Stopped).await?;
        if report.changed() {
            let message = format!("Stop instance, delete {} object(s)", report.deleted.len());
            self.record(obj, Level::Normal, BlackduckAction::Stop, &message).await?;
        }

        Ok(())
    }

    async fn migrate(
        &self,
        key: &ObjectKey,
        obj: &Blackduck,
        prior: Option<State>,
        resolved: &Resolved,
    ) -> Result<(), ReconcilerError> {
        if prior == Some(State::DbMigration) {
            debug!(namespace = &key.namespace, name = &key.name, "Instance is already in database migration");
            return Ok(());
        }

        let credentials = self.credentials(key, resolved).await?;
        let plan = self.builder.build(obj, resolved, &credentials)?;

        // the database still needs its configuration and account to run
        let keep = plan.select(&[Group::Configuration, Group::Storage, Group::Database]);

        info!(namespace = &key.namespace, name = &key.name, "Remove every owned object but the database and its storage");
        let mut report = self
            .deployer
            .prune(&key.namespace, &builder::selector(&key.name), &keep)
            .await?;
        report.merge(self.deployer.apply(&key.namespace, &keep).await?);

        self.transition(key, State::DbMigration).await?;
        if report.changed() {
            let message = format!(
                "Keep database only, create {} update {} delete {} object(s)",
                report.created.len(),
                report.updated.len(),
                report.deleted.len()
            );
            self.record(obj, Level::Normal, BlackduckAction::Migrate, &message).await?;
        }

        Ok(())
    }

    async fn start(
        &self,
        key: &ObjectKey,
        obj: &Blackduck,
        prior: Option<State>,
        resolved: &Resolved,
    ) -> Result<(), ReconcilerError> {
        let namespace = &key.namespace;

        // ---------------------------------------------------------------------
        // Step 1: claim the namespace

        self.label_namespace(key, resolved.release.version).await?;

        if prior != Some(State::Running) {
            self.transition(key, State::Starting).await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: compute the deployment plan

        let credentials = self.credentials(key, resolved).await?;
        let plan = self.builder.build(obj, resolved, &credentials)?;

        // ---------------------------------------------------------------------
        // Step 3: apply configuration, storage and database

        info!(namespace = namespace, name = &key.name, version = resolved.release.version, "Apply configuration and storage manifests");
        let mut report = self
            .deployer
            .apply(namespace, &plan.select(&[Group::Configuration, Group::Storage]))
            .await?;

        if resolved.external_database().is_none() {
            info!(namespace = namespace, name = &key.name, "Apply database manifests");
            report.merge(self.deployer.apply(namespace, &plan.select(&[Group::Database])).await?);

            // -----------------------------------------------------------------
            // Step 4: set up the database on the first deployment

            if prior != Some(State::Running) {
                match resolved.spec.db_prototype.as_deref().filter(|name| !name.is_empty()) {
                    Some(prototype) => {
                        info!(namespace = namespace, name = &key.name, prototype = prototype, "Clone database of prototype instance");
                        self.lifecycle.clone_database(prototype, key, &credentials).await?;

                        let message = format!("Clone database of instance '{prototype}'");
                        self.record(obj, Level::Normal, BlackduckAction::CloneDatabase, &message).await?;
                    }
                    None => {
                        info!(namespace = namespace, name = &key.name, "Initialize database");
                        self.lifecycle.initialize(key, &credentials).await?;
                        self.record(obj, Level::Normal, BlackduckAction::InitializeDatabase, "Initialize database").await?;
                    }
                }
            }
        }

        // ---------------------------------------------------------------------
        // Step 5: apply workloads and exposure

        info!(namespace = namespace, name = &key.name, "Apply workload and exposure manifests");
        report.merge(
            self.deployer
                .apply(namespace, &plan.select(&[Group::Workload, Group::Exposure]))
                .await?,
        );

        if report.changed() {
            let message = format!(
                "Deploy version '{}', create {} update {} object(s)",
                resolved.release.version,
                report.created.len(),
                report.updated.len()
            );
            self.record(obj, Level::Normal, BlackduckAction::Deploy, &message).await?;
        }

        // ---------------------------------------------------------------------
        // Step 6: observe addresses and probe the web server

        let observed = self.observe(key, resolved).await;

        let healthy = prober::verify(
            self.probe.to_owned(),
            self.client.to_owned(),
            key,
            &prober::address(key),
            self.config.prober.attempts,
            Duration::from_secs(self.config.prober.interval),
        )
        .await;

        let updated = self
            .write_status(key, |status| {
                if observed.ip.is_some() {
                    status.ip = observed.ip.to_owned();
                }
                if observed.fqdn.is_some() {
                    status.fqdn = observed.fqdn.to_owned();
                }
                status.pvc_volume_name.extend(observed.volumes.to_owned());

                if healthy {
                    status.state = Some(State::Running);
                    status.error_message = None;
                }
            })
            .await?;

        if healthy && prior != Some(State::Running) && updated.is_some() {
            info!(namespace = namespace, name = &key.name, "Instance is running");
            self.record(obj, Level::Normal, BlackduckAction::Ready, "Instance is running").await?;
        }

        Ok(())
    }

    /// sets `synopsys.com/blackduck.<name>=<version>` on the namespace
    async fn label_namespace(&self, key: &ObjectKey, version: &str) -> Result<(), ReconcilerError> {
        let label = builder::namespace_label(&key.name);
        let current = self
            .client
            .get_namespace(&key.namespace)
            .await?
            .and_then(|namespace| namespace.metadata.labels)
            .and_then(|labels| labels.get(&label).cloned());

        if current.as_deref() == Some(version) {
            return Ok(());
        }

        debug!(namespace = &key.namespace, name = &key.name, label = &label, version = version, "Label namespace");
        self.client
            .patch_namespace_labels(
                &key.namespace,
                BTreeMap::from([(label, Some(version.to_string()))]),
            )
            .await?;

        Ok(())
    }

    /// resolves each password from the instance's stored secret, then the
    /// external database block or the spec, then the operator-wide secret
    async fn credentials(&self, key: &ObjectKey, resolved: &Resolved) -> Result<Credentials, ReconcilerError> {
        let stored = self
            .client
            .get_secret(&key.namespace, &builder::credentials_name(&key.name))
            .await?;

        let operator = self
            .client
            .get_secret(&self.config.operator.namespace, &self.config.operator.credentials)
            .await?;

        let spec = &resolved.spec;
        let external = resolved.external_database();

        let admin = read(&stored, builder::ADMIN_PASSWORD_KEY)
            .or_else(|| external.and_then(|external| external.admin_password.to_owned()))
            .or_else(|| spec.admin_password.to_owned())
            .or_else(|| read(&operator, OPERATOR_ADMIN_PASSWORD))
            .ok_or(ReconcilerError::Credentials("admin password"))?;

        let user = read(&stored, builder::USER_PASSWORD_KEY)
            .or_else(|| external.and_then(|external| external.user_password.to_owned()))
            .or_else(|| spec.user_password.to_owned())
            .or_else(|| read(&operator, OPERATOR_USER_PASSWORD))
            .ok_or(ReconcilerError::Credentials("user password"))?;

        let postgres = match external {
            Some(_) => String::new(),
            None => read(&stored, builder::POSTGRES_PASSWORD_KEY)
                .or_else(|| spec.postgres_password.to_owned())
                .or_else(|| read(&operator, OPERATOR_POSTGRES_PASSWORD))
                .ok_or(ReconcilerError::Credentials("postgres password"))?,
        };

        Ok(Credentials {
            admin,
            user,
            postgres,
        })
    }

    async fn observe(&self, key: &ObjectKey, resolved: &Resolved) -> Observed {
        let attempts = Attempts::Bounded(self.config.network.attempts);
        let interval = Duration::from_secs(self.config.network.interval);
        let expose = resolved.expose;
        let exposed = builder::exposed_name(&key.name);

        let mut observed = Observed::default();
        if expose != ExposeService::None {
            let address = poll(attempts, interval, |attempt| {
                let client = &self.client;
                let exposed = &exposed;
                async move {
                    let address = match expose {
                        ExposeService::OpenShift => client.get_route_host(&key.namespace, exposed).await,
                        _ => client
                            .get_service(&key.namespace, exposed)
                            .await
                            .map(|service| service.and_then(|service| service_address(&service, expose))),
                    };

                    match address {
                        Ok(Some(address)) => Step::Ready(address),
                        Ok(None) => {
                            debug!(namespace = &key.namespace, service = exposed, attempt = attempt, "Address is not assigned yet");
                            Step::Retry
                        }
                        Err(err) => {
                            debug!(namespace = &key.namespace, service = exposed, attempt = attempt, error = err.to_string(), "Failed to read exposed address");
                            Step::Retry
                        }
                    }
                }
            })
            .await
            .ready();

            match address {
                None => warn!(namespace = &key.namespace, name = &key.name, "Exposed address is still not assigned after all attempts"),
                Some(address) if expose == ExposeService::OpenShift => {
                    observed.ip = Some(address.to_owned());
                    observed.fqdn = Some(address);
                }
                Some(address) => observed.ip = Some(address),
            }
        }

        if resolved.persistent_storage {
            let selector = format!("{},component=pvc", builder::selector(&key.name));
            let claims = poll(attempts, interval, |_| {
                let client = &self.client;
                let selector = &selector;
                async move {
                    match client.list_persistent_volume_claims(&key.namespace, selector).await {
                        Ok(claims) if claims.iter().all(|claim| bound(claim).is_some()) => Step::Ready(claims),
                        Ok(_) => Step::Retry,
                        Err(err) => {
                            debug!(namespace = &key.namespace, error = err.to_string(), "Failed to list persistent volume claims");
                            Step::Retry
                        }
                    }
                }
            })
            .await
            .ready()
            .unwrap_or_default();

            observed.volumes = claims
                .iter()
                .filter_map(|claim| Some((claim.metadata.name.to_owned()?, bound(claim)?)))
                .collect();
        }

        observed
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn read(secret: &Option<Secret>, key: &str) -> Option<String> {
    secret
        .as_ref()
        .and_then(|secret| secret.data.as_ref())
        .and_then(|data| data.get(key))
        .map(|value| String::from_utf8_lossy(&value.0).to_string())
        .filter(|value| !value.is_empty())
}

fn bound(claim: &k8s_openapi::api::core::v1::PersistentVolumeClaim) -> Option<String> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.to_owned())
        .filter(|name| !name.is_empty())
}

/// returns the load balancer ingress or the node ports of the exposed service
fn service_address(service: &Service, expose: ExposeService) -> Option<String> {
    match expose {
        ExposeService::NodePort => {
            let ports: Vec<String> = service
                .spec
                .as_ref()
                .and_then(|spec| spec.ports.as_ref())
                .map(|ports| {
                    ports
                        .iter()
                        .filter_map(|port| port.node_port)
                        .map(|port| format!("{NODE_ADDRESS_PLACEHOLDER}:{port}"))
                        .collect()
                })
                .unwrap_or_default();

            Some(ports.join(",")).filter(|ports| !ports.is_empty())
        }
        _ => service
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|balancer| balancer.ingress.as_ref())
            .and_then(|ingress| {
                ingress
                    .iter()
                    .find_map(|ingress| ingress.ip.to_owned().or_else(|| ingress.hostname.to_owned()))
            }),
    }
}

/// returns if the namespace only hosts the given instance
fn exclusive(labels: &BTreeMap<String, String>, label: &str) -> bool {
    let domain = format!("{}/", builder::LABEL_DOMAIN);

    labels.contains_key(label)
        && labels
            .keys()
            .all(|key| key == label || !key.starts_with(&domain))
}

#[async_trait]
impl k8s::Reconciler<Blackduck> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(&self, obj: Arc<Blackduck>) -> Result<(), ReconcilerError> {
        let Some(key) = ObjectKey::of(obj.as_ref()) else {
            return Err(ReconcilerError::Build(builder::Error::Metadata("namespace")));
        };

        match self.run(&key, &obj).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Err(status_err) = self.fail(&key, &obj, &err).await {
                    warn!(namespace = &key.namespace, name = &key.name, error = status_err.to_string(), "Failed to record error state");
                }

                if err.is_configuration() {
                    // nothing to retry until the user edits the spec
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ReconcilerError> {
        // ---------------------------------------------------------------------
        // Step 1: ignore deletions caused by the operator uninstallation

        if !self.client.crd_active().await? {
            info!(namespace = &key.namespace, name = &key.name, "Custom resource definition is gone or being deleted, keep instance objects");
            return Ok(());
        }

        // ---------------------------------------------------------------------
        // Step 2: tear down the namespace or only the instance objects

        let label = builder::namespace_label(&key.name);
        let labels = self
            .client
            .get_namespace(&key.namespace)
            .await?
            .and_then(|namespace| namespace.metadata.labels)
            .unwrap_or_default();

        if key.namespace != self.config.operator.namespace && exclusive(&labels, &label) {
            let volumes: Vec<String> = self
                .client
                .list_persistent_volume_claims(&key.namespace, &builder::selector(&key.name))
                .await?
                .iter()
                .filter_map(bound)
                .collect();

            info!(namespace = &key.namespace, name = &key.name, volumes = volumes.len(), "Namespace only hosts the instance, delete it");
            self.client.delete_namespace(&key.namespace).await?;
            for volume in volumes {
                self.client.delete_persistent_volume(&volume).await?;
            }

            return Ok(());
        }

        info!(namespace = &key.namespace, name = &key.name, "Namespace is shared, delete instance objects only");
        let report = self
            .deployer
            .prune(&key.namespace, &builder::selector(&key.name), &[])
            .await?;
        debug!(namespace = &key.namespace, name = &key.name, deleted = report.deleted.len(), "Deleted instance objects");

        if labels.contains_key(&label) {
            self.client
                .patch_namespace_labels(&key.namespace, BTreeMap::from([(label, None)]))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{
            LoadBalancerIngress, LoadBalancerStatus, PersistentVolumeClaim,
            PersistentVolumeClaimSpec, ServiceStatus,
        },
        ByteString,
    };
    use kube::api::ObjectMeta;

    use super::*;
    use crate::svc::{
        crd::blackduck::BlackduckSpec,
        k8s::Reconciler as _,
        testing::{
            configuration, instance, namespace, FakeClient, FakeDeployer, FakeLifecycle,
            FakeProbe,
        },
    };

    struct Fixture {
        client: Arc<FakeClient>,
        deployer: Arc<FakeDeployer>,
        lifecycle: Arc<FakeLifecycle>,
        reconciler: Reconciler,
    }

    fn fixture(probe: FakeProbe) -> Fixture {
        let client = Arc::new(FakeClient::default());
        let deployer = Arc::new(FakeDeployer::default());
        let lifecycle = Arc::new(FakeLifecycle::default());

        let config = configuration();
        client.with_state(|state| {
            state.secrets.insert(
                (config.operator.namespace.to_owned(), config.operator.credentials.to_owned()),
                Secret {
                    data: Some(BTreeMap::from([
                        (OPERATOR_ADMIN_PASSWORD.to_string(), ByteString(b"admin".to_vec())),
                        (OPERATOR_USER_PASSWORD.to_string(), ByteString(b"user".to_vec())),
                        (OPERATOR_POSTGRES_PASSWORD.to_string(), ByteString(b"postgres".to_vec())),
                    ])),
                    ..Default::default()
                },
            );
        });

        let reconciler = Reconciler::new(
            client.to_owned(),
            deployer.to_owned(),
            lifecycle.to_owned(),
            Arc::new(probe),
            Arc::new(config),
        );

        Fixture {
            client,
            deployer,
            lifecycle,
            reconciler,
        }
    }

    impl Fixture {
        fn put(&self, spec: BlackduckSpec) -> Arc<Blackduck> {
            let key = ObjectKey::new("hub-ns", "hub");
            self.client.with_state(|state| {
                let mut obj = state
                    .instances
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| instance("hub-ns", "hub"));
                obj.spec = spec;
                state.instances.insert(key.to_owned(), obj);
            });

            self.current()
        }

        fn current(&self) -> Arc<Blackduck> {
            Arc::new(
                self.client
                    .state()
                    .instances
                    .get(&ObjectKey::new("hub-ns", "hub"))
                    .cloned()
                    .expect("instance to exist"),
            )
        }

        fn state(&self) -> Option<State> {
            self.current().state()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_deploys_and_reports_running() {
        let fixture = fixture(FakeProbe::healthy());
        fixture.client.with_state(|state| {
            state.services.insert(
                ("hub-ns".into(), "hub-blackduck-webserver-exposed".into()),
                Service {
                    status: Some(ServiceStatus {
                        load_balancer: Some(LoadBalancerStatus {
                            ingress: Some(vec![LoadBalancerIngress {
                                ip: Some("10.0.0.7".into()),
                                ..Default::default()
                            }]),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
        });

        let obj = fixture.put(BlackduckSpec::default());
        fixture.reconciler.upsert(obj).await.expect("upsert to succeed");

        let current = fixture.current();
        let status = current.status.to_owned().expect("status");
        assert_eq!(status.state, Some(State::Running));
        assert_eq!(status.ip.as_deref(), Some("10.0.0.7"));

        let references = fixture.deployer.references("hub-ns");
        assert!(references.contains("Deployment/hub-blackduck-postgres"));
        assert!(references.contains("Deployment/hub-blackduck-webapp"));
        assert!(references.contains("Service/hub-blackduck-webserver-exposed"));

        assert_eq!(fixture.lifecycle.state().initialized, vec![ObjectKey::new("hub-ns", "hub")]);

        let state = fixture.client.state();
        let labels = state.namespaces["hub-ns"].metadata.labels.to_owned().unwrap_or_default();
        assert!(labels.contains_key("synopsys.com/blackduck.hub"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_pass_makes_no_write() {
        let fixture = fixture(FakeProbe::healthy());
        let obj = fixture.put(BlackduckSpec::default());
        fixture.reconciler.upsert(obj).await.expect("first pass to succeed");

        fixture.client.with_state(|state| {
            state.writes = 0;
            state.events.clear();
        });
        fixture.deployer.with_state(|state| state.writes = 0);

        fixture
            .reconciler
            .upsert(fixture.current())
            .await
            .expect("second pass to succeed");

        assert_eq!(fixture.client.state().writes, 0);
        assert!(fixture.client.state().events.is_empty());
        assert_eq!(fixture.deployer.state().writes, 0);
        assert_eq!(fixture.lifecycle.state().initialized.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_instance_stays_starting() {
        let fixture = fixture(FakeProbe::from(vec![]));
        let obj = fixture.put(BlackduckSpec::default());

        fixture.reconciler.upsert(obj).await.expect("upsert to succeed");

        assert_eq!(fixture.state(), Some(State::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_start_ends_running() {
        let fixture = fixture(FakeProbe::healthy());
        let obj = fixture.put(BlackduckSpec {
            desired_state: DesiredState::Stop,
            ..Default::default()
        });

        fixture.reconciler.upsert(obj).await.expect("stop to succeed");
        assert_eq!(fixture.state(), Some(State::Stopped));
        assert!(fixture
            .deployer
            .references("hub-ns")
            .iter()
            .all(|reference| reference == "Secret/hub-blackduck-db-creds"));

        let obj = fixture.put(BlackduckSpec::default());
        fixture.reconciler.upsert(obj).await.expect("start to succeed");

        assert_eq!(fixture.state(), Some(State::Running));
        assert!(fixture
            .deployer
            .references("hub-ns")
            .contains("Deployment/hub-blackduck-webserver"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_claims() {
        let fixture = fixture(FakeProbe::healthy());
        let spec = BlackduckSpec {
            persistent_storage: Some(true),
            ..Default::default()
        };

        let obj = fixture.put(spec.to_owned());
        fixture.reconciler.upsert(obj).await.expect("start to succeed");

        let obj = fixture.put(BlackduckSpec {
            desired_state: DesiredState::Stop,
            ..spec
        });
        fixture.reconciler.upsert(obj).await.expect("stop to succeed");

        let references = fixture.deployer.references("hub-ns");
        assert!(references.iter().all(|reference| {
            reference.starts_with("PersistentVolumeClaim/") || reference == "Secret/hub-blackduck-db-creds"
        }));
        assert!(references.contains("PersistentVolumeClaim/hub-blackduck-postgres"));
        assert!(references.contains("Secret/hub-blackduck-db-creds"));
    }

    #[tokio::test(start_paused = true)]
    async fn migration_keeps_the_database_only() {
        let fixture = fixture(FakeProbe::healthy());
        let obj = fixture.put(BlackduckSpec::default());
        fixture.reconciler.upsert(obj).await.expect("start to succeed");

        let obj = fixture.put(BlackduckSpec {
            desired_state: DesiredState::DbMigrate,
            ..Default::default()
        });
        fixture.reconciler.upsert(obj).await.expect("migration to succeed");

        assert_eq!(fixture.state(), Some(State::DbMigration));
        let references = fixture.deployer.references("hub-ns");
        assert!(references.contains("Deployment/hub-blackduck-postgres"));
        assert!(references.contains("Secret/hub-blackduck-db-creds"));
        assert!(!references.contains("Deployment/hub-blackduck-webapp"));
        assert!(!references.contains("Service/hub-blackduck-webserver-exposed"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_spec_is_an_error_state_without_retry() {
        let fixture = fixture(FakeProbe::healthy());
        let obj = fixture.put(BlackduckSpec {
            size: Some("gigantic".into()),
            ..Default::default()
        });

        fixture
            .reconciler
            .upsert(obj)
            .await
            .expect("configuration errors not to be retried");

        let status = fixture.current().status.to_owned().expect("status");
        assert_eq!(status.state, Some(State::Error));
        assert!(status.error_message.is_some());
        assert!(fixture.deployer.references("hub-ns").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_size_survives_the_merge() {
        let fixture = fixture(FakeProbe::healthy());
        let resolved = fixture
            .reconciler
            .defaults
            .resolve(
                &BlackduckSpec {
                    size: Some("large".into()),
                    ..Default::default()
                },
                &fixture.reconciler.catalog,
            )
            .expect("spec to resolve");

        assert_eq!(resolved.spec.size.as_deref(), Some("large"));
    }

    #[tokio::test(start_paused = true)]
    async fn database_failure_is_retried() {
        let fixture = fixture(FakeProbe::healthy());
        fixture.lifecycle.state().fail = true;
        let obj = fixture.put(BlackduckSpec::default());

        let result = fixture.reconciler.upsert(obj).await;

        assert!(matches!(result, Err(ReconcilerError::Database(_))));
        assert_eq!(fixture.state(), Some(State::Error));
        assert!(!fixture
            .deployer
            .references("hub-ns")
            .contains("Deployment/hub-blackduck-webapp"));

        fixture.lifecycle.state().fail = false;
        fixture
            .reconciler
            .upsert(fixture.current())
            .await
            .expect("retry to succeed");
        assert_eq!(fixture.state(), Some(State::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn prototype_triggers_a_clone() {
        let fixture = fixture(FakeProbe::healthy());
        let obj = fixture.put(BlackduckSpec {
            db_prototype: Some("proto".into()),
            ..Default::default()
        });

        fixture.reconciler.upsert(obj).await.expect("upsert to succeed");

        let lifecycle = fixture.lifecycle.state();
        assert!(lifecycle.initialized.is_empty());
        assert_eq!(lifecycle.cloned, vec![("proto".to_string(), ObjectKey::new("hub-ns", "hub"))]);
    }

    fn claim(name: &str, volume: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("hub-ns".into()),
                labels: Some(builder::labels("hub", "pvc")),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(volume.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_of_exclusive_namespace_removes_it_with_volumes() {
        let fixture = fixture(FakeProbe::healthy());
        fixture.client.with_state(|state| {
            state.namespaces.insert(
                "hub-ns".into(),
                namespace("hub-ns", &[("synopsys.com/blackduck.hub", "2019.6.1")]),
            );
            state.claims.push(claim("hub-blackduck-postgres", "pv-1"));
        });

        fixture
            .reconciler
            .delete(&ObjectKey::new("hub-ns", "hub"))
            .await
            .expect("deletion to succeed");

        let state = fixture.client.state();
        assert_eq!(state.deleted_namespaces, vec!["hub-ns".to_string()]);
        assert_eq!(state.deleted_volumes, vec!["pv-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_in_shared_namespace_only_removes_own_objects() {
        let fixture = fixture(FakeProbe::healthy());
        let obj = fixture.put(BlackduckSpec::default());
        fixture.reconciler.upsert(obj).await.expect("upsert to succeed");

        fixture.client.with_state(|state| {
            if let Some(labels) = state
                .namespaces
                .get_mut("hub-ns")
                .and_then(|namespace| namespace.metadata.labels.as_mut())
            {
                labels.insert("synopsys.com/blackduck.other".into(), "2019.6.1".into());
            }
        });
        fixture.deployer.with_state(|state| {
            state.objects.insert(
                ("hub-ns".into(), "Deployment/other-blackduck-webapp".into()),
                (builder::labels("other", "webapp"), serde_json::Value::Null),
            );
        });

        fixture
            .reconciler
            .delete(&ObjectKey::new("hub-ns", "hub"))
            .await
            .expect("deletion to succeed");

        let references = fixture.deployer.references("hub-ns");
        assert_eq!(
            references.into_iter().collect::<Vec<_>>(),
            vec!["Deployment/other-blackduck-webapp".to_string()]
        );

        let state = fixture.client.state();
        assert!(state.deleted_namespaces.is_empty());
        let labels = state.namespaces["hub-ns"].metadata.labels.to_owned().unwrap_or_default();
        assert!(!labels.contains_key("synopsys.com/blackduck.hub"));
        assert!(labels.contains_key("synopsys.com/blackduck.other"));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_is_ignored_while_the_definition_goes_away() {
        let fixture = fixture(FakeProbe::healthy());
        fixture.client.with_state(|state| {
            state.crd_deleted = true;
            state.namespaces.insert(
                "hub-ns".into(),
                namespace("hub-ns", &[("synopsys.com/blackduck.hub", "2019.6.1")]),
            );
        });

        fixture
            .reconciler
            .delete(&ObjectKey::new("hub-ns", "hub"))
            .await
            .expect("deletion to succeed");

        assert!(fixture.client.state().deleted_namespaces.is_empty());
    }

    #[test]
    fn node_ports_are_listed_with_placeholder() {
        let service: Service = serde_json::from_value(serde_json::json!({
            "spec": { "ports": [ { "port": 443, "nodePort": 30443 } ] }
        }))
        .expect("service");

        assert_eq!(
            service_address(&service, ExposeService::NodePort).as_deref(),
            Some("<<NODE_IP_ADDRESS>>:30443")
        );
    }
}
