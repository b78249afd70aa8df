//! # Prober module
//!
//! This module polls the health endpoint of an instance's web server until it
//! answers or the attempts are exhausted.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::svc::{
    blackduck::builder::{self, EXPOSED_PORT},
    cfg,
    k8s::{client::ResourceClient, resource::ObjectKey},
    retry::{poll, Attempts, Outcome, Step},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build http client, {0}")]
    Client(reqwest::Error),
}

// -----------------------------------------------------------------------------
// Probe trait

#[async_trait]
pub trait Probe: Send + Sync {
    /// returns if the address answered the health check with a success
    async fn probe(&self, address: &str) -> bool;
}

// -----------------------------------------------------------------------------
// HttpProbe structure

#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl TryFrom<&cfg::Prober> for HttpProbe {
    type Error = Error;

    fn try_from(config: &cfg::Prober) -> Result<Self, Self::Error> {
        // instances serve self-signed certificates
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(Error::Client)?;

        Ok(Self {
            client,
            path: config.path.to_owned(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, address: &str) -> bool {
        let url = format!("https://{address}{}", self.path);

        match self.client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                debug!(url = &url, status = response.status().as_u16(), "Health check answered with an unexpected status");
                false
            }
            Err(err) => {
                debug!(url = &url, error = err.to_string(), "Failed to reach health check");
                false
            }
        }
    }
}

/// returns the in-cluster address of the instance's web server
pub fn address(key: &ObjectKey) -> String {
    format!(
        "{}.{}.svc:{EXPOSED_PORT}",
        builder::name(&key.name, "webserver"),
        key.namespace
    )
}

/// polls the address until it is healthy. Before each retry, the instance is
/// looked up again and polling stops early if it was deleted. Exhausting the
/// attempts is not an error.
pub async fn verify(
    probe: Arc<dyn Probe>,
    client: Arc<dyn ResourceClient>,
    key: &ObjectKey,
    address: &str,
    attempts: u32,
    interval: Duration,
) -> bool {
    let outcome = poll(Attempts::Bounded(attempts), interval, |attempt| {
        let probe = &probe;
        let client = &client;
        async move {
            if attempt > 0 {
                match client.get_instance(key).await {
                    Ok(None) => return Step::Abort,
                    Ok(Some(_)) => {}
                    Err(err) => {
                        warn!(namespace = &key.namespace, name = &key.name, error = err.to_string(), "Failed to check that instance still exists, keep probing");
                    }
                }
            }

            if probe.probe(address).await {
                Step::Ready(())
            } else {
                Step::Retry
            }
        }
    })
    .await;

    match outcome {
        Outcome::Ready(()) => {
            info!(namespace = &key.namespace, name = &key.name, address = address, "Instance is healthy");
            true
        }
        Outcome::Aborted => {
            info!(namespace = &key.namespace, name = &key.name, "Instance was deleted while probing, stop");
            false
        }
        Outcome::Exhausted => {
            warn!(namespace = &key.namespace, name = &key.name, attempts = attempts, "Instance is still not healthy after all attempts");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::svc::testing::{instance, FakeClient, FakeProbe};

    fn client_with_instance() -> Arc<FakeClient> {
        let client = Arc::new(FakeClient::default());
        client.with_state(|state| {
            state
                .instances
                .insert(ObjectKey::new("ns", "hub"), instance("ns", "hub"));
        });

        client
    }

    #[test]
    fn address_targets_the_webserver_service() {
        assert_eq!(
            address(&ObjectKey::new("ns", "hub")),
            "hub-blackduck-webserver.ns.svc:443"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_then_success_is_healthy() {
        let probe = Arc::new(FakeProbe::from(vec![false, false, false, true]));
        let begin = Instant::now();

        let healthy = verify(
            probe.to_owned(),
            client_with_instance(),
            &ObjectKey::new("ns", "hub"),
            "hub",
            10,
            Duration::from_secs(10),
        )
        .await;

        assert!(healthy);
        assert_eq!(probe.calls(), 4);
        assert!(begin.elapsed() <= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_are_not_an_error() {
        let probe = Arc::new(FakeProbe::from(vec![false; 5]));

        let healthy = verify(
            probe.to_owned(),
            client_with_instance(),
            &ObjectKey::new("ns", "hub"),
            "hub",
            5,
            Duration::from_secs(1),
        )
        .await;

        assert!(!healthy);
        assert_eq!(probe.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_instance_stops_probing() {
        let probe = Arc::new(FakeProbe::from(vec![false; 5]));

        let healthy = verify(
            probe.to_owned(),
            Arc::new(FakeClient::default()),
            &ObjectKey::new("ns", "hub"),
            "hub",
            5,
            Duration::from_secs(1),
        )
        .await;

        assert!(!healthy);
        assert_eq!(probe.calls(), 1);
    }
}
