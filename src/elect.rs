//! # Leader election
//!
//! A `coordination.k8s.io/v1` Lease lock. When leader election is enabled,
//! the controller blocks in [`LeaseLock::acquire`] until it holds the lease,
//! then keeps renewing it with [`LeaseLock::hold`]; non-leaders keep waiting
//! on the same lease. A lease whose renew time is older than its duration is
//! taken over.

use anyhow::{anyhow, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{info, warn};

pub struct LeaseLock {
    api: Api<Lease>,
    name: String,
    identity: String,
    lease_duration: Duration,
}

impl LeaseLock {
    pub fn new(
        client: Client,
        namespace: &str,
        name: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity: identity.to_string(),
            lease_duration,
        }
    }

    /// Blocks until this instance holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(lease = %self.name, identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => warn!(lease = %self.name, error = %err, "Lease acquisition failed"),
            }
            tokio::time::sleep(self.retry_period()).await;
        }
    }

    /// Renews the lease until it is lost. Returns an error once another
    /// instance holds it, at which point the caller must stop leading.
    pub async fn hold(&self) -> Result<()> {
        loop {
            tokio::time::sleep(self.renew_period()).await;
            match self.try_acquire().await {
                Ok(true) => {}
                Ok(false) => return Err(anyhow!("leader lease {} lost", self.name)),
                Err(err) => warn!(lease = %self.name, error = %err, "Lease renewal failed"),
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let current = match self.api.get(&self.name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(self.lease_spec(1, None)),
                };
                return match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let spec = current.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();
        if holder != self.identity && !self.expired(&spec) {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(holder != self.identity);
        let acquire_time = if holder == self.identity {
            spec.acquire_time.clone()
        } else {
            None
        };
        let mut updated = current;
        updated.spec = Some(self.lease_spec(transitions, acquire_time));
        match self.api.replace(&self.name, &PostParams::default(), &updated).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_spec(&self, transitions: i32, acquire_time: Option<MicroTime>) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: acquire_time.or_else(|| Some(now.clone())),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }

    fn expired(&self, spec: &LeaseSpec) -> bool {
        let Some(renew) = &spec.renew_time else {
            return true;
        };
        let duration = spec
            .lease_duration_seconds
            .map_or(self.lease_duration, |s| Duration::from_secs(s.max(0) as u64));
        renew.0 + chrono::Duration::from_std(duration).unwrap_or_default() < Utc::now()
    }

    fn renew_period(&self) -> Duration {
        self.lease_duration / 3
    }

    fn retry_period(&self) -> Duration {
        self.lease_duration / 2
    }
}
