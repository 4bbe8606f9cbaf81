//! Leader election over a coordination.k8s.io Lease
//!
//! The holder renews `renewTime` every few seconds. Another instance may take
//! over once `renewTime + leaseDurationSeconds` has passed. Every write carries
//! the resourceVersion that was read, so two candidates racing for an expired
//! lease cannot both win.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

/// Parameters of one lease lock
#[derive(Clone, Debug)]
pub struct LeaseLockParams {
    pub holder_id: String,
    pub lease_name: String,
    pub lease_ttl: Duration,
}

/// Result of one acquire-or-renew attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseAttempt {
    pub acquired_lease: bool,
    /// Identity currently holding the lease, when known
    pub holder: Option<String>,
}

/// Lease-based leader lock
pub struct LeaseLock {
    api: Api<Lease>,
    params: LeaseLockParams,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, params: LeaseLockParams) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            params,
        }
    }

    /// Take the lease if it is free or expired, or renew it if we hold it
    pub async fn try_acquire_or_renew(&self) -> Result<LeaseAttempt, kube::Error> {
        let now = Utc::now();
        let existing = match self.api.get(&self.params.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e),
        };

        let Some(existing) = existing else {
            let lease = desired_lease(&self.params, None, now);
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(lease = %self.params.lease_name, "Created leader lease");
                    Ok(acquired(&self.params))
                }
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(lost(None)),
                Err(e) => Err(e),
            };
        };

        let holder = lease_holder(&existing);
        let ours = holder.as_deref() == Some(self.params.holder_id.as_str());
        if !ours && !lease_expired(&existing, now) {
            debug!(holder = ?holder, "Lease held by another instance");
            return Ok(lost(holder));
        }

        let lease = desired_lease(&self.params, Some(&existing), now);
        match self
            .api
            .replace(&self.params.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                if !ours {
                    info!(previous = ?holder, "Took over expired leader lease");
                }
                Ok(acquired(&self.params))
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(lost(holder)),
            Err(e) => Err(e),
        }
    }
}

fn acquired(params: &LeaseLockParams) -> LeaseAttempt {
    LeaseAttempt {
        acquired_lease: true,
        holder: Some(params.holder_id.clone()),
    }
}

fn lost(holder: Option<String>) -> LeaseAttempt {
    LeaseAttempt {
        acquired_lease: false,
        holder,
    }
}

/// Identity recorded in the lease
pub fn lease_holder(lease: &Lease) -> Option<String> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.clone())
}

/// A lease without a renew time or duration counts as expired
pub fn lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let (Some(renewed), Some(ttl)) = (
        spec.renew_time.as_ref().and_then(micro_time_to_utc),
        spec.lease_duration_seconds,
    ) else {
        return true;
    };
    now > renewed + chrono::Duration::seconds(i64::from(ttl))
}

/// Lease body for a take-over or renewal of `existing`
pub fn desired_lease(params: &LeaseLockParams, existing: Option<&Lease>, now: DateTime<Utc>) -> Lease {
    let previous = existing.and_then(|l| l.spec.as_ref());
    let ours = previous.and_then(|s| s.holder_identity.as_deref()) == Some(params.holder_id.as_str());
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);

    let stamp = utc_to_micro_time(now);
    let (acquire_time, lease_transitions) = if ours {
        (previous.and_then(|s| s.acquire_time.clone()).or_else(|| stamp.clone()), transitions)
    } else if existing.is_some() {
        (stamp.clone(), transitions + 1)
    } else {
        (stamp.clone(), 0)
    };

    Lease {
        metadata: ObjectMeta {
            name: Some(params.lease_name.clone()),
            resource_version: existing.and_then(|l| l.metadata.resource_version.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(params.holder_id.clone()),
            lease_duration_seconds: i32::try_from(params.lease_ttl.as_secs()).ok(),
            acquire_time,
            renew_time: stamp,
            lease_transitions: Some(lease_transitions),
            ..Default::default()
        }),
    }
}

fn micro_time_to_utc(time: &MicroTime) -> Option<DateTime<Utc>> {
    let wire = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(wire.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn utc_to_micro_time(time: DateTime<Utc>) -> Option<MicroTime> {
    let wire = time.to_rfc3339_opts(SecondsFormat::Micros, true);
    serde_json::from_value(serde_json::Value::String(wire)).ok()
}
