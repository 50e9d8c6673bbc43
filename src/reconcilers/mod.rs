// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation controllers for service catalog resources.
//!
//! Each reconciler implements [`Reconciler`](crate::dispatcher::Reconciler) for one
//! kind and moves a single entity one step toward its desired state per pass.
//!
//! # Reconciliation Architecture
//!
//! 1. **Load** - read the entity and its immediate collaborators from the store
//! 2. **Decide** - pick exactly one operation from the observed status
//! 3. **Call** - issue at most one OSB request (or hand off to the poller)
//! 4. **Status** - write back conditions and the observed generation
//!
//! # Available Reconcilers
//!
//! - [`BrokerReconciler`] - catalog sync for `ClusterServiceBroker` and `ServiceBroker`
//! - [`InstanceReconciler`] - provision, update and deprovision of `ServiceInstance`
//! - [`BindingReconciler`] - bind and unbind of `ServiceBinding`, secret injection

pub mod binding;
pub mod broker;
pub mod error;
pub mod finalizers;
pub mod instance;
pub mod references;
pub mod retry;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use binding::BindingReconciler;
pub use broker::BrokerReconciler;
pub use error::ReconcileError;
pub use instance::InstanceReconciler;

use crate::constants::{
    AUTH_SECRET_PASSWORD_KEY, AUTH_SECRET_TOKEN_KEY, AUTH_SECRET_USERNAME_KEY,
    OSB_PLATFORM_KUBERNETES,
};
use crate::context::{Context, Settings};
use crate::dispatcher::Action;
use crate::crd::{
    BrokerAuthKind, BrokerResource, CatalogScope, ClusterServiceBroker, ServiceBinding,
    ServiceBindingStatus, ServiceBroker, ServiceBrokerStatus, ServiceInstance,
    ServiceInstanceStatus, UserInfo,
};
use crate::osb::{AuthConfig, BrokerClient, ClientConfig, OriginatingIdentity, RequestContext};
use crate::parameters::secret_value;
use crate::status_reasons::{REASON_AUTH_FAILED, REASON_NONEXISTENT_BROKER};
use crate::store::{EntityStore, ObjectKey, SharedStore, Stored};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use kube::Resource;
use status::{is_failed, record_error, ConditionedStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Current time, RFC3339.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Time elapsed since an RFC3339 timestamp; `None` if absent or unparsable.
#[must_use]
pub fn elapsed_since(timestamp: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let then = DateTime::parse_from_rfc3339(timestamp?).ok()?;
    (now - then.with_timezone(&Utc)).to_std().ok()
}

/// Whether an operation started at `start` has outlived `window`.
#[must_use]
pub fn retry_window_expired(start: Option<&str>, window: Duration) -> bool {
    elapsed_since(start, Utc::now()).is_some_and(|elapsed| elapsed >= window)
}

/// A random identifier shaped like a version 4 UUID.
///
/// Used as the OSB instance or binding ID when the user leaves `externalID` empty.
#[must_use]
pub fn generate_external_id() -> String {
    let mut bits: u128 = rand::random();
    bits = (bits & !(0xf << 76)) | (0x4 << 76);
    bits = (bits & !(0x3 << 62)) | (0x2 << 62);
    let hex = format!("{bits:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Identity header value for the user that last changed an entity.
#[must_use]
pub fn originating_identity(user: Option<&UserInfo>) -> Option<OriginatingIdentity> {
    let user = user?;
    let mut value = serde_json::json!({
        "username": user.username,
        "uid": user.uid,
        "groups": user.groups,
    });
    if let Some(extra) = &user.extra {
        value["extra"] = serde_json::json!(extra);
    }
    Some(OriginatingIdentity {
        platform: OSB_PLATFORM_KUBERNETES.to_string(),
        value,
    })
}

/// Kubernetes context profile for provision, update and bind requests.
#[must_use]
pub fn request_context(settings: &Settings, namespace: &str, instance_name: &str) -> RequestContext {
    RequestContext {
        platform: OSB_PLATFORM_KUBERNETES.to_string(),
        namespace: namespace.to_string(),
        clusterid: settings.cluster_id.clone(),
        instance_name: instance_name.to_string(),
    }
}

/// Build the client configuration for a broker, reading its auth secret.
///
/// # Errors
///
/// `Validation(AuthFailed)` for malformed auth or CA settings, `Transient(AuthFailed)`
/// when the secret cannot be read or lacks a required key.
pub async fn broker_client_config<B: BrokerResource>(
    ctx: &Context,
    broker: &B,
) -> Result<ClientConfig, ReconcileError> {
    let key = ObjectKey::of(broker);
    let spec = broker.common_spec();

    let mut config = ClientConfig::new(key.to_string(), &spec.url);
    config.api_version = ctx.settings.osb_api_version.clone();
    config.timeout = ctx.settings.osb_timeout;
    config.insecure_skip_tls_verify = spec.insecure_skip_tls_verify;

    if let Some(bundle) = spec.ca_bundle.as_deref().filter(|b| !b.is_empty()) {
        let decoded = BASE64.decode(bundle.trim()).map_err(|e| {
            ReconcileError::validation(REASON_AUTH_FAILED, format!("caBundle is not valid base64: {e}"))
        })?;
        config.ca_bundle = Some(decoded);
    }

    let auth_ref = broker
        .auth_secret()
        .map_err(|message| ReconcileError::validation(REASON_AUTH_FAILED, message))?;
    let Some(auth_ref) = auth_ref else {
        return Ok(config);
    };

    let secret = ctx.stores.secrets.get(&auth_ref.secret).await.map_err(|e| {
        ReconcileError::transient(
            REASON_AUTH_FAILED,
            format!("Error getting broker auth credentials from secret {}: {e}", auth_ref.secret),
        )
    })?;
    let required = |name: &str| {
        secret_value(&secret, name)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| {
                ReconcileError::transient(
                    REASON_AUTH_FAILED,
                    format!("auth secret {} has no {name:?} key", auth_ref.secret),
                )
            })
    };
    config.auth = Some(match auth_ref.kind {
        BrokerAuthKind::Basic => AuthConfig::Basic {
            username: required(AUTH_SECRET_USERNAME_KEY)?,
            password: required(AUTH_SECRET_PASSWORD_KEY)?,
        },
        BrokerAuthKind::Bearer => AuthConfig::Bearer {
            token: required(AUTH_SECRET_TOKEN_KEY)?,
        },
    });
    Ok(config)
}

/// Cached OSB client for a broker object.
///
/// # Errors
///
/// See [`broker_client_config`]; a client that cannot be built is `Validation(AuthFailed)`.
pub async fn broker_client_for<B: BrokerResource>(
    ctx: &Context,
    broker: &B,
) -> Result<Arc<dyn BrokerClient>, ReconcileError> {
    let config = broker_client_config(ctx, broker).await?;
    ctx.clients
        .get_or_create(&ObjectKey::of(broker), &config)
        .map_err(|e| ReconcileError::validation(REASON_AUTH_FAILED, e.to_string()))
}

async fn load_broker<B: BrokerResource>(ctx: &Context, key: &ObjectKey) -> Result<B, ReconcileError> {
    B::store(&ctx.stores).get(key).await.map_err(|e| {
        if e.is_not_found() {
            ReconcileError::transient(
                REASON_NONEXISTENT_BROKER,
                format!("References a non-existent broker {key}"),
            )
        } else {
            e.into()
        }
    })
}

/// OSB client for the broker at `key`, of either scope.
///
/// # Errors
///
/// `Transient(ReferencesNonexistentBroker)` if the broker is gone, otherwise as
/// [`broker_client_for`].
pub async fn client_for_broker_key(
    ctx: &Context,
    scope: CatalogScope,
    key: &ObjectKey,
) -> Result<Arc<dyn BrokerClient>, ReconcileError> {
    debug!("Looking up broker client for {}", key);
    match scope {
        CatalogScope::Cluster => {
            let broker: ClusterServiceBroker = load_broker(ctx, key).await?;
            broker_client_for(ctx, &broker).await
        }
        CatalogScope::Namespaced => {
            let broker: ServiceBroker = load_broker(ctx, key).await?;
            broker_client_for(ctx, &broker).await
        }
    }
}

/// Kinds whose status subresource a reconciler owns.
pub trait HasStatusField: Stored {
    type Status: Clone + PartialEq + Default + Send + Sync;

    fn status_field(&self) -> Option<&Self::Status>;

    fn status_field_mut(&mut self) -> &mut Option<Self::Status>;
}

macro_rules! impl_has_status_field {
    ($($kind:ty => $status:ty),* $(,)?) => {
        $(
            impl HasStatusField for $kind {
                type Status = $status;

                fn status_field(&self) -> Option<&$status> {
                    self.status.as_ref()
                }

                fn status_field_mut(&mut self) -> &mut Option<$status> {
                    &mut self.status
                }
            }
        )*
    };
}

impl_has_status_field! {
    ClusterServiceBroker => ServiceBrokerStatus,
    ServiceBroker => ServiceBrokerStatus,
    ServiceInstance => ServiceInstanceStatus,
    ServiceBinding => ServiceBindingStatus,
}

/// An object being reconciled together with the status last persisted for it.
///
/// Status is edited in memory and written with [`Tracked::save`], which skips the
/// write when nothing changed. Spec writes go through [`Tracked::adopt`] so the
/// in-memory status edits survive the new `resourceVersion`.
pub struct Tracked<K: HasStatusField> {
    pub obj: K,
    persisted: Option<K::Status>,
}

impl<K: HasStatusField> Tracked<K> {
    #[must_use]
    pub fn new(obj: K) -> Self {
        let persisted = obj.status_field().cloned();
        Self { obj, persisted }
    }

    /// Mutable status, created on first use.
    pub fn status(&mut self) -> &mut K::Status {
        self.obj.status_field_mut().get_or_insert_with(K::Status::default)
    }

    /// Snapshot of the in-memory status.
    #[must_use]
    pub fn current(&self) -> K::Status {
        self.obj.status_field().cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn generation(&self) -> i64 {
        self.obj.meta().generation.unwrap_or(0)
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.obj)
    }

    /// Take over an object returned by a spec write.
    pub fn adopt(&mut self, written: K) {
        let edited = self.obj.status_field_mut().take();
        self.persisted = written.status_field().cloned();
        self.obj = written;
        *self.obj.status_field_mut() = edited;
    }

    /// Persist the status if it differs from what the store holds.
    ///
    /// # Errors
    ///
    /// Store errors, including a conflict when the object changed since it was read.
    pub async fn save(&mut self, store: &SharedStore<K>) -> Result<(), ReconcileError> {
        if self.obj.status_field() == self.persisted.as_ref() {
            return Ok(());
        }
        let written = store.replace_status(&self.obj).await?;
        self.persisted = written.status_field().cloned();
        self.obj = written;
        Ok(())
    }
}

/// Whether the current generation already failed terminally.
pub(crate) fn failed_for_generation<S: ConditionedStatus>(status: &S, generation: i64) -> bool {
    is_failed(status) && status.reconciled_generation() == generation
}

/// Record the outcome of a pass and persist the status.
///
/// `Ok(None)` means the object was released for deletion and has no status left to write.
/// `observedGeneration` stays at the generation an asynchronous operation started
/// for until that operation completes.
pub(crate) async fn finish_pass<K>(
    pass: &mut Tracked<K>,
    store: &SharedStore<K>,
    result: Result<Option<Action>, ReconcileError>,
) -> Result<Action, ReconcileError>
where
    K: HasStatusField,
    K::Status: ConditionedStatus,
{
    let generation = pass.generation();
    match result {
        Ok(None) => Ok(Action::await_change()),
        Ok(Some(action)) => {
            let status = pass.status();
            if !status.operation_in_flight() {
                status.set_observed_generation(generation);
            }
            pass.save(store).await?;
            Ok(action)
        }
        Err(err) => {
            let status = pass.status();
            record_error(status, &err);
            if err.is_terminal() {
                status.set_reconciled_generation(generation);
            }
            if !status.operation_in_flight() {
                status.set_observed_generation(generation);
            }
            if let Err(save_err) = pass.save(store).await {
                warn!(key = %pass.key(), error = %save_err, "Failed to record reconcile error in status");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod mod_tests;
