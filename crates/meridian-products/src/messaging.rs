//! Messaging (AMQ Online): address-space plans, auth services and console

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use kube::ResourceExt;
use meridian_common::config::ProductConfig;
use meridian_common::crd::{Installation, Phase};
use meridian_common::kube_utils::empty_object;
use meridian_common::store::ObjectKey;
use meridian_common::{Error, ReconcileContext, Result};
use meridian_engine::{Engine, ProductController, StepResult, StepSequencer};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::namespace_labels;
use crate::subscription::{SubscriptionInstaller, SubscriptionTarget};

/// Product name and namespace suffix
pub const PRODUCT: &str = "amq-online";
const PACKAGE: &str = "integreatly-amq-online";
const VERSION: &str = "1.5.1";
const OPERATOR_VERSION: &str = "1.5.1";
const CONSOLE_SERVICE: &str = "console";

const ADMIN_API: &str = "admin.enmasse.io/v1beta1";
const INFRA_API: &str = "enmasse.io/v1beta1";
const PLAN_API: &str = "admin.enmasse.io/v1beta2";

/// Installs AMQ Online and seeds its default configuration
pub struct Messaging {
    engine: Engine,
    subscriptions: Arc<dyn SubscriptionInstaller>,
    host: Mutex<Option<String>>,
}

impl Messaging {
    /// Controller over the shared engine
    pub fn new(engine: Engine, subscriptions: Arc<dyn SubscriptionInstaller>) -> Self {
        Self {
            engine,
            subscriptions,
            host: Mutex::new(None),
        }
    }

    fn config(installation: &Installation) -> ProductConfig {
        ProductConfig::for_installation(installation, PRODUCT, VERSION, OPERATOR_VERSION)
    }

    /// Create every object unless it exists. Existing objects are left to
    /// the messaging operator and the cluster administrator.
    async fn seed(&self, ctx: &ReconcileContext, what: &str, objects: Vec<kube::api::DynamicObject>) -> StepResult {
        debug!(product = PRODUCT, count = objects.len(), "Reconciling default {what}");
        for obj in &objects {
            self.engine.applier.apply(ctx, obj).await?;
        }
        Ok(Phase::Completed)
    }

    /// Read the console host the messaging operator published
    async fn discover_console(&self, ctx: &ReconcileContext, namespace: &str) -> StepResult {
        let key = ObjectKey::namespaced(ADMIN_API, "ConsoleService", namespace, CONSOLE_SERVICE);
        let Some(console) = ctx.guard("store.get", self.engine.store.get(&key)).await? else {
            return Err(Error::configuration(
                PRODUCT,
                format!("could not find consoleservice {CONSOLE_SERVICE} in {namespace}"),
            )
            .into());
        };

        let host = console.data.pointer("/status/host").and_then(Value::as_str);
        let port = console.data.pointer("/status/port").and_then(Value::as_i64);
        if let (Some(host), Some(443)) = (host.filter(|h| !h.is_empty()), port) {
            let url = format!("https://{host}");
            let mut current = self.host.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() != Some(url.as_str()) {
                info!(product = PRODUCT, host = %url, "Console host discovered");
                *current = Some(url);
            }
        }
        Ok(Phase::Completed)
    }
}

fn auth_services(namespace: &str) -> Vec<kube::api::DynamicObject> {
    [("none-authservice", "none"), ("standard-authservice", "standard")]
        .into_iter()
        .map(|(name, kind)| {
            let mut obj = empty_object(ADMIN_API, "AuthenticationService", Some(namespace), name);
            obj.data["spec"] = json!({ "type": kind });
            obj
        })
        .collect()
}

fn infra_configs(namespace: &str) -> Vec<kube::api::DynamicObject> {
    let mut brokered = empty_object(INFRA_API, "BrokeredInfraConfig", Some(namespace), "default");
    brokered.data["spec"] = json!({
        "admin": {"resources": {"memory": "512Mi"}},
        "broker": {"resources": {"memory": "512Mi", "storage": "5Gi"}, "addressFullPolicy": "FAIL"},
    });
    let mut standard = empty_object(INFRA_API, "StandardInfraConfig", Some(namespace), "default");
    standard.data["spec"] = json!({
        "admin": {"resources": {"memory": "512Mi"}},
        "broker": {"resources": {"memory": "512Mi", "storage": "2Gi"}, "addressFullPolicy": "FAIL"},
        "router": {"minReplicas": 2, "linkCapacity": 250, "resources": {"memory": "512Mi"}},
    });
    vec![brokered, standard]
}

fn address_plans(namespace: &str) -> Vec<kube::api::DynamicObject> {
    [
        ("brokered-queue", "queue", "brokered"),
        ("brokered-topic", "topic", "brokered"),
        ("standard-small-queue", "queue", "standard"),
        ("standard-small-anycast", "anycast", "standard"),
        ("standard-small-multicast", "multicast", "standard"),
    ]
    .into_iter()
    .map(|(name, address_type, space)| {
        let mut obj = empty_object(PLAN_API, "AddressPlan", Some(namespace), name);
        let resources = match space {
            "brokered" => json!({"broker": 0.001}),
            _ => json!({"router": 0.01, "broker": 0.1}),
        };
        obj.data["spec"] = json!({
            "addressType": address_type,
            "displayName": name,
            "resources": resources,
        });
        obj
    })
    .collect()
}

fn address_space_plans(namespace: &str) -> Vec<kube::api::DynamicObject> {
    let mut brokered = empty_object(PLAN_API, "AddressSpacePlan", Some(namespace), "brokered-single-broker");
    brokered.data["spec"] = json!({
        "addressSpaceType": "brokered",
        "infraConfigRef": "default",
        "addressPlans": ["brokered-queue", "brokered-topic"],
        "resourceLimits": {"broker": 1.9},
    });
    let mut standard = empty_object(PLAN_API, "AddressSpacePlan", Some(namespace), "standard-small");
    standard.data["spec"] = json!({
        "addressSpaceType": "standard",
        "infraConfigRef": "default",
        "addressPlans": ["standard-small-queue", "standard-small-anycast", "standard-small-multicast"],
        "resourceLimits": {"router": 2.0, "broker": 2.0, "aggregate": 2.0},
    });
    vec![brokered, standard]
}

#[async_trait]
impl ProductController for Messaging {
    fn name(&self) -> &str {
        PRODUCT
    }

    fn version(&self) -> Option<String> {
        Some(VERSION.to_string())
    }

    fn host(&self) -> Option<String> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn reconcile(&self, ctx: &ReconcileContext, installation: &Installation) -> StepResult {
        let config = Self::config(installation);
        if installation.is_deleting() {
            return self
                .engine
                .finalizers
                .run_teardown(ctx, installation, PRODUCT, || async {
                    Ok(self.engine.applier.remove_namespace(ctx, &config.namespace).await?)
                })
                .await;
        }

        let ns = config.namespace.as_str();
        let labels = namespace_labels(installation, PRODUCT);
        let target = SubscriptionTarget::new(PRODUCT, PACKAGE, ns, installation.name_any());

        StepSequencer::new(PRODUCT)
            .step("namespace", async {
                Ok(self.engine.applier.ensure_namespace(ctx, ns, &labels).await?)
            })
            .step("subscription", async {
                Ok(self.subscriptions.install(ctx, &target).await?)
            })
            .step("auth services", self.seed(ctx, "auth services", auth_services(ns)))
            .step("infra configs", self.seed(ctx, "infra configs", infra_configs(ns)))
            .step("address plans", self.seed(ctx, "address plans", address_plans(ns)))
            .step(
                "address space plans",
                self.seed(ctx, "address space plans", address_space_plans(ns)),
            )
            .step("console", self.discover_console(ctx, ns))
            .run()
            .await
    }
}
