//! Product controllers composed from the Meridian convergence engine
//!
//! Each controller owns one product namespace, installs its operator through
//! a [`SubscriptionInstaller`], and orders its own teardown through a
//! finalizer marker on the Installation.

#![deny(missing_docs)]

pub mod api_management;
pub mod claims;
pub mod cloud_resources;
pub mod keycloak;
pub mod messaging;
pub mod subscription;

pub use api_management::ApiManagement;
pub use claims::{Claim, ClaimKind, ClaimState};
pub use cloud_resources::CloudResources;
pub use keycloak::KeycloakUserDirectory;
pub use messaging::Messaging;
pub use subscription::{StoreSubscriptionInstaller, SubscriptionInstaller, SubscriptionTarget};

use std::collections::BTreeMap;

use kube::ResourceExt;
use meridian_common::crd::Installation;
use meridian_common::kube_utils::{INSTALLATION_LABEL, PRODUCT_LABEL};

/// Labels stamped on every namespace a product creates
pub(crate) fn namespace_labels(installation: &Installation, product: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INSTALLATION_LABEL.to_string(), installation.name_any()),
        (PRODUCT_LABEL.to_string(), product.to_string()),
    ])
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use meridian_common::crd::{Installation, InstallationSpec, InstallationType};
    use meridian_common::kube_utils::{empty_object, set_secret_data};
    use meridian_common::store::MemoryStore;

    pub fn installation(installation_type: InstallationType) -> Installation {
        let mut inst = Installation::new(
            "rhmi",
            InstallationSpec {
                installation_type,
                namespace_prefix: "redhat-rhmi-".to_string(),
                smtp_secret: Some("redhat-rhmi-smtp".to_string()),
                routing_subdomain: Some("apps.example.com".to_string()),
            },
        );
        inst.metadata.namespace = Some("redhat-rhmi-operator".to_string());
        inst
    }

    pub fn seed_secret(store: &MemoryStore, namespace: &str, name: &str, pairs: &[(&str, &str)]) {
        let mut secret = empty_object("v1", "Secret", Some(namespace), name);
        let data: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        set_secret_data(&mut secret, &data).expect("encode secret");
        store.seed(secret).expect("seed secret");
    }
}
