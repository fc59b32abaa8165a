//! Custom Resource Definitions and supporting types

mod installation;
mod types;

pub use installation::{
    Installation, InstallationSpec, InstallationStatus, ProductStatus, API_GROUP,
    INSTALLATION_API_VERSION, INSTALLATION_KIND,
};
pub use types::{Condition, ConditionStatus, InstallationType, Phase};
