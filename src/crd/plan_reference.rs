// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Class and plan addressing for instances.
//!
//! On the wire a reference is twelve optional fields (three addressing modes times
//! two scopes, one class field and one plan field each). Inside the crate it is the
//! [`PlanReference`] sum type, so exactly one mode is ever in play.

use super::CatalogScope;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire form of a plan reference, flattened into `ServiceInstanceSpec`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanReferenceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_name: Option<String>,

    #[serde(
        rename = "clusterServiceClassExternalID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_service_class_external_id: Option<String>,
    #[serde(
        rename = "clusterServicePlanExternalID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_service_plan_external_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_external_name: Option<String>,

    #[serde(
        rename = "serviceClassExternalID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_class_external_id: Option<String>,
    #[serde(
        rename = "servicePlanExternalID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_plan_external_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_name: Option<String>,
}

/// Which identifier a reference uses to find the class and plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    ExternalName,
    ExternalId,
    KubeName,
}

/// A validated plan reference: exactly one addressing mode in one scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanReference {
    ClusterExternalName { class: String, plan: String },
    ClusterExternalId { class: String, plan: String },
    ClusterKubeName { class: String, plan: String },
    ExternalName { class: String, plan: String },
    ExternalId { class: String, plan: String },
    KubeName { class: String, plan: String },
}

/// A wire reference that does not describe exactly one mode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanReferenceError {
    #[error("a class and plan must be specified")]
    Missing,

    #[error("exactly one of {modes} may be specified")]
    Ambiguous { modes: String },

    #[error("{present} is set but {missing} is not")]
    Incomplete {
        present: &'static str,
        missing: &'static str,
    },
}

impl PlanReference {
    #[must_use]
    pub fn scope(&self) -> CatalogScope {
        match self {
            Self::ClusterExternalName { .. }
            | Self::ClusterExternalId { .. }
            | Self::ClusterKubeName { .. } => CatalogScope::Cluster,
            Self::ExternalName { .. } | Self::ExternalId { .. } | Self::KubeName { .. } => {
                CatalogScope::Namespaced
            }
        }
    }

    #[must_use]
    pub fn addressing(&self) -> Addressing {
        match self {
            Self::ClusterExternalName { .. } | Self::ExternalName { .. } => Addressing::ExternalName,
            Self::ClusterExternalId { .. } | Self::ExternalId { .. } => Addressing::ExternalId,
            Self::ClusterKubeName { .. } | Self::KubeName { .. } => Addressing::KubeName,
        }
    }

    #[must_use]
    pub fn class(&self) -> &str {
        match self {
            Self::ClusterExternalName { class, .. }
            | Self::ClusterExternalId { class, .. }
            | Self::ClusterKubeName { class, .. }
            | Self::ExternalName { class, .. }
            | Self::ExternalId { class, .. }
            | Self::KubeName { class, .. } => class,
        }
    }

    #[must_use]
    pub fn plan(&self) -> &str {
        match self {
            Self::ClusterExternalName { plan, .. }
            | Self::ClusterExternalId { plan, .. }
            | Self::ClusterKubeName { plan, .. }
            | Self::ExternalName { plan, .. }
            | Self::ExternalId { plan, .. }
            | Self::KubeName { plan, .. } => plan,
        }
    }
}

impl fmt::Display for PlanReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ClusterExternalName { .. } => "ClusterServiceClass/ClusterServicePlan",
            Self::ClusterExternalId { .. } => "ClusterServiceClass/ClusterServicePlan externalID",
            Self::ClusterKubeName { .. } => "ClusterServiceClass/ClusterServicePlan name",
            Self::ExternalName { .. } => "ServiceClass/ServicePlan",
            Self::ExternalId { .. } => "ServiceClass/ServicePlan externalID",
            Self::KubeName { .. } => "ServiceClass/ServicePlan name",
        };
        write!(f, "{label} {:?}/{:?}", self.class(), self.plan())
    }
}

/// One (class, plan) field pair together with the mode it selects.
struct ModeFields<'a> {
    class_field: &'static str,
    plan_field: &'static str,
    class: Option<&'a String>,
    plan: Option<&'a String>,
    build: fn(String, String) -> PlanReference,
}

impl TryFrom<&PlanReferenceFields> for PlanReference {
    type Error = PlanReferenceError;

    fn try_from(fields: &PlanReferenceFields) -> Result<Self, Self::Error> {
        let modes = [
            ModeFields {
                class_field: "clusterServiceClassExternalName",
                plan_field: "clusterServicePlanExternalName",
                class: fields.cluster_service_class_external_name.as_ref(),
                plan: fields.cluster_service_plan_external_name.as_ref(),
                build: |class, plan| PlanReference::ClusterExternalName { class, plan },
            },
            ModeFields {
                class_field: "clusterServiceClassExternalID",
                plan_field: "clusterServicePlanExternalID",
                class: fields.cluster_service_class_external_id.as_ref(),
                plan: fields.cluster_service_plan_external_id.as_ref(),
                build: |class, plan| PlanReference::ClusterExternalId { class, plan },
            },
            ModeFields {
                class_field: "clusterServiceClassName",
                plan_field: "clusterServicePlanName",
                class: fields.cluster_service_class_name.as_ref(),
                plan: fields.cluster_service_plan_name.as_ref(),
                build: |class, plan| PlanReference::ClusterKubeName { class, plan },
            },
            ModeFields {
                class_field: "serviceClassExternalName",
                plan_field: "servicePlanExternalName",
                class: fields.service_class_external_name.as_ref(),
                plan: fields.service_plan_external_name.as_ref(),
                build: |class, plan| PlanReference::ExternalName { class, plan },
            },
            ModeFields {
                class_field: "serviceClassExternalID",
                plan_field: "servicePlanExternalID",
                class: fields.service_class_external_id.as_ref(),
                plan: fields.service_plan_external_id.as_ref(),
                build: |class, plan| PlanReference::ExternalId { class, plan },
            },
            ModeFields {
                class_field: "serviceClassName",
                plan_field: "servicePlanName",
                class: fields.service_class_name.as_ref(),
                plan: fields.service_plan_name.as_ref(),
                build: |class, plan| PlanReference::KubeName { class, plan },
            },
        ];

        let populated: Vec<&ModeFields<'_>> = modes
            .iter()
            .filter(|m| m.class.is_some() || m.plan.is_some())
            .collect();

        match populated.as_slice() {
            [] => Err(PlanReferenceError::Missing),
            [mode] => match (mode.class, mode.plan) {
                (Some(class), Some(plan)) if !class.is_empty() && !plan.is_empty() => {
                    Ok((mode.build)(class.clone(), plan.clone()))
                }
                (Some(class), _) if !class.is_empty() => Err(PlanReferenceError::Incomplete {
                    present: mode.class_field,
                    missing: mode.plan_field,
                }),
                _ => Err(PlanReferenceError::Incomplete {
                    present: mode.plan_field,
                    missing: mode.class_field,
                }),
            },
            many => Err(PlanReferenceError::Ambiguous {
                modes: many
                    .iter()
                    .map(|m| format!("{}/{}", m.class_field, m.plan_field))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

impl From<&PlanReference> for PlanReferenceFields {
    fn from(reference: &PlanReference) -> Self {
        let mut fields = Self::default();
        let (class, plan) = (
            Some(reference.class().to_string()),
            Some(reference.plan().to_string()),
        );
        match reference {
            PlanReference::ClusterExternalName { .. } => {
                fields.cluster_service_class_external_name = class;
                fields.cluster_service_plan_external_name = plan;
            }
            PlanReference::ClusterExternalId { .. } => {
                fields.cluster_service_class_external_id = class;
                fields.cluster_service_plan_external_id = plan;
            }
            PlanReference::ClusterKubeName { .. } => {
                fields.cluster_service_class_name = class;
                fields.cluster_service_plan_name = plan;
            }
            PlanReference::ExternalName { .. } => {
                fields.service_class_external_name = class;
                fields.service_plan_external_name = plan;
            }
            PlanReference::ExternalId { .. } => {
                fields.service_class_external_id = class;
                fields.service_plan_external_id = plan;
            }
            PlanReference::KubeName { .. } => {
                fields.service_class_name = class;
                fields.service_plan_name = plan;
            }
        }
        fields
    }
}
