// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `filter.rs`

#[cfg(test)]
mod tests {
    use crate::crd::{
        CatalogRestrictions, CatalogScope, ClassResource, ClusterServiceClass, ClusterServicePlan,
        CommonServiceClassSpec, CommonServicePlanSpec, PlanResource, ServiceClass,
    };
    use crate::filter::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn cluster_class(name: &str, external_name: &str) -> ClusterServiceClass {
        ClusterServiceClass::from_catalog(
            ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            "broker-a",
            CommonServiceClassSpec {
                external_name: external_name.to_string(),
                external_id: format!("{external_name}-id"),
                ..Default::default()
            },
        )
    }

    fn cluster_plan(external_name: &str, free: bool) -> ClusterServicePlan {
        ClusterServicePlan::from_catalog(
            ObjectMeta {
                name: Some(format!("{external_name}-kube")),
                ..Default::default()
            },
            "broker-a",
            "class-kube",
            CommonServicePlanSpec {
                external_name: external_name.to_string(),
                external_id: format!("{external_name}-id"),
                free,
                ..Default::default()
            },
        )
    }

    // ============================================================================
    // Parsing
    // ============================================================================

    #[test]
    fn test_parse_empty_matches_everything() {
        let selector = Selector::parse("   ").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_parse_all_operators() {
        let selector =
            Selector::parse("a=1, b==2, c!=3, d in (x, y), e notin (z)").unwrap();
        let ops: Vec<Operator> = selector.requirements().iter().map(|r| r.operator).collect();
        assert_eq!(
            ops,
            vec![
                Operator::Equals,
                Operator::DoubleEquals,
                Operator::NotEquals,
                Operator::In,
                Operator::NotIn
            ]
        );
        assert_eq!(selector.requirements()[3].values.len(), 2);
    }

    #[test]
    fn test_parse_dotted_and_slashed_keys() {
        let selector = Selector::parse("servicecatalog.k8s.io/spec.externalID=abc").unwrap();
        assert_eq!(
            selector.requirements()[0].key,
            "servicecatalog.k8s.io/spec.externalID"
        );
    }

    #[test]
    fn test_parse_rejects_unknown_operator() {
        let err = Selector::parse("spec.externalName like Foo").unwrap_err();
        assert!(matches!(err, FilterError::Syntax { .. }));
        assert!(err.to_string().contains("like"));
    }

    #[test]
    fn test_parse_rejects_unterminated_set() {
        assert!(Selector::parse("name in (a, b").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_set() {
        assert!(Selector::parse("name in ()").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_key() {
        assert!(Selector::parse("=foo").is_err());
    }

    #[test]
    fn test_parse_rejects_trailing_garbage() {
        assert!(Selector::parse("a=b c").is_err());
    }

    // ============================================================================
    // Matching
    // ============================================================================

    #[test]
    fn test_equals_requires_presence() {
        let selector = Selector::parse("a=1").unwrap();
        assert!(selector.matches(&props(&[("a", "1")])));
        assert!(!selector.matches(&props(&[("a", "2")])));
        assert!(!selector.matches(&props(&[])));
    }

    #[test]
    fn test_not_equals_matches_absent_key() {
        let selector = Selector::parse("a!=1").unwrap();
        assert!(selector.matches(&props(&[])));
        assert!(selector.matches(&props(&[("a", "2")])));
        assert!(!selector.matches(&props(&[("a", "1")])));
    }

    #[test]
    fn test_notin_matches_absent_key() {
        let selector = Selector::parse("a notin (1,2)").unwrap();
        assert!(selector.matches(&props(&[])));
        assert!(!selector.matches(&props(&[("a", "2")])));
    }

    #[test]
    fn test_requirements_are_anded() {
        let selector = Selector::from_expressions(&["a=1", "b in (x,y)"]).unwrap();
        assert!(selector.matches(&props(&[("a", "1"), ("b", "y")])));
        assert!(!selector.matches(&props(&[("a", "1"), ("b", "z")])));
    }

    // ============================================================================
    // Catalog restrictions
    // ============================================================================

    #[test]
    fn test_whitelist_admits_only_listed_classes() {
        let restrictions = CatalogRestrictions {
            service_class: vec!["spec.externalName in (Foo,Bar)".to_string()],
            service_plan: vec![],
        };
        let predicate = CatalogPredicate::compile(Some(&restrictions), CatalogScope::Cluster).unwrap();

        assert!(predicate.accepts_class(&cluster_class("foo", "Foo")));
        assert!(predicate.accepts_class(&cluster_class("bar", "Bar")));
        assert!(!predicate.accepts_class(&cluster_class("baz", "Baz")));
    }

    #[test]
    fn test_plan_restriction_on_free_flag() {
        let restrictions = CatalogRestrictions {
            service_class: vec![],
            service_plan: vec!["spec.free=true".to_string()],
        };
        let predicate = CatalogPredicate::compile(Some(&restrictions), CatalogScope::Cluster).unwrap();

        assert!(predicate.accepts_plan(&cluster_plan("free-tier", true)));
        assert!(!predicate.accepts_plan(&cluster_plan("gold", false)));
    }

    #[test]
    fn test_no_restrictions_admit_everything() {
        let predicate = CatalogPredicate::compile(None, CatalogScope::Cluster).unwrap();
        assert!(predicate.accepts_class(&cluster_class("baz", "Baz")));
        assert!(predicate.accepts_plan(&cluster_plan("gold", false)));
    }

    #[test]
    fn test_plan_property_rejected_for_classes() {
        let restrictions = CatalogRestrictions {
            service_class: vec!["spec.free=true".to_string()],
            service_plan: vec![],
        };
        let err = CatalogPredicate::compile(Some(&restrictions), CatalogScope::Cluster).unwrap_err();
        match err {
            FilterError::UnknownProperty { property, allowed } => {
                assert_eq!(property, "spec.free");
                assert!(allowed.contains("spec.clusterServiceBrokerName"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_scope_decides_broker_property() {
        let restrictions = CatalogRestrictions {
            service_class: vec!["spec.clusterServiceBrokerName=broker-a".to_string()],
            service_plan: vec![],
        };
        assert!(CatalogPredicate::compile(Some(&restrictions), CatalogScope::Cluster).is_ok());
        assert!(CatalogPredicate::compile(Some(&restrictions), CatalogScope::Namespaced).is_err());
    }

    #[test]
    fn test_class_property_set() {
        let class = ServiceClass::from_catalog(
            ObjectMeta {
                name: Some("kube-name".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            "broker-b",
            CommonServiceClassSpec {
                external_name: "mysql".to_string(),
                external_id: "mysql-id".to_string(),
                ..Default::default()
            },
        );
        let set = class_properties(&class);
        assert_eq!(set["name"], "kube-name");
        assert_eq!(set["spec.externalName"], "mysql");
        assert_eq!(set["spec.externalID"], "mysql-id");
        assert_eq!(set["spec.serviceBrokerName"], "broker-b");
    }

    #[test]
    fn test_plan_property_set() {
        let plan = cluster_plan("small", true);
        let set = plan_properties(&plan);
        assert_eq!(set["spec.free"], "true");
        assert_eq!(set["spec.clusterServiceClass.name"], "class-kube");
        assert_eq!(set[ClusterServicePlan::BROKER_NAME_PROPERTY], "broker-a");
    }
}
