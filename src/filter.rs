// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Selector-style predicates over string property maps.
//!
//! The same engine serves two purposes:
//!
//! - Broker catalog restrictions, compiled by [`CatalogPredicate::compile`] and applied
//!   to the property set of every class and plan before it is created
//! - Label selectors accepted by the in-memory entity store
//!
//! # Grammar
//!
//! ```text
//! selector    := requirement ("," requirement)*
//! requirement := key op value
//!              | key set-op "(" value ("," value)* ")"
//! op          := "=" | "==" | "!="
//! set-op      := "in" | "notin"
//! ```
//!
//! Requirements are ANDed. `!=` and `notin` also match when the key is absent.
//!
//! # Example
//!
//! ```rust
//! use svcat::filter::Selector;
//! use std::collections::BTreeMap;
//!
//! let selector = Selector::parse("spec.externalName in (Foo,Bar), spec.free=true").unwrap();
//! let props = BTreeMap::from([
//!     ("spec.externalName".to_string(), "Foo".to_string()),
//!     ("spec.free".to_string(), "true".to_string()),
//! ]);
//! assert!(selector.matches(&props));
//! ```

use crate::crd::{CatalogRestrictions, CatalogScope, ClassResource, PlanResource};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Errors from compiling a selector expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The expression does not follow the selector grammar.
    #[error("invalid selector {expression:?}: {message}")]
    Syntax {
        /// Full expression being parsed.
        expression: String,
        /// What was wrong at the failing position.
        message: String,
    },

    /// The expression names a property that the target kind does not expose.
    #[error("unknown property {property:?}; allowed properties are {allowed}")]
    UnknownProperty {
        property: String,
        /// Comma separated list of accepted property names.
        allowed: String,
    },
}

/// Comparison applied by one requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Equals,
    DoubleEquals,
    NotEquals,
    In,
    NotIn,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equals => "=",
            Self::DoubleEquals => "==",
            Self::NotEquals => "!=",
            Self::In => "in",
            Self::NotIn => "notin",
        })
    }
}

/// One `key op value(s)` term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    #[must_use]
    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        let actual = properties.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::DoubleEquals | Operator::In => {
                actual.is_some_and(|v| self.values.contains(v))
            }
            Operator::NotEquals | Operator::NotIn => actual.is_none_or(|v| !self.values.contains(v)),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse a comma separated selector expression.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Syntax`] when the expression does not follow the grammar.
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        Parser::new(expression).parse()
    }

    /// Parse a list of expressions whose requirements are all ANDed together.
    ///
    /// # Errors
    ///
    /// Returns the first [`FilterError::Syntax`] found.
    pub fn from_expressions<S: AsRef<str>>(expressions: &[S]) -> Result<Self, FilterError> {
        let mut requirements = Vec::new();
        for expression in expressions {
            requirements.extend(Self::parse(expression.as_ref())?.requirements);
        }
        Ok(Self { requirements })
    }

    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    #[must_use]
    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(properties))
    }

    /// Reject requirements on properties outside `allowed`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::UnknownProperty`] for the first offending key.
    pub fn validate_keys(&self, allowed: &[&str]) -> Result<(), FilterError> {
        match self
            .requirements
            .iter()
            .find(|r| !allowed.contains(&r.key.as_str()))
        {
            Some(bad) => Err(FilterError::UnknownProperty {
                property: bad.key.clone(),
                allowed: allowed.join(", "),
            }),
            None => Ok(()),
        }
    }
}

/// Characters that end a key or a bare value.
fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '=' | '!' | '(' | ')' | ',')
}

struct Parser<'a> {
    expression: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(expression: &'a str) -> Self {
        Self {
            expression,
            chars: expression.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::Syntax {
            expression: self.expression.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| !is_delimiter(c)) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse(mut self) -> Result<Selector, FilterError> {
        let mut requirements = Vec::new();
        self.skip_whitespace();
        if self.peek().is_none() {
            return Ok(Selector { requirements });
        }
        loop {
            requirements.push(self.requirement()?);
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some(',') => self.pos += 1,
                Some(c) => return Err(self.error(format!("unexpected {c:?} after requirement"))),
            }
        }
        Ok(Selector { requirements })
    }

    fn requirement(&mut self) -> Result<Requirement, FilterError> {
        self.skip_whitespace();
        let key = self.word();
        if key.is_empty() {
            return Err(self.error("expected a property name"));
        }
        self.skip_whitespace();
        let operator = self.operator()?;
        self.skip_whitespace();
        let values = match operator {
            Operator::In | Operator::NotIn => self.value_set()?,
            _ => BTreeSet::from([self.word()]),
        };
        Ok(Requirement {
            key,
            operator,
            values,
        })
    }

    fn operator(&mut self) -> Result<Operator, FilterError> {
        if self.eat('=') {
            return Ok(if self.eat('=') {
                Operator::DoubleEquals
            } else {
                Operator::Equals
            });
        }
        if self.eat('!') {
            if self.eat('=') {
                return Ok(Operator::NotEquals);
            }
            return Err(self.error("expected '=' after '!'"));
        }
        match self.word().as_str() {
            "in" => Ok(Operator::In),
            "notin" => Ok(Operator::NotIn),
            "" => Err(self.error("expected an operator")),
            other => Err(self.error(format!("unknown operator {other:?}"))),
        }
    }

    fn value_set(&mut self) -> Result<BTreeSet<String>, FilterError> {
        if !self.eat('(') {
            return Err(self.error("expected '(' to open a value set"));
        }
        let mut values = BTreeSet::new();
        loop {
            self.skip_whitespace();
            let value = self.word();
            self.skip_whitespace();
            if !value.is_empty() {
                values.insert(value);
            }
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => return Err(self.error(format!("unexpected {c:?} in value set"))),
                None => return Err(self.error("unterminated value set")),
            }
        }
        if values.is_empty() {
            return Err(self.error("value set must not be empty"));
        }
        Ok(values)
    }
}

// ============================================================================
// Catalog restrictions
// ============================================================================

/// Property names a class restriction may use, per scope.
#[must_use]
pub fn allowed_class_properties(scope: CatalogScope) -> Vec<&'static str> {
    let broker = match scope {
        CatalogScope::Cluster => "spec.clusterServiceBrokerName",
        CatalogScope::Namespaced => "spec.serviceBrokerName",
    };
    vec!["name", "spec.externalName", "spec.externalID", broker]
}

/// Property names a plan restriction may use, per scope.
#[must_use]
pub fn allowed_plan_properties(scope: CatalogScope) -> Vec<&'static str> {
    let class = match scope {
        CatalogScope::Cluster => "spec.clusterServiceClass.name",
        CatalogScope::Namespaced => "spec.serviceClassRef.name",
    };
    let mut allowed = allowed_class_properties(scope);
    allowed.extend(["spec.free", class]);
    allowed
}

/// Property set used to filter a class.
pub fn class_properties<C: ClassResource>(class: &C) -> BTreeMap<String, String> {
    let spec = class.common_spec();
    BTreeMap::from([
        ("name".to_string(), class.name_any()),
        ("spec.externalName".to_string(), spec.external_name.clone()),
        ("spec.externalID".to_string(), spec.external_id.clone()),
        (C::BROKER_NAME_PROPERTY.to_string(), class.broker_name().to_string()),
    ])
}

/// Property set used to filter a plan.
pub fn plan_properties<P: PlanResource>(plan: &P) -> BTreeMap<String, String> {
    let spec = plan.common_spec();
    BTreeMap::from([
        ("name".to_string(), plan.name_any()),
        ("spec.externalName".to_string(), spec.external_name.clone()),
        ("spec.externalID".to_string(), spec.external_id.clone()),
        (P::BROKER_NAME_PROPERTY.to_string(), plan.broker_name().to_string()),
        ("spec.free".to_string(), spec.free.to_string()),
        (P::CLASS_NAME_PROPERTY.to_string(), plan.class_name().to_string()),
    ])
}

/// Compiled `catalogRestrictions` of a broker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogPredicate {
    classes: Selector,
    plans: Selector,
}

impl CatalogPredicate {
    /// Compile both restriction lists and validate their property names for `scope`.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] when an expression is malformed or uses a
    /// property the kind does not expose.
    pub fn compile(
        restrictions: Option<&CatalogRestrictions>,
        scope: CatalogScope,
    ) -> Result<Self, FilterError> {
        let Some(restrictions) = restrictions else {
            return Ok(Self::default());
        };
        let classes = Selector::from_expressions(&restrictions.service_class)?;
        classes.validate_keys(&allowed_class_properties(scope))?;
        let plans = Selector::from_expressions(&restrictions.service_plan)?;
        plans.validate_keys(&allowed_plan_properties(scope))?;
        Ok(Self { classes, plans })
    }

    #[must_use]
    pub fn accepts_class<C: ClassResource>(&self, class: &C) -> bool {
        self.classes.matches(&class_properties(class))
    }

    #[must_use]
    pub fn accepts_plan<P: PlanResource>(&self, plan: &P) -> bool {
        self.plans.matches(&plan_properties(plan))
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod filter_tests;
