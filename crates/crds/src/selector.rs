//! Host label selector evaluation.
//!
//! Machines limit which hosts they may claim with a `hostSelector` of
//! equality labels plus set-based expressions. Operators are matched
//! case-insensitively; an unknown operator fails selector compilation
//! rather than silently matching nothing.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Matching criteria for labels on hosts, limiting the set of hosts
/// considered for claiming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostSelector {
    /// Labels that must be present with exactly these values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// Set-based label requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

/// One set-based requirement in a host selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,

    /// One of In, NotIn, Exists, DoesNotExist (case-insensitive)
    pub operator: String,

    /// Values the operator compares against (In/NotIn only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Errors raised while compiling a selector.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unknown selector operator {0:?}")]
    UnknownOperator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Operator {
    fn parse(raw: &str) -> Result<Self, SelectorError> {
        match raw.to_ascii_lowercase().as_str() {
            "in" => Ok(Operator::In),
            "notin" => Ok(Operator::NotIn),
            "exists" => Ok(Operator::Exists),
            "doesnotexist" => Ok(Operator::DoesNotExist),
            _ => Err(SelectorError::UnknownOperator(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct Requirement {
    key: String,
    operator: Operator,
    values: Vec<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.is_some_and(|v| self.values.iter().any(|c| c == v)),
            // NotIn matches when the key is absent entirely
            Operator::NotIn => value.is_none_or(|v| !self.values.iter().any(|c| c == v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A selector compiled into a flat requirement list, ready to match
/// against host labels.
#[derive(Debug, Clone, Default)]
pub struct CompiledSelector {
    requirements: Vec<Requirement>,
}

impl CompiledSelector {
    /// An empty selector matches every host.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl HostSelector {
    /// Compiles the selector into requirements, validating every operator.
    pub fn compile(&self) -> Result<CompiledSelector, SelectorError> {
        let mut requirements = Vec::new();
        if let Some(labels) = &self.match_labels {
            for (key, value) in labels {
                requirements.push(Requirement {
                    key: key.clone(),
                    operator: Operator::In,
                    values: vec![value.clone()],
                });
            }
        }
        if let Some(expressions) = &self.match_expressions {
            for expression in expressions {
                requirements.push(Requirement {
                    key: expression.key.clone(),
                    operator: Operator::parse(&expression.operator)?,
                    values: expression.values.clone(),
                });
            }
        }
        Ok(CompiledSelector { requirements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expression(key: &str, operator: &str, values: &[&str]) -> SelectorRequirement {
        SelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = HostSelector::default().compile().unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("size", "large")])));
    }

    #[test]
    fn test_match_labels_equality() {
        let selector = HostSelector {
            match_labels: Some(labels(&[("size", "small")])),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(selector.matches(&labels(&[("size", "small"), ("rack", "r1")])));
        assert!(!selector.matches(&labels(&[("size", "large")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_match_expression_in_and_not_in() {
        let selector = HostSelector {
            match_expressions: Some(vec![expression("size", "In", &["small", "medium"])]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(selector.matches(&labels(&[("size", "medium")])));
        assert!(!selector.matches(&labels(&[("size", "large")])));

        let selector = HostSelector {
            match_expressions: Some(vec![expression("size", "NotIn", &["large"])]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(selector.matches(&labels(&[("size", "small")])));
        // key absent also satisfies NotIn
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("size", "large")])));
    }

    #[test]
    fn test_match_expression_existence() {
        let selector = HostSelector {
            match_expressions: Some(vec![expression("gpu", "Exists", &[])]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(selector.matches(&labels(&[("gpu", "a100")])));
        assert!(!selector.matches(&labels(&[])));

        let selector = HostSelector {
            match_expressions: Some(vec![expression("gpu", "DoesNotExist", &[])]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("gpu", "a100")])));
    }

    #[test]
    fn test_operator_is_case_insensitive() {
        for raw in ["in", "IN", "In", "iN"] {
            let selector = HostSelector {
                match_expressions: Some(vec![expression("size", raw, &["small"])]),
                ..Default::default()
            }
            .compile()
            .unwrap();
            assert!(selector.matches(&labels(&[("size", "small")])));
        }
    }

    #[test]
    fn test_unknown_operator_fails_compilation() {
        let result = HostSelector {
            match_expressions: Some(vec![expression("size", "Like", &["small"])]),
            ..Default::default()
        }
        .compile();
        assert_eq!(result.unwrap_err(), SelectorError::UnknownOperator("Like".to_string()));
    }

    #[test]
    fn test_labels_and_expressions_combine_conjunctively() {
        let selector = HostSelector {
            match_labels: Some(labels(&[("rack", "r1")])),
            match_expressions: Some(vec![expression("size", "In", &["small"])]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(selector.matches(&labels(&[("rack", "r1"), ("size", "small")])));
        assert!(!selector.matches(&labels(&[("rack", "r1"), ("size", "large")])));
        assert!(!selector.matches(&labels(&[("rack", "r2"), ("size", "small")])));
    }
}
