//! Scope of a bulk submission.
//!
//! A submission may only reconcile against stored records of its own type and,
//! for vendor types, its own account, endpoint or tenant. The scope predicate
//! is the type clause plus one grouping of vendor context equalities.

use crate::error::{HostdbError, Result};
use crate::identity::TypeMatcher;
use crate::mapping::{Column, FieldMapping};
use crate::predicate::{Clause, Grouping, Key, Operator, Relativity, WhereClauses};
use crate::record::{scalar_text, Context};

/// One context equality: the query parameter (and variant) whose configured
/// location is compared, and the submission context key supplying the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeField {
    pub param: String,
    pub variant: String,
    pub context_key: String,
}

impl ScopeField {
    pub fn new(param: &str, variant: &str, context_key: &str) -> Self {
        Self {
            param: param.to_string(),
            variant: variant.to_string(),
            context_key: context_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRule {
    pub matcher: TypeMatcher,
    /// Match stored types by prefix rather than equality.
    pub type_prefix: bool,
    pub fields: Vec<ScopeField>,
}

#[derive(Debug, Clone)]
pub struct ScopeRegistry {
    rules: Vec<ScopeRule>,
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(ScopeRule {
                matcher: TypeMatcher::contains("aws"),
                type_prefix: false,
                fields: vec![
                    ScopeField::new("aws-region", "aws", "aws-region"),
                    ScopeField::new("aws-account-id", "aws", "aws-account-id"),
                ],
            })
            .register(ScopeRule {
                matcher: TypeMatcher::contains("oneview"),
                type_prefix: false,
                fields: vec![ScopeField::new("oneview_url", "oneview", "oneview_url")],
            })
            .register(ScopeRule {
                matcher: TypeMatcher::exact("openstack"),
                type_prefix: false,
                fields: vec![ScopeField::new("tenant", "openstack", "tenant_name")],
            })
            .register(ScopeRule {
                matcher: TypeMatcher::contains("ucs"),
                type_prefix: false,
                fields: vec![ScopeField::new("ucs_url", "ucs", "ucs_url")],
            })
            .register(ScopeRule {
                matcher: TypeMatcher::exact("vrops-vmware"),
                type_prefix: true,
                fields: vec![ScopeField::new("vc_url", "vrops-vmware", "vc_url")],
            });
        registry
    }
}

impl ScopeRegistry {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Adds a rule; the first rule matching a type is the only one applied.
    pub fn register(&mut self, rule: ScopeRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_for(&self, record_type: &str) -> Option<&ScopeRule> {
        self.rules.iter().find(|rule| rule.matcher.matches(record_type))
    }

    /// Builds the predicate selecting the stored records a submission owns.
    pub fn scope_for(&self, record_type: &str, context: &Context, mapping: &FieldMapping) -> Result<WhereClauses> {
        let rule = self.rule_for(record_type);
        let type_clause = match rule {
            Some(rule) if rule.type_prefix => Clause::new(
                Relativity::And,
                vec![Key::Column(Column::Type)],
                Operator::Like,
                vec![format!("{record_type}%")],
            ),
            _ => Clause::new(
                Relativity::And,
                vec![Key::Column(Column::Type)],
                Operator::Eq,
                vec![record_type.to_string()],
            ),
        };
        let mut clauses = WhereClauses::new();
        clauses.push(Grouping::new(vec![type_clause]));

        let Some(rule) = rule else {
            return Ok(clauses);
        };
        let mut vendor = Vec::with_capacity(rule.fields.len());
        for field in &rule.fields {
            let key = mapping.key_for(&field.param, &field.variant).ok_or_else(|| {
                HostdbError::Config(format!(
                    "no storage location configured for query param '{}' ({})",
                    field.param, field.variant
                ))
            })?;
            let value = context
                .get(&field.context_key)
                .and_then(scalar_text)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    HostdbError::validation(format!("missing context value for {}", field.context_key))
                })?;
            vendor.push(Clause::new(Relativity::And, vec![key], Operator::Eq, vec![value]));
        }
        clauses.push(Grouping::new(vendor));
        Ok(clauses)
    }
}
