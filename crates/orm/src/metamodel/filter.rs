//! Filter and fetch profile definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator used by filter conditions and criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    IsNull,
    IsNotNull,
}

impl ComparisonOp {
    /// Whether the operator takes a parameter
    pub fn takes_parameter(&self) -> bool {
        !matches!(self, ComparisonOp::IsNull | ComparisonOp::IsNotNull)
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::In => "IN",
            ComparisonOp::IsNull => "IS NULL",
            ComparisonOp::IsNotNull => "IS NOT NULL",
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A named, parameterized restriction that contexts may enable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDefinition {
    name: String,
    column: String,
    op: ComparisonOp,
    parameter: Option<String>,
}

impl FilterDefinition {
    /// Restrict `column` by comparing it with the value bound to `parameter`
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        op: ComparisonOp,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            op,
            parameter: Some(parameter.into()),
        }
    }

    /// Restrict `column` with a parameterless operator such as `IS NULL`
    pub fn unary(name: impl Into<String>, column: impl Into<String>, op: ComparisonOp) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            op,
            parameter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> ComparisonOp {
        self.op
    }

    pub fn parameter(&self) -> Option<&str> {
        self.parameter.as_deref()
    }
}

/// Named set of associations that become join-fetched while the profile is enabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchProfile {
    name: String,
    fetches: Vec<(String, String)>,
}

impl FetchProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fetches: Vec::new(),
        }
    }

    /// Join-fetch `association` of `kind`
    pub fn fetch(mut self, kind: impl Into<String>, association: impl Into<String>) -> Self {
        self.fetches.push((kind.into(), association.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fetches(&self) -> &[(String, String)] {
        &self.fetches
    }

    pub fn applies_to(&self, kind: &str) -> bool {
        self.fetches.iter().any(|(k, _)| k == kind)
    }

    pub fn fetches_association(&self, kind: &str, association: &str) -> bool {
        self.fetches
            .iter()
            .any(|(k, a)| k == kind && a == association)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_definitions() {
        let filter = FilterDefinition::new("minTotal", "total", ComparisonOp::Ge, "min");
        assert_eq!(filter.parameter(), Some("min"));
        assert!(filter.op().takes_parameter());

        let open = FilterDefinition::unary("open", "closed_at", ComparisonOp::IsNull);
        assert!(open.parameter().is_none());
        assert!(!open.op().takes_parameter());
    }

    #[test]
    fn test_fetch_profile_matching() {
        let profile = FetchProfile::new("checkout")
            .fetch("Order", "customer")
            .fetch("Customer", "orders");
        assert!(profile.applies_to("Order"));
        assert!(profile.fetches_association("Customer", "orders"));
        assert!(!profile.fetches_association("Order", "lines"));
        assert!(!profile.applies_to("Product"));
    }
}
