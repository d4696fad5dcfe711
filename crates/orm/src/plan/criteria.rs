//! Criteria queries

use crate::backends::DatabaseValue;
use crate::metamodel::ComparisonOp;

#[derive(Debug, Clone, PartialEq)]
pub struct Restriction {
    pub attribute: String,
    pub op: ComparisonOp,
    pub value: DatabaseValue,
}

/// Restrictions on one entity kind, combined with `AND`.
///
/// Attributes are named as in the metamodel: the identifier attribute, basic attributes,
/// and many-to-one attributes (compared by the target's identifier).
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    kind: String,
    restrictions: Vec<Restriction>,
    order: Vec<(String, bool)>,
    limit: Option<usize>,
    read_only: bool,
}

impl Criteria {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            restrictions: Vec::new(),
            order: Vec::new(),
            limit: None,
            read_only: false,
        }
    }

    pub fn restrict(
        mut self,
        attribute: impl Into<String>,
        op: ComparisonOp,
        value: impl Into<DatabaseValue>,
    ) -> Self {
        self.restrictions.push(Restriction {
            attribute: attribute.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, attribute: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.restrict(attribute, ComparisonOp::Eq, value)
    }

    pub fn is_null(self, attribute: impl Into<String>) -> Self {
        self.restrict(attribute, ComparisonOp::IsNull, DatabaseValue::Null)
    }

    /// `attribute IN (values...)`
    pub fn in_list<V: Into<DatabaseValue>>(
        self,
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.restrict(attribute, ComparisonOp::In, DatabaseValue::Array(values))
    }

    pub fn order_by(mut self, attribute: impl Into<String>) -> Self {
        self.order.push((attribute.into(), false));
        self
    }

    pub fn order_by_desc(mut self, attribute: impl Into<String>) -> Self {
        self.order.push((attribute.into(), true));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Register loaded instances as read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    pub fn ordering(&self) -> &[(String, bool)] {
        &self.order
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}
