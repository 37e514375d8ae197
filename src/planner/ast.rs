//! Query structures
//!
//! Defines the query representation consumed by the optimizer and the
//! query engine. Queries are plain serde values; the JSON form uses
//! camelCase field names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::Where;
use crate::error::{DbError, DbResult};

/// Selects every field of the document
pub const SELECT_ALL: &str = "*";

/// Aggregate applied to a group of documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Max,
    Min,
    Sum,
    Avg,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Max => "max",
            AggregateFunction::Min => "min",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A selected field, optionally aggregated and renamed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Select {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateFunction>,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Select {
    pub fn field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            aggregate: None,
            alias: None,
        }
    }

    pub fn all() -> Self {
        Self::field(SELECT_ALL)
    }

    pub fn aggregate(function: AggregateFunction, field: impl Into<String>) -> Self {
        Self {
            aggregate: Some(function),
            ..Self::field(field)
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn is_all(&self) -> bool {
        self.field == SELECT_ALL
    }

    /// Name of the field in the output document.
    ///
    /// Aggregates without an alias are named `{function}_{field}` with dots
    /// replaced by underscores.
    pub fn output_name(&self) -> String {
        match (&self.alias, self.aggregate) {
            (Some(alias), _) => alias.clone(),
            (None, Some(function)) => {
                format!("{}_{}", function.as_str(), self.field.replace('.', "_"))
            }
            (None, None) => self.field.clone(),
        }
    }
}

/// Nested-loop join against another collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub collection: String,
    /// Join predicates; `$.`-prefixed values refer to the outer document
    pub on: Vec<Where>,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Join {
    pub fn new(collection: impl Into<String>, on: Vec<Where>) -> Self {
        Self {
            collection: collection.into(),
            on,
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Field the joined document is merged under
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.collection)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Query against one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub select: Vec<Select>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join: Vec<Join>,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Where>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub having: Vec<Where>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    /// Page size; 0 means unlimited
    #[serde(default)]
    pub limit: usize,
    /// Zero-based page number
    #[serde(default)]
    pub page: usize,
}

impl Query {
    /// `select *` with no filter
    pub fn new() -> Self {
        Self {
            select: vec![Select::all()],
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> DbResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Replaces the select list
    pub fn select(mut self, select: Vec<Select>) -> Self {
        self.select = select;
        self
    }

    pub fn with_where(mut self, predicate: Where) -> Self {
        self.filter.push(predicate);
        self
    }

    pub fn with_join(mut self, join: Join) -> Self {
        self.join.push(join);
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_having(mut self, predicate: Where) -> Self {
        self.having.push(predicate);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn is_aggregate(&self) -> bool {
        self.select.iter().any(|s| s.aggregate.is_some())
    }

    /// Checks the query shape before any I/O
    pub fn validate(&self) -> DbResult<()> {
        if self.select.is_empty() {
            return Err(DbError::validation("at least one select is required"));
        }
        if let Some(empty) = self.select.iter().find(|s| s.field.is_empty()) {
            return Err(DbError::validation(format!(
                "empty select field (alias {:?})",
                empty.alias
            )));
        }

        if self.is_aggregate() {
            for select in self.select.iter().filter(|s| s.aggregate.is_none()) {
                if !self.group_by.contains(&select.field) {
                    return Err(DbError::validation(format!(
                        "'{}' is required in the group_by clause when aggregating",
                        select.field
                    )));
                }
            }
            for group in &self.group_by {
                if !self.select.iter().any(|s| &s.field == group) {
                    return Err(DbError::validation(format!(
                        "'{}' is required in the select clause when aggregating",
                        group
                    )));
                }
            }
        } else if !self.having.is_empty() {
            return Err(DbError::validation("having requires an aggregate select"));
        }

        for join in &self.join {
            if join.collection.is_empty() {
                return Err(DbError::validation("join requires a collection"));
            }
            if join.on.is_empty() {
                return Err(DbError::validation(format!(
                    "join on {} requires at least one 'on' predicate",
                    join.collection
                )));
            }
        }

        if let Some(order) = self.order_by.iter().find(|o| o.field.is_empty()) {
            return Err(DbError::validation(format!(
                "empty order_by field ({})",
                order.direction.as_str()
            )));
        }
        Ok(())
    }
}
