// Structured query model
//
// Mirrors the shape of a Dataverse QueryExpression closely enough to express the linked
// lookups this tool issues. `fetchxml::render` turns it into FetchXML for the Web API and the
// test fake evaluates it directly.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSet {
    All,
    Columns(Vec<String>),
}

impl ColumnSet {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnSet::Columns(columns.into_iter().map(Into::into).collect())
    }

    pub fn columns(&self) -> &[String] {
        match self {
            ColumnSet::All => &[],
            ColumnSet::Columns(c) => c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equal,
    NotEqual,
    Null,
    NotNull,
}

impl ConditionOperator {
    pub fn as_fetch_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equal => "eq",
            ConditionOperator::NotEqual => "ne",
            ConditionOperator::Null => "null",
            ConditionOperator::NotNull => "not-null",
        }
    }

    pub fn takes_value(&self) -> bool {
        matches!(self, ConditionOperator::Equal | ConditionOperator::NotEqual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionExpression {
    pub attribute: String,
    pub operator: ConditionOperator,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterExpression {
    pub operator: LogicalOperator,
    pub conditions: Vec<ConditionExpression>,
}

impl FilterExpression {
    pub fn add_condition(
        &mut self,
        attribute: impl Into<String>,
        operator: ConditionOperator,
        value: impl ToString,
    ) {
        self.conditions.push(ConditionExpression {
            attribute: attribute.into(),
            operator,
            value: Some(value.to_string()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOperator {
    Inner,
    LeftOuter,
}

impl JoinOperator {
    pub fn as_fetch_str(&self) -> &'static str {
        match self {
            JoinOperator::Inner => "inner",
            JoinOperator::LeftOuter => "outer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntity {
    pub link_from_entity: String,
    pub link_to_entity: String,
    /// Attribute on the parent (`link_from_entity`) side.
    pub link_from_attribute: String,
    /// Attribute on the linked (`link_to_entity`) side.
    pub link_to_attribute: String,
    pub join: JoinOperator,
    pub columns: ColumnSet,
    pub alias: Option<String>,
    pub link_criteria: FilterExpression,
}

impl LinkEntity {
    pub fn new(
        link_from_entity: impl Into<String>,
        link_to_entity: impl Into<String>,
        link_from_attribute: impl Into<String>,
        link_to_attribute: impl Into<String>,
        join: JoinOperator,
    ) -> Self {
        Self {
            link_from_entity: link_from_entity.into(),
            link_to_entity: link_to_entity.into(),
            link_from_attribute: link_from_attribute.into(),
            link_to_attribute: link_to_attribute.into(),
            join,
            columns: ColumnSet::Columns(Vec::new()),
            alias: None,
            link_criteria: FilterExpression::default(),
        }
    }

    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingInfo {
    pub count: u32,
    pub page_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryExpression {
    pub entity_name: String,
    pub column_set: ColumnSet,
    pub criteria: FilterExpression,
    pub link_entities: Vec<LinkEntity>,
    pub distinct: bool,
    pub page_info: Option<PagingInfo>,
}

impl QueryExpression {
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            column_set: ColumnSet::Columns(Vec::new()),
            criteria: FilterExpression::default(),
            link_entities: Vec::new(),
            distinct: false,
            page_info: None,
        }
    }

    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.column_set = columns;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_page(mut self, count: u32, page_number: u32) -> Self {
        self.page_info = Some(PagingInfo { count, page_number });
        self
    }
}
