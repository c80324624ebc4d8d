// QueryExpression -> FetchXML

use super::query::{ColumnSet, FilterExpression, LinkEntity, LogicalOperator, QueryExpression};

pub fn render(query: &QueryExpression) -> String {
    let mut out = String::from("<fetch version=\"1.0\" mapping=\"logical\"");
    if query.distinct {
        out.push_str(" distinct=\"true\"");
    }
    if let Some(page) = query.page_info {
        out.push_str(&format!(
            " count=\"{}\" page=\"{}\"",
            page.count, page.page_number
        ));
    }
    out.push('>');

    out.push_str(&format!("<entity name=\"{}\">", escape(&query.entity_name)));
    render_columns(&mut out, &query.column_set);
    render_filter(&mut out, &query.criteria);
    for link in &query.link_entities {
        render_link(&mut out, link);
    }
    out.push_str("</entity></fetch>");
    out
}

fn render_columns(out: &mut String, columns: &ColumnSet) {
    match columns {
        ColumnSet::All => out.push_str("<all-attributes/>"),
        ColumnSet::Columns(cols) => {
            for c in cols {
                out.push_str(&format!("<attribute name=\"{}\"/>", escape(c)));
            }
        }
    }
}

fn render_filter(out: &mut String, filter: &FilterExpression) {
    if filter.is_empty() {
        return;
    }
    let op = match filter.operator {
        LogicalOperator::And => "and",
        LogicalOperator::Or => "or",
    };
    out.push_str(&format!("<filter type=\"{}\">", op));
    for c in &filter.conditions {
        out.push_str(&format!(
            "<condition attribute=\"{}\" operator=\"{}\"",
            escape(&c.attribute),
            c.operator.as_fetch_str()
        ));
        if c.operator.takes_value() {
            if let Some(v) = &c.value {
                out.push_str(&format!(" value=\"{}\"", escape(v)));
            }
        }
        out.push_str("/>");
    }
    out.push_str("</filter>");
}

fn render_link(out: &mut String, link: &LinkEntity) {
    // FetchXML: `from` names the linked table's column, `to` the parent's.
    out.push_str(&format!(
        "<link-entity name=\"{}\" from=\"{}\" to=\"{}\" link-type=\"{}\"",
        escape(&link.link_to_entity),
        escape(&link.link_to_attribute),
        escape(&link.link_from_attribute),
        link.join.as_fetch_str()
    ));
    if let Some(alias) = &link.alias {
        out.push_str(&format!(" alias=\"{}\"", escape(alias)));
    }
    out.push('>');
    render_columns(out, &link.columns);
    render_filter(out, &link.link_criteria);
    out.push_str("</link-entity>");
}

pub fn escape(value: &str) -> String {
    let mut s = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => s.push_str("&amp;"),
            '<' => s.push_str("&lt;"),
            '>' => s.push_str("&gt;"),
            '"' => s.push_str("&quot;"),
            '\'' => s.push_str("&apos;"),
            _ => s.push(ch),
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataverse::query::{ConditionOperator, JoinOperator};

    #[test]
    fn renders_linked_query_with_alias_and_filters() {
        let mut q = QueryExpression::new("attributemap").with_columns(ColumnSet::new([
            "attributemapid",
            "sourceattributename",
        ]));
        q.criteria
            .add_condition("sourceattributename", ConditionOperator::Equal, "emailaddress1");
        let mut link = LinkEntity::new(
            "attributemap",
            "entitymap",
            "entitymapid",
            "entitymapid",
            JoinOperator::Inner,
        )
        .with_columns(ColumnSet::new(["sourceentityname"]))
        .with_alias("em");
        link.link_criteria
            .add_condition("sourceentityname", ConditionOperator::Equal, "contact");
        q.link_entities.push(link);

        let xml = render(&q);
        assert_eq!(
            xml,
            "<fetch version=\"1.0\" mapping=\"logical\"><entity name=\"attributemap\">\
             <attribute name=\"attributemapid\"/><attribute name=\"sourceattributename\"/>\
             <filter type=\"and\"><condition attribute=\"sourceattributename\" operator=\"eq\" value=\"emailaddress1\"/></filter>\
             <link-entity name=\"entitymap\" from=\"entitymapid\" to=\"entitymapid\" link-type=\"inner\" alias=\"em\">\
             <attribute name=\"sourceentityname\"/>\
             <filter type=\"and\"><condition attribute=\"sourceentityname\" operator=\"eq\" value=\"contact\"/></filter>\
             </link-entity></entity></fetch>"
        );
    }

    #[test]
    fn renders_distinct_and_paging() {
        let q = QueryExpression::new("attributemap")
            .with_columns(ColumnSet::new(["attributemapid"]))
            .distinct()
            .with_page(1, 1);
        let xml = render(&q);
        assert!(xml.starts_with(
            "<fetch version=\"1.0\" mapping=\"logical\" distinct=\"true\" count=\"1\" page=\"1\">"
        ));
    }

    #[test]
    fn condition_values_are_escaped() {
        let mut q = QueryExpression::new("entitymap");
        q.criteria
            .add_condition("sourceentityname", ConditionOperator::Equal, "a\"/><x y='&");
        let xml = render(&q);
        assert!(xml.contains("value=\"a&quot;/&gt;&lt;x y=&apos;&amp;\""));
    }
}
