use std::collections::BTreeMap;
use std::fmt::Write as _;

use dvt_error::{DvResult, ErrorCode, err};

use crate::ast::*;
use crate::parser::{ParsedQuery, parse_query};

/// A synthetic display-name column resolved client-side from a base column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualColumn {
    pub base_column: String,
    /// True when the base column was itself queried explicitly.
    pub base_explicitly_queried: bool,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TranspileOutput {
    pub xml: String,
    /// virtual display name -> base-column mapping, for the post-execution
    /// name lookup step.
    pub virtual_columns: BTreeMap<String, VirtualColumn>,
    /// Select expressions (CASE, IIF, arithmetic) that must be evaluated
    /// client-side; the server only sees their referenced columns.
    pub computed_columns: Vec<String>,
}

/// Parses and transpiles a single-SELECT SQL text.
pub fn transpile_sql(source: &str) -> DvResult<TranspileOutput> {
    transpile(&parse_query(source)?)
}

pub fn transpile(query: &ParsedQuery) -> DvResult<TranspileOutput> {
    Transpiler::new(&query.select)?.run(query)
}

// ---------------------------------------------------------------------------
// emission model

#[derive(Debug, Clone, Default)]
struct Attr {
    name: String,
    aggregate: Option<String>,
    distinct: bool,
    alias: Option<String>,
    groupby: bool,
}

#[derive(Debug, Clone, Default)]
struct Element {
    all_attributes: bool,
    attributes: Vec<Attr>,
    orders: Vec<OrderSpec>,
}

#[derive(Debug, Clone)]
struct OrderSpec {
    attribute: Option<String>,
    alias: Option<String>,
    descending: bool,
}

#[derive(Debug, Clone)]
struct Link {
    entity: String,
    from: String,
    to: String,
    link_type: &'static str,
    alias: String,
    parent: Target,
    element: Element,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Entity,
    Link(usize),
}

#[derive(Debug)]
enum FilterNode {
    Group { or: bool, children: Vec<FilterNode> },
    Condition {
        entityname: Option<String>,
        attribute: String,
        operator: &'static str,
        values: Vec<String>,
    },
}

struct Transpiler<'a> {
    select: &'a SelectStatement,
    entity_name: String,
    entity: Element,
    links: Vec<Link>,
    aggregate_mode: bool,
    /// (target, column) pairs explicitly selected as plain columns.
    explicit: Vec<(Target, String)>,
    virtual_columns: BTreeMap<String, VirtualColumn>,
    computed_columns: Vec<String>,
}

impl<'a> Transpiler<'a> {
    fn new(select: &'a SelectStatement) -> DvResult<Self> {
        let aggregate_mode = !select.group_by.is_empty()
            || select.columns.iter().any(|c| match c {
                SelectColumn::Expr { expr, .. } => contains_aggregate(expr),
                SelectColumn::Star { .. } => false,
            });
        Ok(Transpiler {
            select,
            entity_name: select.from.name.to_ascii_lowercase(),
            entity: Element::default(),
            links: Vec::new(),
            aggregate_mode,
            explicit: Vec::new(),
            virtual_columns: BTreeMap::new(),
            computed_columns: Vec::new(),
        })
    }

    fn run(mut self, query: &ParsedQuery) -> DvResult<TranspileOutput> {
        if self.select.having.is_some() {
            return err!(
                ErrorCode::TranspileUnsupported,
                "HAVING has no query-language counterpart"
            );
        }
        self.build_links()?;
        self.build_columns()?;
        self.build_group_by()?;
        let filter = match &self.select.where_clause {
            Some(condition) => Some(self.build_filter(condition)?),
            None => None,
        };
        self.build_orders()?;
        self.resolve_explicit_bases();

        let xml = self.emit(query, filter.as_ref());
        Ok(TranspileOutput {
            xml,
            virtual_columns: self.virtual_columns,
            computed_columns: self.computed_columns,
        })
    }

    // ------------------------------------------------------------------
    // resolution

    /// The binding a column qualifier matches: outer entity or a link.
    fn resolve_target(&self, qualifier: Option<&str>) -> DvResult<Target> {
        let Some(qualifier) = qualifier else {
            return Ok(Target::Entity);
        };
        if self.select.from.binding() == qualifier {
            return Ok(Target::Entity);
        }
        if let Some(index) = self.links.iter().position(|l| l.alias == qualifier) {
            return Ok(Target::Link(index));
        }
        err!(
            ErrorCode::TranspileUnsupported,
            "unknown table alias '{qualifier}'"
        )
    }

    fn element_mut(&mut self, target: Target) -> &mut Element {
        match target {
            Target::Entity => &mut self.entity,
            Target::Link(index) => &mut self.links[index].element,
        }
    }

    fn link_alias(&self, target: Target) -> Option<String> {
        match target {
            Target::Entity => None,
            Target::Link(index) => Some(self.links[index].alias.clone()),
        }
    }

    fn build_links(&mut self) -> DvResult<()> {
        for join in &self.select.joins {
            let binding = join.table.binding().to_string();
            let ExprKind::Binary { left, op: BinaryOp::Eq, right } = &join.on.kind else {
                return err!(
                    ErrorCode::TranspileUnsupported,
                    "JOIN ... ON must be a single equality"
                );
            };
            let (ExprKind::Column(left_col), ExprKind::Column(right_col)) =
                (&left.kind, &right.kind)
            else {
                return err!(
                    ErrorCode::TranspileUnsupported,
                    "JOIN ... ON must compare two columns"
                );
            };
            // the side naming the joined table is the link's `from` column
            let (link_side, parent_side) = if left_col.table.as_deref() == Some(binding.as_str()) {
                (left_col, right_col)
            } else if right_col.table.as_deref() == Some(binding.as_str()) {
                (right_col, left_col)
            } else {
                return err!(
                    ErrorCode::TranspileUnsupported,
                    "JOIN ... ON must reference the joined table '{binding}'"
                );
            };
            let parent = self.resolve_target(parent_side.table.as_deref())?;
            let link_type = match join.kind {
                JoinKind::Inner => "inner",
                JoinKind::LeftOuter | JoinKind::RightOuter => "outer",
            };
            self.links.push(Link {
                entity: join.table.name.to_ascii_lowercase(),
                from: link_side.name.to_ascii_lowercase(),
                to: parent_side.name.to_ascii_lowercase(),
                link_type,
                alias: binding,
                parent,
                element: Element::default(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // columns

    fn build_columns(&mut self) -> DvResult<()> {
        for column in &self.select.columns {
            match column {
                SelectColumn::Star { table, offset: _ } => {
                    let target = self.resolve_target(table.as_deref())?;
                    self.element_mut(target).all_attributes = true;
                }
                SelectColumn::Expr { expr, alias } => {
                    self.build_select_expr(expr, alias.as_deref())?;
                }
            }
        }
        Ok(())
    }

    fn build_select_expr(&mut self, expr: &Expr, alias: Option<&str>) -> DvResult<()> {
        match &expr.kind {
            ExprKind::Column(column) => {
                let target = self.resolve_target(column.table.as_deref())?;
                let name = column.name.to_ascii_lowercase();
                if let Some(base) = virtual_base(&name) {
                    self.push_attr(target, Attr { name: base.clone(), ..Attr::default() });
                    self.virtual_columns.insert(
                        name,
                        VirtualColumn {
                            base_column: base,
                            base_explicitly_queried: false,
                            alias: alias.map(|a| a.to_string()),
                        },
                    );
                } else {
                    self.explicit.push((target, name.clone()));
                    self.push_attr(
                        target,
                        Attr {
                            name,
                            alias: alias.map(|a| a.to_string()),
                            ..Attr::default()
                        },
                    );
                }
                Ok(())
            }
            ExprKind::Function { name, args, distinct } if is_aggregate_name(name) => {
                self.build_aggregate(name, args, *distinct, alias)
            }
            // CASE, IIF, arithmetic, CAST: evaluated client-side; the
            // server only needs the referenced columns
            _ => {
                for column in expr.referenced_columns() {
                    let target = self.resolve_target(column.table.as_deref())?;
                    let name = column.name.to_ascii_lowercase();
                    match virtual_base(&name) {
                        Some(base) => {
                            self.push_attr(target, Attr { name: base.clone(), ..Attr::default() });
                            self.virtual_columns.entry(name).or_insert(VirtualColumn {
                                base_column: base,
                                base_explicitly_queried: false,
                                alias: None,
                            });
                        }
                        None => {
                            self.push_attr(target, Attr { name, ..Attr::default() });
                        }
                    }
                }
                let display = alias
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| format!("expr{}", self.computed_columns.len() + 1));
                self.computed_columns.push(display);
                Ok(())
            }
        }
    }

    fn build_aggregate(
        &mut self,
        name: &str,
        args: &[Expr],
        distinct: bool,
        alias: Option<&str>,
    ) -> DvResult<()> {
        let is_count_star =
            name == "count" && matches!(args.first().map(|a| &a.kind), Some(ExprKind::Star));
        let (target, attr_name) = if is_count_star {
            // the primary-key convention: <entity>id
            (Target::Entity, format!("{}id", self.entity_name))
        } else {
            let Some(ExprKind::Column(column)) = args.first().map(|a| &a.kind) else {
                return err!(
                    ErrorCode::TranspileUnsupported,
                    "aggregate {} expects a column argument",
                    name.to_uppercase()
                );
            };
            (
                self.resolve_target(column.table.as_deref())?,
                column.name.to_ascii_lowercase(),
            )
        };
        let aggregate = if is_count_star {
            "count".to_string()
        } else if name == "count" {
            "countcolumn".to_string()
        } else {
            name.to_string()
        };
        // aggregates always carry an alias
        let alias = alias
            .map(|a| a.to_string())
            .unwrap_or_else(|| format!("{}_{}", name, attr_name));
        self.push_attr(
            target,
            Attr {
                name: attr_name,
                aggregate: Some(aggregate),
                distinct,
                alias: Some(alias),
                groupby: false,
            },
        );
        Ok(())
    }

    /// Adds an attribute, suppressing duplicate emission per base column.
    /// Re-adding an existing attribute merges alias/aggregate/groupby flags.
    fn push_attr(&mut self, target: Target, attr: Attr) {
        let element = self.element_mut(target);
        if let Some(existing) = element
            .attributes
            .iter_mut()
            .find(|a| a.name == attr.name && a.aggregate == attr.aggregate)
        {
            existing.groupby |= attr.groupby;
            existing.distinct |= attr.distinct;
            if existing.alias.is_none() {
                existing.alias = attr.alias;
            }
            return;
        }
        element.attributes.push(attr);
    }

    fn build_group_by(&mut self) -> DvResult<()> {
        let group_by = self.select.group_by.clone();
        for expr in &group_by {
            let ExprKind::Column(column) = &expr.kind else {
                return err!(
                    ErrorCode::TranspileUnsupported,
                    "GROUP BY supports plain columns only"
                );
            };
            let target = self.resolve_target(column.table.as_deref())?;
            let name = column.name.to_ascii_lowercase();
            let element = self.element_mut(target);
            match element.attributes.iter_mut().find(|a| a.name == name && a.aggregate.is_none()) {
                Some(attr) => attr.groupby = true,
                None => element.attributes.push(Attr { name, groupby: true, ..Attr::default() }),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // filters

    fn build_filter(&mut self, expr: &Expr) -> DvResult<FilterNode> {
        match &expr.kind {
            ExprKind::Binary { left, op, right } if matches!(op, BinaryOp::And | BinaryOp::Or) => {
                let or = matches!(op, BinaryOp::Or);
                let mut children = Vec::new();
                self.flatten_logical(left, or, &mut children)?;
                self.flatten_logical(right, or, &mut children)?;
                Ok(FilterNode::Group { or, children })
            }
            _ => self.build_condition(expr),
        }
    }

    fn flatten_logical(
        &mut self,
        expr: &Expr,
        parent_or: bool,
        out: &mut Vec<FilterNode>,
    ) -> DvResult<()> {
        match &expr.kind {
            ExprKind::Binary { left, op, right }
                if matches!(op, BinaryOp::And | BinaryOp::Or)
                    && matches!(op, BinaryOp::Or) == parent_or =>
            {
                self.flatten_logical(left, parent_or, out)?;
                self.flatten_logical(right, parent_or, out)?;
                Ok(())
            }
            _ => {
                out.push(self.build_filter(expr)?);
                Ok(())
            }
        }
    }

    fn build_condition(&mut self, expr: &Expr) -> DvResult<FilterNode> {
        match &expr.kind {
            ExprKind::Binary { left, op, right } if op.is_comparison() => {
                // normalize to column <op> literal
                let (column, literal, op) = match (&left.kind, &right.kind) {
                    (ExprKind::Column(column), _) => {
                        (column, right.as_ref(), *op)
                    }
                    (_, ExprKind::Column(column)) => (column, left.as_ref(), mirror(*op)),
                    _ => {
                        return err!(
                            ErrorCode::TranspileUnsupported,
                            "conditions must compare a column with a value"
                        );
                    }
                };
                let value = literal_value(literal)?;
                let (operator, values) = match (op, value) {
                    (BinaryOp::Eq, None) => ("null", Vec::new()),
                    (BinaryOp::Neq, None) => ("not-null", Vec::new()),
                    (BinaryOp::Eq, Some(v)) => ("eq", vec![v]),
                    (BinaryOp::Neq, Some(v)) => ("ne", vec![v]),
                    (BinaryOp::Lt, Some(v)) => ("lt", vec![v]),
                    (BinaryOp::Lte, Some(v)) => ("le", vec![v]),
                    (BinaryOp::Gt, Some(v)) => ("gt", vec![v]),
                    (BinaryOp::Gte, Some(v)) => ("ge", vec![v]),
                    _ => {
                        return err!(
                            ErrorCode::TranspileUnsupported,
                            "NULL only combines with = and <>"
                        );
                    }
                };
                self.condition_node(column, operator, values)
            }
            ExprKind::Like { expr, pattern, negated } => {
                let ExprKind::Column(column) = &expr.kind else {
                    return err!(ErrorCode::TranspileUnsupported, "LIKE expects a column");
                };
                let Some(pattern) = literal_value(pattern)? else {
                    return err!(ErrorCode::TranspileUnsupported, "LIKE expects a string pattern");
                };
                let (operator, value) = like_operator(&pattern, *negated);
                self.condition_node(column, operator, vec![value])
            }
            ExprKind::IsNull { expr, negated } => {
                let ExprKind::Column(column) = &expr.kind else {
                    return err!(ErrorCode::TranspileUnsupported, "IS NULL expects a column");
                };
                self.condition_node(column, if *negated { "not-null" } else { "null" }, Vec::new())
            }
            ExprKind::In { expr, list, negated } => {
                let ExprKind::Column(column) = &expr.kind else {
                    return err!(ErrorCode::TranspileUnsupported, "IN expects a column");
                };
                let mut values = Vec::new();
                for item in list {
                    let Some(value) = literal_value(item)? else {
                        return err!(ErrorCode::TranspileUnsupported, "IN lists hold literals only");
                    };
                    values.push(value);
                }
                self.condition_node(column, if *negated { "not-in" } else { "in" }, values)
            }
            ExprKind::Between { expr, low, high, negated } => {
                let ExprKind::Column(column) = &expr.kind else {
                    return err!(ErrorCode::TranspileUnsupported, "BETWEEN expects a column");
                };
                let (Some(low), Some(high)) = (literal_value(low)?, literal_value(high)?) else {
                    return err!(ErrorCode::TranspileUnsupported, "BETWEEN bounds must be literals");
                };
                self.condition_node(
                    column,
                    if *negated { "not-between" } else { "between" },
                    vec![low, high],
                )
            }
            _ => err!(
                ErrorCode::TranspileUnsupported,
                "unsupported condition in WHERE clause"
            ),
        }
    }

    fn condition_node(
        &mut self,
        column: &ColumnRef,
        operator: &'static str,
        values: Vec<String>,
    ) -> DvResult<FilterNode> {
        let target = self.resolve_target(column.table.as_deref())?;
        Ok(FilterNode::Condition {
            entityname: self.link_alias(target),
            attribute: column.name.to_ascii_lowercase(),
            operator,
            values,
        })
    }

    // ------------------------------------------------------------------
    // order

    fn build_orders(&mut self) -> DvResult<()> {
        let order_by = self.select.order_by.clone();
        for order in &order_by {
            let ExprKind::Column(column) = &order.expr.kind else {
                return err!(ErrorCode::TranspileUnsupported, "ORDER BY supports plain columns");
            };
            let name = column.name.to_ascii_lowercase();
            // in aggregate queries, prefer a matching attribute alias
            let aliased = self.aggregate_mode
                && column.table.is_none()
                && self.alias_exists(&name);
            if aliased {
                self.entity.orders.push(OrderSpec {
                    attribute: None,
                    alias: Some(name),
                    descending: order.descending,
                });
            } else {
                let target = self.resolve_target(column.table.as_deref())?;
                self.element_mut(target).orders.push(OrderSpec {
                    attribute: Some(name),
                    alias: None,
                    descending: order.descending,
                });
            }
        }
        Ok(())
    }

    fn alias_exists(&self, name: &str) -> bool {
        let check = |element: &Element| {
            element.attributes.iter().any(|a| a.alias.as_deref() == Some(name))
        };
        check(&self.entity) || self.links.iter().any(|l| check(&l.element))
    }

    fn resolve_explicit_bases(&mut self) {
        for (_, name) in &self.explicit {
            for virtual_column in self.virtual_columns.values_mut() {
                if &virtual_column.base_column == name {
                    virtual_column.base_explicitly_queried = true;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // emission

    fn emit(&self, query: &ParsedQuery, filter: Option<&FilterNode>) -> String {
        let mut xml = String::new();
        for comment in &query.comments {
            if comment.offset < self.select.offset {
                let _ = writeln!(xml, "<!-- {} -->", xml_escape(&comment.text));
            }
        }
        xml.push_str("<fetch");
        if let Some(top) = self.select.top {
            let _ = write!(xml, " top=\"{top}\"");
        }
        if self.aggregate_mode {
            xml.push_str(" aggregate=\"true\"");
        }
        if self.select.distinct {
            xml.push_str(" distinct=\"true\"");
        }
        xml.push('>');

        let _ = write!(xml, "<entity name=\"{}\">", xml_escape(&self.entity_name));
        self.emit_element(&mut xml, &self.entity);
        for (index, link) in self.links.iter().enumerate() {
            if link.parent == Target::Entity {
                self.emit_link(&mut xml, index);
            }
        }
        if let Some(filter) = filter {
            emit_filter(&mut xml, filter, true);
        }
        emit_orders(&mut xml, &self.entity.orders);
        xml.push_str("</entity></fetch>");
        xml
    }

    fn emit_element(&self, xml: &mut String, element: &Element) {
        if element.all_attributes {
            xml.push_str("<all-attributes/>");
        }
        for attr in &element.attributes {
            let _ = write!(xml, "<attribute name=\"{}\"", xml_escape(&attr.name));
            if let Some(aggregate) = &attr.aggregate {
                let _ = write!(xml, " aggregate=\"{aggregate}\"");
            }
            if attr.distinct {
                xml.push_str(" distinct=\"true\"");
            }
            if let Some(alias) = &attr.alias {
                let _ = write!(xml, " alias=\"{}\"", xml_escape(alias));
            }
            if attr.groupby {
                xml.push_str(" groupby=\"true\"");
            }
            xml.push_str("/>");
        }
    }

    fn emit_link(&self, xml: &mut String, index: usize) {
        let link = &self.links[index];
        let _ = write!(
            xml,
            "<link-entity name=\"{}\" from=\"{}\" to=\"{}\" link-type=\"{}\" alias=\"{}\">",
            xml_escape(&link.entity),
            xml_escape(&link.from),
            xml_escape(&link.to),
            link.link_type,
            xml_escape(&link.alias),
        );
        self.emit_element(xml, &link.element);
        for (child, candidate) in self.links.iter().enumerate() {
            if candidate.parent == Target::Link(index) {
                self.emit_link(xml, child);
            }
        }
        emit_orders(xml, &link.element.orders);
        xml.push_str("</link-entity>");
    }
}

fn emit_filter(xml: &mut String, node: &FilterNode, top_level: bool) {
    match node {
        FilterNode::Group { or, children } => {
            if *or {
                xml.push_str("<filter type=\"or\">");
            } else {
                xml.push_str("<filter type=\"and\">");
            }
            for child in children {
                emit_filter(xml, child, false);
            }
            xml.push_str("</filter>");
        }
        FilterNode::Condition { entityname, attribute, operator, values } => {
            if top_level {
                xml.push_str("<filter>");
            }
            let _ = write!(xml, "<condition");
            if let Some(entityname) = entityname {
                let _ = write!(xml, " entityname=\"{}\"", xml_escape(entityname));
            }
            let _ = write!(
                xml,
                " attribute=\"{}\" operator=\"{operator}\"",
                xml_escape(attribute)
            );
            match values.as_slice() {
                [] => xml.push_str("/>"),
                [value] => {
                    let _ = write!(xml, " value=\"{}\"/>", xml_escape(value));
                }
                values => {
                    xml.push('>');
                    for value in values {
                        let _ = write!(xml, "<value>{}</value>", xml_escape(value));
                    }
                    xml.push_str("</condition>");
                }
            }
            if top_level {
                xml.push_str("</filter>");
            }
        }
    }
}

fn emit_orders(xml: &mut String, orders: &[OrderSpec]) {
    for order in orders {
        xml.push_str("<order");
        if let Some(attribute) = &order.attribute {
            let _ = write!(xml, " attribute=\"{}\"", xml_escape(attribute));
        }
        if let Some(alias) = &order.alias {
            let _ = write!(xml, " alias=\"{}\"", xml_escape(alias));
        }
        if order.descending {
            xml.push_str(" descending=\"true\"");
        }
        xml.push_str("/>");
    }
}

// ---------------------------------------------------------------------------
// helpers

fn contains_aggregate(expr: &Expr) -> bool {
    if expr.is_aggregate() {
        return true;
    }
    match &expr.kind {
        ExprKind::Unary { expr, .. } => contains_aggregate(expr),
        ExprKind::Binary { left, right, .. } => contains_aggregate(left) || contains_aggregate(right),
        ExprKind::Cast { expr, .. } => contains_aggregate(expr),
        ExprKind::Function { args, .. } => args.iter().any(contains_aggregate),
        _ => false,
    }
}

/// `<base>name` display columns: the base must look like a lookup, state,
/// code, type or boolean column.
fn virtual_base(name: &str) -> Option<String> {
    let prefix = name.strip_suffix("name")?;
    if prefix.is_empty() {
        return None;
    }
    let matches_pattern = prefix.ends_with("id")
        || prefix == "statecode"
        || prefix == "statuscode"
        || prefix.ends_with("code")
        || prefix.ends_with("type")
        || prefix.starts_with("is")
        || prefix.starts_with("do")
        || prefix.starts_with("has");
    matches_pattern.then(|| prefix.to_string())
}

/// Mirrors a comparison when the literal is on the left: `0 < x` is `x > 0`.
fn mirror(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Lte => BinaryOp::Gte,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Gte => BinaryOp::Lte,
        other => other,
    }
}

/// The condition value for a literal; `None` encodes SQL NULL.
fn literal_value(expr: &Expr) -> DvResult<Option<String>> {
    match &expr.kind {
        ExprKind::Literal(Literal::Null) => Ok(None),
        ExprKind::Literal(Literal::Int(value)) => Ok(Some(value.to_string())),
        ExprKind::Literal(Literal::Float(value)) => Ok(Some(value.to_string())),
        ExprKind::Literal(Literal::String(value)) => Ok(Some(value.clone())),
        ExprKind::Unary { op: UnaryOp::Neg, expr } => match &expr.kind {
            ExprKind::Literal(Literal::Int(value)) => Ok(Some((-value).to_string())),
            ExprKind::Literal(Literal::Float(value)) => Ok(Some((-value).to_string())),
            _ => err!(ErrorCode::TranspileUnsupported, "expected a literal value"),
        },
        _ => err!(ErrorCode::TranspileUnsupported, "expected a literal value"),
    }
}

/// `%p%` is a contains match, `p%` a prefix match, `%p` a suffix match.
fn like_operator(pattern: &str, negated: bool) -> (&'static str, String) {
    let starts = pattern.starts_with('%');
    let ends = pattern.ends_with('%') && pattern.len() > 1;
    if negated {
        return ("not-like", pattern.to_string());
    }
    match (starts, ends) {
        (true, false) => ("ends-with", pattern.trim_start_matches('%').to_string()),
        (false, true) => ("begins-with", pattern.trim_end_matches('%').to_string()),
        _ => ("like", pattern.to_string()),
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
