//! Routing of schema events to destination topics and partitions.
//!
//! The router is built once from configuration and is pure afterwards:
//! `route` maps an event to its destination without I/O or shared state.

use crate::{Error, Result, SchemaChangeEvent};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoutingRuleConfig {
    /// `schema.table` patterns; `*` matches everything, a trailing `*`
    /// matches any suffix, and a bare pattern matches the schema name.
    pub matcher: Vec<String>,
    /// Destination topic; may reference `{schema}` and `{table}`. Falls back
    /// to the sink's destination topic when unset.
    pub topic: Option<String>,
    /// Partition dispatch: `broadcast` (default) or `table`.
    pub partition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionDispatch {
    /// The event goes to every partition of the topic.
    Broadcast,
    /// The event goes to the partition its table name hashes to.
    Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub topic: String,
    pub dispatch: PartitionDispatch,
    /// Partition key for [`PartitionDispatch::Table`] routes.
    pub partition_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
}

impl Pattern {
    fn compile(pattern: &str) -> Result<Pattern> {
        if pattern.is_empty() {
            return Err(Error::InvalidRoutingRule(
                "matcher pattern must not be empty".to_string(),
            ));
        }
        if pattern == "*" {
            return Ok(Pattern::Any);
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.contains('*') {
                return Err(Error::InvalidRoutingRule(format!(
                    "pattern {pattern} may only use a single trailing *"
                )));
            }
            return Ok(Pattern::Prefix(prefix.to_string()));
        }
        if pattern.contains('*') {
            return Err(Error::InvalidRoutingRule(format!(
                "pattern {pattern} may only use a trailing *"
            )));
        }
        Ok(Pattern::Exact(pattern.to_string()))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(exact) => value == exact,
            Pattern::Prefix(prefix) => value.starts_with(prefix),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TableMatcher {
    schema: Pattern,
    table: Pattern,
}

impl TableMatcher {
    fn compile(matcher: &str) -> Result<TableMatcher> {
        let (schema, table) = match matcher.split_once('.') {
            Some((schema, table)) => (schema, table),
            None => (matcher, "*"),
        };
        Ok(TableMatcher {
            schema: Pattern::compile(schema)?,
            table: Pattern::compile(table)?,
        })
    }

    fn matches(&self, event: &SchemaChangeEvent) -> bool {
        if !self.schema.matches(&event.schema) {
            return false;
        }
        match &event.table {
            Some(table) => self.table.matches(table),
            // Database-level statements only match rules that leave the
            // table unconstrained.
            None => self.table == Pattern::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TopicTemplate {
    template: String,
    wants_table: bool,
}

impl TopicTemplate {
    fn compile(template: &str) -> Result<TopicTemplate> {
        let mut wants_table = false;
        let mut placeholder: Option<String> = None;
        for c in template.chars() {
            match (&mut placeholder, c) {
                (None, '{') => placeholder = Some(String::new()),
                (None, '}') => {
                    return Err(Error::InvalidRoutingRule(format!(
                        "topic template {template} has unbalanced braces"
                    )));
                }
                (None, _) => {}
                (Some(name), '}') => {
                    match name.as_str() {
                        "schema" => {}
                        "table" => wants_table = true,
                        unknown => {
                            return Err(Error::InvalidRoutingRule(format!(
                                "topic template references unknown placeholder {{{unknown}}}"
                            )));
                        }
                    }
                    placeholder = None;
                }
                (Some(_), '{') => {
                    return Err(Error::InvalidRoutingRule(format!(
                        "topic template {template} has unbalanced braces"
                    )));
                }
                (Some(name), _) => name.push(c),
            }
        }
        if placeholder.is_some() {
            return Err(Error::InvalidRoutingRule(format!(
                "topic template {template} has unbalanced braces"
            )));
        }
        Ok(TopicTemplate {
            template: template.to_string(),
            wants_table,
        })
    }

    /// Renders the destination topic for the event, or `None` when the
    /// template needs a table name the event does not carry.
    fn render(&self, event: &SchemaChangeEvent) -> Option<String> {
        if self.wants_table && event.table.is_none() {
            return None;
        }
        let rendered = self
            .template
            .replace("{schema}", &event.schema)
            .replace("{table}", event.table.as_deref().unwrap_or_default());
        Some(sanitize_topic(&rendered))
    }
}

/// Replaces characters Kafka topics cannot carry, so a rendered topic name is
/// always legal.
fn sanitize_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledRule {
    matchers: Vec<TableMatcher>,
    topic: Option<TopicTemplate>,
    dispatch: PartitionDispatch,
}

/// Maps a schema event to its destination topic and partition key.
/// Immutable and stateless after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRouter {
    rules: Vec<CompiledRule>,
    default_topic: String,
}

impl EventRouter {
    pub(crate) fn new(rules: &[RoutingRuleConfig], default_topic: &str) -> Result<EventRouter> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.matcher.is_empty() {
                return Err(Error::InvalidRoutingRule(
                    "rule must have at least one matcher".to_string(),
                ));
            }
            let matchers = rule
                .matcher
                .iter()
                .map(|m| TableMatcher::compile(m))
                .collect::<Result<Vec<_>>>()?;
            let topic = rule
                .topic
                .as_deref()
                .map(TopicTemplate::compile)
                .transpose()?;
            let dispatch = match rule.partition.as_deref() {
                None | Some("broadcast") => PartitionDispatch::Broadcast,
                Some("table") => PartitionDispatch::Table,
                Some(unknown) => {
                    return Err(Error::InvalidRoutingRule(format!(
                        "unknown partition dispatch {unknown}"
                    )));
                }
            };
            compiled.push(CompiledRule {
                matchers,
                topic,
                dispatch,
            });
        }
        Ok(EventRouter {
            rules: compiled,
            default_topic: default_topic.to_string(),
        })
    }

    /// First matching rule wins; events no rule claims go to the default
    /// topic as a broadcast.
    pub fn route(&self, event: &SchemaChangeEvent) -> Route {
        for rule in &self.rules {
            if !rule.matchers.iter().any(|m| m.matches(event)) {
                continue;
            }
            let topic = match &rule.topic {
                Some(template) => match template.render(event) {
                    Some(topic) => topic,
                    // A table-scoped template cannot place this event; let a
                    // later rule or the default claim it.
                    None => continue,
                },
                None => self.default_topic.clone(),
            };
            let partition_key = match rule.dispatch {
                PartitionDispatch::Broadcast => None,
                PartitionDispatch::Table => Some(event.qualified_name()),
            };
            return Route {
                topic,
                dispatch: rule.dispatch,
                partition_key,
            };
        }
        Route {
            topic: self.default_topic.clone(),
            dispatch: PartitionDispatch::Broadcast,
            partition_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchemaEventType;

    fn event(schema: &str, table: Option<&str>) -> SchemaChangeEvent {
        SchemaChangeEvent {
            schema: schema.to_string(),
            table: table.map(|t| t.to_string()),
            event_type: SchemaEventType::Alter,
            query: "ALTER TABLE t ADD COLUMN c INT".to_string(),
            commit_ts_ms: 1,
        }
    }

    fn rule(matcher: &[&str], topic: Option<&str>, partition: Option<&str>) -> RoutingRuleConfig {
        RoutingRuleConfig {
            matcher: matcher.iter().map(|m| m.to_string()).collect(),
            topic: topic.map(|t| t.to_string()),
            partition: partition.map(|p| p.to_string()),
        }
    }

    #[test]
    fn test_default_route_is_broadcast_to_default_topic() {
        let router = EventRouter::new(&[], "schema-events").unwrap();
        let route = router.route(&event("inventory", Some("orders")));
        assert_eq!(route.topic, "schema-events");
        assert_eq!(route.dispatch, PartitionDispatch::Broadcast);
        assert_eq!(route.partition_key, None);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let router = EventRouter::new(
            &[
                rule(&["inventory.orders"], Some("orders-events"), None),
                rule(&["inventory.*"], Some("inventory-events"), None),
            ],
            "schema-events",
        )
        .unwrap();
        let route = router.route(&event("inventory", Some("orders")));
        assert_eq!(route.topic, "orders-events");
        let route = router.route(&event("inventory", Some("shipments")));
        assert_eq!(route.topic, "inventory-events");
    }

    #[test]
    fn test_prefix_and_bare_schema_patterns() {
        let router = EventRouter::new(
            &[rule(&["inv*"], Some("inventory-events"), None)],
            "schema-events",
        )
        .unwrap();
        // A bare pattern matches on the schema name for any table.
        assert_eq!(
            router.route(&event("inventory", Some("orders"))).topic,
            "inventory-events"
        );
        assert_eq!(router.route(&event("inventory", None)).topic, "inventory-events");
        assert_eq!(router.route(&event("billing", Some("invoices"))).topic, "schema-events");
    }

    #[test]
    fn test_table_constrained_rule_skips_database_level_events() {
        let router = EventRouter::new(
            &[rule(&["inventory.ord*"], Some("orders-events"), None)],
            "schema-events",
        )
        .unwrap();
        assert_eq!(router.route(&event("inventory", None)).topic, "schema-events");
    }

    #[test]
    fn test_topic_template_renders_and_sanitizes() {
        let router = EventRouter::new(
            &[rule(&["*.*"], Some("{schema}/{table}-events"), None)],
            "schema-events",
        )
        .unwrap();
        let route = router.route(&event("inventory", Some("orders")));
        assert_eq!(route.topic, "inventory_orders-events");
    }

    #[test]
    fn test_table_template_falls_through_for_database_events() {
        let router = EventRouter::new(
            &[
                rule(&["inventory", "inventory.*"], Some("{table}-events"), None),
                rule(&["inventory"], Some("{schema}-events"), None),
            ],
            "schema-events",
        )
        .unwrap();
        assert_eq!(
            router.route(&event("inventory", Some("orders"))).topic,
            "orders-events"
        );
        // No table to render: the first rule cannot place it, the second can.
        assert_eq!(router.route(&event("inventory", None)).topic, "inventory-events");
    }

    #[test]
    fn test_table_dispatch_sets_partition_key() {
        let router = EventRouter::new(
            &[rule(&["inventory.*"], None, Some("table"))],
            "schema-events",
        )
        .unwrap();
        let route = router.route(&event("inventory", Some("orders")));
        assert_eq!(route.topic, "schema-events");
        assert_eq!(route.dispatch, PartitionDispatch::Table);
        assert_eq!(route.partition_key.as_deref(), Some("inventory.orders"));
    }

    #[test]
    fn test_rejects_rule_without_matchers() {
        let err = EventRouter::new(&[rule(&[], None, None)], "schema-events").unwrap_err();
        assert!(matches!(err, Error::InvalidRoutingRule(_)));
    }

    #[test]
    fn test_rejects_interior_wildcard() {
        let err =
            EventRouter::new(&[rule(&["inv*tory.orders"], None, None)], "schema-events")
                .unwrap_err();
        assert!(matches!(err, Error::InvalidRoutingRule(_)));
    }

    #[test]
    fn test_rejects_unknown_placeholder() {
        let err = EventRouter::new(
            &[rule(&["*"], Some("{database}-events"), None)],
            "schema-events",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRoutingRule(_)));
    }

    #[test]
    fn test_rejects_unknown_dispatch() {
        let err = EventRouter::new(
            &[rule(&["*"], None, Some("round-robin"))],
            "schema-events",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRoutingRule(_)));
    }
}
