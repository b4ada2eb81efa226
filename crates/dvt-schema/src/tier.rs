use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;

use dvt_error::{DvResult, unexpected_err};
use itertools::Itertools as _;
use tracing::debug;

use crate::descriptor::{RelationshipDescriptor, SchemaDescriptor};

/// The import plan as data: ordered tiers of entities, the reference fields
/// deferred to the second pass, and the relationships for the third.
#[derive(Debug, Clone, Default)]
pub struct TierPlan {
    pub tiers: Vec<Vec<String>>,
    /// `(entity, field)` pairs stripped from first-pass rows and re-applied
    /// as updates once every tier has imported.
    pub deferred_fields: BTreeSet<(String, String)>,
    pub relationships: Vec<RelationshipDescriptor>,
}

impl TierPlan {
    /// Plans tiers over the schema's reference graph.
    ///
    /// Self-references are deferred outright. Cross-entity cycles are cut
    /// edge by edge until the graph is acyclic; every field on a cut edge
    /// joins the deferred set. References to entities outside the schema
    /// (environment-provided rows like `systemuser`) constrain nothing.
    pub fn build(schema: &SchemaDescriptor) -> DvResult<TierPlan> {
        let mut deferred: BTreeSet<(String, String)> = BTreeSet::new();
        let mut deps: BTreeMap<String, BTreeSet<String>> = schema
            .entities
            .iter()
            .map(|e| (e.logical_name.clone(), BTreeSet::new()))
            .collect();
        let mut edge_fields: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();

        for entity in &schema.entities {
            for field in entity.reference_fields() {
                for target in &field.targets {
                    if !schema.contains(target) {
                        continue;
                    }
                    if *target == entity.logical_name {
                        deferred.insert((entity.logical_name.clone(), field.name.clone()));
                        continue;
                    }
                    deps.get_mut(&entity.logical_name)
                        .expect("all entities are keys")
                        .insert(target.clone());
                    edge_fields
                        .entry((entity.logical_name.clone(), target.clone()))
                        .or_default()
                        .insert(field.name.clone());
                }
            }
        }

        // Cut cycles one closing edge at a time until none remain
        while let Some(cycle) = find_cycle(&deps) {
            let from = cycle.last().expect("cycle is non-empty").clone();
            let to = cycle[0].clone();
            debug!(cycle = %cycle.iter().join(" -> "), cut = %format!("{from} -> {to}"), "cycle cut");
            deps.get_mut(&from).expect("cycle node is a key").remove(&to);
            for field in edge_fields.remove(&(from.clone(), to.clone())).unwrap_or_default() {
                deferred.insert((from.clone(), field));
            }
        }

        let tiers = topological_levels(&deps)?;
        Ok(TierPlan {
            tiers,
            deferred_fields: deferred,
            relationships: schema.relationships.clone(),
        })
    }

    pub fn tier_of(&self, entity: &str) -> Option<usize> {
        self.tiers
            .iter()
            .position(|tier| tier.iter().any(|e| e == entity))
    }

    pub fn entity_count(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }

    pub fn is_deferred(&self, entity: &str, field: &str) -> bool {
        self.deferred_fields
            .contains(&(entity.to_string(), field.to_string()))
    }

    /// Deferred fields of one entity.
    pub fn deferred_fields_of(&self, entity: &str) -> Vec<&str> {
        self.deferred_fields
            .iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, f)| f.as_str())
            .collect()
    }
}

impl fmt::Display for TierPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, tier) in self.tiers.iter().enumerate() {
            writeln!(f, "Tier {}: {}", index + 1, tier.iter().join(", "))?;
        }
        if !self.deferred_fields.is_empty() {
            let deferred = self
                .deferred_fields
                .iter()
                .map(|(e, field)| format!("{e}.{field}"))
                .join(", ");
            writeln!(f, "Deferred: {deferred}")?;
        }
        if !self.relationships.is_empty() {
            writeln!(
                f,
                "Relationships: {}",
                self.relationships.iter().map(|r| r.name.as_str()).join(", ")
            )?;
        }
        Ok(())
    }
}

/// Finds one cycle in the dependency graph, as the path `[n0, .., nk]` with
/// an edge `nk -> n0` closing it. Returns `None` when the graph is acyclic.
fn find_cycle(deps: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    fn dfs(
        node: &str,
        deps: &BTreeMap<String, BTreeSet<String>>,
        stack: &mut VecDeque<String>,
        visited: &mut HashSet<String>,
        stack_set: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if stack_set.contains(node) {
            let cycle_start = stack.iter().position(|n| n == node).expect("node is on stack");
            return Some(stack.iter().skip(cycle_start).cloned().collect());
        }
        if visited.contains(node) {
            return None;
        }
        visited.insert(node.to_string());
        stack.push_back(node.to_string());
        stack_set.insert(node.to_string());

        if let Some(neighbors) = deps.get(node) {
            for neighbor in neighbors {
                if let Some(cycle) = dfs(neighbor, deps, stack, visited, stack_set) {
                    return Some(cycle);
                }
            }
        }

        stack.pop_back();
        stack_set.remove(node);
        None
    }

    let mut visited = HashSet::new();
    for node in deps.keys() {
        if !visited.contains(node) {
            let mut stack = VecDeque::new();
            let mut stack_set = HashSet::new();
            if let Some(cycle) = dfs(node, deps, &mut stack, &mut visited, &mut stack_set) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Groups an acyclic graph into levels: a node's level is one past the
/// deepest level among its dependencies.
fn topological_levels(deps: &BTreeMap<String, BTreeSet<String>>) -> DvResult<Vec<Vec<String>>> {
    fn compute_level(
        node: &str,
        deps: &BTreeMap<String, BTreeSet<String>>,
        levels: &mut BTreeMap<String, usize>,
        stack: &mut BTreeSet<String>,
    ) -> DvResult<usize> {
        if let Some(&level) = levels.get(node) {
            return Ok(level);
        }
        if !stack.insert(node.to_string()) {
            // cycles were cut before this runs
            return unexpected_err!("residual cycle at entity '{node}'");
        }
        let level = match deps.get(node) {
            Some(neighbors) if !neighbors.is_empty() => {
                let mut max_level = 0;
                for neighbor in neighbors {
                    max_level = max_level.max(compute_level(neighbor, deps, levels, stack)?);
                }
                1 + max_level
            }
            _ => 0,
        };
        stack.remove(node);
        levels.insert(node.to_string(), level);
        Ok(level)
    }

    let mut levels: BTreeMap<String, usize> = BTreeMap::new();
    for node in deps.keys() {
        let mut stack = BTreeSet::new();
        compute_level(node, deps, &mut levels, &mut stack)?;
    }

    let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (node, level) in levels {
        grouped.entry(level).or_default().push(node);
    }
    Ok(grouped.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityDescriptor, FieldDescriptor};

    fn entity(name: &str, lookups: &[(&str, &str)]) -> EntityDescriptor {
        let mut entity = EntityDescriptor::new(name).with_field(FieldDescriptor::attribute("name"));
        for (field, target) in lookups {
            entity = entity.with_field(FieldDescriptor::lookup(*field, vec![target.to_string()]));
        }
        entity
    }

    fn schema_of(entities: Vec<EntityDescriptor>) -> SchemaDescriptor {
        SchemaDescriptor { entities, relationships: vec![], user_mapping_entity: None }
    }

    /// Every reference either lands in an earlier tier or is deferred.
    fn assert_plan_is_sound(schema: &SchemaDescriptor, plan: &TierPlan) {
        for entity in &schema.entities {
            for field in entity.reference_fields() {
                for target in &field.targets {
                    if !schema.contains(target) {
                        continue;
                    }
                    let deferred = plan.is_deferred(&entity.logical_name, &field.name);
                    let ordered = match (plan.tier_of(target), plan.tier_of(&entity.logical_name)) {
                        (Some(t_target), Some(t_entity)) => t_target < t_entity,
                        _ => false,
                    };
                    assert!(
                        deferred || ordered,
                        "{}.{} -> {} escapes both ordering and deferral",
                        entity.logical_name,
                        field.name,
                        target
                    );
                }
            }
        }
        assert_eq!(plan.entity_count(), schema.entities.len());
    }

    #[test]
    fn test_simple_chain() {
        let schema = schema_of(vec![
            entity("account", &[]),
            entity("contact", &[("parentcustomerid", "account")]),
            entity("opportunity", &[("customerid", "contact")]),
        ]);
        let plan = TierPlan::build(&schema).unwrap();
        assert_eq!(
            plan.tiers,
            vec![
                vec!["account".to_string()],
                vec!["contact".to_string()],
                vec!["opportunity".to_string()],
            ]
        );
        assert!(plan.deferred_fields.is_empty());
        assert_plan_is_sound(&schema, &plan);
    }

    #[test]
    fn test_branching_graph_shares_tiers() {
        let schema = schema_of(vec![
            entity("account", &[]),
            entity("campaign", &[]),
            entity("contact", &[("parentcustomerid", "account")]),
            entity("lead", &[("campaignid", "campaign")]),
        ]);
        let plan = TierPlan::build(&schema).unwrap();
        assert_eq!(plan.tiers.len(), 2);
        assert_eq!(plan.tiers[0], vec!["account".to_string(), "campaign".to_string()]);
        assert_eq!(plan.tiers[1], vec!["contact".to_string(), "lead".to_string()]);
        assert_plan_is_sound(&schema, &plan);
    }

    #[test]
    fn test_self_reference_is_deferred() {
        let schema = schema_of(vec![entity("contact", &[("parentcontactid", "contact")])]);
        let plan = TierPlan::build(&schema).unwrap();
        assert_eq!(plan.tiers, vec![vec!["contact".to_string()]]);
        assert!(plan.is_deferred("contact", "parentcontactid"));
        assert_plan_is_sound(&schema, &plan);
    }

    #[test]
    fn test_two_entity_cycle_is_cut() {
        let schema = schema_of(vec![
            entity("account", &[("primarycontactid", "contact")]),
            entity("contact", &[("parentcustomerid", "account")]),
        ]);
        let plan = TierPlan::build(&schema).unwrap();
        // exactly one of the two edges must be deferred
        assert_eq!(plan.deferred_fields.len(), 1);
        assert_plan_is_sound(&schema, &plan);
    }

    #[test]
    fn test_three_entity_cycle_with_tail() {
        let schema = schema_of(vec![
            entity("a", &[("b_ref", "b")]),
            entity("b", &[("c_ref", "c")]),
            entity("c", &[("a_ref", "a")]),
            entity("d", &[("a_ref2", "a")]),
        ]);
        let plan = TierPlan::build(&schema).unwrap();
        assert_eq!(plan.deferred_fields.len(), 1);
        assert_plan_is_sound(&schema, &plan);
    }

    #[test]
    fn test_external_targets_are_ignored() {
        let schema = schema_of(vec![entity("account", &[("ownerid", "systemuser")])]);
        let plan = TierPlan::build(&schema).unwrap();
        assert_eq!(plan.tiers, vec![vec!["account".to_string()]]);
        assert!(plan.deferred_fields.is_empty());
    }

    #[test]
    fn test_relationships_carried_into_final_phase() {
        let mut schema = schema_of(vec![entity("account", &[]), entity("contact", &[])]);
        schema.relationships.push(RelationshipDescriptor {
            name: "account_contacts".to_string(),
            entity1: "account".to_string(),
            entity2: "contact".to_string(),
            intersect_entity: None,
        });
        let plan = TierPlan::build(&schema).unwrap();
        assert_eq!(plan.relationships.len(), 1);
    }

    #[test]
    fn test_display_shape() {
        let schema = schema_of(vec![
            entity("account", &[]),
            entity("contact", &[("parentcustomerid", "account"), ("parentcontactid", "contact")]),
        ]);
        let plan = TierPlan::build(&schema).unwrap();
        let shown = plan.to_string();
        assert!(shown.contains("Tier 1: account"));
        assert!(shown.contains("Tier 2: contact"));
        assert!(shown.contains("Deferred: contact.parentcontactid"));
    }
}
