use crate::types::{Step, StepId, WorkflowDefinition};
use anyhow::{anyhow, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use std::collections::{HashMap, HashSet};

/// Dependency graph built from a workflow definition's steps.
#[derive(Clone)]
pub struct WorkflowDag {
    graph: DiGraph<Step, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
}

impl WorkflowDag {
    /// Builds the DAG from a definition's `depends_on` edges, rejecting
    /// unknown dependency references and cycles.
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in &definition.steps {
            let node = graph.add_node(step.clone());
            step_indices.insert(step.id.clone(), node);
        }

        for step in &definition.steps {
            let step_idx = step_indices[&step.id];
            for dep_id in &step.depends_on {
                let dep_idx = step_indices
                    .get(dep_id)
                    .ok_or_else(|| anyhow!("dependency {} not found for step {}", dep_id, step.id))?;
                graph.add_edge(*dep_idx, step_idx, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(anyhow!("workflow contains circular dependencies"));
        }

        Ok(Self { graph, step_indices })
    }

    /// Steps in dependency order (each step's dependencies precede it).
    pub fn topological_order(&self) -> Vec<Step> {
        let mut topo = Topo::new(&self.graph);
        let mut steps = Vec::new();
        while let Some(node) = topo.next(&self.graph) {
            steps.push(self.graph[node].clone());
        }
        steps
    }

    pub fn dependencies(&self, step_id: &StepId) -> Result<Vec<StepId>> {
        let node = self
            .step_indices
            .get(step_id)
            .ok_or_else(|| anyhow!("step {} not found", step_id))?;

        Ok(self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].id.clone())
            .collect())
    }

    pub fn dependents(&self, step_id: &StepId) -> Result<Vec<StepId>> {
        let node = self
            .step_indices
            .get(step_id)
            .ok_or_else(|| anyhow!("step {} not found", step_id))?;

        Ok(self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].id.clone())
            .collect())
    }

    /// True when every dependency of `step_id` is in `completed_steps`.
    pub fn can_execute(&self, step_id: &StepId, completed_steps: &HashSet<StepId>) -> Result<bool> {
        let deps = self.dependencies(step_id)?;
        Ok(deps.iter().all(|dep| completed_steps.contains(dep)))
    }

    /// Steps with no dependencies — the DAG's starting points.
    pub fn entry_steps(&self) -> Vec<Step> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.step_indices.get(step_id).map(|n| &self.graph[*n])
    }

    pub fn all_step_ids(&self) -> Vec<StepId> {
        self.step_indices.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepErrorHandling, StepType, WorkflowErrorHandling};
    use chrono::Utc;

    fn step(id: &str, depends_on: &[&str]) -> Step {
        Step {
            id: StepId::new(id),
            name: id.to_string(),
            step_type: StepType::Transform,
            depends_on: depends_on.iter().map(|d| StepId::new(*d)).collect(),
            condition: None,
            error_handling: StepErrorHandling::default(),
            configuration: serde_json::json!({}),
        }
    }

    fn definition(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: crate::types::WorkflowId::new("wf"),
            version: 1,
            name: "wf".into(),
            description: None,
            steps,
            error_handling: WorkflowErrorHandling::stop_on_first_error(),
            variables: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn linear_dag_orders_by_dependency() {
        let def = definition(vec![
            step("step1", &[]),
            step("step2", &["step1"]),
            step("step3", &["step2"]),
        ]);

        let dag = WorkflowDag::from_definition(&def).unwrap();
        let order = dag.topological_order();

        assert_eq!(order.len(), 3);
        assert_eq!(order[0].id.0, "step1");
        assert_eq!(order[1].id.0, "step2");
        assert_eq!(order[2].id.0, "step3");
    }

    #[test]
    fn parallel_fan_in_has_two_entry_steps() {
        let def = definition(vec![
            step("step1", &[]),
            step("step2", &[]),
            step("step3", &["step1", "step2"]),
            step("step4", &["step3"]),
        ]);

        let dag = WorkflowDag::from_definition(&def).unwrap();
        let entry = dag.entry_steps();
        assert_eq!(entry.len(), 2);

        let deps = dag.dependencies(&StepId::new("step3")).unwrap();
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn cyclic_dag_is_rejected() {
        let def = definition(vec![step("step1", &["step2"]), step("step2", &["step1"])]);

        let result = WorkflowDag::from_definition(&def);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("circular dependencies"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let def = definition(vec![step("step1", &["missing"])]);
        let result = WorkflowDag::from_definition(&def);
        assert!(result.is_err());
    }
}
