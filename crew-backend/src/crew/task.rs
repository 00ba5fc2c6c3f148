//! Task graph
//!
//! Tasks are appended in any order and checked as a whole by [`TaskGraph::validate`].
//! Execution order is a topological sort with ties broken by insertion order, so
//! the same graph always yields the same order.

use super::agent::AgentRegistry;
use super::run::RunInput;
use crate::error::GraphError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_\-]+)\}").expect("valid placeholder regex"));

/// One unit of work, owned by exactly one agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSpec {
    pub id: String,
    pub instruction: String,
    pub agent: String,
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

impl TaskSpec {
    pub fn new(
        id: impl Into<String>,
        instruction: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        TaskSpec {
            id: id.into(),
            instruction: instruction.into(),
            agent: agent.into(),
            dependencies: Vec::new(),
            expected_output: None,
        }
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn expecting(mut self, expected_output: impl Into<String>) -> Self {
        self.expected_output = Some(expected_output.into());
        self
    }

    /// Instruction with run inputs and dependency outputs filled in.
    ///
    /// `{goal}` and `{url}` take the run input, `{<task>}` takes the output of a
    /// dependency. Other placeholders are left as written. Dependency outputs not
    /// referenced inline are appended as context.
    pub fn resolve(&self, input: &RunInput, outputs: &HashMap<String, String>) -> String {
        let mut inlined: HashSet<&str> = HashSet::new();

        let body = PLACEHOLDER.replace_all(&self.instruction, |caps: &Captures| {
            let name = &caps[1];
            match name {
                "goal" => input.goal.clone(),
                "url" => input
                    .url
                    .clone()
                    .unwrap_or_else(|| "(no URL provided)".to_string()),
                _ => match self.dependencies.iter().find(|d| d.as_str() == name) {
                    Some(dep) => match outputs.get(dep) {
                        Some(output) => {
                            inlined.insert(dep.as_str());
                            output.clone()
                        }
                        None => caps[0].to_string(),
                    },
                    None => caps[0].to_string(),
                },
            }
        });

        let mut resolved = body.into_owned();

        let context: Vec<(&String, &String)> = self
            .dependencies
            .iter()
            .filter(|dep| !inlined.contains(dep.as_str()))
            .filter_map(|dep| outputs.get(dep).map(|out| (dep, out)))
            .collect();
        if !context.is_empty() {
            resolved.push_str("\n\nContext from previous tasks:");
            for (dep, output) in context {
                resolved.push_str(&format!("\n\n### {}\n{}", dep, output));
            }
        }

        if let Some(expected) = &self.expected_output {
            resolved.push_str(&format!("\n\nExpected output: {}", expected));
        }

        resolved
    }
}

/// The dependent set of work items for a crew
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<TaskSpec>,
    terminal: Option<String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task; structure is checked later by `validate`
    pub fn add_task(&mut self, task: TaskSpec) {
        self.tasks.push(task);
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.add_task(task);
        self
    }

    /// Make `task_id` the task whose output is the run result
    pub fn designate_terminal(&mut self, task_id: impl Into<String>) {
        self.terminal = Some(task_id.into());
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.iter()
    }

    /// Check structure and agent references
    pub fn validate(&self, agents: &AgentRegistry) -> Result<(), GraphError> {
        self.topological_order()?;

        if let Some(task) = self.tasks.iter().find(|t| !agents.contains(&t.agent)) {
            return Err(GraphError::UnknownAgent {
                task: task.id.clone(),
                agent: task.agent.clone(),
            });
        }

        if let Some(terminal) = &self.terminal {
            if self.get(terminal).is_none() {
                return Err(GraphError::UnknownTerminal(terminal.clone()));
            }
        }

        Ok(())
    }

    /// Deterministic execution order honoring every dependency
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        // deps[i] = indices task i waits on, dependents[j] = tasks waiting on j
        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let j = *index.get(dep.as_str()).ok_or_else(|| GraphError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                if deps[i].insert(j) {
                    dependents[j].push(i);
                }
            }
        }

        let mut in_degree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut ready: BTreeSet<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < self.tasks.len() {
            let done: HashSet<usize> = order.iter().copied().collect();
            return Err(GraphError::CyclicDependency(self.find_cycle(&deps, &done)));
        }

        Ok(order.into_iter().map(|i| self.tasks[i].id.clone()).collect())
    }

    /// Walk unfinished dependencies from the first stuck task until one repeats
    fn find_cycle(&self, deps: &[BTreeSet<usize>], done: &HashSet<usize>) -> Vec<String> {
        let Some(start) = (0..self.tasks.len()).find(|i| !done.contains(i)) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = vec![start];
        let mut current = start;
        loop {
            // every stuck task has at least one unfinished dependency
            let Some(&next) = deps[current].iter().find(|d| !done.contains(d)) else {
                break;
            };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.tasks[i].id.clone()).collect();
                cycle.push(self.tasks[next].id.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }

        path.into_iter().map(|i| self.tasks[i].id.clone()).collect()
    }

    /// The designated terminal task, else the last task of `order`
    pub fn terminal_task(&self, order: &[String]) -> Option<String> {
        self.terminal.clone().or_else(|| order.last().cloned())
    }

    /// Every task that directly or transitively depends on `task_id`, in insertion order
    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        let mut affected: HashSet<&str> = HashSet::from([task_id]);
        let mut changed = true;
        while changed {
            changed = false;
            for task in &self.tasks {
                if !affected.contains(task.id.as_str())
                    && task.dependencies.iter().any(|d| affected.contains(d.as_str()))
                {
                    affected.insert(task.id.as_str());
                    changed = true;
                }
            }
        }

        self.tasks
            .iter()
            .filter(|t| t.id != task_id && affected.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }
}
