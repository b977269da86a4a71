//! Dependency graph over the tasks of one work request.
//!
//! Readiness is recomputed from task states on every query; nothing is cached
//! between state changes.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::core::types::{Task, TaskState};

/// A prerequisite cycle. `path` starts and ends with the same task id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

impl CycleError {
    /// Distinct task ids participating in the cycle.
    pub fn members(&self) -> BTreeSet<&str> {
        self.path.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),
    #[error("task '{task}' references unknown prerequisite '{prerequisite}'")]
    UnknownPrerequisite { task: String, prerequisite: String },
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

/// Validated, indexed task set.
#[derive(Debug, Clone)]
pub struct Graph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl Graph {
    /// Validate ids and prerequisite references, then reject prerequisite cycles.
    pub fn build(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (pos, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), pos).is_some() {
                return Err(GraphError::DuplicateId(task.id.clone()));
            }
        }
        for task in &tasks {
            for prerequisite in &task.prerequisites {
                if !index.contains_key(prerequisite) {
                    return Err(GraphError::UnknownPrerequisite {
                        task: task.id.clone(),
                        prerequisite: prerequisite.clone(),
                    });
                }
            }
        }

        let graph = Self { tasks, index };
        graph.detect_cycle()?;
        Ok(graph)
    }

    fn detect_cycle(&self) -> Result<(), CycleError> {
        let mut colors = vec![Color::White; self.tasks.len()];
        let mut stack = Vec::new();
        for start in 0..self.tasks.len() {
            if colors[start] == Color::White {
                self.visit(start, &mut colors, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        colors: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Result<(), CycleError> {
        colors[node] = Color::Gray;
        stack.push(node);
        for prerequisite in &self.tasks[node].prerequisites {
            let next = self.index[prerequisite];
            match colors[next] {
                Color::Gray => {
                    let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path: Vec<String> = stack[from..]
                        .iter()
                        .map(|&n| self.tasks[n].id.clone())
                        .collect();
                    path.push(self.tasks[next].id.clone());
                    return Err(CycleError { path });
                }
                Color::White => self.visit(next, colors, stack)?,
                Color::Black => {}
            }
        }
        stack.pop();
        colors[node] = Color::Black;
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&pos| &self.tasks[pos])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.index.get(id).map(|&pos| &mut self.tasks[pos])
    }

    /// True if every prerequisite of `id` is `Done`.
    pub fn prerequisites_done(&self, id: &str) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        task.prerequisites
            .iter()
            .all(|p| self.get(p).is_some_and(|t| t.state == TaskState::Done))
    }

    /// Tasks in `Pending` or `Ready` whose prerequisites are all `Done`, in input order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Ready))
            .filter(|t| self.prerequisites_done(&t.id))
            .collect()
    }

    /// Tasks that can never become ready because a prerequisite (directly or
    /// transitively) is `Blocked`. Each entry lists the blocked root causes.
    pub fn blocked_by_dependency(&self) -> Vec<(&Task, Vec<String>)> {
        let mut out = Vec::new();
        for task in &self.tasks {
            if task.state != TaskState::Pending {
                continue;
            }
            let mut roots = BTreeSet::new();
            let mut seen = BTreeSet::new();
            self.collect_blocked_roots(task, &mut roots, &mut seen);
            if !roots.is_empty() {
                out.push((task, roots.into_iter().collect()));
            }
        }
        out
    }

    fn collect_blocked_roots<'a>(
        &'a self,
        task: &'a Task,
        roots: &mut BTreeSet<String>,
        seen: &mut BTreeSet<&'a str>,
    ) {
        for prerequisite in &task.prerequisites {
            if !seen.insert(prerequisite.as_str()) {
                continue;
            }
            let Some(pre) = self.get(prerequisite) else {
                continue;
            };
            if pre.state == TaskState::Blocked {
                roots.insert(pre.id.clone());
            } else if pre.state == TaskState::Pending {
                self.collect_blocked_roots(pre, roots, seen);
            }
        }
    }

    /// Number of tasks currently in `state`.
    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskKind;

    fn task(id: &str, prerequisites: &[&str]) -> Task {
        Task::new(id, TaskKind::Feature, format!("{id} description"))
            .with_prerequisites(prerequisites.iter().copied())
    }

    fn ready_ids(graph: &Graph) -> Vec<&str> {
        graph.ready_tasks().iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn accepts_acyclic_diamond() {
        let graph = Graph::build(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ])
        .expect("acyclic graph");
        assert_eq!(graph.len(), 4);
        assert_eq!(ready_ids(&graph), vec!["a"]);
    }

    #[test]
    fn rejects_cycle_with_full_path() {
        let err = Graph::build(vec![
            task("entry", &["x"]),
            task("x", &["y"]),
            task("y", &["z"]),
            task("z", &["x"]),
        ])
        .expect_err("cycle");
        let cycle = match err {
            GraphError::Cycle(cycle) => cycle,
            other => panic!("expected cycle error, got {other:?}"),
        };
        assert_eq!(cycle.path.first(), cycle.path.last());
        let members: Vec<&str> = cycle.members().into_iter().collect();
        assert_eq!(members, vec!["x", "y", "z"]);
        assert!(cycle.to_string().contains("x -> y -> z -> x"));
    }

    #[test]
    fn rejects_self_loop() {
        let err = Graph::build(vec![task("a", &["a"])]).expect_err("self loop");
        assert_eq!(
            err,
            GraphError::Cycle(CycleError {
                path: vec!["a".to_string(), "a".to_string()]
            })
        );
    }

    #[test]
    fn rejects_unknown_prerequisite() {
        let err = Graph::build(vec![task("a", &["ghost"])]).expect_err("unknown");
        assert!(matches!(err, GraphError::UnknownPrerequisite { .. }));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = Graph::build(vec![task("a", &[]), task("a", &[])]).expect_err("dup");
        assert_eq!(err, GraphError::DuplicateId("a".to_string()));
    }

    #[test]
    fn readiness_requires_every_prerequisite_done() {
        let mut graph = Graph::build(vec![
            task("a", &[]),
            task("b", &[]),
            task("c", &["a", "b"]),
        ])
        .expect("graph");

        graph.get_mut("a").expect("a").state = TaskState::Done;
        graph.get_mut("b").expect("b").state = TaskState::Running;
        assert_eq!(ready_ids(&graph), Vec::<&str>::new());

        graph.get_mut("b").expect("b").state = TaskState::Passed;
        assert!(!graph.prerequisites_done("c"));

        graph.get_mut("b").expect("b").state = TaskState::Done;
        assert_eq!(ready_ids(&graph), vec!["c"]);
    }

    #[test]
    fn ready_excludes_tasks_already_past_ready() {
        let mut graph = Graph::build(vec![task("a", &[]), task("b", &[])]).expect("graph");
        graph.get_mut("a").expect("a").state = TaskState::Retrying;
        graph.get_mut("b").expect("b").state = TaskState::Ready;
        assert_eq!(ready_ids(&graph), vec!["b"]);
    }

    #[test]
    fn blocked_prerequisite_strands_transitive_dependents() {
        let mut graph = Graph::build(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ])
        .expect("graph");
        graph.get_mut("a").expect("a").state = TaskState::Blocked;

        assert!(ready_ids(&graph).contains(&"d"));
        let stranded: Vec<(String, Vec<String>)> = graph
            .blocked_by_dependency()
            .into_iter()
            .map(|(t, roots)| (t.id.clone(), roots))
            .collect();
        assert_eq!(
            stranded,
            vec![
                ("b".to_string(), vec!["a".to_string()]),
                ("c".to_string(), vec!["a".to_string()]),
            ]
        );
    }
}
