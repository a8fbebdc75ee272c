use std::collections::{HashMap, HashSet, VecDeque};

use orchestrator_core::{
    models::{is_reserved_queue, JobSpec, Task, TaskState},
    OrchestratorError, OrchestratorResult,
};
use tracing::{debug, warn};

/// Validation and readiness checks over a job's task graph.
///
/// Dependencies are by task name. A task without `depends_on` follows the
/// task declared before it; an explicit empty list marks a root.
pub struct DependencyChecker;

impl DependencyChecker {
    /// Validates `spec` and returns the resolved predecessors of every task,
    /// indexed by declaration position.
    pub fn validate(spec: &JobSpec) -> OrchestratorResult<Vec<Vec<String>>> {
        if spec.tasks.is_empty() {
            return Err(OrchestratorError::InvalidJob("job has no tasks".to_string()));
        }

        let mut names = HashSet::new();
        for task in &spec.tasks {
            if task.name.trim().is_empty() {
                return Err(OrchestratorError::InvalidJob(
                    "task name must not be empty".to_string(),
                ));
            }
            if !names.insert(task.name.as_str()) {
                return Err(OrchestratorError::InvalidJob(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
            if let Some(queue) = &task.queue {
                if is_reserved_queue(queue) {
                    return Err(OrchestratorError::InvalidJob(format!(
                        "task {} targets reserved queue {queue}",
                        task.name
                    )));
                }
            }
        }

        let predecessors = Self::resolve(spec);
        for (task, deps) in spec.tasks.iter().zip(&predecessors) {
            for dep in deps {
                if dep == &task.name {
                    return Err(OrchestratorError::InvalidJob(format!(
                        "task {} depends on itself",
                        task.name
                    )));
                }
                if !names.contains(dep.as_str()) {
                    return Err(OrchestratorError::InvalidJob(format!(
                        "task {} depends on unknown task {dep}",
                        task.name
                    )));
                }
            }
        }

        let graph: HashMap<&str, Vec<&str>> = spec
            .tasks
            .iter()
            .zip(&predecessors)
            .map(|(task, deps)| (task.name.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        if Self::has_cycle(&graph) {
            warn!(job = %spec.name, "dependency cycle detected");
            return Err(OrchestratorError::InvalidJob(
                "task dependencies form a cycle".to_string(),
            ));
        }

        debug!(job = %spec.name, tasks = spec.tasks.len(), "task graph validated");
        Ok(predecessors)
    }

    /// Resolves implicit dependencies without validating them.
    pub fn resolve(spec: &JobSpec) -> Vec<Vec<String>> {
        spec.tasks
            .iter()
            .enumerate()
            .map(|(position, task)| match &task.depends_on {
                Some(deps) => deps.clone(),
                None if position == 0 => Vec::new(),
                None => vec![spec.tasks[position - 1].name.clone()],
            })
            .collect()
    }

    /// Kahn's algorithm over `task -> predecessors` edges.
    fn has_cycle(graph: &HashMap<&str, Vec<&str>>) -> bool {
        let mut in_degree: HashMap<&str, usize> = graph.keys().map(|&n| (n, 0)).collect();
        for deps in graph.values() {
            for &dep in deps {
                *in_degree.entry(dep).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop_front() {
            processed += 1;
            for &dep in graph.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }
        processed < in_degree.len()
    }

    /// Ids of `CREATED` tasks whose predecessors have all completed, in
    /// declaration order.
    pub fn ready_tasks(tasks: &[Task]) -> Vec<String> {
        let states: HashMap<&str, TaskState> =
            tasks.iter().map(|t| (t.name(), t.state)).collect();
        let mut ready: Vec<&Task> = tasks
            .iter()
            .filter(|task| task.state == TaskState::Created)
            .filter(|task| {
                task.predecessors
                    .iter()
                    .all(|dep| states.get(dep.as_str()) == Some(&TaskState::Completed))
            })
            .collect();
        ready.sort_by_key(|task| task.position);
        ready.into_iter().map(|task| task.id.clone()).collect()
    }

    pub fn all_completed(tasks: &[Task]) -> bool {
        !tasks.is_empty() && tasks.iter().all(|t| t.state == TaskState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use orchestrator_core::models::TaskSpec;

    use super::*;

    fn spec(tasks: Vec<TaskSpec>) -> JobSpec {
        tasks.into_iter().fold(JobSpec::new("job"), JobSpec::with_task)
    }

    #[test]
    fn test_implicit_dependencies_follow_declaration_order() {
        let job = spec(vec![TaskSpec::new("a"), TaskSpec::new("b"), TaskSpec::new("c")]);
        let predecessors = DependencyChecker::validate(&job).unwrap();
        assert_eq!(
            predecessors,
            vec![vec![], vec!["a".to_string()], vec!["b".to_string()]]
        );
    }

    #[test]
    fn test_parallel_group() {
        let job = spec(vec![
            TaskSpec::new("setup"),
            TaskSpec::new("left").depends_on(["setup"]),
            TaskSpec::new("right").depends_on(["setup"]),
            TaskSpec::new("join").depends_on(["left", "right"]),
        ]);
        let predecessors = DependencyChecker::validate(&job).unwrap();
        assert_eq!(predecessors[1], predecessors[2]);
        assert_eq!(predecessors[3], vec!["left".to_string(), "right".to_string()]);
    }

    #[test]
    fn test_invalid_graphs_are_rejected() {
        let cases = vec![
            spec(vec![]),
            spec(vec![TaskSpec::new("a"), TaskSpec::new("a")]),
            spec(vec![TaskSpec::new("")]),
            spec(vec![TaskSpec::new("a").depends_on(["missing"])]),
            spec(vec![TaskSpec::new("a").depends_on(["a"])]),
            spec(vec![
                TaskSpec::new("a").depends_on(["b"]),
                TaskSpec::new("b").depends_on(["a"]),
            ]),
            spec(vec![TaskSpec::new("a").with_queue("x-status")]),
        ];
        for job in cases {
            assert!(
                matches!(
                    DependencyChecker::validate(&job),
                    Err(OrchestratorError::InvalidJob(_))
                ),
                "accepted {job:?}"
            );
        }
    }

    #[test]
    fn test_ready_tasks_wait_for_all_predecessors() {
        let mut a = Task::new("job", 0, TaskSpec::new("a"));
        let mut b = Task::new("job", 1, TaskSpec::new("b"));
        let mut c = Task::new("job", 2, TaskSpec::new("c"));
        b.predecessors = vec!["a".into()];
        c.predecessors = vec!["a".into(), "b".into()];

        assert_eq!(
            DependencyChecker::ready_tasks(&[a.clone(), b.clone(), c.clone()]),
            vec![a.id.clone()]
        );

        a.state = TaskState::Completed;
        assert_eq!(
            DependencyChecker::ready_tasks(&[a.clone(), b.clone(), c.clone()]),
            vec![b.id.clone()]
        );

        b.state = TaskState::Completed;
        c.state = TaskState::Completed;
        assert!(DependencyChecker::all_completed(&[a, b, c]));
    }
}
