//! Dependency-ordered task orchestration.
//!
//! Unique responsibility: run a small DAG of async tasks (typically dependent REST
//! calls) so that every task starts only after the tasks it depends on completed.
//!
//! A group has one root task. Other tasks join it in two ways:
//! - dependencies: the root waits for them (`add_dependency`, `add_dependency_group`)
//! - post-run dependents: they wait for the root and still run as part of the same
//!   invocation (`add_post_run_dependent`, `add_post_run_dependent_group`)
//!
//! Expected integration:
//! 1) Build the group around a root task
//! 2) Attach dependencies / post-run dependents (e.g. role assignments)
//! 3) `group.invoke(ctx)` => `TaskGroupOutcome` or `TaskGroupError::Failed`
//!
//! Ready tasks run concurrently; a failure never aborts tasks already in flight.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;

/// Error produced by a task.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What happens to the rest of the group once a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminateStrategy {
    /// Skip only the tasks that (transitively) depend on the failed task.
    #[default]
    TerminateOnHittingLcaTask,
    /// Start no new task after the first failure; in-flight tasks finish.
    TerminateOnInProgressTasksCompletion,
}

/// Context shared by every task of one invocation.
///
/// Cloning is cheap; clones share the same property map.
#[derive(Clone, Default)]
pub struct InvocationContext {
    strategy: TerminateStrategy,
    properties: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl InvocationContext {
    /// New context with the default termination strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `strategy` when a task fails.
    #[must_use]
    pub const fn with_terminate_strategy(mut self, strategy: TerminateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Termination strategy of this invocation.
    #[must_use]
    pub const fn terminate_strategy(&self) -> TerminateStrategy {
        self.strategy
    }

    /// Store a value for other tasks to read.
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Read a stored value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether `key` was stored.
    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// A unit of work in a task group.
#[async_trait]
pub trait TaskItem<T: Send>: Send + Sync {
    /// Called once on every task before the group starts running.
    fn before_group_invoke(&mut self) {}

    /// Run the task. `Ok(None)` is a successful task without a result.
    ///
    /// # Errors
    ///
    /// Any error marks the task as failed.
    async fn invoke(&self, ctx: &InvocationContext) -> Result<Option<T>, BoxError>;
}

/// Task item backed by an async closure.
pub struct FunctionalTaskItem<F> {
    func: F,
}

impl<F> FunctionalTaskItem<F> {
    /// Wrap `func`, which receives a clone of the invocation context.
    #[must_use]
    pub const fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<T, F, Fut> TaskItem<T> for FunctionalTaskItem<F>
where
    T: Send + 'static,
    F: Fn(InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<T>, BoxError>> + Send,
{
    async fn invoke(&self, ctx: &InvocationContext) -> Result<Option<T>, BoxError> {
        (self.func)(ctx.clone()).await
    }
}

/// Final state of a task after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Ran successfully.
    Completed,
    /// Ran and returned an error.
    Failed,
    /// Not run because a task it depends on failed.
    ErroredDependency,
    /// Not run because the group was cancelled.
    Cancelled,
}

struct TaskEntry<T: Send> {
    item: Box<dyn TaskItem<T>>,
    dependencies: Vec<String>,
}

/// A DAG of tasks with a single root.
pub struct TaskGroup<T: Send> {
    root_key: String,
    order: Vec<String>,
    entries: HashMap<String, TaskEntry<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create a group holding only its root task.
    pub fn new(root_key: impl Into<String>, root: impl TaskItem<T> + 'static) -> Self {
        let root_key = root_key.into();
        let mut entries = HashMap::new();
        entries.insert(
            root_key.clone(),
            TaskEntry {
                item: Box::new(root) as Box<dyn TaskItem<T>>,
                dependencies: Vec::new(),
            },
        );

        Self {
            order: vec![root_key.clone()],
            root_key,
            entries,
        }
    }

    /// Key of the root task.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.root_key
    }

    /// Number of tasks in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the group holds no task (never true: the root always exists).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether a task with `key` is part of the group.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether the root (transitively) depends on the task `key`.
    #[must_use]
    pub fn depends_on(&self, key: &str) -> bool {
        let mut stack = vec![self.root_key.as_str()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(current) {
                for dep in &entry.dependencies {
                    if dep == key {
                        return true;
                    }
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    /// Add a task the root must wait for.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if `key` is already used in the group.
    pub fn add_dependency(
        &mut self,
        key: impl Into<String>,
        item: impl TaskItem<T> + 'static,
    ) -> Result<(), TaskGroupError> {
        let key = key.into();
        self.insert_entry(key.clone(), Box::new(item), Vec::new())?;
        self.push_edge(&self.root_key.clone(), key);
        Ok(())
    }

    /// Merge `other`; this root waits for all of its tasks.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if both groups share a key.
    pub fn add_dependency_group(&mut self, other: Self) -> Result<(), TaskGroupError> {
        let other_root = other.root_key.clone();
        self.merge(other)?;
        self.push_edge(&self.root_key.clone(), other_root);
        Ok(())
    }

    /// Add a task that runs after the root within the same invocation.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if `key` is already used in the group.
    pub fn add_post_run_dependent(
        &mut self,
        key: impl Into<String>,
        item: impl TaskItem<T> + 'static,
    ) -> Result<(), TaskGroupError> {
        self.insert_entry(key.into(), Box::new(item), vec![self.root_key.clone()])
    }

    /// Merge `other`; its root runs after this root within the same invocation.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if both groups share a key.
    pub fn add_post_run_dependent_group(&mut self, other: Self) -> Result<(), TaskGroupError> {
        let other_root = other.root_key.clone();
        self.merge(other)?;
        self.push_edge(&other_root, self.root_key.clone());
        Ok(())
    }

    /// Make the task `dependent` wait for the task `dependency`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKey` if either task is not in the group. Cycles are
    /// reported when the group is invoked.
    pub fn add_dependency_edge(&mut self, dependent: &str, dependency: &str) -> Result<(), TaskGroupError> {
        for key in [dependent, dependency] {
            if !self.entries.contains_key(key) {
                return Err(TaskGroupError::UnknownKey(key.to_string()));
            }
        }
        self.push_edge(dependent, dependency.to_string());
        Ok(())
    }

    /// Run all tasks in dependency order.
    ///
    /// # Errors
    ///
    /// Returns `Cycle` if the dependencies are cyclic, or `Failed` with every task
    /// error once nothing is left to run.
    pub async fn invoke(&mut self, ctx: &InvocationContext) -> Result<TaskGroupOutcome<T>, TaskGroupError> {
        for key in &self.order {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.item.before_group_invoke();
            }
        }

        let topo = self.topological_order()?;
        tracing::debug!(root = %self.root_key, tasks = topo.len(), "invoking task group");

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut pending: HashMap<&str, usize> = HashMap::new();
        for key in &self.order {
            let entry = &self.entries[key];
            pending.insert(key.as_str(), entry.dependencies.len());
            for dep in &entry.dependencies {
                dependents.entry(dep.as_str()).or_default().push(key.as_str());
            }
        }

        let mut ready: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|k| pending.get(k).copied() == Some(0))
            .collect();

        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut results: HashMap<String, Option<T>> = HashMap::new();
        let mut failures: Vec<TaskFailure> = Vec::new();
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut cancelled = false;
        let mut running = FuturesUnordered::new();

        loop {
            while let Some(key) = ready.pop_front() {
                if cancelled {
                    continue;
                }
                let item = &self.entries[key].item;
                let task_ctx = ctx.clone();
                running.push(async move {
                    let res = item.invoke(&task_ctx).await;
                    (key, res)
                });
            }

            let Some((key, res)) = running.next().await else {
                break;
            };

            match res {
                Ok(value) => {
                    tracing::debug!(task = key, "task completed");
                    statuses.insert(key.to_string(), TaskStatus::Completed);
                    results.insert(key.to_string(), value);
                    for dependent in dependents.get(key).into_iter().flatten() {
                        if let Some(count) = pending.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && !blocked.contains(dependent) {
                                ready.push_back(*dependent);
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(task = key, %error, "task failed");
                    statuses.insert(key.to_string(), TaskStatus::Failed);
                    failures.push(TaskFailure {
                        key: key.to_string(),
                        error,
                    });
                    if ctx.terminate_strategy() == TerminateStrategy::TerminateOnInProgressTasksCompletion {
                        cancelled = true;
                    }
                    mark_descendants(key, &dependents, &mut blocked);
                }
            }
        }

        for key in &self.order {
            if !statuses.contains_key(key) {
                let status = if blocked.contains(key.as_str()) {
                    TaskStatus::ErroredDependency
                } else {
                    TaskStatus::Cancelled
                };
                statuses.insert(key.clone(), status);
            }
        }

        if failures.is_empty() {
            Ok(TaskGroupOutcome {
                root_key: self.root_key.clone(),
                results,
                statuses,
            })
        } else {
            Err(TaskGroupError::Failed(failures))
        }
    }

    fn insert_entry(
        &mut self,
        key: String,
        item: Box<dyn TaskItem<T>>,
        dependencies: Vec<String>,
    ) -> Result<(), TaskGroupError> {
        if self.entries.contains_key(&key) {
            return Err(TaskGroupError::DuplicateKey(key));
        }
        self.order.push(key.clone());
        self.entries.insert(key, TaskEntry { item, dependencies });
        Ok(())
    }

    fn merge(&mut self, other: Self) -> Result<(), TaskGroupError> {
        if let Some(dup) = other.order.iter().find(|k| self.entries.contains_key(*k)) {
            return Err(TaskGroupError::DuplicateKey(dup.clone()));
        }
        let Self {
            order, mut entries, ..
        } = other;
        for key in order {
            if let Some(entry) = entries.remove(&key) {
                self.order.push(key.clone());
                self.entries.insert(key, entry);
            }
        }
        Ok(())
    }

    fn push_edge(&mut self, dependent: &str, dependency: String) {
        if let Some(entry) = self.entries.get_mut(dependent)
            && !entry.dependencies.contains(&dependency)
        {
            entry.dependencies.push(dependency);
        }
    }

    /// Kahn's algorithm; returns the keys in a valid execution order.
    fn topological_order(&self) -> Result<Vec<String>, TaskGroupError> {
        let mut pending: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|k| (k.as_str(), self.entries[k].dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for key in &self.order {
            for dep in &self.entries[key].dependencies {
                dependents.entry(dep.as_str()).or_default().push(key.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|k| pending[k] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(key) = queue.pop_front() {
            sorted.push(key.to_string());
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            let in_cycle = pending
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(k, _)| k.to_string())
                .collect();
            Err(TaskGroupError::Cycle(in_cycle))
        }
    }
}

fn mark_descendants<'a>(
    key: &'a str,
    dependents: &HashMap<&'a str, Vec<&'a str>>,
    blocked: &mut HashSet<&'a str>,
) {
    let mut stack: Vec<&str> = dependents.get(key).cloned().unwrap_or_default();
    while let Some(current) = stack.pop() {
        if blocked.insert(current)
            && let Some(next) = dependents.get(current)
        {
            stack.extend(next.iter().copied());
        }
    }
}

/// Results of a successful invocation.
#[derive(Debug)]
pub struct TaskGroupOutcome<T> {
    root_key: String,
    results: HashMap<String, Option<T>>,
    statuses: HashMap<String, TaskStatus>,
}

impl<T> TaskGroupOutcome<T> {
    /// Result of the root task.
    #[must_use]
    pub fn root_result(&self) -> Option<&T> {
        self.task_result(&self.root_key)
    }

    /// Result of the task `key`; `None` for void results or unknown keys.
    #[must_use]
    pub fn task_result(&self, key: &str) -> Option<&T> {
        self.results.get(key).and_then(Option::as_ref)
    }

    /// Take ownership of the result of task `key`.
    pub fn take_result(&mut self, key: &str) -> Option<T> {
        self.results.get_mut(key).and_then(Option::take)
    }

    /// Status of the task `key`.
    #[must_use]
    pub fn status(&self, key: &str) -> Option<TaskStatus> {
        self.statuses.get(key).copied()
    }

    /// Number of tasks that completed.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == TaskStatus::Completed)
            .count()
    }
}

/// A task that returned an error.
#[derive(Debug)]
pub struct TaskFailure {
    /// Task key.
    pub key: String,
    /// The error the task returned.
    pub error: BoxError,
}

/// Error type for task group operations.
#[derive(Debug, Error)]
pub enum TaskGroupError {
    /// A task with this key already exists.
    #[error("a task with key '{0}' already exists in the group")]
    DuplicateKey(String),
    /// No task with this key.
    #[error("no task with key '{0}' in the group")]
    UnknownKey(String),
    /// The dependency graph has a cycle through these tasks.
    #[error("dependency cycle detected among tasks: {0:?}")]
    Cycle(Vec<String>),
    /// One or more tasks failed.
    #[error("{} task(s) failed: {}", .0.len(), describe_failures(.0))]
    Failed(Vec<TaskFailure>),
}

impl TaskGroupError {
    /// Failures reported by tasks, empty for structural errors.
    #[must_use]
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            Self::Failed(f) => f,
            _ => &[],
        }
    }
}

fn describe_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.key, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, name: &'static str) -> impl TaskItem<String> + 'static {
        let log = Arc::clone(log);
        FunctionalTaskItem::new(move |_ctx: InvocationContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok::<_, BoxError>(Some(name.to_string()))
            }
        })
    }

    fn failing(name: &'static str) -> impl TaskItem<String> + 'static {
        FunctionalTaskItem::new(move |_ctx: InvocationContext| async move {
            Err::<Option<String>, BoxError>(format!("{name} exploded").into())
        })
    }

    fn position(log: &Log, name: &str) -> usize {
        log.lock().unwrap().iter().position(|n| n == name).unwrap()
    }

    #[tokio::test]
    async fn dependencies_run_before_root_and_post_run_after() {
        let log: Log = Arc::default();
        let mut group = TaskGroup::new("root", recorder(&log, "root"));
        group.add_dependency("dep-a", recorder(&log, "dep-a")).unwrap();
        group.add_dependency("dep-b", recorder(&log, "dep-b")).unwrap();
        group.add_post_run_dependent("after", recorder(&log, "after")).unwrap();

        let outcome = group.invoke(&InvocationContext::new()).await.unwrap();

        assert!(position(&log, "dep-a") < position(&log, "root"));
        assert!(position(&log, "dep-b") < position(&log, "root"));
        assert!(position(&log, "root") < position(&log, "after"));
        assert_eq!(outcome.root_result().map(String::as_str), Some("root"));
        assert_eq!(outcome.task_result("after").map(String::as_str), Some("after"));
        assert_eq!(outcome.completed_count(), 4);
    }

    #[tokio::test]
    async fn merged_groups_keep_their_internal_order() {
        let log: Log = Arc::default();
        let mut network = TaskGroup::new("vnet", recorder(&log, "vnet"));
        network.add_dependency("rg", recorder(&log, "rg")).unwrap();

        let mut vm = TaskGroup::new("vm", recorder(&log, "vm"));
        vm.add_dependency_group(network).unwrap();
        assert!(vm.depends_on("rg"));
        assert!(vm.depends_on("vnet"));

        let mut rbac = TaskGroup::new("assign", recorder(&log, "assign"));
        rbac.add_dependency("lookup", recorder(&log, "lookup")).unwrap();
        vm.add_post_run_dependent_group(rbac).unwrap();
        assert!(!vm.depends_on("assign"));

        vm.invoke(&InvocationContext::new()).await.unwrap();

        assert!(position(&log, "rg") < position(&log, "vnet"));
        assert!(position(&log, "vnet") < position(&log, "vm"));
        assert!(position(&log, "vm") < position(&log, "assign"));
        assert!(position(&log, "lookup") < position(&log, "assign"));
    }

    #[tokio::test]
    async fn failure_skips_only_dependents_by_default() {
        let log: Log = Arc::default();
        let mut group = TaskGroup::new("root", recorder(&log, "root"));
        group.add_dependency("bad", failing("bad")).unwrap();
        group.add_dependency("good", recorder(&log, "good")).unwrap();

        let err = group.invoke(&InvocationContext::new()).await.unwrap_err();

        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].key, "bad");
        assert!(err.to_string().contains("bad exploded"));
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran, vec!["good".to_string()]);
    }

    fn slow(log: &Log, name: &'static str) -> impl TaskItem<String> + 'static {
        let log = Arc::clone(log);
        FunctionalTaskItem::new(move |_ctx: InvocationContext| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                log.lock().unwrap().push(name.to_string());
                Ok::<_, BoxError>(None)
            }
        })
    }

    #[tokio::test]
    async fn in_progress_strategy_stops_scheduling() {
        let build = |log: &Log| {
            let mut group = TaskGroup::new("root", recorder(log, "root"));
            group.add_dependency("bad", failing("bad")).unwrap();
            let mut chain = TaskGroup::new("second", recorder(log, "second"));
            chain.add_dependency("slow", slow(log, "slow")).unwrap();
            group.add_dependency_group(chain).unwrap();
            group
        };

        let log: Log = Arc::default();
        let ctx = InvocationContext::new()
            .with_terminate_strategy(TerminateStrategy::TerminateOnInProgressTasksCompletion);
        let err = build(&log).invoke(&ctx).await.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        // "slow" was already running and finishes; "second" is never started.
        assert_eq!(log.lock().unwrap().clone(), vec!["slow".to_string()]);

        let log: Log = Arc::default();
        build(&log).invoke(&InvocationContext::new()).await.unwrap_err();
        assert_eq!(
            log.lock().unwrap().clone(),
            vec!["slow".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn independent_branch_continues_after_failure() {
        let log: Log = Arc::default();
        let mut group = TaskGroup::new("root", recorder(&log, "root"));
        group.add_dependency("bad", failing("bad")).unwrap();
        let mut other = TaskGroup::new("b2", recorder(&log, "b2"));
        other.add_dependency("b1", recorder(&log, "b1")).unwrap();
        group.add_dependency_group(other).unwrap();

        let err = group.invoke(&InvocationContext::new()).await.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran, vec!["b1".to_string(), "b2".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_keys_and_cycles_are_rejected() {
        let log: Log = Arc::default();
        let mut group = TaskGroup::new("root", recorder(&log, "root"));
        group.add_dependency("a", recorder(&log, "a")).unwrap();
        assert!(matches!(
            group.add_dependency("a", recorder(&log, "a")),
            Err(TaskGroupError::DuplicateKey(k)) if k == "a"
        ));
        assert!(matches!(
            group.add_dependency_edge("a", "missing"),
            Err(TaskGroupError::UnknownKey(_))
        ));

        group.add_dependency_edge("a", "root").unwrap();
        let err = group.invoke(&InvocationContext::new()).await.unwrap_err();
        assert!(matches!(err, TaskGroupError::Cycle(keys) if keys.len() == 2));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn context_is_shared_between_tasks() {
        let mut group = TaskGroup::new(
            "reader",
            FunctionalTaskItem::new(|ctx: InvocationContext| async move {
                Ok::<_, BoxError>(ctx.get("principal").and_then(|v| v.as_str().map(String::from)))
            }),
        );
        group
            .add_dependency(
                "writer",
                FunctionalTaskItem::new(|ctx: InvocationContext| async move {
                    ctx.put("principal", serde_json::json!("object-id-1"));
                    Ok::<Option<String>, BoxError>(None)
                }),
            )
            .unwrap();

        let outcome = group.invoke(&InvocationContext::new()).await.unwrap();
        assert_eq!(outcome.root_result().map(String::as_str), Some("object-id-1"));
        assert_eq!(outcome.status("writer"), Some(TaskStatus::Completed));
        assert!(outcome.task_result("writer").is_none());
    }

    struct Prepared {
        prepared: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskItem<String> for Prepared {
        fn before_group_invoke(&mut self) {
            self.prepared.fetch_add(1, Ordering::SeqCst);
        }

        async fn invoke(&self, _ctx: &InvocationContext) -> Result<Option<String>, BoxError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn every_task_is_prepared_once_per_invocation() {
        let prepared = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new("root", Prepared { prepared: Arc::clone(&prepared) });
        group
            .add_post_run_dependent("child", Prepared { prepared: Arc::clone(&prepared) })
            .unwrap();

        group.invoke(&InvocationContext::new()).await.unwrap();
        assert_eq!(prepared.load(Ordering::SeqCst), 2);
        group.invoke(&InvocationContext::new()).await.unwrap();
        assert_eq!(prepared.load(Ordering::SeqCst), 4);
    }
}
