//! In-memory pattern library with structural validation.
//!
//! Pattern *semantics* (prompt compilation, execution strategy) belong to the
//! external orchestrator; the library only guards the structure every
//! consumer relies on: unique step ids, resolvable dependencies, and an
//! acyclic invocation graph.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use weft_types::{PatternLibrary, WeftError, WorkflowPattern};

/// Structurally validate a pattern before it enters the library.
pub fn validate_pattern(pattern: &WorkflowPattern) -> Result<(), WeftError> {
    if pattern.name.is_empty() {
        return Err(WeftError::InvalidArgument("pattern name must not be empty".into()));
    }
    if pattern.steps.is_empty() {
        return Err(WeftError::InvalidArgument(format!(
            "pattern {:?} has no steps",
            pattern.name
        )));
    }
    let mut ids = HashSet::new();
    for step in &pattern.steps {
        if step.id.is_empty() || step.agent.is_empty() {
            return Err(WeftError::InvalidArgument(format!(
                "pattern {:?}: every step needs an id and an agent",
                pattern.name
            )));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(WeftError::InvalidArgument(format!(
                "pattern {:?}: duplicate step id {:?}",
                pattern.name, step.id
            )));
        }
    }
    for step in &pattern.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(WeftError::InvalidArgument(format!(
                    "pattern {:?}: step {:?} depends on unknown step {:?}",
                    pattern.name, step.id, dep
                )));
            }
        }
    }
    if has_cycle(pattern) {
        return Err(WeftError::InvalidArgument(format!(
            "pattern {:?}: dependency cycle detected",
            pattern.name
        )));
    }
    Ok(())
}

fn has_cycle(pattern: &WorkflowPattern) -> bool {
    let deps: HashMap<&str, &[String]> =
        pattern.steps.iter().map(|s| (s.id.as_str(), s.depends_on.as_slice())).collect();
    let mut done: HashSet<&str> = HashSet::new();
    let mut in_progress: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        done: &mut HashSet<&'a str>,
        in_progress: &mut HashSet<&'a str>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !in_progress.insert(node) {
            return true;
        }
        for dep in deps.get(node).copied().unwrap_or(&[]) {
            if visit(dep.as_str(), deps, done, in_progress) {
                return true;
            }
        }
        in_progress.remove(node);
        done.insert(node);
        false
    }

    pattern
        .steps
        .iter()
        .any(|s| visit(s.id.as_str(), &deps, &mut done, &mut in_progress))
}

/// Hot-reloadable in-memory [`PatternLibrary`].
#[derive(Default)]
pub struct MemoryPatternLibrary {
    patterns: RwLock<HashMap<String, WorkflowPattern>>,
}

impl MemoryPatternLibrary {
    /// Create an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole library in one swap (hot reload).
    pub fn replace_all(&self, patterns: Vec<WorkflowPattern>) {
        let mut map = HashMap::new();
        for pattern in patterns {
            map.insert(pattern.name.clone(), pattern);
        }
        *self.patterns.write().expect("pattern lock poisoned") = map;
    }
}

impl PatternLibrary for MemoryPatternLibrary {
    fn get(&self, name: &str) -> Option<WorkflowPattern> {
        self.patterns.read().expect("pattern lock poisoned").get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.patterns.read().expect("pattern lock poisoned").keys().cloned().collect()
    }

    fn put(&self, pattern: WorkflowPattern) -> bool {
        self.patterns
            .write()
            .expect("pattern lock poisoned")
            .insert(pattern.name.clone(), pattern)
            .is_none()
    }

    fn remove(&self, name: &str) -> bool {
        self.patterns.write().expect("pattern lock poisoned").remove(name).is_some()
    }
}
