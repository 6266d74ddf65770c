//! Orchestration definitions: a named DAG of verification steps.
//!
//! Steps and edges are plain id-indexed data. A step names the steps it
//! depends on by id; no step ever holds a reference to another. Graph
//! questions (cycles, eligibility) are answered on demand from the step list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::StepResult;
use crate::types::{generate_id, ResponseMode};

/// Prefix for definition identifiers.
pub const DEFINITION_ID_PREFIX: &str = "od";

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// One unit of verification inside a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationStep {
    pub id: String,
    /// Verification-template reference handed to the provider.
    pub template: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub response_mode: ResponseMode,
    /// Step-local configuration, forwarded to the provider as metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl OrchestrationStep {
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template: template.into(),
            depends_on: Vec::new(),
            response_mode: ResponseMode::default(),
            config: BTreeMap::new(),
        }
    }

    /// Builder: declare dependencies.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_entry(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// Where terminal orchestration events are additionally delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionTarget {
    pub url: String,
    pub secret: String,
}

/// Caller-supplied content of a definition, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionDraft {
    pub name: String,
    pub steps: Vec<OrchestrationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<CompletionTarget>,
}

/// An immutable, validated DAG of verification steps owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationDefinition {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub steps: Vec<OrchestrationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<CompletionTarget>,
    pub created_at: DateTime<Utc>,
}

impl OrchestrationDefinition {
    /// Assign an id to `draft`. Does not validate; see
    /// [`validate_orchestration`].
    pub fn from_draft(tenant_id: impl Into<String>, draft: DefinitionDraft) -> Self {
        Self {
            id: generate_id(DEFINITION_ID_PREFIX),
            tenant_id: tenant_id.into(),
            name: draft.name,
            steps: draft.steps,
            on_complete: draft.on_complete,
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&OrchestrationStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether every step already has a recorded result.
    pub fn is_fully_covered(&self, results: &BTreeMap<String, StepResult>) -> bool {
        self.steps.iter().all(|s| results.contains_key(&s.id))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Why a definition was rejected. Each variant names the failed condition
/// and the step ids involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    DuplicateStepId(String),
    SelfReference(String),
    UnknownDependency { step: String, dependency: String },
    Cycle(Vec<String>),
    NoEntryStep,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Empty => f.write_str("orchestration must contain at least one step"),
            ValidationError::DuplicateStepId(id) => write!(f, "duplicate step id '{id}'"),
            ValidationError::SelfReference(id) => write!(f, "step '{id}' depends on itself"),
            ValidationError::UnknownDependency { step, dependency } => {
                write!(f, "step '{step}' depends on unknown step '{dependency}'")
            }
            ValidationError::Cycle(path) => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            ValidationError::NoEntryStep => {
                f.write_str("no entry step: at least one step must have no dependencies")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result of [`validate_orchestration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub reason: Option<ValidationError>,
}

impl From<Result<(), ValidationError>> for ValidationOutcome {
    fn from(r: Result<(), ValidationError>) -> Self {
        match r {
            Ok(()) => Self {
                is_valid: true,
                error: None,
                reason: None,
            },
            Err(e) => Self {
                is_valid: false,
                error: Some(e.to_string()),
                reason: Some(e),
            },
        }
    }
}

pub fn validate_orchestration(definition: &OrchestrationDefinition) -> ValidationOutcome {
    validate_steps(&definition.steps).into()
}

/// Check a step list, in order, stopping at the first failure:
///
/// 1. non-empty
/// 2. unique ids
/// 3. every dependency resolves, and none is a self-reference
/// 4. acyclic
/// 5. at least one entry step
pub fn validate_steps(steps: &[OrchestrationStep]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::Empty);
    }

    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if *dep == step.id {
                return Err(ValidationError::SelfReference(step.id.clone()));
            }
            if !ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(steps) {
        return Err(ValidationError::Cycle(cycle));
    }

    if !steps.iter().any(OrchestrationStep::is_entry) {
        return Err(ValidationError::NoEntryStep);
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search over `depends_on` edges. Returns the first cycle found
/// as a path that starts and ends on the same step id.
fn find_cycle(steps: &[OrchestrationStep]) -> Option<Vec<String>> {
    let index: HashMap<&str, &OrchestrationStep> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = steps
        .iter()
        .map(|s| (s.id.as_str(), Mark::Unvisited))
        .collect();
    let mut path = Vec::new();

    for step in steps {
        if marks.get(step.id.as_str()) == Some(&Mark::Unvisited) {
            if let Some(cycle) = visit(step.id.as_str(), &index, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a OrchestrationStep>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    let &step = index.get(id)?;
    marks.insert(id, Mark::InProgress);
    path.push(id);

    for dep in &step.depends_on {
        match marks.get(dep.as_str()).copied() {
            Some(Mark::InProgress) => {
                let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            Some(Mark::Unvisited) => {
                if let Some(cycle) = visit(dep.as_str(), index, marks, path) {
                    return Some(cycle);
                }
            }
            Some(Mark::Done) | None => {}
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    None
}

// ---------------------------------------------------------------------------
// Step selection
// ---------------------------------------------------------------------------

/// The first step with no dependencies, in declared order.
pub fn find_first_step(definition: &OrchestrationDefinition) -> Option<&OrchestrationStep> {
    definition.steps.iter().find(|s| s.is_entry())
}

/// The first step, in declared order, that has no result yet and whose
/// dependencies all succeeded.
///
/// `None` is ambiguous: either every step has a result, or the remaining
/// steps are blocked behind a failed ancestor. Use
/// [`OrchestrationDefinition::is_fully_covered`] to tell them apart.
pub fn find_next_eligible_step<'d>(
    definition: &'d OrchestrationDefinition,
    results: &BTreeMap<String, StepResult>,
) -> Option<&'d OrchestrationStep> {
    definition.steps.iter().find(|step| {
        !results.contains_key(&step.id)
            && step
                .depends_on
                .iter()
                .all(|dep| results.get(dep).is_some_and(|r| r.success))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
