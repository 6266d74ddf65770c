//! Definition registry: stores and retrieves orchestration definitions.
//!
//! Definitions are validated on the way in and immutable afterwards. Every
//! lookup is scoped to the owning tenant; another tenant's definition reads
//! as not found.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::definition::{validate_steps, DefinitionDraft, OrchestrationDefinition};
use crate::error::{Result, StepwiseError};

#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<OrchestrationDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `draft` and register it for `tenant_id`.
    pub fn create(
        &self,
        tenant_id: &str,
        draft: DefinitionDraft,
    ) -> Result<Arc<OrchestrationDefinition>> {
        validate_steps(&draft.steps)?;
        let definition = Arc::new(OrchestrationDefinition::from_draft(tenant_id, draft));
        self.definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.id.clone(), definition.clone());
        tracing::info!(
            definition_id = %definition.id,
            tenant = %tenant_id,
            steps = definition.steps.len(),
            "orchestration definition registered"
        );
        Ok(definition)
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Arc<OrchestrationDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StepwiseError::DefinitionNotFound(id.to_string()))
    }

    /// All definitions of `tenant_id`, oldest first.
    pub fn list(&self, tenant_id: &str) -> Vec<Arc<OrchestrationDefinition>> {
        let mut list: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        let mut map = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        match map.get(id) {
            Some(d) if d.tenant_id == tenant_id => {
                map.remove(id);
                tracing::info!(definition_id = %id, "orchestration definition deleted");
                Ok(())
            }
            _ => Err(StepwiseError::DefinitionNotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::definition::{OrchestrationStep, ValidationError};

    fn draft(steps: Vec<OrchestrationStep>) -> DefinitionDraft {
        DefinitionDraft {
            name: "kyc".into(),
            steps,
            on_complete: None,
        }
    }

    #[test]
    fn create_rejects_invalid_definition() {
        let reg = DefinitionRegistry::new();
        let err = reg.create("t1", draft(vec![])).unwrap_err();
        assert!(matches!(
            err,
            StepwiseError::InvalidDefinition(ValidationError::Empty)
        ));
        assert!(reg.list("t1").is_empty());
    }

    #[test]
    fn definitions_are_tenant_scoped() {
        let reg = DefinitionRegistry::new();
        let d = reg
            .create("t1", draft(vec![OrchestrationStep::new("a", "tpl-a")]))
            .unwrap();
        assert!(d.id.starts_with("od_"));
        assert_eq!(reg.get("t1", &d.id).unwrap().name, "kyc");
        assert!(matches!(
            reg.get("t2", &d.id),
            Err(StepwiseError::DefinitionNotFound(_))
        ));
        assert!(reg.list("t2").is_empty());
        assert!(reg.delete("t2", &d.id).is_err());
    }

    #[test]
    fn delete_removes_definition() {
        let reg = DefinitionRegistry::new();
        let d = reg
            .create("t1", draft(vec![OrchestrationStep::new("a", "tpl-a")]))
            .unwrap();
        reg.delete("t1", &d.id).unwrap();
        assert!(reg.get("t1", &d.id).is_err());
    }
}
