//! The loaded, immutable set of flow definitions per integration

use crate::domain::flow_definition::FlowDefinition;
use crate::domain::session::FlowId;
use crate::error::EngineError;
use std::collections::HashMap;
use tracing::warn;

/// Immutable catalog of validated flow definitions
///
/// Populated once at startup from integration manifests; lookups never
/// mutate. Cross-flow references (goto/reset targets) are deliberately not
/// validated here - flows may be loaded independently, so a dangling
/// target fails at dispatch time instead.
#[derive(Default)]
pub struct FlowCatalog {
    flows: HashMap<String, Vec<FlowDefinition>>,
}

impl FlowCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration's flows, validating each definition
    pub fn register(
        &mut self,
        integration: impl Into<String>,
        definitions: Vec<FlowDefinition>,
    ) -> Result<(), EngineError> {
        let integration = integration.into();

        let mut default_count = 0;
        for definition in &definitions {
            definition.validate()?;
            if definition.default {
                default_count += 1;
            }
            Self::warn_on_overlapping_steps(&integration, definition);
        }
        if default_count > 1 {
            return Err(EngineError::FlowConfig(format!(
                "Integration {} declares {} default flows, at most one is allowed",
                integration, default_count
            )));
        }

        self.flows.insert(integration, definitions);
        Ok(())
    }

    /// Declaration order decides between overlapping candidates; flag
    /// flows where that ambiguity exists so authors notice
    fn warn_on_overlapping_steps(integration: &str, definition: &FlowDefinition) {
        for pair in definition.steps.windows(2) {
            if pair[0].conditions.is_empty()
                && pair[1].conditions.is_empty()
                && !pair[0].optional
                && !pair[1].optional
            {
                warn!(
                    integration,
                    flow = %definition.id,
                    first = %pair[0].id,
                    second = %pair[1].id,
                    "adjacent unconditioned steps; declaration order decides"
                );
            }
        }
    }

    /// Look up a flow by integration and id
    pub fn get(&self, integration: &str, flow_id: &FlowId) -> Option<&FlowDefinition> {
        self.flows
            .get(integration)?
            .iter()
            .find(|f| &f.id == flow_id)
    }

    /// The integration's default flow, if one is declared
    pub fn default_flow(&self, integration: &str) -> Option<&FlowDefinition> {
        self.flows.get(integration)?.iter().find(|f| f.default)
    }

    /// Resolve a flow reference from an action; dangling references are a
    /// dispatch-time error
    pub fn resolve(&self, integration: &str, flow: &str) -> Result<&FlowDefinition, EngineError> {
        self.get(integration, &FlowId(flow.to_string()))
            .ok_or_else(|| EngineError::FlowReference {
                flow: flow.to_string(),
            })
    }

    /// All flow ids registered for an integration
    pub fn flow_ids(&self, integration: &str) -> Vec<FlowId> {
        self.flows
            .get(integration)
            .map(|flows| flows.iter().map(|f| f.id.clone()).collect())
            .unwrap_or_default()
    }
}
