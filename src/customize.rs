//! Per-destination template expansion of workload objects
//!
//! A workload object opts into expansion with the
//! `edge.kubestellar.io/expand-templates: "true"` annotation. For such an
//! object the engine decides whether the object actually contains templates
//! (`wanted_change`, a property of the object alone) and, per destination,
//! produces the expanded variant using that destination's properties.
//!
//! The engine is a seam: [`CustomizationEngine`] is the contract the
//! controller consumes, [`TemplateExpander`] the bundled implementation.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::properties::ClusterProperties;

/// Result of expanding one object for one destination
pub struct Expansion {
    /// The (possibly) expanded object content
    pub data: Value,
    /// Whether the object requested any change; constant across destinations
    pub wanted_change: bool,
    /// User errors hit during expansion, e.g. references to absent properties
    pub errors: Vec<String>,
}

/// Expands templates in an object's content against destination properties
///
/// Implementations must be pure: same inputs, same outputs, no side effects.
/// `wanted_change` must depend only on the object, never on the properties.
pub trait CustomizationEngine: Send + Sync {
    /// Expand `data` for the destination identified by `dest_key`
    ///
    /// `dest_key` is only used to label error messages; it carries the
    /// destination and a reference to the object being expanded.
    fn expand(&self, dest_key: &str, data: &Value, properties: &ClusterProperties) -> Expansion;
}

fn has_template_marker(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Template engine over every string scalar of the object content
///
/// Strings containing `{{ ... }}` or `{% ... %}` are rendered against the
/// property map; everything else passes through untouched. A reference to a
/// property the destination does not have is a user error, reported with the
/// offending template and `dest_key`.
pub struct TemplateExpander {
    env: Environment<'static>,
}

impl Default for TemplateExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateExpander {
    /// Create an expander with strict handling of absent properties
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    fn render_value(
        &self,
        value: &Value,
        properties: &ClusterProperties,
        dest_key: &str,
        changed: &mut bool,
        errors: &mut Vec<String>,
    ) -> Value {
        match value {
            Value::String(s) if has_template_marker(s) => {
                *changed = true;
                match self.env.render_str(s, &**properties) {
                    Ok(rendered) => Value::String(rendered),
                    Err(err) => {
                        errors.push(format!(
                            "failed to expand template {s:?} for {dest_key}: {err}"
                        ));
                        value.clone()
                    }
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item, properties, dest_key, changed, errors))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| {
                        (
                            key.clone(),
                            self.render_value(item, properties, dest_key, changed, errors),
                        )
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl CustomizationEngine for TemplateExpander {
    fn expand(&self, dest_key: &str, data: &Value, properties: &ClusterProperties) -> Expansion {
        let mut changed = false;
        let mut errors = Vec::new();
        let expanded = self.render_value(data, properties, dest_key, &mut changed, &mut errors);
        Expansion {
            data: expanded,
            wanted_change: changed,
            errors,
        }
    }
}
