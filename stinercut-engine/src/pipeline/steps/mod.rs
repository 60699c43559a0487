//! Built-in step handlers and pipeline templates.

pub mod demo;
pub mod media;

use crate::pipeline::registry::StepRegistry;

/// Register every built-in step and template.
pub fn register_builtins(registry: &mut StepRegistry) {
    demo::register(registry);
    media::register(registry);
}
