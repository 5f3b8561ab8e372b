//! Inline list generator.

use async_trait::async_trait;
use std::time::Duration;

use super::{Element, Generator, element_from_value, unexpected_spec};
use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::error::GeneratorError;

/// Yields the elements written in the set itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineList;

#[async_trait]
impl Generator for InlineList {
    async fn generate(&self, spec: GeneratorSpec<'_>, _set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let GeneratorSpec::List(list) = spec else {
            return Err(unexpected_spec(GeneratorKind::List, spec));
        };
        list.elements
            .iter()
            .map(|value| element_from_value(GeneratorKind::List, value.clone()))
            .collect()
    }

    fn interval(&self, _spec: GeneratorSpec<'_>) -> Duration {
        Duration::ZERO
    }
}
