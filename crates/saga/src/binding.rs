//! Resolves a remote action's declared inputs against the saga context.

use serde_json::{Map, Value};

use crate::definition::{BindingSource, InputBinding};
use crate::error::ContextBindingError;

/// Builds the argument map for an action.
///
/// Required context bindings that resolve to nothing (or to `null`) fail
/// with [`ContextBindingError`]; optional ones are left out.
pub fn resolve(
    bindings: &[InputBinding],
    context: &Map<String, Value>,
) -> Result<Map<String, Value>, ContextBindingError> {
    let mut arguments = Map::new();

    for binding in bindings {
        let value = match &binding.source {
            BindingSource::Literal(value) => Some(value.clone()),
            BindingSource::Context(path) => lookup(context, path).filter(|v| !v.is_null()).cloned(),
        };

        match value {
            Some(value) => {
                arguments.insert(binding.field.clone(), value);
            }
            None if binding.required => {
                let path = match &binding.source {
                    BindingSource::Context(path) => path.clone(),
                    BindingSource::Literal(_) => String::new(),
                };
                return Err(ContextBindingError {
                    field: binding.field.clone(),
                    path,
                });
            }
            None => {}
        }
    }

    Ok(arguments)
}

/// Follows a JSON pointer whose first segment is a context key.
fn lookup<'a>(context: &'a Map<String, Value>, pointer: &str) -> Option<&'a Value> {
    let pointer = pointer.strip_prefix('/')?;
    let (key, rest) = match pointer.split_once('/') {
        Some((key, rest)) => (key, Some(rest)),
        None => (pointer, None),
    };

    let root = context.get(&unescape(key))?;
    match rest {
        Some(rest) => root.pointer(&format!("/{rest}")),
        None => Some(root),
    }
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}
