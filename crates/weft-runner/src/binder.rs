//! Context-argument binding.
//!
//! A context reference may carry a small binding expression that shapes the
//! parent's input into the argument object of the target tool:
//!
//! ```text
//! $city as location and metric
//! ```
//!
//! Tokens are whitespace-split. `and` separates bindings, `as <name>` aliases
//! the target property (case-insensitive), `$name` / `${name}` reads a field
//! of the parent input, and anything else is a literal. Without an alias the
//! value binds to the target's sole property.

use serde_json::{Map, Value};
use weft_contract::{Program, ProgramError, ToolReference};

/// Render the JSON argument object for one context-tool invocation, or
/// `None` when the reference binds nothing.
pub(crate) fn context_call_input(
    program: &Program,
    reference: &ToolReference,
    input: &str,
) -> Result<Option<String>, ProgramError> {
    let arg = match reference.arg.as_deref() {
        Some(arg) if !arg.trim().is_empty() => arg,
        _ => return Ok(None),
    };

    let target = program.get_tool(&reference.tool_id)?;
    let Some(arguments) = &target.arguments else {
        return Ok(None);
    };

    // Case-insensitive lookup of the target's property names.
    let mut target_keys = std::collections::BTreeMap::new();
    for key in arguments.properties.keys() {
        target_keys.insert(key.to_lowercase(), key.clone());
    }

    let input_map: Map<String, Value> = serde_json::from_str(input).unwrap_or_default();
    let mut output = Map::new();

    let fields: Vec<&str> = arg.split_whitespace().collect();
    let mut i = 0;
    while i < fields.len() {
        let field = fields[i];
        if field == "and" {
            i += 1;
            continue;
        }
        if field == "as" {
            // Alias tokens are consumed by the value that precedes them.
            i += 2;
            continue;
        }

        let value = if let Some(name) = field.strip_prefix('$') {
            let name = name
                .strip_prefix('{')
                .and_then(|n| n.strip_suffix('}'))
                .unwrap_or(name);
            input_map.get(name).cloned().unwrap_or(Value::Null)
        } else {
            Value::String(field.to_string())
        };

        let alias = if fields.get(i + 1) == Some(&"as") {
            match fields.get(i + 2) {
                Some(name) => Some(name.to_lowercase()),
                None => {
                    return Err(invalid_binding(
                        &reference.tool_id,
                        "\"as\" must be followed by a property name",
                    ))
                }
            }
        } else {
            None
        };

        if target_keys.is_empty() {
            return Err(invalid_binding(
                &reference.tool_id,
                "target tool has no defined args",
            ));
        }

        let key = match alias {
            Some(alias) => alias,
            None => {
                if target_keys.len() != 1 {
                    return Err(invalid_binding(
                        &reference.tool_id,
                        "target tool does not have exactly one arg, use \"as\" to name one",
                    ));
                }
                target_keys.keys().next().cloned().unwrap_or_default()
            }
        };

        match target_keys.get(&key) {
            Some(target_key) => {
                output.insert(target_key.clone(), value);
            }
            None => {
                return Err(invalid_binding(
                    &reference.tool_id,
                    &format!("target tool does not define arg [{key}]"),
                ))
            }
        }

        i += 1;
    }

    if output.is_empty() {
        return Ok(None);
    }

    serde_json::to_string(&Value::Object(output))
        .map(Some)
        .map_err(|err| invalid_binding(&reference.tool_id, &err.to_string()))
}

fn invalid_binding(tool_id: &str, reason: &str) -> ProgramError {
    ProgramError::InvalidContextBinding {
        tool_id: tool_id.to_string(),
        reason: reason.to_string(),
    }
}
