//! `#Name` substitution in instruction attributes.

use super::scope::{Scope, Value};
use crate::error::{Error, Result};
use crate::tree::Tree;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace every `#Name` in `text` with the string form of the bound value.
///
/// The longest run of name characters after `#` that is bound wins, so
/// `#SectionNumber` prefers `SectionNumber` over `Section`. A `#` not
/// followed by a name character is kept literally. A reference with no
/// bound prefix is an error.
pub fn substitute(text: &str, scope: &Scope, tree: &Tree) -> Result<String> {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(index) = rest.find('#') {
        output.push_str(&rest[..index]);
        let after = &rest[index + 1..];
        let run_len = after
            .char_indices()
            .find(|(_, c)| !is_name_char(*c))
            .map_or(after.len(), |(i, _)| i);

        if run_len == 0 {
            output.push('#');
            rest = after;
            continue;
        }

        let run = &after[..run_len];
        // Name characters are ASCII, so every prefix length is a char boundary.
        let bound = (1..=run_len)
            .rev()
            .find_map(|len| scope.get(&run[..len]).map(|value| (len, value)));
        let Some((len, value)) = bound else {
            return Err(Error::UnresolvedVariable {
                name: run.to_string(),
                text: text.to_string(),
            });
        };

        output.push_str(&value.render(tree));
        rest = &after[len..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Resolve an attribute: exactly `#Name` yields the bound value itself,
/// anything else is substituted into text.
pub fn resolve_value(text: &str, scope: &Scope, tree: &Tree) -> Result<Value> {
    if let Some(name) = text.strip_prefix('#') {
        if !name.is_empty() && name.chars().all(is_name_char) {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
    }
    substitute(text, scope, tree).map(Value::Text)
}
