//! Name mangling for generated identifiers.
//!
//! Model names may contain `$`, `.`, and derivative marks; generated Rust
//! identifiers encode them reversibly enough for a human reading the
//! output: `$t'` becomes `s_t_dot`, `pre.I` becomes `pre_I`.

use dendrite_model::eqset::VariableKey;

/// Field name for a variable.
pub fn field(key: &VariableKey) -> String {
    let mut out = sanitize(&key.name);
    for _ in 0..key.order {
        out.push_str("_dot");
    }
    out
}

/// Field name of the buffered (`next_`) copy.
pub fn next_field(key: &VariableKey) -> String {
    format!("next_{}", field(key))
}

/// Type name prefix for a part: path segments in CamelCase.
pub fn type_prefix(path: &[String]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push_str(&camel(&sanitize(segment)));
    }
    if out.is_empty() {
        out.push_str("Wrapper");
    }
    out
}

pub fn instance_type(path: &[String]) -> String {
    format!("{}Instance", type_prefix(path))
}

pub fn population_type(path: &[String]) -> String {
    format!("{}Population", type_prefix(path))
}

/// Field holding a nested population inside its container instance.
pub fn population_field(name: &str) -> String {
    format!("{}_population", sanitize(name))
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '$' => out.push_str("s_"),
            '.' => out.push('_'),
            '\'' => out.push_str("_dot"),
            c if c.is_alphanumeric() || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if c == '_' {
            upper = true;
            continue;
        }
        if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() {
        assert_eq!(field(&VariableKey::new("V", 0)), "V");
        assert_eq!(field(&VariableKey::new("V", 1)), "V_dot");
        assert_eq!(field(&VariableKey::new("$t", 1)), "s_t_dot");
        assert_eq!(field(&VariableKey::new("pre.I", 0)), "pre_I");
    }

    #[test]
    fn types() {
        let path = vec!["layer".to_string(), "cell".to_string()];
        assert_eq!(instance_type(&path), "LayerCellInstance");
        assert_eq!(population_type(&path), "LayerCellPopulation");
        assert_eq!(instance_type(&[]), "WrapperInstance");
    }

    #[test]
    fn digits_guarded() {
        assert_eq!(field(&VariableKey::new("2x", 0)), "_2x");
    }
}
