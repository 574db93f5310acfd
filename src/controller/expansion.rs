//! # Variable expansion
//!
//! Substitutes `$(VAR_NAME)` references in template strings. The syntax and
//! semantics match container environment variable expansion: `$$` escapes
//! the operator, unresolved references are preserved verbatim, and expansion
//! is a single pass over the input (values are never re-expanded).

/// Expands `$(name)` references in `input` using `mapping`.
///
/// Rules:
/// - `$$` yields a literal `$`, so `$$(NAME)` yields the literal `$(NAME)`.
/// - `$(name)` is replaced by `mapping(name)` when it returns a value, and
///   is otherwise emitted unchanged.
/// - A `$(` without a matching `)` and a `$` followed by anything else are
///   emitted verbatim.
pub fn expand<F>(input: &str, mapping: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(i) = rest.find('$') {
        out.push_str(&rest[..i]);
        let after = &rest[i + 1..];
        match after.bytes().next() {
            // Trailing operator.
            None => {
                out.push('$');
                rest = "";
            }
            // Escaped operator.
            Some(b'$') => {
                out.push('$');
                rest = &after[1..];
            }
            Some(b'(') => match after.find(')') {
                Some(close) => {
                    let name = &after[1..close];
                    match mapping(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("$(");
                            out.push_str(name);
                            out.push(')');
                        }
                    }
                    rest = &after[close + 1..];
                }
                // Unbalanced opener.
                None => {
                    out.push_str("$(");
                    rest = &after[1..];
                }
            },
            // Operator that doesn't begin a reference.
            Some(_) => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Returns a mapping over `env` suitable for [`expand`].
pub fn mapping_for(env: &std::collections::HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
    move |name| env.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("VAR_A".to_string(), "A".to_string());
        env.insert("VAR_B".to_string(), "B".to_string());
        env.insert("VAR_EMPTY".to_string(), String::new());
        env
    }

    #[test]
    fn expands_references() {
        let env = env();
        let cases = [
            ("$(VAR_A)", "A"),
            ("before $(VAR_A) after", "before A after"),
            ("$(VAR_A)$(VAR_B)", "AB"),
            ("foo$(VAR_EMPTY)bar", "foobar"),
        ];
        for (input, expected) in cases {
            assert_eq!(expand(input, mapping_for(&env)), expected, "input {input:?}");
        }
    }

    #[test]
    fn preserves_unresolved_references() {
        let env = env();
        assert_eq!(expand("$(UNKNOWN)", mapping_for(&env)), "$(UNKNOWN)");
        assert_eq!(expand("a $(MISSING) b", mapping_for(&env)), "a $(MISSING) b");
        assert_eq!(expand("$()", mapping_for(&env)), "$()");
    }

    #[test]
    fn escaped_references_are_never_expanded() {
        let env = env();
        assert_eq!(expand("$$(VAR_A)", mapping_for(&env)), "$(VAR_A)");
        assert_eq!(expand("$$(UNKNOWN)", mapping_for(&env)), "$(UNKNOWN)");
        assert_eq!(expand("$$", mapping_for(&env)), "$");
        assert_eq!(expand("$$$(VAR_A)", mapping_for(&env)), "$A");
    }

    #[test]
    fn malformed_operators_are_verbatim() {
        let env = env();
        let cases = [
            ("$", "$"),
            ("$(", "$("),
            ("$(VAR_A", "$(VAR_A"),
            ("$VAR_A", "$VAR_A"),
            ("$)", "$)"),
            ("a$", "a$"),
        ];
        for (input, expected) in cases {
            assert_eq!(expand(input, mapping_for(&env)), expected, "input {input:?}");
        }
    }

    #[test]
    fn expansion_is_single_pass() {
        let mut env = HashMap::new();
        env.insert("OUTER".to_string(), "$(INNER)".to_string());
        env.insert("INNER".to_string(), "value".to_string());
        assert_eq!(expand("$(OUTER)", mapping_for(&env)), "$(INNER)");
    }

    #[test]
    fn nested_opener_resolves_at_first_closer() {
        let env = env();
        assert_eq!(expand("$($(VAR_A))", mapping_for(&env)), "$($(VAR_A))");
    }
}
