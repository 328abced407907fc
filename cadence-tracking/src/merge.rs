//! Per-recipient merge-field substitution.

/// Substitute `{{ key }}` and `{{key}}` placeholders in `template`.
///
/// Values render as bare strings; non-string JSON values use their JSON
/// form. Unknown placeholders are left untouched so a typo in authored
/// content is visible in the delivered message rather than silently blank.
#[must_use]
pub fn substitute_merge_fields(
    template: &str,
    substitutions: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut output = template.to_string();
    for (key, value) in substitutions {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        output = output.replace(&format!("{{{{ {key} }}}}"), &rendered);
        output = output.replace(&format!("{{{{{key}}}}}"), &rendered);
    }
    output
}
