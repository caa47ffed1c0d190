//! `{{placeholder}}` substitution for notification templates.

use std::collections::HashMap;

pub const KNOWN_PLACEHOLDERS: &[&str] = &[
    "client_name",
    "appointment_number",
    "appointment_date",
    "appointment_time",
    "branch_name",
    "branch_address",
    "cancellation_reason",
    "company_name",
];

/// Replaces every `{{ key }}` whose key is in `values`.
///
/// Unknown placeholders are copied through untouched and substituted text is
/// never scanned again.
pub fn render(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let key = after_open[..end].trim();
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escapes text for insertion into an HTML body.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Placeholders in `template` that are not in the known set.
pub fn unknown_placeholders(template: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else { break };
        let key = after_open[..end].trim();
        if !KNOWN_PLACEHOLDERS.contains(&key) && !found.iter().any(|k| k == key) {
            found.push(key.to_string());
        }
        rest = &after_open[end + 2..];
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> HashMap<&'static str, String> {
        HashMap::from([
            ("client_name", "Ana Ruiz".to_string()),
            ("appointment_number", "APT-20261015-3F2A9C1B".to_string()),
        ])
    }

    #[test]
    fn substitutes_known_keys_with_optional_spaces() {
        let out = render("Hola {{client_name}}, cita {{ appointment_number }}.", &values());
        assert_eq!(out, "Hola Ana Ruiz, cita APT-20261015-3F2A9C1B.");
    }

    #[test]
    fn unknown_and_unterminated_placeholders_survive() {
        let out = render("{{client_name}} {{unknown}} {{client_name", &values());
        assert_eq!(out, "Ana Ruiz {{unknown}} {{client_name");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let vals = HashMap::from([("client_name", "{{appointment_number}}".to_string())]);
        assert_eq!(render("{{client_name}}", &vals), "{{appointment_number}}");
    }

    #[test]
    fn html_special_characters_are_escaped() {
        assert_eq!(
            escape_html(r#"<b onclick="x">Tom & 'Jerry'</b>"#),
            "&lt;b onclick=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
        assert_eq!(escape_html("Ana Ruiz"), "Ana Ruiz");
    }

    #[test]
    fn reports_unknown_placeholders_once() {
        let unknown = unknown_placeholders("{{client_name}} {{foo}} {{ foo }} {{bar}}");
        assert_eq!(unknown, vec!["foo".to_string(), "bar".to_string()]);
    }
}
