/// Normalizes a phone number to E.164 (`+` and 8-15 digits).
///
/// Separators are dropped, a `00` prefix becomes `+`, and a bare 10-digit
/// national number gets `default_country_code` prepended.
pub fn normalize_e164(raw: &str, default_country_code: &str) -> Result<String, String> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if let Some(rest) = s.strip_prefix("00") {
        s = format!("+{rest}");
    }

    if !s.starts_with('+') {
        if s.len() == 10 && s.chars().all(|c| c.is_ascii_digit()) {
            s = format!("+{default_country_code}{s}");
        } else {
            return Err("phone number must include a country code, e.g. +573001234567".into());
        }
    }

    let digits = &s[1..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err("phone number must contain only digits after +".into());
    }
    if !(8..=15).contains(&digits.len()) {
        return Err("phone number must have between 8 and 15 digits".into());
    }

    Ok(s)
}
