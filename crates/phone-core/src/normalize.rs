//! Phone number normalization with firmware-compatible semantics.
//!
//! The device compares numbers after stripping formatting and localizing
//! against the configured default dialing code; the client mirrors that so
//! blocked/missed dedup and list lookups agree with the firmware.

/// Return only the digit characters from `value`.
pub fn strip_to_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Sanitize a default dialing code: digits only, leading zeros removed.
pub fn sanitize_dialing_code(value: &str) -> String {
    let digits = strip_to_digits(value);
    let stripped = digits.trim_start_matches('0');
    stripped.to_owned()
}

fn strip_formatting(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' | '-' | '(' | ')' | '.' | '\t' | '\r' | '\n' => {}
            '+' if result.is_empty() => result.push('+'),
            '+' => {}
            c if c.is_ascii_digit() => result.push(c),
            _ => {}
        }
    }
    result
}

/// Convert international digits into local format using the default code,
/// when the number carries that code.
fn localize_with_default(digits: &str, code: &str) -> Option<String> {
    if code.is_empty() || !digits.starts_with(code) {
        return None;
    }
    let remainder = &digits[code.len()..];
    if remainder.is_empty() {
        return None;
    }
    if remainder.starts_with('0') {
        Some(remainder.to_owned())
    } else {
        Some(format!("0{remainder}"))
    }
}

/// Normalize a raw number into the local comparison form the firmware uses.
pub fn normalize_number(raw: &str, default_dialing_code: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let cleaned = strip_formatting(trimmed);
    if cleaned.is_empty() {
        return String::new();
    }

    let digits = strip_to_digits(&cleaned);
    if digits.is_empty() {
        return String::new();
    }

    let code = sanitize_dialing_code(default_dialing_code);

    if cleaned.starts_with('+') {
        return localize_with_default(&digits, &code).unwrap_or(digits);
    }

    if digits.starts_with("00") && digits.len() > 2 {
        let stripped = &digits[2..];
        if let Some(localized) = localize_with_default(stripped, &code) {
            return localized;
        }
        return digits;
    }

    if let Some(localized) = localize_with_default(&digits, &code) {
        return localized;
    }

    if digits.starts_with('0') {
        return digits;
    }

    if !code.is_empty() && digits.len() >= 7 {
        return format!("0{digits}");
    }

    digits
}

/// Return a device-friendly canonical number (E.164 when possible).
pub fn canonicalize_number(raw: &str, default_dialing_code: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let code = sanitize_dialing_code(default_dialing_code);
    let normalized = normalize_number(trimmed, &code);
    if normalized.is_empty() {
        return String::new();
    }
    if normalized.starts_with('+') {
        return normalized;
    }

    let digits = strip_to_digits(&normalized);
    if digits.is_empty() {
        return String::new();
    }

    if digits.starts_with("00") && digits.len() > 2 {
        return format!("+{}", &digits[2..]);
    }

    if !code.is_empty() {
        if digits.starts_with(&code) {
            return format!("+{digits}");
        }
        if digits.starts_with('0') && digits.len() >= 7 {
            let local = digits[1..].trim_start_matches('0');
            if !local.is_empty() {
                return format!("+{code}{local}");
            }
        }
        if digits.len() >= 8 {
            return format!("+{code}{digits}");
        }
    }

    digits
}

/// Format a number for display, localizing against the default code when the
/// number carries it.
pub fn format_for_display(raw: &str, default_dialing_code: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let code = sanitize_dialing_code(default_dialing_code);
    let cleaned = strip_formatting(trimmed);
    let digits = strip_to_digits(&cleaned);

    if cleaned.starts_with('+') && !digits.is_empty() {
        if let Some(localized) = localize_with_default(&digits, &code) {
            return localized;
        }
        return format!("+{digits}");
    }

    if digits.starts_with("00") && digits.len() > 2 {
        if let Some(localized) = localize_with_default(&digits[2..], &code) {
            return localized;
        }
    }

    if let Some(localized) = localize_with_default(&digits, &code) {
        return localized;
    }

    trimmed.to_owned()
}

/// True when both values represent the same number after normalization.
pub fn numbers_equivalent(lhs: &str, rhs: &str, default_dialing_code: &str) -> bool {
    if lhs == rhs {
        return true;
    }
    let norm_lhs = normalize_number(lhs, default_dialing_code);
    let norm_rhs = normalize_number(rhs, default_dialing_code);
    if norm_lhs.is_empty() || norm_rhs.is_empty() {
        return false;
    }
    norm_lhs == norm_rhs
}
