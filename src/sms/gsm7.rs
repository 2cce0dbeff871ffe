//! GSM 03.38 default-alphabet length accounting
//!
//! Outbound text is scanned character by character to decide whether the
//! whole message fits the 7-bit repertoire. The table covers the default
//! alphabet plus its escape-prefixed extension; it is deliberately the
//! fixed Latin/Western-European subset shipped by common PDU encoders,
//! so any other script drops the message to UCS-2.

/// Septets one character occupies in a GSM-7 encoded message
///
/// Returns 0 when the character is outside the repertoire, which forces
/// the whole message to UCS-2.
pub fn septet_cost(c: char) -> usize {
    match c {
        // Escape-prefixed extension characters take two septets
        '^' | '{' | '}' | '\\' | '[' | '~' | ']' | '|' | '€' => 2,
        'a'..='z' | 'A'..='Z' | '0'..='9' => 1,
        ' ' | '!' | '"' | '#' | '%' | '&' | '\'' | '(' | ')' | '*' | '+' | ',' | '-' | '.'
        | '/' | ':' | ';' | '<' | '=' | '>' | '?' | '@' | '_' | '$' | '\r' | '\n' => 1,
        // Latin/Greek characters of the default alphabet
        '£' | '¥' | '¤' | '§' | '¡' | '¿' => 1,
        'è' | 'é' | 'ù' | 'ì' | 'ò' | 'à' | 'ç' | 'Ç' | 'É' => 1,
        'Ø' | 'ø' | 'Å' | 'å' | 'Æ' | 'æ' | 'ß' => 1,
        'Ä' | 'ä' | 'Ö' | 'ö' | 'Ñ' | 'ñ' | 'Ü' | 'ü' => 1,
        'Δ' | 'Φ' | 'Γ' | 'Λ' | 'Ω' | 'Π' | 'Ψ' | 'Σ' | 'Θ' | 'Ξ' => 1,
        _ => 0,
    }
}

/// Total septets for a text, or `None` if any character falls outside
/// the GSM-7 repertoire
pub fn septet_len(text: &str) -> Option<usize> {
    let mut total = 0;
    for c in text.chars() {
        match septet_cost(c) {
            0 => return None,
            n => total += n,
        }
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii_costs_one_septet_each() {
        assert_eq!(septet_len("Hello, world! 123"), Some(17));
    }

    #[test]
    fn extension_characters_cost_two() {
        assert_eq!(septet_cost('€'), 2);
        assert_eq!(septet_cost('{'), 2);
        assert_eq!(septet_len("a{b}"), Some(6));
    }

    #[test]
    fn accented_subset_is_seven_bit() {
        assert_eq!(septet_cost('ç'), 1);
        assert_eq!(septet_cost('Ç'), 1);
        assert_eq!(septet_len("déjà ça"), Some(7));
        assert_eq!(septet_len("ΔΩΣ"), Some(3));
    }

    #[test]
    fn outside_repertoire_yields_none() {
        assert_eq!(septet_cost('中'), 0);
        assert_eq!(septet_cost('ê'), 0);
        assert_eq!(septet_len("ok 中"), None);
    }
}
