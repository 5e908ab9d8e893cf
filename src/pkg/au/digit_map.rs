// MEGACO digit map translated to an anchored regular expression

use regex::Regex;

use crate::command::CommandError;

/// Compiled MEGACO digit map.
///
/// Translation: `x` matches one digit, `.` marks repetition of the previous
/// element, `*` is the literal star key, `|` separates alternatives. Matching
/// is anchored over the whole collected sequence.
#[derive(Debug, Clone)]
pub struct DigitMap {
    source: String,
    regex: Regex,
}

impl DigitMap {
    pub fn compile(pattern: &str) -> Result<Self, CommandError> {
        let translated = translate(pattern);
        let anchored = format!("^(?:{})$", translated);
        let regex = Regex::new(&anchored).map_err(|e| {
            CommandError::inconsistent_parameters(format!(
                "Invalid digit pattern {}: {}",
                pattern, e
            ))
        })?;
        Ok(DigitMap {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, sequence: &str) -> bool {
        self.regex.is_match(sequence)
    }
}

/// MEGACO digit map syntax → regex syntax, character by character.
fn translate(pattern: &str) -> String {
    let mut translated = String::with_capacity(pattern.len() * 2);
    for ch in pattern.chars() {
        match ch {
            'x' | 'X' => translated.push_str("[0-9]"),
            '.' => translated.push('+'),
            '*' => translated.push_str("\\*"),
            '#' => translated.push('#'),
            '|' => translated.push('|'),
            '[' | ']' | '-' => translated.push(ch),
            other => translated.push(other),
        }
    }
    translated
}
