#![allow(clippy::non_std_lazy_statics)]

use super::config::{ValidationRule, ValidationSpec};
use lazy_regex::lazy_regex;
use thiserror::Error;
use tracing::warn;

static RE_EMAIL: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"^[^\s@]+@[^\s@]+\.[^\s@]+$");

static RE_URL: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^https?://[^\s/$.?#][^\s]*\.[^\s]+$");

static RE_PHONE_CHARS: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^\+?[0-9\s\-()]+$");

/// A rejected answer, with the message to show the user
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    /// User-facing explanation
    pub message: String,
}

fn reject(spec: &ValidationSpec, default: String) -> ValidationError {
    ValidationError {
        message: spec
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(default),
    }
}

/// Check a text answer against an optional rule
///
/// # Errors
///
/// Returns a `ValidationError` carrying the configured or default message.
pub fn validate_answer(spec: Option<&ValidationSpec>, input: &str) -> Result<(), ValidationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ValidationError {
            message: "Please send a text answer.".to_string(),
        });
    }
    let Some(spec) = spec else {
        return Ok(());
    };

    match spec.rule {
        ValidationRule::Email => {
            if !RE_EMAIL.is_match(input) {
                return Err(reject(spec, "Please enter a valid e-mail address.".into()));
            }
        }
        ValidationRule::Phone => {
            let digits = input.chars().filter(char::is_ascii_digit).count();
            if !RE_PHONE_CHARS.is_match(input) || !(7..=15).contains(&digits) {
                return Err(reject(spec, "Please enter a valid phone number.".into()));
            }
        }
        ValidationRule::Url => {
            if !RE_URL.is_match(input) {
                return Err(reject(
                    spec,
                    "Please enter a link starting with http:// or https://.".into(),
                ));
            }
        }
        ValidationRule::Number => check_number(spec, input)?,
        ValidationRule::MinLength => {
            let min = spec.min.unwrap_or(0.0);
            #[allow(clippy::cast_precision_loss)]
            let len = input.chars().count() as f64;
            if len < min {
                return Err(reject(spec, format!("Please enter at least {min} characters.")));
            }
        }
        ValidationRule::MaxLength => {
            #[allow(clippy::cast_precision_loss)]
            let len = input.chars().count() as f64;
            if let Some(max) = spec.max {
                if len > max {
                    return Err(reject(spec, format!("Please keep it under {max} characters.")));
                }
            }
        }
        ValidationRule::Regex | ValidationRule::Custom => check_pattern(spec, input)?,
    }
    Ok(())
}

fn check_number(spec: &ValidationSpec, input: &str) -> Result<(), ValidationError> {
    let Ok(value) = input.replace(',', ".").parse::<f64>() else {
        return Err(reject(spec, "Please enter a number.".into()));
    };
    if !value.is_finite() {
        return Err(reject(spec, "Please enter a number.".into()));
    }
    if let Some(min) = spec.min {
        if value < min {
            return Err(reject(spec, format!("The number must be at least {min}.")));
        }
    }
    if let Some(max) = spec.max {
        if value > max {
            return Err(reject(spec, format!("The number must be at most {max}.")));
        }
    }
    Ok(())
}

fn check_pattern(spec: &ValidationSpec, input: &str) -> Result<(), ValidationError> {
    let Some(pattern) = spec.pattern.as_deref() else {
        if spec.rule == ValidationRule::Regex {
            warn!("Regex rule without a pattern, accepting answer");
        }
        return Ok(());
    };
    match regex::Regex::new(pattern) {
        Ok(re) if re.is_match(input) => Ok(()),
        Ok(_) => Err(reject(spec, "The answer has an unexpected format.".into())),
        Err(e) => {
            warn!(pattern, error = %e, "Invalid validation pattern, accepting answer");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(rule: ValidationRule) -> ValidationSpec {
        ValidationSpec {
            rule,
            min: None,
            max: None,
            pattern: None,
            message: None,
        }
    }

    #[test]
    fn test_email() {
        let s = spec(ValidationRule::Email);
        assert!(validate_answer(Some(&s), "a@b.com").is_ok());
        assert!(validate_answer(Some(&s), "not-an-email").is_err());
    }

    #[test]
    fn test_phone_and_url() {
        let phone = spec(ValidationRule::Phone);
        assert!(validate_answer(Some(&phone), "+1 (555) 123-4567").is_ok());
        assert!(validate_answer(Some(&phone), "12-34").is_err());
        assert!(validate_answer(Some(&phone), "call me").is_err());

        let url = spec(ValidationRule::Url);
        assert!(validate_answer(Some(&url), "https://example.com/x").is_ok());
        assert!(validate_answer(Some(&url), "example.com").is_err());
    }

    #[test]
    fn test_number_bounds() {
        let s = ValidationSpec {
            min: Some(1.0),
            max: Some(10.0),
            ..spec(ValidationRule::Number)
        };
        assert!(validate_answer(Some(&s), "2,5").is_ok());
        assert!(validate_answer(Some(&s), "0").is_err());
        assert!(validate_answer(Some(&s), "11").is_err());
        assert!(validate_answer(Some(&s), "ten").is_err());
    }

    #[test]
    fn test_lengths_count_characters() {
        let min = ValidationSpec {
            min: Some(3.0),
            ..spec(ValidationRule::MinLength)
        };
        assert!(validate_answer(Some(&min), "Аня").is_ok());
        assert!(validate_answer(Some(&min), "Ан").is_err());

        let max = ValidationSpec {
            max: Some(3.0),
            ..spec(ValidationRule::MaxLength)
        };
        assert!(validate_answer(Some(&max), "abc").is_ok());
        assert!(validate_answer(Some(&max), "abcd").is_err());
    }

    #[test]
    fn test_custom_message_wins() {
        let s = ValidationSpec {
            pattern: Some("^[0-9]{4}$".into()),
            message: Some("Four digits, please".into()),
            ..spec(ValidationRule::Custom)
        };
        let err = validate_answer(Some(&s), "12a4").expect_err("rejected");
        assert_eq!(err.message, "Four digits, please");
        assert!(validate_answer(Some(&s), "1234").is_ok());
    }

    #[test]
    fn test_blank_answer_rejected_without_rule() {
        assert!(validate_answer(None, "   ").is_err());
        assert!(validate_answer(None, "anything").is_ok());
    }

    proptest! {
        #[test]
        fn validation_never_panics(input in ".{0,64}", rule_idx in 0usize..8) {
            let rules = [
                ValidationRule::Email,
                ValidationRule::Phone,
                ValidationRule::Url,
                ValidationRule::Number,
                ValidationRule::MinLength,
                ValidationRule::MaxLength,
                ValidationRule::Regex,
                ValidationRule::Custom,
            ];
            let s = ValidationSpec {
                min: Some(1.0),
                max: Some(5.0),
                pattern: Some("^x".into()),
                ..spec(rules[rule_idx])
            };
            let _ = validate_answer(Some(&s), &input);
        }
    }
}
