//! Compiles path templates such as `/blog/:slug*` into regular expressions.
//!
//! Supported syntax:
//!
//! - `:name` parameters matching one segment
//! - custom patterns `:id(\d+)` and unnamed groups `(.*)`
//! - modifiers `?` (optional), `*` (zero or more), `+` (one or more)
//! - `\` escapes the next character
//!
//! A `/` or `.` directly before a parameter belongs to it, so `/docs/:page?`
//! matches `/docs` as well as `/docs/intro`. Compiled expressions are anchored,
//! case-insensitive and accept one trailing slash.

use regex::{Regex, RegexBuilder};
use std::fmt::Write;
use thiserror::Error;

const DEFAULT_PATTERN: &str = "[^/]+?";
const PREFIXES: &[char] = &['/', '.'];

#[derive(Debug, Error)]
pub enum PathPatternError {
    #[error("Missing parameter name at {index}")]
    MissingParameterName { index: usize },

    #[error("Unbalanced pattern at {index}")]
    UnbalancedPattern { index: usize },

    #[error("Missing pattern at {index}")]
    MissingPattern { index: usize },

    #[error("Pattern cannot start with \"?\" at {index}")]
    PatternStartsWithQuestion { index: usize },

    #[error("Capturing groups are not allowed at {index}")]
    CapturingGroup { index: usize },

    #[error("Unexpected modifier \"{modifier}\" at {index}")]
    UnexpectedModifier { index: usize, modifier: char },

    #[error("Invalid pattern \"{pattern}\": {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, PartialEq)]
enum Lexeme {
    Char(char),
    Escaped(char),
    Name(String),
    Pattern(String),
    Modifier(char),
}

#[derive(Debug, PartialEq)]
enum Token {
    Literal(String),
    Param {
        prefix: String,
        pattern: String,
        modifier: Option<char>,
    },
}

/// Compile a path template into a case-insensitive regular expression
pub fn compile(template: &str) -> Result<Regex, PathPatternError> {
    let source = to_regex_source(template)?;
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|source| PathPatternError::InvalidPattern {
            pattern: template.to_string(),
            source,
        })
}

/// Translate a path template into regular expression source
pub fn to_regex_source(template: &str) -> Result<String, PathPatternError> {
    let tokens = parse(lex(template)?)?;

    let mut source = String::from("^");
    let last = tokens.len().saturating_sub(1);
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Literal(text) => {
                let text = if i == last && text.len() > 1 {
                    text.strip_suffix('/').unwrap_or(text)
                } else {
                    text.as_str()
                };
                source.push_str(&regex::escape(text));
            }
            Token::Param {
                prefix,
                pattern,
                modifier,
            } => {
                let prefix = regex::escape(prefix);
                // Writing to a String cannot fail
                let _ = match modifier {
                    None => write!(source, "{prefix}({pattern})"),
                    Some('?') => write!(source, "(?:{prefix}({pattern}))?"),
                    Some(m) => write!(
                        source,
                        "(?:{prefix}((?:{pattern})(?:{prefix}(?:{pattern}))*)){}",
                        if *m == '*' { "?" } else { "" }
                    ),
                };
            }
        }
    }
    source.push_str("(?:/)?$");
    Ok(source)
}

fn lex(template: &str) -> Result<Vec<(usize, Lexeme)>, PathPatternError> {
    let chars: Vec<char> = template.chars().collect();
    let mut lexemes = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => match chars.get(i + 1) {
                Some(&c) => {
                    lexemes.push((i, Lexeme::Escaped(c)));
                    i += 2;
                }
                None => {
                    lexemes.push((i, Lexeme::Char('\\')));
                    i += 1;
                }
            },
            ':' => {
                let name: String = chars[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                    .collect();
                if name.is_empty() {
                    return Err(PathPatternError::MissingParameterName { index: i });
                }
                let len = name.len();
                lexemes.push((i, Lexeme::Name(name)));
                i += 1 + len;
            }
            '(' => {
                let (pattern, end) = lex_pattern(&chars, i)?;
                lexemes.push((i, Lexeme::Pattern(pattern)));
                i = end;
            }
            c @ ('?' | '*' | '+') => {
                lexemes.push((i, Lexeme::Modifier(c)));
                i += 1;
            }
            c => {
                lexemes.push((i, Lexeme::Char(c)));
                i += 1;
            }
        }
    }

    Ok(lexemes)
}

/// Read a parenthesised pattern starting at `start`, returning it and the index after `)`
fn lex_pattern(chars: &[char], start: usize) -> Result<(String, usize), PathPatternError> {
    if chars.get(start + 1) == Some(&'?') {
        return Err(PathPatternError::PatternStartsWithQuestion { index: start + 1 });
    }

    let mut depth = 1;
    let mut pattern = String::new();
    let mut j = start + 1;

    while j < chars.len() {
        let c = chars[j];
        match c {
            '\\' => {
                pattern.push(c);
                if let Some(&next) = chars.get(j + 1) {
                    pattern.push(next);
                }
                j += 2;
                continue;
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    j += 1;
                    break;
                }
            }
            '(' => {
                depth += 1;
                if chars.get(j + 1) != Some(&'?') {
                    return Err(PathPatternError::CapturingGroup { index: j });
                }
            }
            _ => {}
        }
        pattern.push(c);
        j += 1;
    }

    if depth > 0 {
        return Err(PathPatternError::UnbalancedPattern { index: start });
    }
    if pattern.is_empty() {
        return Err(PathPatternError::MissingPattern { index: start });
    }

    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
        PathPatternError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        }
    })?;

    Ok((pattern, j))
}

fn parse(lexemes: Vec<(usize, Lexeme)>) -> Result<Vec<Token>, PathPatternError> {
    let mut tokens = Vec::new();
    let mut path = String::new();
    let mut prefix_candidate = false;
    let mut lexemes = lexemes.into_iter().peekable();

    while let Some((index, lexeme)) = lexemes.next() {
        let pattern = match lexeme {
            Lexeme::Char(c) => {
                path.push(c);
                prefix_candidate = PREFIXES.contains(&c);
                continue;
            }
            Lexeme::Escaped(c) => {
                path.push(c);
                prefix_candidate = false;
                continue;
            }
            Lexeme::Modifier(modifier) => {
                return Err(PathPatternError::UnexpectedModifier { index, modifier });
            }
            Lexeme::Name(_) => match lexemes.peek() {
                Some((_, Lexeme::Pattern(_))) => match lexemes.next() {
                    Some((_, Lexeme::Pattern(pattern))) => pattern,
                    _ => DEFAULT_PATTERN.to_string(),
                },
                _ => DEFAULT_PATTERN.to_string(),
            },
            Lexeme::Pattern(pattern) => pattern,
        };

        let prefix = match path.pop() {
            Some(c) if prefix_candidate => c.to_string(),
            Some(c) => {
                path.push(c);
                String::new()
            }
            None => String::new(),
        };
        prefix_candidate = false;

        if !path.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut path)));
        }

        let modifier = match lexemes.peek() {
            Some((_, Lexeme::Modifier(m))) => {
                let m = *m;
                lexemes.next();
                Some(m)
            }
            _ => None,
        };

        tokens.push(Token::Param {
            prefix,
            pattern,
            modifier,
        });
    }

    if !path.is_empty() {
        tokens.push(Token::Literal(path));
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_path() {
        assert_eq!(to_regex_source("/about").unwrap(), "^/about(?:/)?$");

        let re = compile("/about").unwrap();
        assert!(re.is_match("/about"));
        assert!(re.is_match("/about/"));
        assert!(re.is_match("/ABOUT"));
        assert!(!re.is_match("/about/us"));
        assert!(!re.is_match("/aboutus"));
    }

    #[test]
    fn test_zero_or_more_parameter() {
        assert_eq!(
            to_regex_source("/about/:any*").unwrap(),
            "^/about(?:/((?:[^/]+?)(?:/(?:[^/]+?))*))?(?:/)?$"
        );

        let re = compile("/about/:any*").unwrap();
        assert!(re.is_match("/about"));
        assert!(re.is_match("/about/team"));
        assert!(re.is_match("/about/team/berlin"));
        assert!(!re.is_match("/abouts"));
    }

    #[test]
    fn test_single_parameter() {
        let re = compile("/blog/:slug").unwrap();
        assert!(re.is_match("/blog/hello-world"));
        assert!(!re.is_match("/blog"));
        assert!(!re.is_match("/blog/a/b"));

        let caps = re.captures("/blog/hello-world").unwrap();
        assert_eq!(&caps[1], "hello-world");
    }

    #[test]
    fn test_optional_and_repeated_parameters() {
        let optional = compile("/docs/:page?").unwrap();
        assert!(optional.is_match("/docs"));
        assert!(optional.is_match("/docs/intro"));
        assert!(!optional.is_match("/docs/intro/more"));

        let repeated = compile("/files/:path+").unwrap();
        assert!(repeated.is_match("/files/a/b/c"));
        assert!(!repeated.is_match("/files"));
    }

    #[test]
    fn test_custom_and_unnamed_patterns() {
        let custom = compile("/user/:id(\\d+)").unwrap();
        assert!(custom.is_match("/user/42"));
        assert!(!custom.is_match("/user/abc"));

        let unnamed = compile("/api/(.*)").unwrap();
        assert!(unnamed.is_match("/api/v1/items"));
        assert!(!unnamed.is_match("/other"));
    }

    #[test]
    fn test_escaped_characters() {
        let re = compile("/a\\:b").unwrap();
        assert!(re.is_match("/a:b"));
    }

    #[test]
    fn test_trailing_slash_in_template() {
        let re = compile("/stuff/").unwrap();
        assert!(re.is_match("/stuff"));
        assert!(re.is_match("/stuff/"));
        assert_eq!(to_regex_source("/").unwrap(), "^/(?:/)?$");
    }

    #[test]
    fn test_invalid_templates() {
        assert!(matches!(
            to_regex_source(".*"),
            Err(PathPatternError::UnexpectedModifier { index: 1, modifier: '*' })
        ));
        assert!(matches!(
            to_regex_source("/:"),
            Err(PathPatternError::MissingParameterName { index: 1 })
        ));
        assert!(matches!(
            to_regex_source("/(foo"),
            Err(PathPatternError::UnbalancedPattern { index: 1 })
        ));
        assert!(matches!(
            to_regex_source("/a/(b(c))"),
            Err(PathPatternError::CapturingGroup { .. })
        ));
        assert!(matches!(
            to_regex_source("/a/()"),
            Err(PathPatternError::MissingPattern { .. })
        ));
        assert!(matches!(
            to_regex_source("/a/(?:x)"),
            Err(PathPatternError::PatternStartsWithQuestion { .. })
        ));
    }
}
