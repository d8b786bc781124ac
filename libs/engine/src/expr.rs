//! The literal-substitution expression grammar used by expression placeholders (§4.1).
//!
//! Deliberately not a general CEL evaluator (Non-goal, §1): string concatenation and
//! arithmetic over literals, with `*`/`/` binding tighter than `+`/`-`, and parenthesized
//! sub-expressions. Anything else (comparisons, ternaries, function calls) fails to parse
//! and the caller falls back to the literal expression text.

use serde_json::{Number, Value as Json};

#[derive(Debug, PartialEq)]
pub enum EvalError {
    UnexpectedToken(String),
    UnexpectedEnd,
    TrailingInput(String),
    DivisionByZero,
}

pub fn evaluate(src: &str) -> Result<Json, EvalError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::TrailingInput(format!("{:?}", parser.tokens[parser.pos..].to_vec())));
    }
    Ok(value)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(EvalError::UnexpectedEnd);
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| EvalError::UnexpectedToken(text))?;
                tokens.push(Token::Number(n));
            }
            other => return Err(EvalError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<Json, EvalError> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = add(left, right)?;
                }
                Some(Token::Minus) => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = Json::Number(
                        Number::from_f64(as_number(&left)? - as_number(&right)?)
                            .ok_or(EvalError::UnexpectedToken("-".into()))?,
                    );
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term := factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> Result<Json, EvalError> {
        let mut left = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.advance();
                    let right = self.parse_factor()?;
                    left = Json::Number(
                        Number::from_f64(as_number(&left)? * as_number(&right)?)
                            .ok_or(EvalError::UnexpectedToken("*".into()))?,
                    );
                }
                Some(Token::Slash) => {
                    self.advance();
                    let right = self.parse_factor()?;
                    let divisor = as_number(&right)?;
                    if divisor == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    left = Json::Number(
                        Number::from_f64(as_number(&left)? / divisor)
                            .ok_or(EvalError::UnexpectedToken("/".into()))?,
                    );
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // factor := NUMBER | STRING | '(' expr ')' | '-' factor
    fn parse_factor(&mut self) -> Result<Json, EvalError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Json::Number(
                Number::from_f64(n).ok_or(EvalError::UnexpectedToken(n.to_string()))?,
            )),
            Some(Token::Str(s)) => Ok(Json::String(s)),
            Some(Token::Minus) => {
                let inner = self.parse_factor()?;
                Ok(Json::Number(
                    Number::from_f64(-as_number(&inner)?)
                        .ok_or(EvalError::UnexpectedToken("-".into()))?,
                ))
            }
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    other => Err(EvalError::UnexpectedToken(format!("{other:?}"))),
                }
            }
            Some(other) => Err(EvalError::UnexpectedToken(format!("{other:?}"))),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

fn as_number(v: &Json) -> Result<f64, EvalError> {
    v.as_f64()
        .ok_or_else(|| EvalError::UnexpectedToken(format!("expected number, got {v:?}")))
}

/// `+` is string concatenation when either side is a string, arithmetic otherwise.
fn add(left: Json, right: Json) -> Result<Json, EvalError> {
    match (&left, &right) {
        (Json::String(_), _) | (_, Json::String(_)) => {
            Ok(Json::String(format!("{}{}", stringify(&left), stringify(&right))))
        }
        _ => Ok(Json::Number(
            Number::from_f64(as_number(&left)? + as_number(&right)?)
                .ok_or(EvalError::UnexpectedToken("+".into()))?,
        )),
    }
}

fn stringify(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn concatenates_strings() {
        assert_eq!(evaluate("'foo' + '-' + 'bar'").unwrap(), json!("foo-bar"));
    }

    #[test]
    fn adds_numbers() {
        assert_eq!(evaluate("1 + 2 * 3").unwrap(), json!(7.0));
    }

    #[test]
    fn respects_parens() {
        assert_eq!(evaluate("(1 + 2) * 3").unwrap(), json!(9.0));
    }

    #[test]
    fn mixes_string_and_number_via_stringify() {
        assert_eq!(evaluate("'replica-' + 3").unwrap(), json!("replica-3"));
    }

    #[test]
    fn rejects_unsupported_grammar() {
        assert!(evaluate("1 == 2").is_err());
        assert!(evaluate("'a' ? 1 : 2").is_err());
    }

    #[test]
    fn rejects_division_by_zero() {
        assert!(matches!(evaluate("1 / 0"), Err(EvalError::DivisionByZero)));
    }
}
