//! Recursive-descent parser for call expressions.

use super::Expr;
use crate::error::{SyncError, SyncResult};
use crate::value::Value;

/// Parses a complete `IFNULL(..)` or `IF(..)` expression for `field`.
pub(super) fn parse_call(field: &str, text: &str) -> SyncResult<Expr> {
    let mut parser = Parser::new(field, text);
    let expr = parser.call()?;
    parser.finish()?;
    Ok(expr)
}

struct Parser<'a> {
    field: &'a str,
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(field: &'a str, src: &'a str) -> Self {
        Self { field, src, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> SyncError {
        SyncError::invalid_expression(self.field, reason)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn finish(&mut self) -> SyncResult<()> {
        self.skip_whitespace();
        if self.pos == self.src.len() {
            Ok(())
        } else {
            Err(self.error(format!("unexpected trailing input '{}'", self.rest())))
        }
    }

    fn ident(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn call(&mut self) -> SyncResult<Expr> {
        self.skip_whitespace();
        let name = self.ident();
        self.skip_whitespace();
        if !self.rest().starts_with('(') {
            return Err(self.error(format!("expected '(' after '{name}'")));
        }
        self.pos += 1;
        let args = self.arguments()?;

        match name.to_ascii_uppercase().as_str() {
            "NOW" if args == [""] => Ok(Expr::Now),
            "NULL" if args == [""] => Ok(Expr::Null),
            "IFNULL" => {
                let [value, fallback] = self.arity::<2>("IFNULL", &args)?;
                Ok(Expr::IfNull {
                    value: Box::new(self.argument(value)?),
                    fallback: Box::new(self.argument(fallback)?),
                })
            }
            "IF" => {
                let [condition, then, otherwise] = self.arity::<3>("IF", &args)?;
                if condition.is_empty() {
                    return Err(self.error("IF requires a condition"));
                }
                Ok(Expr::If {
                    condition: condition.to_string(),
                    then: Box::new(self.argument(then)?),
                    otherwise: Box::new(self.argument(otherwise)?),
                })
            }
            other => Err(self.error(format!("unknown function '{other}'"))),
        }
    }

    fn arity<const N: usize>(&self, name: &str, args: &[&'a str]) -> SyncResult<[&'a str; N]> {
        <[&'a str; N]>::try_from(args).map_err(|_| {
            self.error(format!(
                "{name} expects {N} arguments, got {}",
                args.len()
            ))
        })
    }

    /// Splits arguments at top-level commas up to the matching `)`.
    fn arguments(&mut self) -> SyncResult<Vec<&'a str>> {
        let src = self.src;
        let mut args = Vec::new();
        let mut start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut chars = src[self.pos..].char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            let at = self.pos + offset;
            if let Some(q) = quote {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    if chars.peek().map(|&(_, n)| n) == Some(q) {
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' if depth > 0 => depth -= 1,
                ')' => {
                    args.push(src[start..at].trim());
                    self.pos = at + 1;
                    return Ok(args);
                }
                ',' if depth == 0 => {
                    args.push(src[start..at].trim());
                    start = at + 1;
                }
                _ => {}
            }
        }

        Err(self.error(if quote.is_some() {
            "unterminated string literal"
        } else {
            "missing closing parenthesis"
        }))
    }

    fn argument(&self, arg: &'a str) -> SyncResult<Expr> {
        if arg.is_empty() {
            return Ok(Expr::Staged(self.field.to_string()));
        }
        if let Some(name) = arg.strip_prefix('$') {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(self.error(format!("invalid field reference '{arg}'")));
            }
            return Ok(Expr::Staged(name.to_string()));
        }
        if arg.starts_with('\'') || arg.starts_with('"') {
            return unquote(arg)
                .map(|text| Expr::Literal(Value::Text(text)))
                .ok_or_else(|| self.error(format!("malformed string literal {arg}")));
        }
        if arg.eq_ignore_ascii_case("NULL") {
            return Ok(Expr::Null);
        }
        if let Some(number) = parse_number(arg) {
            return Ok(Expr::Literal(number));
        }
        if is_call(arg) {
            let mut nested = Parser::new(self.field, arg);
            let expr = nested.call()?;
            nested.finish()?;
            return Ok(expr);
        }
        Ok(Expr::Raw(arg.to_string()))
    }
}

fn is_call(arg: &str) -> bool {
    let upper = arg.to_ascii_uppercase();
    ["NOW(", "NULL(", "IFNULL(", "IF("]
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

fn parse_number(arg: &str) -> Option<Value> {
    let digits = arg.strip_prefix('-').unwrap_or(arg);
    if !digits.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    if let Ok(i) = arg.parse::<i64>() {
        return Some(Value::Integer(i));
    }
    arg.parse::<f64>().ok().map(Value::Real)
}

/// Strips the quotes of a literal spanning the whole argument.
fn unquote(arg: &str) -> Option<String> {
    let mut chars = arg.chars();
    let q = chars.next()?;
    let mut out = String::new();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else if c == q {
            let mut lookahead = chars.clone();
            match lookahead.next() {
                Some(n) if n == q => {
                    out.push(q);
                    chars = lookahead;
                }
                None => return Some(out),
                Some(_) => return None,
            }
        } else {
            out.push(c);
        }
    }
    None
}
