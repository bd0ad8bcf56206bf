//! A narrow, side-effect-free expression language over the data tree:
//! dotted paths, literals, arithmetic, comparison, boolean logic, a ternary,
//! and a fixed set of string/array built-ins. Evaluation is bounded by a
//! wall-clock deadline. Error strings name operators and template paths,
//! never resolved data values.

use serde_json::Value;
use std::time::Instant;

/// Resolves a dotted template path to a value. Missing paths are `Null`.
pub trait PathResolver {
    fn resolve(&self, path: &str) -> Value;
}

pub fn evaluate(
    source: &str,
    scope: &dyn PathResolver,
    deadline: Instant,
) -> Result<Value, String> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, at: 0 };
    let expr = parser.ternary()?;
    if parser.at != parser.tokens.len() {
        return Err("unexpected trailing input".to_string());
    }
    eval(&expr, scope, deadline)
}

/// Renders a value the way substitution does: scalars as text, null as the
/// empty string, trees as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Path(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    LParen,
    RParen,
    Comma,
}

fn lex(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut at = 0;

    while at < chars.len() {
        let c = chars[at];
        match c {
            ' ' | '\t' | '\n' | '\r' => at += 1,
            '+' | '-' | '*' | '/' | '%' | '?' | ':' | '(' | ')' | ',' => {
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '?' => Token::Question,
                    ':' => Token::Colon,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                });
                at += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two = chars.get(at + 1) == Some(&'=');
                tokens.push(match (c, two) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    ('=', true) => Token::EqEq,
                    ('=', false) => return Err("single '=' is not an operator".to_string()),
                    ('!', true) => Token::NotEq,
                    ('!', false) => Token::Bang,
                    _ => unreachable!(),
                });
                at += if two { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(at + 1) != Some(&c) {
                    return Err(format!("single {c:?} is not an operator"));
                }
                tokens.push(if c == '&' { Token::AndAnd } else { Token::OrOr });
                at += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                at += 1;
                loop {
                    match chars.get(at) {
                        None => return Err("unterminated string literal".to_string()),
                        Some(&q) if q == quote => {
                            at += 1;
                            break;
                        }
                        Some(&'\\') => {
                            match chars.get(at + 1) {
                                Some(&next) => text.push(next),
                                None => return Err("unterminated string literal".to_string()),
                            }
                            at += 2;
                        }
                        Some(&other) => {
                            text.push(other);
                            at += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let start = at;
                while at < chars.len() && (chars[at].is_ascii_digit() || chars[at] == '.') {
                    at += 1;
                }
                let text: String = chars[start..at].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal {text:?}"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '@' => {
                let start = at;
                while at < chars.len()
                    && (chars[at].is_ascii_alphanumeric()
                        || chars[at] == '_'
                        || chars[at] == '@'
                        || chars[at] == '.')
                {
                    at += 1;
                }
                let word: String = chars[start..at].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Path(word),
                });
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Expr {
    Lit(Value),
    Path(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(Token, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn eat(&mut self, expected: &Token) -> Result<(), String> {
        if self.peek() == Some(expected) {
            self.at += 1;
            Ok(())
        } else {
            Err(format!("expected {expected:?}"))
        }
    }

    fn ternary(&mut self) -> Result<Expr, String> {
        let cond = self.or()?;
        if self.peek() == Some(&Token::Question) {
            self.at += 1;
            let then = self.ternary()?;
            self.eat(&Token::Colon)?;
            let otherwise = self.ternary()?;
            Ok(Expr::Ternary(cond.into(), then.into(), otherwise.into()))
        } else {
            Ok(cond)
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.at += 1;
            left = Expr::Binary(Token::OrOr, left.into(), self.and()?.into());
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.at += 1;
            left = Expr::Binary(Token::AndAnd, left.into(), self.equality()?.into());
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut left = self.relational()?;
        while matches!(self.peek(), Some(Token::EqEq | Token::NotEq)) {
            let op = self.tokens[self.at].clone();
            self.at += 1;
            left = Expr::Binary(op, left.into(), self.relational()?.into());
        }
        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr, String> {
        let mut left = self.additive()?;
        while matches!(
            self.peek(),
            Some(Token::Lt | Token::Le | Token::Gt | Token::Ge)
        ) {
            let op = self.tokens[self.at].clone();
            self.at += 1;
            left = Expr::Binary(op, left.into(), self.additive()?.into());
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        while matches!(self.peek(), Some(Token::Plus | Token::Minus)) {
            let op = self.tokens[self.at].clone();
            self.at += 1;
            left = Expr::Binary(op, left.into(), self.multiplicative()?.into());
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while matches!(self.peek(), Some(Token::Star | Token::Slash | Token::Percent)) {
            let op = self.tokens[self.at].clone();
            self.at += 1;
            left = Expr::Binary(op, left.into(), self.unary()?.into());
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Bang) => {
                self.at += 1;
                Ok(Expr::Not(self.unary()?.into()))
            }
            Some(Token::Minus) => {
                self.at += 1;
                Ok(Expr::Neg(self.unary()?.into()))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.at += 1;
        match token {
            Token::Num(n) => Ok(Expr::Lit(json_number(n))),
            Token::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Token::True => Ok(Expr::Lit(Value::Bool(true))),
            Token::False => Ok(Expr::Lit(Value::Bool(false))),
            Token::Null => Ok(Expr::Lit(Value::Null)),
            Token::LParen => {
                let inner = self.ternary()?;
                self.eat(&Token::RParen)?;
                Ok(inner)
            }
            Token::Path(word) => {
                if self.peek() == Some(&Token::LParen) {
                    self.at += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.at += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.eat(&Token::RParen)?;
                    Ok(Expr::Call(word, args))
                } else {
                    Ok(Expr::Path(word))
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn number(value: &Value, context: &str) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("{context} requires a number"))
}

fn eval(expr: &Expr, scope: &dyn PathResolver, deadline: Instant) -> Result<Value, String> {
    if Instant::now() >= deadline {
        return Err("evaluation timed out".to_string());
    }
    match expr {
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(scope.resolve(path)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope, deadline)?))),
        Expr::Neg(inner) => {
            let n = number(&eval(inner, scope, deadline)?, "unary '-'")?;
            Ok(json_number(-n))
        }
        Expr::Ternary(cond, then, otherwise) => {
            if truthy(&eval(cond, scope, deadline)?) {
                eval(then, scope, deadline)
            } else {
                eval(otherwise, scope, deadline)
            }
        }
        Expr::Binary(op, left, right) => {
            // Short-circuit the boolean operators.
            match op {
                Token::AndAnd => {
                    let l = truthy(&eval(left, scope, deadline)?);
                    return Ok(Value::Bool(l && truthy(&eval(right, scope, deadline)?)));
                }
                Token::OrOr => {
                    let l = truthy(&eval(left, scope, deadline)?);
                    return Ok(Value::Bool(l || truthy(&eval(right, scope, deadline)?)));
                }
                _ => (),
            }
            let l = eval(left, scope, deadline)?;
            let r = eval(right, scope, deadline)?;
            match op {
                Token::Plus => match (&l, &r) {
                    (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                        "{}{}",
                        value_to_text(&l),
                        value_to_text(&r)
                    ))),
                    _ => Ok(json_number(number(&l, "'+'")? + number(&r, "'+'")?)),
                },
                Token::Minus => Ok(json_number(number(&l, "'-'")? - number(&r, "'-'")?)),
                Token::Star => Ok(json_number(number(&l, "'*'")? * number(&r, "'*'")?)),
                Token::Slash => {
                    let divisor = number(&r, "'/'")?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    Ok(json_number(number(&l, "'/'")? / divisor))
                }
                Token::Percent => {
                    let divisor = number(&r, "'%'")?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    Ok(json_number(number(&l, "'%'")? % divisor))
                }
                Token::EqEq => Ok(Value::Bool(l == r)),
                Token::NotEq => Ok(Value::Bool(l != r)),
                Token::Lt | Token::Le | Token::Gt | Token::Ge => {
                    let ordering = match (&l, &r) {
                        (Value::String(a), Value::String(b)) => a.cmp(b),
                        _ => number(&l, "comparison")?
                            .partial_cmp(&number(&r, "comparison")?)
                            .ok_or_else(|| "values are not comparable".to_string())?,
                    };
                    Ok(Value::Bool(match op {
                        Token::Lt => ordering.is_lt(),
                        Token::Le => ordering.is_le(),
                        Token::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    }))
                }
                _ => unreachable!("operator tokens are exhaustive"),
            }
        }
        Expr::Call(name, args) => {
            let args: Vec<Value> = args
                .iter()
                .map(|a| eval(a, scope, deadline))
                .collect::<Result<_, _>>()?;
            call(name, &args)
        }
    }
}

fn json_number(n: f64) -> Value {
    // Integral results render without a trailing ".0".
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(format!("{name}() takes {expected} argument(s)"))
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "upper" => {
            arity(name, args, 1)?;
            Ok(Value::String(value_to_text(&args[0]).to_uppercase()))
        }
        "lower" => {
            arity(name, args, 1)?;
            Ok(Value::String(value_to_text(&args[0]).to_lowercase()))
        }
        "trim" => {
            arity(name, args, 1)?;
            Ok(Value::String(value_to_text(&args[0]).trim().to_string()))
        }
        "len" | "count" => {
            arity(name, args, 1)?;
            let n = match &args[0] {
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => value_to_text(other).chars().count(),
            };
            Ok(Value::Number(n.into()))
        }
        "concat" => Ok(Value::String(
            args.iter().map(value_to_text).collect::<String>(),
        )),
        "substr" => {
            arity(name, args, 3)?;
            let text = value_to_text(&args[0]);
            let start = number(&args[1], "substr start")? as usize;
            let take = number(&args[2], "substr length")? as usize;
            Ok(Value::String(
                text.chars().skip(start).take(take).collect(),
            ))
        }
        "round" => {
            arity(name, args, 1)?;
            Ok(json_number(number(&args[0], name)?.round()))
        }
        "floor" => {
            arity(name, args, 1)?;
            Ok(json_number(number(&args[0], name)?.floor()))
        }
        "ceil" => {
            arity(name, args, 1)?;
            Ok(json_number(number(&args[0], name)?.ceil()))
        }
        "abs" => {
            arity(name, args, 1)?;
            Ok(json_number(number(&args[0], name)?.abs()))
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(format!("{name}() takes at least one argument"));
            }
            let mut best = number(&args[0], name)?;
            for arg in &args[1..] {
                let n = number(arg, name)?;
                best = if name == "min" { best.min(n) } else { best.max(n) };
            }
            Ok(json_number(best))
        }
        "sum" => {
            arity(name, args, 1)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| "sum() requires an array".to_string())?;
            let mut total = 0.0;
            for item in items {
                total += number(item, name)?;
            }
            Ok(json_number(total))
        }
        "join" => {
            arity(name, args, 2)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| "join() requires an array".to_string())?;
            let separator = value_to_text(&args[1]);
            Ok(Value::String(
                items
                    .iter()
                    .map(value_to_text)
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        }
        "first" | "last" => {
            arity(name, args, 1)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| format!("{name}() requires an array"))?;
            let picked = if name == "first" {
                items.first()
            } else {
                items.last()
            };
            Ok(picked.cloned().unwrap_or(Value::Null))
        }
        "contains" => {
            arity(name, args, 2)?;
            match &args[0] {
                Value::Array(items) => Ok(Value::Bool(items.contains(&args[1]))),
                other => Ok(Value::Bool(
                    value_to_text(other).contains(&value_to_text(&args[1])),
                )),
            }
        }
        _ => Err(format!("unknown function {name}()")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Data(Value);

    impl PathResolver for Data {
        fn resolve(&self, path: &str) -> Value {
            path.split('.')
                .try_fold(&self.0, |node, key| node.get(key))
                .cloned()
                .unwrap_or(Value::Null)
        }
    }

    fn run(source: &str, data: Value) -> Result<Value, String> {
        let deadline = Instant::now() + Duration::from_millis(250);
        evaluate(source, &Data(data), deadline)
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(run("1 + 2 * 3", json!({})).unwrap(), json!(7));
        assert_eq!(run("(1 + 2) * 3", json!({})).unwrap(), json!(9));
        assert_eq!(run("10 % 4", json!({})).unwrap(), json!(2));
        assert_eq!(run("-Price", json!({"Price": 5})).unwrap(), json!(-5));
    }

    #[test]
    fn test_paths_and_comparison() {
        let data = json!({"Account": {"AnnualRevenue": 5000000}});
        assert_eq!(
            run("Account.AnnualRevenue >= 1000000", data.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(run("Account.Missing == null", data).unwrap(), json!(true));
    }

    #[test]
    fn test_ternary_and_logic() {
        let data = json!({"Tier": "gold", "Spend": 100});
        assert_eq!(
            run("Tier == 'gold' && Spend > 50 ? 'vip' : 'standard'", data).unwrap(),
            json!("vip")
        );
        assert_eq!(run("false || !false", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_string_and_array_builtins() {
        assert_eq!(run("upper('abc')", json!({})).unwrap(), json!("ABC"));
        assert_eq!(
            run("concat('a', '-', 1 + 1)", json!({})).unwrap(),
            json!("a-2")
        );
        assert_eq!(run("substr('hello', 1, 3)", json!({})).unwrap(), json!("ell"));
        assert_eq!(
            run("sum(Prices)", json!({"Prices": [1, 2, 3.5]})).unwrap(),
            json!(6.5)
        );
        assert_eq!(
            run("join(Names, ', ')", json!({"Names": ["a", "b"]})).unwrap(),
            json!("a, b")
        );
        assert_eq!(
            run("contains(Names, 'b')", json!({"Names": ["a", "b"]})).unwrap(),
            json!(true)
        );
        assert_eq!(run("len(Names)", json!({"Names": ["a"]})).unwrap(), json!(1));
    }

    #[test]
    fn test_errors_name_constructs_only() {
        let err = run("Secret / 'x'", json!({"Secret": "hunter2"})).unwrap_err();
        assert!(!err.contains("hunter2"), "{err}");

        assert!(run("1 / 0", json!({})).is_err());
        assert!(run("nope()", json!({})).is_err());
        assert!(run("1 +", json!({})).is_err());
        assert!(run("'unterminated", json!({})).is_err());
    }

    #[test]
    fn test_deadline_is_enforced() {
        let err = evaluate("1 + 1", &Data(json!({})), Instant::now() - Duration::from_millis(1))
            .unwrap_err();
        assert!(err.contains("timed out"), "{err}");
    }
}
