use crate::{Argument, BinaryOp, CalcError, Expression, UnaryOp};

/// Turns formula source text into an [`Expression`] tree.
///
/// The [`Calculator`](crate::Calculator) calls this for every
/// [`Argument::Source`] it evaluates.
pub trait ExpressionParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Expression, CalcError>;
}

/// Recursive-descent parser for the formula grammar accepted by
/// [`parse_expression`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FormulaParser;

impl ExpressionParser for FormulaParser {
    fn parse(&self, source: &str) -> Result<Expression, CalcError> {
        parse_expression(source)
    }
}

/// Parse a formula. Every node in the returned tree gets a fresh id.
///
/// Grammar (lowest to highest precedence):
///   ternary → add ( "?" ternary ":" ternary )?
///   add     → mul ( ("+" | "-") mul )*
///   mul     → unary ( ("*" | "/") unary )*
///   unary   → ("+" | "-") unary | power
///   power   → atom ( "^" unary )?
///   atom    → NUMBER | STRING | IDENT | IDENT "(" args? ")" | "(" ternary ")"
pub fn parse_expression(input: &str) -> Result<Expression, CalcError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let (result, _) = parse_ternary(&tokens, &mut pos, 0)?;
    if pos < tokens.len() {
        return Err(CalcError::Parse(format!(
            "unexpected token at position {pos}: {:?}",
            tokens[pos]
        )));
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Question,
    Colon,
    Comma,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '^' => Some(Token::Caret),
            '?' => Some(Token::Question),
            ':' => Some(Token::Colon),
            ',' => Some(Token::Comma),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(token);
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(CalcError::Parse("unterminated string literal".into()));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1; // closing quote
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Optional exponent: 1e5, 2.5E-3
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let num_str: String = chars[start..i].iter().collect();
                let value = num_str
                    .parse::<f64>()
                    .map_err(|_| CalcError::Parse(format!("invalid number: {num_str}")))?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                return Err(CalcError::Parse(format!("unexpected character: '{c}'")));
            }
        }
    }
    Ok(tokens)
}

/// Deepest expression the parser builds or recurses through. Counts tree
/// levels (including every link of a `+`/`*` chain) as well as parentheses.
pub const MAX_NESTING: usize = 256;

/// A parsed subtree and its height in nodes.
type Parsed = (Expression, usize);

fn too_deep() -> CalcError {
    CalcError::Parse(format!("expression nests deeper than {MAX_NESTING} levels"))
}

/// One level further down the recursive descent.
fn descend(depth: usize) -> Result<usize, CalcError> {
    let next = depth + 1;
    if next > MAX_NESTING {
        return Err(too_deep());
    }
    Ok(next)
}

fn measured(expr: Expression, height: usize) -> Result<Parsed, CalcError> {
    if height > MAX_NESTING {
        return Err(too_deep());
    }
    Ok((expr, height))
}

fn peek(tokens: &[Token], pos: usize) -> Option<&Token> {
    tokens.get(pos)
}

fn expect(tokens: &[Token], pos: &mut usize, wanted: &Token, what: &str) -> Result<(), CalcError> {
    if peek(tokens, *pos) != Some(wanted) {
        return Err(CalcError::Parse(format!("expected {what}")));
    }
    *pos += 1;
    Ok(())
}

fn parse_ternary(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Parsed, CalcError> {
    let (condition, condition_height) = parse_add(tokens, pos, depth)?;
    if peek(tokens, *pos) != Some(&Token::Question) {
        return Ok((condition, condition_height));
    }
    *pos += 1;
    let inner = descend(depth)?;
    let (when_true, true_height) = parse_ternary(tokens, pos, inner)?;
    expect(tokens, pos, &Token::Colon, "':' in conditional expression")?;
    let (when_false, false_height) = parse_ternary(tokens, pos, inner)?;
    let height = 1 + condition_height.max(true_height).max(false_height);
    measured(Expression::ternary(condition, when_true, when_false), height)
}

fn parse_add(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Parsed, CalcError> {
    let (mut left, mut height) = parse_mul(tokens, pos, depth)?;
    loop {
        let op = match peek(tokens, *pos) {
            Some(Token::Plus) => BinaryOp::Add,
            Some(Token::Minus) => BinaryOp::Sub,
            _ => break,
        };
        *pos += 1;
        let (right, right_height) = parse_mul(tokens, pos, depth)?;
        (left, height) = measured(
            Expression::basic(op, left, right),
            1 + height.max(right_height),
        )?;
    }
    Ok((left, height))
}

fn parse_mul(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Parsed, CalcError> {
    let (mut left, mut height) = parse_unary(tokens, pos, depth)?;
    loop {
        let op = match peek(tokens, *pos) {
            Some(Token::Star) => BinaryOp::Mul,
            Some(Token::Slash) => BinaryOp::Div,
            _ => break,
        };
        *pos += 1;
        let (right, right_height) = parse_unary(tokens, pos, depth)?;
        (left, height) = measured(
            Expression::basic(op, left, right),
            1 + height.max(right_height),
        )?;
    }
    Ok((left, height))
}

fn parse_unary(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Parsed, CalcError> {
    let op = match peek(tokens, *pos) {
        Some(Token::Plus) => UnaryOp::Plus,
        Some(Token::Minus) => UnaryOp::Minus,
        _ => return parse_power(tokens, pos, depth),
    };
    *pos += 1;
    let (operand, height) = parse_unary(tokens, pos, descend(depth)?)?;
    measured(Expression::unary(op, operand), height + 1)
}

fn parse_power(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Parsed, CalcError> {
    let (base, base_height) = parse_atom(tokens, pos, depth)?;
    if peek(tokens, *pos) != Some(&Token::Caret) {
        return Ok((base, base_height));
    }
    *pos += 1;
    // Right associative: the exponent may itself be a power.
    let (exponent, exponent_height) = parse_unary(tokens, pos, descend(depth)?)?;
    measured(
        Expression::basic(BinaryOp::Pow, base, exponent),
        1 + base_height.max(exponent_height),
    )
}

fn parse_atom(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Parsed, CalcError> {
    let Some(token) = peek(tokens, *pos) else {
        return Err(CalcError::Parse("unexpected end of expression".into()));
    };
    match token {
        Token::Number(value) => {
            let value = *value;
            *pos += 1;
            Ok((Expression::number(value), 1))
        }
        Token::Str(text) => {
            let text = text.clone();
            *pos += 1;
            Ok((Expression::text(text), 1))
        }
        Token::Ident(name) => {
            let name = name.clone();
            *pos += 1;
            if peek(tokens, *pos) == Some(&Token::LParen) {
                *pos += 1;
                let (arguments, height) = parse_arguments(tokens, pos, descend(depth)?)?;
                return measured(Expression::function(name, arguments), height + 1);
            }
            Ok((Expression::variable(name), 1))
        }
        Token::LParen => {
            *pos += 1;
            let inner = parse_ternary(tokens, pos, descend(depth)?)?;
            expect(tokens, pos, &Token::RParen, "closing ')'")?;
            Ok(inner)
        }
        other => Err(CalcError::Parse(format!("unexpected token: {other:?}"))),
    }
}

/// Comma-separated call arguments; the opening '(' is already consumed.
/// Returns the arguments with the height of the tallest one.
fn parse_arguments(
    tokens: &[Token],
    pos: &mut usize,
    depth: usize,
) -> Result<(Vec<Argument>, usize), CalcError> {
    let mut arguments = Vec::new();
    let mut tallest = 0;
    if peek(tokens, *pos) == Some(&Token::RParen) {
        *pos += 1;
        return Ok((arguments, tallest));
    }
    loop {
        let (argument, height) = parse_ternary(tokens, pos, depth)?;
        tallest = tallest.max(height);
        arguments.push(Argument::Parsed(argument));
        match peek(tokens, *pos) {
            Some(Token::Comma) => *pos += 1,
            Some(Token::RParen) => {
                *pos += 1;
                return Ok((arguments, tallest));
            }
            _ => return Err(CalcError::Parse("expected ',' or ')' in argument list".into())),
        }
    }
}
