// src/expression/parser.rs

use super::{
    EvalError,
    ast::{BinOp, Clause, CmpOp, Comprehension, ComprehensionKind, Expr, LambdaDef, Param, Pattern, UnaryOp},
    lexer::{Spanned, Token, tokenize},
    value::Value,
};
use crate::constants::MAX_EXPRESSION_DEPTH;
use std::rc::Rc;

const RESERVED: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "else", "lambda", "for", "True", "False", "None",
];

const ADDITIVE: &[(&str, BinOp)] = &[("+", BinOp::Add), ("-", BinOp::Sub)];
const MULTIPLICATIVE: &[(&str, BinOp)] = &[
    ("*", BinOp::Mul),
    ("/", BinOp::Div),
    ("//", BinOp::FloorDiv),
    ("%", BinOp::Mod),
];
const SHIFT: &[(&str, BinOp)] = &[("<<", BinOp::LShift), (">>", BinOp::RShift)];

type ParseResult<T> = Result<T, EvalError>;

/// Parses a full expression. Forbidden constructs are reported before any
/// syntax error that may follow them.
pub fn parse(source: &str) -> ParseResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    if parser.at_eof() {
        return Err(parser.syntax("empty expression"));
    }
    let expr = parser.expression_list()?;
    if !parser.at_eof() {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    // --- Token helpers ---

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &Token {
        self.tokens
            .get(self.pos + n)
            .or_else(|| self.tokens.last())
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.offset).unwrap_or_default()
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let found = self.is_op(op);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            return Ok(());
        }
        match self.unexpected() {
            EvalError::Syntax { offset, .. } => Err(EvalError::Syntax {
                offset,
                message: format!("expected '{}' but found {}", op, describe(self.peek())),
            }),
            other => Err(other),
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        let found = self.is_kw(kw);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_kw(&mut self, kw: &str) -> ParseResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected '{}' but found {}", kw, describe(self.peek()))))
        }
    }

    fn syntax(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn unexpected(&self) -> EvalError {
        match self.peek() {
            Token::Op("=") => EvalError::Forbidden("assignment operator '='".into()),
            token => self.syntax(format!("unexpected {}", describe(token))),
        }
    }

    fn enter(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(self.syntax("expression is too deeply nested"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn identifier(&mut self) -> ParseResult<String> {
        match self.peek() {
            Token::Name(name) if !RESERVED.contains(&name.as_str()) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.syntax(format!("expected a name but found {}", describe(self.peek())))),
        }
    }

    // --- Grammar ---

    fn expression_list(&mut self) -> ParseResult<Expr> {
        let first = self.expression()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_eof() || self.is_op(")") {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.enter()?;
        let expr = if self.is_kw("lambda") {
            self.lambda()?
        } else {
            self.ternary()?
        };
        self.leave();
        Ok(expr)
    }

    fn lambda(&mut self) -> ParseResult<Expr> {
        self.expect_kw("lambda")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(":") {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.syntax("variadic lambda parameters are not supported"));
            }
            let name = self.identifier()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.syntax(format!("duplicate argument '{}' in lambda", name)));
            }
            let default = if self.eat_op("=") {
                Some(self.expression()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.syntax("non-default argument follows default argument"));
                }
                None
            };
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(":")?;
        let body = self.expression()?;
        Ok(Expr::Lambda(Rc::new(LambdaDef { params, body })))
    }

    fn ternary(&mut self) -> ParseResult<Expr> {
        let body = self.or_test()?;
        if !self.eat_kw("if") {
            return Ok(body);
        }
        let test = self.or_test()?;
        self.expect_kw("else")?;
        let orelse = self.expression()?;
        Ok(Expr::IfElse {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn or_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_test()?;
        while self.eat_kw("or") {
            let right = self.and_test()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.not_test()?;
        while self.eat_kw("and") {
            let right = self.not_test()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_test(&mut self) -> ParseResult<Expr> {
        if !self.eat_kw("not") {
            return self.comparison();
        }
        self.enter()?;
        let operand = self.not_test()?;
        self.leave();
        Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)))
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let first = self.bit_or()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Op("==") => CmpOp::Eq,
                Token::Op("!=") => CmpOp::NotEq,
                Token::Op("<") => CmpOp::Lt,
                Token::Op("<=") => CmpOp::LtE,
                Token::Op(">") => CmpOp::Gt,
                Token::Op(">=") => CmpOp::GtE,
                Token::Name(n) if n == "in" => CmpOp::In,
                Token::Name(n) if n == "not" && matches!(self.peek_at(1), Token::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Token::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Token::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.bit_or()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn binary_level(&mut self, ops: &[(&str, BinOp)], next: fn(&mut Self) -> ParseResult<Expr>) -> ParseResult<Expr> {
        let mut left = next(self)?;
        while let Some(op) = ops.iter().find(|(sym, _)| self.is_op(sym)).map(|(_, op)| *op) {
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn bit_or(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("|", BinOp::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("^", BinOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("&", BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> ParseResult<Expr> {
        self.binary_level(SHIFT, Self::arith)
    }

    fn arith(&mut self) -> ParseResult<Expr> {
        self.binary_level(ADDITIVE, Self::term)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        self.binary_level(MULTIPLICATIVE, Self::factor)
    }

    fn factor(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Token::Op("-") => UnaryOp::Neg,
            Token::Op("+") => UnaryOp::Pos,
            Token::Op("~") => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.factor()?;
        self.leave();
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.postfix()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        self.enter()?;
        let exponent = self.factor()?;
        self.leave();
        Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)))
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                expr = self.call(expr)?;
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else if self.eat_op(".") {
                let name = match self.advance() {
                    Token::Name(name) => name,
                    other => return Err(self.syntax(format!("expected an attribute name but found {}", describe(&other)))),
                };
                if name.starts_with('_') {
                    return Err(EvalError::Forbidden(format!("private attribute '{}'", name)));
                }
                expr = Expr::Attribute(Box::new(expr), name);
            } else {
                return Ok(expr);
            }
        }
    }

    fn call(&mut self, func: Expr) -> ParseResult<Expr> {
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        while !self.is_op(")") {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.syntax("argument unpacking is not supported"));
            }
            let is_keyword = matches!((self.peek(), self.peek_at(1)), (Token::Name(_), Token::Op("=")));
            if is_keyword {
                let name = self.identifier()?;
                self.pos += 1;
                if keywords.iter().any(|(k, _)| *k == name) {
                    return Err(self.syntax(format!("keyword argument repeated: {}", name)));
                }
                keywords.push((name, self.expression()?));
            } else {
                if !keywords.is_empty() {
                    return Err(self.syntax("positional argument follows keyword argument"));
                }
                let arg = self.expression()?;
                if self.is_kw("for") {
                    args.push(self.comprehension(ComprehensionKind::Generator, arg, None)?);
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            keywords,
        })
    }

    fn subscript(&mut self) -> ParseResult<Expr> {
        let start = if self.is_op(":") {
            None
        } else {
            Some(self.expression()?)
        };
        if !self.eat_op(":") {
            return start.ok_or_else(|| self.unexpected());
        }
        let stop = if self.is_op(":") || self.is_op("]") {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        let step = if self.eat_op(":") && !self.is_op("]") {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        Ok(Expr::Slice(start.map(Box::new), stop, step))
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        match self.peek().clone() {
            Token::Int(i) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Int(i)))
            }
            Token::Float(x) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Float(x)))
            }
            Token::Str(_) | Token::Bytes(_) => self.string_literal(),
            Token::Name(name) => match name.as_str() {
                "True" | "False" | "None" => {
                    self.pos += 1;
                    Ok(Expr::Literal(match name.as_str() {
                        "True" => Value::Bool(true),
                        "False" => Value::Bool(false),
                        _ => Value::None,
                    }))
                }
                _ => Ok(Expr::Name(self.identifier()?)),
            },
            Token::Op("(") => {
                self.pos += 1;
                self.parenthesized()
            }
            Token::Op("[") => {
                self.pos += 1;
                self.list_display()
            }
            Token::Op("{") => {
                self.pos += 1;
                self.dict_display()
            }
            _ => Err(self.unexpected()),
        }
    }

    // Adjacent literals are concatenated, as in `'a' 'b'`.
    fn string_literal(&mut self) -> ParseResult<Expr> {
        let mut text: Option<String> = None;
        let mut bytes: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                Token::Str(s) if bytes.is_none() => text.get_or_insert_with(String::new).push_str(s),
                Token::Bytes(b) if text.is_none() => bytes.get_or_insert_with(Vec::new).extend_from_slice(b),
                Token::Str(_) | Token::Bytes(_) => return Err(self.syntax("cannot mix bytes and nonbytes literals")),
                _ => break,
            }
            self.pos += 1;
        }
        Ok(Expr::Literal(match (text, bytes) {
            (_, Some(b)) => Value::Bytes(b),
            (Some(s), None) => Value::Str(s),
            (None, None) => Value::Str(String::new()),
        }))
    }

    fn parenthesized(&mut self) -> ParseResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        self.enter()?;
        let first = self.expression()?;
        let expr = if self.is_kw("for") {
            self.comprehension(ComprehensionKind::Generator, first, None)?
        } else if self.is_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.is_op(")") {
                    break;
                }
                items.push(self.expression()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        self.expect_op(")")?;
        self.leave();
        Ok(expr)
    }

    fn list_display(&mut self) -> ParseResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        self.enter()?;
        let first = self.expression()?;
        let expr = if self.is_kw("for") {
            self.comprehension(ComprehensionKind::List, first, None)?
        } else {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.is_op("]") {
                    break;
                }
                items.push(self.expression()?);
            }
            Expr::List(items)
        };
        self.expect_op("]")?;
        self.leave();
        Ok(expr)
    }

    fn dict_display(&mut self) -> ParseResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        if self.is_op("**") {
            return Err(self.syntax("dict unpacking is not supported"));
        }
        self.enter()?;
        let key = self.expression()?;
        if !self.eat_op(":") {
            return Err(self.syntax("sets are not supported"));
        }
        let value = self.expression()?;
        let expr = if self.is_kw("for") {
            self.comprehension(ComprehensionKind::Dict, key, Some(value))?
        } else {
            let mut pairs = vec![(key, value)];
            while self.eat_op(",") {
                if self.is_op("}") {
                    break;
                }
                let key = self.expression()?;
                self.expect_op(":")?;
                pairs.push((key, self.expression()?));
            }
            Expr::Dict(pairs)
        };
        self.expect_op("}")?;
        self.leave();
        Ok(expr)
    }

    fn comprehension(&mut self, kind: ComprehensionKind, element: Expr, value: Option<Expr>) -> ParseResult<Expr> {
        let mut clauses = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_kw("if") {
                conditions.push(self.or_test()?);
            }
            clauses.push(Clause {
                target,
                iter,
                conditions,
            });
        }
        Ok(Expr::Comprehension(Box::new(Comprehension {
            kind,
            element,
            value,
            clauses,
        })))
    }

    fn target_list(&mut self) -> ParseResult<Pattern> {
        let first = self.target()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") || self.is_op(")") {
                break;
            }
            items.push(self.target()?);
        }
        Ok(Pattern::Tuple(items))
    }

    fn target(&mut self) -> ParseResult<Pattern> {
        if self.eat_op("(") {
            let pattern = self.target_list()?;
            self.expect_op(")")?;
            return Ok(pattern);
        }
        Ok(Pattern::Name(self.identifier()?))
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(i) => format!("number {}", i),
        Token::Float(x) => format!("number {}", x),
        Token::Str(_) | Token::Bytes(_) => "string literal".to_string(),
        Token::Name(n) => format!("'{}'", n),
        Token::Op(op) => format!("'{}'", op),
        Token::Eof => "end of expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_of_power_and_unary_minus() {
        // -2 ** 2 parses as -(2 ** 2)
        let expr = parse("-2 ** 2").unwrap();
        assert!(matches!(expr, Expr::Unary(UnaryOp::Neg, inner) if matches!(*inner, Expr::Binary(_, BinOp::Pow, _))));
    }

    #[test]
    fn test_chained_comparison() {
        let expr = parse("1 < x <= 3 not in y").unwrap();
        match expr {
            Expr::Compare(_, rest) => {
                let ops: Vec<CmpOp> = rest.iter().map(|(op, _)| *op).collect();
                assert_eq!(ops, vec![CmpOp::Lt, CmpOp::LtE, CmpOp::NotIn]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lambda_with_defaults_and_keyword_call() {
        let expr = parse("(lambda a, b=2: a + b)(1, b=3)").unwrap();
        match expr {
            Expr::Call { args, keywords, .. } => {
                assert_eq!(args.len(), 1);
                assert_eq!(keywords.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_comprehension_clauses() {
        let expr = parse("[a * b for a in x if a for b in y if b if a != b]").unwrap();
        match expr {
            Expr::Comprehension(comp) => {
                assert_eq!(comp.kind, ComprehensionKind::List);
                assert_eq!(comp.clauses.len(), 2);
                assert_eq!(comp.clauses[1].conditions.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_top_level_tuple_and_slices() {
        assert!(matches!(parse("1, 2,").unwrap(), Expr::Tuple(items) if items.len() == 2));
        assert!(matches!(parse("x[::-1]").unwrap(), Expr::Subscript(_, idx) if matches!(*idx, Expr::Slice(None, None, Some(_)))));
    }

    #[test]
    fn test_forbidden_constructs_are_reported() {
        for source in ["x = 1", "f(a.b=1)", "s._private", "x.__class__", "[y := 1]", "a; b", "lambda: __import__"] {
            assert!(matches!(parse(source), Err(EvalError::Forbidden(_))), "'{}' should be forbidden", source);
        }
    }

    #[test]
    fn test_syntax_errors() {
        for source in ["", "1 +", "{1, 2}", "f(a=1, 2)", "lambda a=1, b: 0", "(1, 2"] {
            assert!(matches!(parse(source), Err(EvalError::Syntax { .. })), "'{}' should not parse", source);
        }
    }

    #[test]
    fn test_nesting_is_bounded() {
        let source = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(parse(&source), Err(EvalError::Syntax { .. })));
    }
}
