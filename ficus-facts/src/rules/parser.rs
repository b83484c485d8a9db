//! Recursive descent parser for rule scripts.
//!
//! ```text
//! script    := rule*
//! rule      := "rule" IDENT [":" IDENT ("," IDENT)*] "{" member* "}"
//! member    := "let" IDENT "=" expr ";" | "when" expr ";" | "then" block
//! block     := "{" stmt* "}"
//! stmt      := "set" path "=" expr ";" | "unset" path ";"
//!            | "if" expr block ["else" (block | if-stmt)]
//! expr      := and (("or" | "||") and)*
//! and       := not (("and" | "&&") not)*
//! not       := ("not" | "!") not | compare
//! compare   := sum [("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") sum]
//! sum       := product (("+" | "-") product)*
//! product   := unary (("*" | "/" | "%") unary)*
//! unary     := "-" unary | primary
//! primary   := literal | "[" [expr ("," expr)*] "]" | "(" expr ")"
//!            | IDENT "(" [expr ("," expr)*] ")" | path
//! ```
//!
//! Nesting, including operator chains, is limited to `max_depth` levels so
//! hostile scripts cannot exhaust the stack.

use std::collections::HashSet;

use serde_json::{Number, Value};

use super::ast::{BinaryOp, Expr, Function, Path, RuleDecl, Stmt, UnaryOp};
use super::lexer::{tokenize, SyntaxError, Token, TokenKind};
use super::Capability;

/// Parse every rule declared in `source`
pub(crate) fn parse(source: &str, max_depth: usize) -> Result<Vec<RuleDecl>, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, max_depth).script()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

type ParseResult<T> = Result<T, SyntaxError>;

impl Parser {
    fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(token.line, token.column, message)
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected {}, found {}", kind, self.peek().kind)))
        }
    }

    fn ident(&mut self, what: &str) -> ParseResult<(String, Token)> {
        let token = self.advance();
        match &token.kind {
            TokenKind::Ident(name) => Ok((name.clone(), token.clone())),
            other => Err(SyntaxError::new(
                token.line,
                token.column,
                format!("expected {}, found {}", what, other),
            )),
        }
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(self.error_here(format!("nesting deeper than {} levels", self.max_depth)));
        }
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn chain(&self, links: usize) -> ParseResult<()> {
        if self.depth + links > self.max_depth {
            Err(self.error_here(format!("nesting deeper than {} levels", self.max_depth)))
        } else {
            Ok(())
        }
    }

    fn script(&mut self) -> ParseResult<Vec<RuleDecl>> {
        let mut rules: Vec<RuleDecl> = Vec::new();
        let mut names = HashSet::new();
        while !self.check(&TokenKind::Eof) {
            let rule = self.rule()?;
            if !names.insert(rule.name.clone()) {
                return Err(SyntaxError::new(
                    rule.line,
                    1,
                    format!("rule {} is declared more than once", rule.name),
                ));
            }
            rules.push(rule);
        }
        Ok(rules)
    }

    fn rule(&mut self) -> ParseResult<RuleDecl> {
        self.expect(TokenKind::Rule)?;
        let (name, name_token) = self.ident("rule name")?;

        let mut declared = Vec::new();
        if self.eat(&TokenKind::Colon) {
            loop {
                let (capability, token) = self.ident("capability")?;
                let capability = Capability::from_marker(&capability).ok_or_else(|| {
                    SyntaxError::new(
                        token.line,
                        token.column,
                        format!("unknown capability {}, expected Action or Condition", capability),
                    )
                })?;
                if !declared.contains(&capability) {
                    declared.push(capability);
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut decl = RuleDecl {
            name,
            line: name_token.line,
            declared,
            fields: Vec::new(),
            condition: None,
            body: None,
        };

        self.expect(TokenKind::LeftBrace)?;
        while !self.eat(&TokenKind::RightBrace) {
            let token = self.advance();
            match token.kind {
                TokenKind::Let => {
                    let (field, field_token) = self.ident("field name")?;
                    if decl.fields.iter().any(|(existing, _)| *existing == field) {
                        return Err(SyntaxError::new(
                            field_token.line,
                            field_token.column,
                            format!("field {} is declared more than once", field),
                        ));
                    }
                    self.expect(TokenKind::Assign)?;
                    let value = self.expr()?;
                    self.expect(TokenKind::Semicolon)?;
                    decl.fields.push((field, value));
                }
                TokenKind::When => {
                    if decl.condition.is_some() {
                        let message = "duplicate when clause";
                        return Err(SyntaxError::new(token.line, token.column, message));
                    }
                    let condition = self.expr()?;
                    self.expect(TokenKind::Semicolon)?;
                    decl.condition = Some(condition);
                }
                TokenKind::Then => {
                    if decl.body.is_some() {
                        let message = "duplicate then block";
                        return Err(SyntaxError::new(token.line, token.column, message));
                    }
                    decl.body = Some(self.block()?);
                }
                other => {
                    return Err(SyntaxError::new(
                        token.line,
                        token.column,
                        format!("expected let, when, then or }}, found {}", other),
                    ));
                }
            }
        }

        if decl.condition.is_none() && decl.body.is_none() {
            return Err(SyntaxError::new(
                decl.line,
                name_token.column,
                format!("rule {} has neither a when clause nor a then block", decl.name),
            ));
        }
        Ok(decl)
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.nested(|p| {
            p.expect(TokenKind::LeftBrace)?;
            let mut stmts = Vec::new();
            while !p.eat(&TokenKind::RightBrace) {
                stmts.push(p.stmt()?);
            }
            Ok(stmts)
        })
    }

    fn stmt(&mut self) -> ParseResult<Stmt> {
        let token = self.advance();
        match token.kind {
            TokenKind::Set => {
                let path = self.path()?;
                self.expect(TokenKind::Assign)?;
                let value = self.expr()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::Set(path, value))
            }
            TokenKind::Unset => {
                let path = self.path()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::Unset(path))
            }
            TokenKind::If => self.if_stmt(),
            other => Err(SyntaxError::new(
                token.line,
                token.column,
                format!("expected set, unset or if, found {}", other),
            )),
        }
    }

    // The `if` keyword is already consumed
    fn if_stmt(&mut self) -> ParseResult<Stmt> {
        let condition = self.expr()?;
        let then = self.block()?;
        let otherwise = if self.eat(&TokenKind::Else) {
            if self.eat(&TokenKind::If) {
                vec![self.nested(|p| p.if_stmt())?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            condition,
            then,
            otherwise,
        })
    }

    fn path(&mut self) -> ParseResult<Path> {
        let (head, _) = self.ident("fact path")?;
        self.path_tail(head)
    }

    fn path_tail(&mut self, head: String) -> ParseResult<Path> {
        let mut path = vec![head];
        while self.eat(&TokenKind::Dot) {
            let (segment, _) = self.ident("path segment")?;
            path.push(segment);
        }
        Ok(path)
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        self.nested(|p| p.or())
    }

    fn binary_chain(
        &mut self,
        operand: fn(&mut Self) -> ParseResult<Expr>,
        operator: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> ParseResult<Expr> {
        let mut left = operand(self)?;
        let mut links = 0;
        while let Some(op) = operator(&self.peek().kind) {
            links += 1;
            self.chain(links)?;
            self.advance();
            let right = operand(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> ParseResult<Expr> {
        self.binary_chain(Self::and, |kind| match kind {
            TokenKind::Or | TokenKind::OrOr => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn and(&mut self) -> ParseResult<Expr> {
        self.binary_chain(Self::not, |kind| match kind {
            TokenKind::And | TokenKind::AndAnd => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn not(&mut self) -> ParseResult<Expr> {
        if self.eat(&TokenKind::Not) || self.eat(&TokenKind::Bang) {
            let operand = self.nested(|p| p.not())?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.compare()
    }

    fn compare(&mut self) -> ParseResult<Expr> {
        let left = self.sum()?;
        let op = match self.peek().kind {
            TokenKind::Equal => BinaryOp::Equal,
            TokenKind::NotEqual => BinaryOp::NotEqual,
            TokenKind::Less => BinaryOp::Less,
            TokenKind::LessEqual => BinaryOp::LessEqual,
            TokenKind::Greater => BinaryOp::Greater,
            TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
            TokenKind::In => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn sum(&mut self) -> ParseResult<Expr> {
        self.binary_chain(Self::product, |kind| match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn product(&mut self) -> ParseResult<Expr> {
        self.binary_chain(Self::unary, |kind| match kind {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&TokenKind::Minus) {
            let operand = self.nested(|p| p.unary())?;
            return Ok(match operand {
                Expr::Literal(Value::Number(n)) if n.is_i64() => {
                    let value = n.as_i64().unwrap_or_default();
                    match value.checked_neg() {
                        Some(negated) => Expr::Literal(Value::from(negated)),
                        None => {
                            Expr::Unary(UnaryOp::Neg, Box::new(Expr::Literal(Value::Number(n))))
                        }
                    }
                }
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Int(value) => Ok(Expr::Literal(Value::from(value))),
            TokenKind::Float(value) => Number::from_f64(value)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| SyntaxError::new(token.line, token.column, "number is not finite")),
            TokenKind::Str(value) => Ok(Expr::Literal(Value::String(value))),
            TokenKind::LeftParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RightParen)?;
                Ok(inner)
            }
            TokenKind::LeftBracket => {
                let items = self.arguments(TokenKind::RightBracket)?;
                Ok(Expr::List(items))
            }
            TokenKind::Ident(name) => {
                if !self.check(&TokenKind::LeftParen) {
                    return Ok(Expr::Path(self.path_tail(name)?));
                }
                let function = Function::from_name(&name).ok_or_else(|| {
                    SyntaxError::new(token.line, token.column, format!("unknown function {}", name))
                })?;
                self.advance();
                let args = self.arguments(TokenKind::RightParen)?;
                if args.len() != function.arity() {
                    return Err(SyntaxError::new(
                        token.line,
                        token.column,
                        format!(
                            "{} takes {} argument(s), {} given",
                            function.name(),
                            function.arity(),
                            args.len()
                        ),
                    ));
                }
                if function == Function::Exists && !matches!(args[0], Expr::Path(_)) {
                    return Err(SyntaxError::new(
                        token.line,
                        token.column,
                        "exists takes a fact path",
                    ));
                }
                Ok(Expr::Call(function, args))
            }
            other => Err(SyntaxError::new(
                token.line,
                token.column,
                format!("expected an expression, found {}", other),
            )),
        }
    }

    // The opening delimiter is already consumed
    fn arguments(&mut self, close: TokenKind) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat(&close) {
                return Ok(items);
            }
            self.expect(TokenKind::Comma)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Expr {
        Expr::Path(segments.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_parse_rule() {
        let rules = parse(
            r#"
            rule Flag: Condition, Action {
                let limit = 100;
                when order.amount > limit and not order.flagged;
                then {
                    set order.flagged = true;
                    if order.amount > 1000 { set order.tier = "high"; } else { unset order.tier; }
                }
            }
            "#,
            64,
        )
        .unwrap();

        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.name, "Flag");
        assert_eq!(rule.line, 2);
        assert_eq!(rule.declared, vec![Capability::Condition, Capability::Action]);
        assert_eq!(rule.fields, vec![("limit".to_string(), Expr::Literal(json!(100)))]);
        assert_eq!(
            rule.condition,
            Some(Expr::Binary(
                BinaryOp::And,
                Box::new(Expr::Binary(
                    BinaryOp::Greater,
                    Box::new(path(&["order", "amount"])),
                    Box::new(path(&["limit"])),
                )),
                Box::new(Expr::Unary(UnaryOp::Not, Box::new(path(&["order", "flagged"])))),
            ))
        );
        assert_eq!(rule.body.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_precedence() {
        let rules = parse("rule R { when 1 + 2 * 3 == 7 || false; }", 64).unwrap();
        let expected = Expr::Binary(
            BinaryOp::Or,
            Box::new(Expr::Binary(
                BinaryOp::Equal,
                Box::new(Expr::Binary(
                    BinaryOp::Add,
                    Box::new(Expr::Literal(json!(1))),
                    Box::new(Expr::Binary(
                        BinaryOp::Mul,
                        Box::new(Expr::Literal(json!(2))),
                        Box::new(Expr::Literal(json!(3))),
                    )),
                )),
                Box::new(Expr::Literal(json!(7))),
            )),
            Box::new(Expr::Literal(json!(false))),
        );
        assert_eq!(rules[0].condition, Some(expected));
    }

    #[test]
    fn test_calls_and_lists() {
        let source = r#"rule R { when lower(name) in ["a", "b"] and exists(x.y); }"#;
        let rules = parse(source, 64).unwrap();
        let condition = rules[0].condition.clone().unwrap();
        match condition {
            Expr::Binary(BinaryOp::And, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::In, _, _)));
                assert_eq!(*right, Expr::Call(Function::Exists, vec![path(&["x", "y"])]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negative_literal_folds() {
        let rules = parse("rule R { when x > -5; }", 64).unwrap();
        assert_eq!(
            rules[0].condition,
            Some(Expr::Binary(
                BinaryOp::Greater,
                Box::new(path(&["x"])),
                Box::new(Expr::Literal(json!(-5))),
            ))
        );
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            "rule { when true; }",
            "rule R: Sometimes { when true; }",
            "rule R { }",
            "rule R { when true }",
            "rule R { when true; when false; }",
            "rule R { let a = 1; let a = 2; when a; }",
            "rule R { when nope(1); }",
            "rule R { when len(1, 2); }",
            "rule R { when exists(1); }",
            "rule R { then { print x; } }",
            "rule R { when true; } rule R { when false; }",
        ];
        for source in cases {
            assert!(parse(source, 64).is_err(), "should reject {:?}", source);
        }
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("rule R {{ when {}1{}; }}", "(".repeat(40), ")".repeat(40));
        assert!(parse(&deep, 64).is_ok());
        assert!(parse(&deep, 16).is_err());

        let long_chain = format!("rule R {{ when 1{}; }}", " + 1".repeat(100));
        assert!(parse(&long_chain, 64).is_err());

        let negations = format!("rule R {{ when {}true; }}", "!".repeat(100));
        assert!(parse(&negations, 64).is_err());
    }
}
