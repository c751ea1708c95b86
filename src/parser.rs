use crate::ast::{Ast, ExprId, ExprKind};
use crate::error::{OpalError, OpalResult};
use crate::lexer::Token;
use crate::location::SourceLocation;
use crate::symbol::SymbolTable;
use crate::value::SymbolId;

/// Reserved words that can never be variables.
const KEYWORDS: [&str; 3] = ["lambda", "letrec", "if"];

fn is_integer_token(token: &Token) -> bool {
    token
        .text
        .bytes()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == b'-' || c == b'+')
}

fn is_string_token(token: &Token) -> bool {
    token.text.starts_with('"')
}

fn is_intrinsic_token(token: &Token) -> bool {
    token.text.starts_with('.')
}

fn is_variable_token(token: &Token) -> bool {
    token
        .text
        .bytes()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == b'_')
        && !KEYWORDS.contains(&token.text.as_str())
}

/// Parse one complete expression from the token list. Trailing tokens are
/// an error; so is an empty input.
pub fn parse(tokens: Vec<Token>, symbols: &mut SymbolTable) -> OpalResult<(Ast, ExprId)> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        ast: Ast::new(),
        symbols,
    };
    let root = parser.parse_expr()?;
    if let Some(token) = parser.peek() {
        return Err(OpalError::parser(token.sl, "redundant token(s)"));
    }
    Ok((parser.ast, root))
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ast: Ast,
    symbols: &'a mut SymbolTable,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_second(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1)
    }

    /// Pop the next token, requiring it to satisfy `predicate`.
    fn consume(&mut self, predicate: impl Fn(&Token) -> bool) -> OpalResult<Token> {
        match self.tokens.get(self.pos) {
            None => Err(OpalError::parser(
                SourceLocation::none(),
                "incomplete token stream",
            )),
            Some(token) => {
                if !predicate(token) {
                    return Err(OpalError::parser(token.sl, "unexpected token"));
                }
                let token = token.clone();
                self.pos += 1;
                Ok(token)
            }
        }
    }

    fn consume_text(&mut self, text: &str) -> OpalResult<Token> {
        self.consume(|t| t.text == text)
    }

    fn parse_integer(&mut self) -> OpalResult<ExprId> {
        let token = self.consume(is_integer_token)?;
        Ok(self.ast.add(
            ExprKind::Integer {
                text: token.text,
                loc: None,
            },
            token.sl,
        ))
    }

    fn parse_string(&mut self) -> OpalResult<ExprId> {
        let token = self.consume(is_string_token)?;
        Ok(self.ast.add(
            ExprKind::String {
                text: token.text,
                loc: None,
            },
            token.sl,
        ))
    }

    fn parse_variable_name(&mut self) -> OpalResult<(SymbolId, SourceLocation)> {
        let token = self.consume(is_variable_token)?;
        Ok((self.symbols.intern(&token.text), token.sl))
    }

    fn parse_variable(&mut self) -> OpalResult<ExprId> {
        let (name, sl) = self.parse_variable_name()?;
        Ok(self.ast.add(ExprKind::Variable { name }, sl))
    }

    fn parse_lambda(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("lambda")?;
        self.consume_text("(")?;
        let mut params = Vec::new();
        while self.peek().is_some_and(is_variable_token) {
            let (name, _) = self.parse_variable_name()?;
            params.push(name);
        }
        self.consume_text(")")?;
        let body = self.parse_expr()?;
        Ok(self.ast.add(ExprKind::Lambda { params, body }, start.sl))
    }

    fn parse_letrec(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("letrec")?;
        self.consume_text("(")?;
        let mut bindings = Vec::new();
        while self.peek().is_some_and(is_variable_token) {
            let (name, _) = self.parse_variable_name()?;
            let init = self.parse_expr()?;
            bindings.push((name, init));
        }
        self.consume_text(")")?;
        let body = self.parse_expr()?;
        Ok(self.ast.add(ExprKind::Letrec { bindings, body }, start.sl))
    }

    fn parse_if(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("if")?;
        let cond = self.parse_expr()?;
        let then_branch = self.parse_expr()?;
        let else_branch = self.parse_expr()?;
        Ok(self.ast.add(
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            },
            start.sl,
        ))
    }

    fn parse_sequence(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("{")?;
        let mut exprs = Vec::new();
        while self.peek().is_some_and(|t| t.text != "}") {
            exprs.push(self.parse_expr()?);
        }
        if exprs.is_empty() {
            return Err(OpalError::parser(start.sl, "zero-length sequence"));
        }
        self.consume_text("}")?;
        Ok(self.ast.add(ExprKind::Sequence { exprs }, start.sl))
    }

    fn parse_intrinsic_call(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("(")?;
        let intrinsic = self.consume(is_intrinsic_token)?;
        let mut args = Vec::new();
        while self.peek().is_some_and(|t| t.text != ")") {
            args.push(self.parse_expr()?);
        }
        self.consume_text(")")?;
        Ok(self.ast.add(
            ExprKind::IntrinsicCall {
                name: intrinsic.text,
                args,
            },
            start.sl,
        ))
    }

    fn parse_expr_call(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("(")?;
        let callee = self.parse_expr()?;
        let mut args = Vec::new();
        while self.peek().is_some_and(|t| t.text != ")") {
            args.push(self.parse_expr()?);
        }
        self.consume_text(")")?;
        Ok(self.ast.add(ExprKind::ExprCall { callee, args }, start.sl))
    }

    fn parse_at(&mut self) -> OpalResult<ExprId> {
        let start = self.consume_text("@")?;
        let (var, _) = self.parse_variable_name()?;
        let expr = self.parse_expr()?;
        Ok(self.ast.add(ExprKind::At { var, expr }, start.sl))
    }

    fn parse_expr(&mut self) -> OpalResult<ExprId> {
        let Some(token) = self.peek() else {
            return Err(OpalError::parser(
                SourceLocation::none(),
                "incomplete token stream",
            ));
        };
        if is_integer_token(token) {
            self.parse_integer()
        } else if is_string_token(token) {
            self.parse_string()
        } else if token.text == "lambda" {
            self.parse_lambda()
        } else if token.text == "letrec" {
            self.parse_letrec()
        } else if token.text == "if" {
            self.parse_if()
        } else if is_variable_token(token) {
            self.parse_variable()
        } else if token.text == "{" {
            self.parse_sequence()
        } else if token.text == "(" {
            // the second token decides between an intrinsic call and an
            // expression call
            match self.peek_second() {
                None => Err(OpalError::parser(
                    SourceLocation::none(),
                    "incomplete token stream",
                )),
                Some(second) if is_intrinsic_token(second) => self.parse_intrinsic_call(),
                Some(_) => self.parse_expr_call(),
            }
        } else if token.text == "@" {
            self.parse_at()
        } else {
            Err(OpalError::parser(token.sl, "unrecognized token"))
        }
    }
}
