use super::ir::{
    is_reserved_name, ArrayUsage, Assignment, BinaryOp, Expr, IrFunction, IrModule, MathConstant,
    MathFunction, Parameter, ParameterKind, ReturnType, Target, UnaryOp,
};
use super::scanner::{Token, TokenKind};
use super::ParseError;
use crate::error::{SymbolError, SyntaxError, SyntaxErrorKind};

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Name resolution state for the function being parsed.
struct Scope {
    name: String,
    parameters: Vec<Parameter>,
    locals: Vec<String>,
    array_usage: Vec<ArrayUsage>,
    scalar_parameters: usize,
}

enum Binding {
    Scalar(usize),
    Array(usize),
}

impl Scope {
    fn lookup(&self, name: &str) -> Option<Binding> {
        if let Some(param) = self.parameters.iter().find(|p| p.name == name) {
            return Some(match param.kind {
                ParameterKind::Scalar => Binding::Scalar(param.slot),
                ParameterKind::Array => Binding::Array(param.slot),
            });
        }
        self.locals
            .iter()
            .position(|l| l == name)
            .map(|i| Binding::Scalar(self.scalar_parameters + i))
    }
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        // The scanner always terminates the stream with Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_next_kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    fn consume(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        ParseError::Syntax(SyntaxError {
            line: token.line,
            column: token.column,
            kind: SyntaxErrorKind::Expected {
                expected: expected.to_string(),
                found: token.describe(),
            },
        })
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.peek_kind() == kind {
            Ok(self.consume())
        } else {
            Err(self.unexpected(expected))
        }
    }

    pub fn module(mut self) -> Result<IrModule, ParseError> {
        let mut functions: Vec<IrFunction> = Vec::new();

        while self.peek_kind() != TokenKind::Eof {
            let function = self.function()?;
            if functions.iter().any(|f| f.name == function.name) {
                return Err(SymbolError::DuplicateFunction {
                    name: function.name,
                }
                .into());
            }
            functions.push(function);
        }

        Ok(IrModule { functions })
    }

    fn function(&mut self) -> Result<IrFunction, ParseError> {
        let return_type = match self.peek_kind() {
            TokenKind::Void => ReturnType::Void,
            TokenKind::Double => ReturnType::Double,
            _ => return Err(self.unexpected("`void` or `double`")),
        };
        self.consume();

        let name_token = self.expect(TokenKind::Identifier, "an identifier")?;
        check_not_reserved(&name_token)?;

        let mut scope = Scope {
            name: name_token.text.clone(),
            parameters: Vec::new(),
            locals: Vec::new(),
            array_usage: Vec::new(),
            scalar_parameters: 0,
        };

        self.expect(TokenKind::LeftParen, "`(`")?;
        if self.peek_kind() != TokenKind::RightParen {
            loop {
                self.parameter(&mut scope)?;
                match self.peek_kind() {
                    TokenKind::Comma => {
                        self.consume();
                    }
                    TokenKind::RightParen => break,
                    _ => return Err(self.unexpected("`,` or `)`")),
                }
            }
        }
        self.expect(TokenKind::RightParen, "`)`")?;
        self.expect(TokenKind::LeftBrace, "`{`")?;

        let mut body = Vec::new();
        let mut return_value = None;

        loop {
            match (self.peek_kind(), return_type) {
                (TokenKind::Identifier, _) => body.push(self.assignment(&mut scope)?),
                (TokenKind::Double, _) if self.peek_next_kind() == TokenKind::Identifier => {
                    self.consume();
                    body.push(self.declaration(&mut scope)?);
                }
                (TokenKind::RightBrace, ReturnType::Void) => break,
                (TokenKind::Return, ReturnType::Double) => {
                    self.consume();
                    return_value = Some(self.expression(&mut scope)?);
                    self.expect(TokenKind::Semicolon, "`;`")?;
                    break;
                }
                (_, ReturnType::Void) => return Err(self.unexpected("an identifier or `}`")),
                (_, ReturnType::Double) => {
                    return Err(self.unexpected("an identifier or `return`"))
                }
            }
        }
        self.expect(TokenKind::RightBrace, "`}`")?;

        Ok(IrFunction {
            name: scope.name,
            return_type,
            parameters: scope.parameters,
            locals: scope.locals,
            body,
            return_value,
            array_usage: scope.array_usage,
        })
    }

    fn parameter(&mut self, scope: &mut Scope) -> Result<(), ParseError> {
        self.expect(TokenKind::Double, "`double`")?;
        let kind = if self.peek_kind() == TokenKind::Asterisk {
            self.consume();
            ParameterKind::Array
        } else {
            ParameterKind::Scalar
        };
        let token = self.expect(TokenKind::Identifier, "an identifier")?;
        check_not_reserved(&token)?;

        if scope.parameters.iter().any(|p| p.name == token.text) {
            return Err(SymbolError::DuplicateParameter {
                function: scope.name.clone(),
                name: token.text,
            }
            .into());
        }

        let slot = match kind {
            ParameterKind::Scalar => {
                scope.scalar_parameters += 1;
                scope.scalar_parameters - 1
            }
            ParameterKind::Array => {
                scope.array_usage.push(ArrayUsage::default());
                scope.array_usage.len() - 1
            }
        };
        scope.parameters.push(Parameter {
            name: token.text,
            kind,
            slot,
        });
        Ok(())
    }

    /// `double name = value;`, which must introduce a new local.
    fn declaration(&mut self, scope: &mut Scope) -> Result<Assignment, ParseError> {
        let token = self.peek().clone();
        if scope.lookup(&token.text).is_some() {
            return Err(SymbolError::DuplicateLocal {
                function: scope.name.clone(),
                name: token.text,
                line: token.line,
                column: token.column,
            }
            .into());
        }
        self.assignment(scope)
    }

    fn assignment(&mut self, scope: &mut Scope) -> Result<Assignment, ParseError> {
        let token = self.expect(TokenKind::Identifier, "an identifier")?;

        let element = if self.peek_kind() == TokenKind::LeftBracket {
            Some(self.index()?)
        } else {
            None
        };

        self.expect(TokenKind::Equals, "`=`")?;
        let value = self.expression(scope)?;
        self.expect(TokenKind::Semicolon, "`;`")?;

        let target = match (scope.lookup(&token.text), element) {
            (Some(Binding::Array(array)), Some(index)) => {
                scope.array_usage[array].record_write(index);
                Target::Element { array, index }
            }
            (Some(Binding::Array(_)), None) => return Err(missing_index(&token)),
            (Some(Binding::Scalar(_)), Some(_)) => return Err(not_an_array(&token)),
            (None, Some(_)) => return Err(unresolved(&token)),
            (Some(Binding::Scalar(slot)), None) => Target::Scalar(slot),
            (None, None) => {
                check_not_reserved(&token)?;
                scope.locals.push(token.text.clone());
                Target::Scalar(scope.scalar_parameters + scope.locals.len() - 1)
            }
        };

        Ok(Assignment { target, value })
    }

    fn index(&mut self) -> Result<usize, ParseError> {
        self.expect(TokenKind::LeftBracket, "`[`")?;
        let token = self.expect(TokenKind::Integer, "a positive integer")?;
        let index = token.text.parse::<usize>().map_err(|_| {
            ParseError::Syntax(SyntaxError {
                line: token.line,
                column: token.column,
                kind: SyntaxErrorKind::NumberOutOfRange {
                    literal: token.text.clone(),
                },
            })
        })?;
        self.expect(TokenKind::RightBracket, "`]`")?;
        Ok(index)
    }

    fn expression(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        let condition = self.logical_or(scope)?;
        if self.peek_kind() != TokenKind::Question {
            return Ok(condition);
        }
        self.consume();
        let if_true = self.expression(scope)?;
        self.expect(TokenKind::Colon, "`:`")?;
        let if_false = self.expression(scope)?;
        Ok(Expr::Conditional {
            condition: Box::new(condition),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        })
    }

    /// Parses a left-associative chain of `operand (op operand)*`.
    fn binary_chain(
        &mut self,
        scope: &mut Scope,
        operand: fn(&mut Self, &mut Scope) -> Result<Expr, ParseError>,
        operator: fn(TokenKind) -> Option<BinaryOp>,
    ) -> Result<Expr, ParseError> {
        let mut lhs = operand(self, scope)?;
        while let Some(op) = operator(self.peek_kind()) {
            self.consume();
            let rhs = operand(self, scope)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_or(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::logical_and, |kind| match kind {
            TokenKind::OrOr => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn logical_and(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::exclusive_or, |kind| match kind {
            TokenKind::AndAnd => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn exclusive_or(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::equality, |kind| match kind {
            TokenKind::Caret => Some(BinaryOp::Xor),
            _ => None,
        })
    }

    fn equality(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::relational, |kind| match kind {
            TokenKind::EqualEqual => Some(BinaryOp::Eq),
            TokenKind::NotEqual => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn relational(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::additive, |kind| match kind {
            TokenKind::Less => Some(BinaryOp::Lt),
            TokenKind::LessEqual => Some(BinaryOp::Le),
            TokenKind::Greater => Some(BinaryOp::Gt),
            TokenKind::GreaterEqual => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn additive(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::multiplicative, |kind| match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn multiplicative(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        self.binary_chain(scope, Self::unary, |kind| match kind {
            TokenKind::Asterisk => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    fn unary(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Plus => {
                self.consume();
                return self.unary(scope);
            }
            _ => return self.primary(scope),
        };
        self.consume();
        let operand = self.unary(scope)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn primary(&mut self, scope: &mut Scope) -> Result<Expr, ParseError> {
        match self.peek_kind() {
            TokenKind::Integer | TokenKind::Real => {
                let token = self.consume();
                // Literals were range-checked by the scanner.
                let value = token.text.parse::<f64>().map_err(|_| {
                    ParseError::Syntax(SyntaxError {
                        line: token.line,
                        column: token.column,
                        kind: SyntaxErrorKind::NumberOutOfRange {
                            literal: token.text.clone(),
                        },
                    })
                })?;
                Ok(Expr::Number(value))
            }
            TokenKind::LeftParen => {
                self.consume();
                let expr = self.expression(scope)?;
                self.expect(TokenKind::RightParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::Identifier => {
                let token = self.consume();
                match self.peek_kind() {
                    TokenKind::LeftParen => self.call(scope, &token),
                    TokenKind::LeftBracket => {
                        let index = self.index()?;
                        match scope.lookup(&token.text) {
                            Some(Binding::Array(array)) => {
                                scope.array_usage[array].record_read(index);
                                Ok(Expr::Element { array, index })
                            }
                            Some(Binding::Scalar(_)) => Err(not_an_array(&token)),
                            None => Err(unresolved(&token)),
                        }
                    }
                    _ => match scope.lookup(&token.text) {
                        Some(Binding::Scalar(slot)) => Ok(Expr::Scalar(slot)),
                        Some(Binding::Array(_)) => Err(missing_index(&token)),
                        None => MathConstant::from_name(&token.text)
                            .map(Expr::Constant)
                            .ok_or_else(|| unresolved(&token)),
                    },
                }
            }
            _ => Err(self.unexpected("a number, an identifier or `(`")),
        }
    }

    fn call(&mut self, scope: &mut Scope, name: &Token) -> Result<Expr, ParseError> {
        let function = MathFunction::from_name(&name.text).ok_or_else(|| {
            ParseError::Symbol(SymbolError::UnknownFunction {
                name: name.text.clone(),
                line: name.line,
                column: name.column,
            })
        })?;

        self.expect(TokenKind::LeftParen, "`(`")?;
        let mut args = Vec::new();
        if self.peek_kind() != TokenKind::RightParen {
            loop {
                args.push(self.expression(scope)?);
                match self.peek_kind() {
                    TokenKind::Comma => {
                        self.consume();
                    }
                    TokenKind::RightParen => break,
                    _ => return Err(self.unexpected("`,` or `)`")),
                }
            }
        }
        self.expect(TokenKind::RightParen, "`)`")?;

        let arity = function.arity();
        if !arity.accepts(args.len()) {
            return Err(SymbolError::ArgumentCount {
                name: name.text.clone(),
                expected: arity.describe(),
                found: args.len(),
                line: name.line,
                column: name.column,
            }
            .into());
        }

        Ok(Expr::Call { function, args })
    }
}

fn check_not_reserved(token: &Token) -> Result<(), ParseError> {
    if is_reserved_name(&token.text) {
        return Err(SymbolError::ReservedName {
            name: token.text.clone(),
            line: token.line,
            column: token.column,
        }
        .into());
    }
    Ok(())
}

fn unresolved(token: &Token) -> ParseError {
    SymbolError::UnresolvedIdentifier {
        name: token.text.clone(),
        line: token.line,
        column: token.column,
    }
    .into()
}

fn not_an_array(token: &Token) -> ParseError {
    SymbolError::NotAnArray {
        name: token.text.clone(),
        line: token.line,
        column: token.column,
    }
    .into()
}

fn missing_index(token: &Token) -> ParseError {
    SymbolError::MissingIndex {
        name: token.text.clone(),
        line: token.line,
        column: token.column,
    }
    .into()
}
