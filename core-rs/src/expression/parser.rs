//! Lexer and parser for the expression language

use super::functions::is_function;
use crate::errors::{Result, Test161Error};

/// Parsed template node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Range {
        index_var: Option<String>,
        elem_var: Option<String>,
        over: Pipeline,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
}

/// `[$decl :=] cmd | cmd | ...`
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub decl: Option<String>,
    pub commands: Vec<Command>,
}

/// A function call or a single operand
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Str(String),
    Field(String),
    Dot,
    Var(String),
    Ident(String),
    Sub(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Field(String),
    Dot,
    Var(String),
    Ident(String),
    Declare,
    Pipe,
    Comma,
    LParen,
    RParen,
}

/// Raw pieces of a template before nesting: text runs and action bodies
enum Piece {
    Text(String),
    Action(String),
}

pub fn parse(src: &str) -> Result<Vec<Node>> {
    let pieces = split(src)?;
    let mut pos = 0;
    let (nodes, end) = parse_list(&pieces, &mut pos)?;
    match end {
        Terminator::Eof => Ok(nodes),
        Terminator::End => Err(err("unexpected {{end}}")),
        Terminator::Else => Err(err("unexpected {{else}}")),
    }
}

fn err(msg: &str) -> Test161Error {
    Test161Error::Expression(msg.to_string())
}

/// Split into text and action pieces, applying `{{-` / `-}}` trimming.
fn split(src: &str) -> Result<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut rest = src;
    let mut trim_next = false;

    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        if trim_next {
            text = text.trim_start();
        }
        let after_open = &rest[open + 2..];
        let (trim_left, body_start) = match after_open.strip_prefix("- ") {
            Some(s) => (true, s),
            None => (false, after_open),
        };
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text.to_string()));
        }

        let close = body_start
            .find("}}")
            .ok_or_else(|| err("unclosed action"))?;
        let mut body = &body_start[..close];
        trim_next = false;
        if let Some(b) = body.strip_suffix(" -") {
            body = b;
            trim_next = true;
        }
        pieces.push(Piece::Action(body.trim().to_string()));
        rest = &body_start[close + 2..];
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        pieces.push(Piece::Text(text.to_string()));
    }
    Ok(pieces)
}

enum Terminator {
    Eof,
    End,
    Else,
}

fn parse_list(pieces: &[Piece], pos: &mut usize) -> Result<(Vec<Node>, Terminator)> {
    let mut nodes = Vec::new();

    while *pos < pieces.len() {
        let piece = &pieces[*pos];
        *pos += 1;
        match piece {
            Piece::Text(t) => nodes.push(Node::Text(t.clone())),
            Piece::Action(body) => {
                let tokens = lex(body)?;
                match tokens.first() {
                    Some(Token::Ident(k)) if k == "end" => return Ok((nodes, Terminator::End)),
                    Some(Token::Ident(k)) if k == "else" => {
                        return Ok((nodes, Terminator::Else))
                    }
                    Some(Token::Ident(k)) if k == "if" => {
                        let cond = parse_pipeline(&tokens[1..])?;
                        let (body, else_body) = parse_block(pieces, pos)?;
                        nodes.push(Node::If {
                            cond,
                            body,
                            else_body,
                        });
                    }
                    Some(Token::Ident(k)) if k == "range" => {
                        let (index_var, elem_var, over) = parse_range_header(&tokens[1..])?;
                        let (body, else_body) = parse_block(pieces, pos)?;
                        nodes.push(Node::Range {
                            index_var,
                            elem_var,
                            over,
                            body,
                            else_body,
                        });
                    }
                    _ => nodes.push(Node::Action(parse_pipeline(&tokens)?)),
                }
            }
        }
    }

    Ok((nodes, Terminator::Eof))
}

/// Parse the body of a block action up to `{{end}}`, with optional `{{else}}`.
fn parse_block(pieces: &[Piece], pos: &mut usize) -> Result<(Vec<Node>, Vec<Node>)> {
    let (body, term) = parse_list(pieces, pos)?;
    match term {
        Terminator::End => Ok((body, Vec::new())),
        Terminator::Else => {
            let (else_body, term) = parse_list(pieces, pos)?;
            match term {
                Terminator::End => Ok((body, else_body)),
                _ => Err(err("missing {{end}} after {{else}}")),
            }
        }
        Terminator::Eof => Err(err("missing {{end}}")),
    }
}

fn parse_range_header(tokens: &[Token]) -> Result<(Option<String>, Option<String>, Pipeline)> {
    match tokens {
        [Token::Var(i), Token::Comma, Token::Var(e), Token::Declare, rest @ ..] => Ok((
            Some(i.clone()),
            Some(e.clone()),
            parse_pipeline(rest)?,
        )),
        [Token::Var(e), Token::Declare, rest @ ..] => {
            Ok((None, Some(e.clone()), parse_pipeline(rest)?))
        }
        rest => Ok((None, None, parse_pipeline(rest)?)),
    }
}

fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline> {
    let (decl, tokens) = match tokens {
        [Token::Var(v), Token::Declare, rest @ ..] => (Some(v.clone()), rest),
        _ => (None, tokens),
    };

    let mut commands = Vec::new();
    let mut pos = 0;
    loop {
        let (cmd, next) = parse_command(tokens, pos)?;
        commands.push(cmd);
        pos = next;
        match tokens.get(pos) {
            Some(Token::Pipe) => pos += 1,
            None => break,
            Some(t) => return Err(Test161Error::Expression(format!("unexpected token {:?}", t))),
        }
    }

    Ok(Pipeline { decl, commands })
}

/// Parse one command starting at `pos`; returns the index after it.
fn parse_command(tokens: &[Token], mut pos: usize) -> Result<(Command, usize)> {
    let mut args = Vec::new();
    while let Some(tok) = tokens.get(pos) {
        let arg = match tok {
            Token::Pipe | Token::RParen => break,
            Token::Int(i) => Arg::Int(*i),
            Token::Str(s) => Arg::Str(s.clone()),
            Token::Field(f) => Arg::Field(f.clone()),
            Token::Dot => Arg::Dot,
            Token::Var(v) => Arg::Var(v.clone()),
            Token::Ident(name) => {
                if !is_function(name) {
                    return Err(Test161Error::Expression(format!(
                        "function {:?} not defined",
                        name
                    )));
                }
                Arg::Ident(name.clone())
            }
            Token::LParen => {
                let close = matching_paren(tokens, pos)?;
                let sub = parse_pipeline(&tokens[pos + 1..close])?;
                pos = close;
                Arg::Sub(sub)
            }
            Token::Declare | Token::Comma => {
                return Err(Test161Error::Expression(format!("unexpected token {:?}", tok)))
            }
        };
        args.push(arg);
        pos += 1;
    }

    if args.is_empty() {
        return Err(err("missing value for command"));
    }
    // Nested bare function names must be parenthesized.
    if let Some(Arg::Ident(name)) = args[1..].iter().find(|a| matches!(a, Arg::Ident(_))) {
        return Err(Test161Error::Expression(format!(
            "function {} used as an argument; wrap it in parentheses",
            name
        )));
    }
    Ok((Command { args }, pos))
}

fn matching_paren(tokens: &[Token], open: usize) -> Result<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(err("unclosed parenthesis"))
}

fn lex(body: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let ident_char = |c: char| c.is_ascii_alphanumeric() || c == '_';

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
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
            ':' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Declare);
                i += 2;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string")),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(&other) => other,
                                None => return Err(err("unterminated string")),
                            };
                            s.push(escaped);
                            i += 2;
                        }
                        Some(&other) => {
                            s.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '.' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && ident_char(chars[j]) {
                    j += 1;
                }
                if j == start {
                    tokens.push(Token::Dot);
                } else {
                    tokens.push(Token::Field(chars[start..j].iter().collect()));
                }
                i = j;
            }
            '$' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && ident_char(chars[j]) {
                    j += 1;
                }
                tokens.push(Token::Var(chars[start..j].iter().collect()));
                i = j;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())) => {
                let start = i;
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                let n = text
                    .parse::<i64>()
                    .map_err(|_| Test161Error::Expression(format!("bad number {}", text)))?;
                tokens.push(Token::Int(n));
                i = j;
            }
            c if ident_char(c) => {
                let start = i;
                let mut j = i;
                while j < chars.len() && ident_char(chars[j]) {
                    j += 1;
                }
                tokens.push(Token::Ident(chars[start..j].iter().collect()));
                i = j;
            }
            other => {
                return Err(Test161Error::Expression(format!(
                    "unexpected character {:?} in action",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}
