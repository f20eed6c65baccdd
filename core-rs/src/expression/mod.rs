//! Template expression language
//!
//! A small, sandboxed text-template evaluator used to synthesize command
//! arguments and expected output. The surface syntax is the familiar
//! `{{ ... }}` action form:
//!
//! ```text
//! argc: {{add 1 .ArgLen}}
//! {{range $i, $e := .Args}}argv[{{add $i 1}}]: {{$e}}
//! {{end}}
//! {{$n := index .Args 0 | atoi}}{{factorial $n}}
//! ```
//!
//! Supported: text, `{{pipeline}}`, `{{$x := pipeline}}`, pipes (`|` passes
//! the left value as the last argument), parenthesized sub-pipelines,
//! `{{range [$i,] [$e :=] pipeline}}...{{else}}...{{end}}`,
//! `{{if pipeline}}...{{else}}...{{end}}`, trim markers `{{-` and `-}}`,
//! fields `.Args` / `.ArgLen`, dot, `$variables`, integers and quoted strings.
//!
//! Evaluation has no side effects other than drawing from the caller's RNG.

mod functions;
mod parser;

pub use functions::{is_function, FUNCTIONS};
pub use parser::{parse, Arg, Command, Node, Pipeline};

use crate::errors::{Result, Test161Error};
use rand::rngs::StdRng;
use std::fmt;

/// Runtime value of an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Nil,
}

impl Value {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Str(s) => s.trim().parse::<i64>().map_err(|_| {
                Test161Error::Expression(format!("expected integer, got {:?}", s))
            }),
            other => Err(Test161Error::Expression(format!(
                "expected integer, got {}",
                other
            ))),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Nil => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Nil => write!(f, "<no value>"),
        }
    }
}

/// Data visible to a template as `.Args` and `.ArgLen`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateData {
    pub args: Vec<String>,
    pub arg_len: usize,
}

impl TemplateData {
    pub fn new(args: Vec<String>) -> Self {
        let arg_len = args.len();
        Self { args, arg_len }
    }

    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "Args" => Ok(Value::List(
                self.args.iter().cloned().map(Value::Str).collect(),
            )),
            "ArgLen" => Ok(Value::Int(self.arg_len as i64)),
            other => Err(Test161Error::Expression(format!(
                "unknown field .{}",
                other
            ))),
        }
    }
}

/// Parse and evaluate `src` against `data`
pub fn render(src: &str, data: &TemplateData, rng: &mut StdRng) -> Result<String> {
    let nodes = parse(src)?;
    let mut eval = Evaluator {
        data,
        rng,
        vars: Vec::new(),
        dot: Vec::new(),
    };
    let mut out = String::new();
    eval.walk(&nodes, &mut out)?;
    Ok(out)
}

struct Evaluator<'a> {
    data: &'a TemplateData,
    rng: &'a mut StdRng,
    vars: Vec<(String, Value)>,
    dot: Vec<Value>,
}

impl<'a> Evaluator<'a> {
    fn walk(&mut self, nodes: &[Node], out: &mut String) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Action(p) => {
                    let v = self.pipeline(p)?;
                    if p.decl.is_none() {
                        out.push_str(&v.to_string());
                    }
                }
                Node::If {
                    cond,
                    body,
                    else_body,
                } => {
                    let scope = self.vars.len();
                    let taken = self.pipeline(cond)?.truthy();
                    if taken {
                        self.walk(body, out)?;
                    } else {
                        self.walk(else_body, out)?;
                    }
                    self.vars.truncate(scope);
                }
                Node::Range {
                    index_var,
                    elem_var,
                    over,
                    body,
                    else_body,
                } => {
                    let scope = self.vars.len();
                    let items = match self.pipeline(over)? {
                        Value::List(items) => items,
                        Value::Int(n) => (0..n.max(0)).map(Value::Int).collect(),
                        Value::Nil => Vec::new(),
                        other => {
                            return Err(Test161Error::Expression(format!(
                                "range over non-list value {}",
                                other
                            )))
                        }
                    };
                    if items.is_empty() {
                        self.walk(else_body, out)?;
                    }
                    for (i, item) in items.into_iter().enumerate() {
                        let iter_scope = self.vars.len();
                        if let Some(name) = index_var {
                            self.vars.push((name.clone(), Value::Int(i as i64)));
                        }
                        if let Some(name) = elem_var {
                            self.vars.push((name.clone(), item.clone()));
                        }
                        self.dot.push(item);
                        let res = self.walk(body, out);
                        self.dot.pop();
                        self.vars.truncate(iter_scope);
                        res?;
                    }
                    self.vars.truncate(scope);
                }
            }
        }
        Ok(())
    }

    fn pipeline(&mut self, p: &Pipeline) -> Result<Value> {
        let mut last: Option<Value> = None;
        for cmd in &p.commands {
            last = Some(self.command(cmd, last.take())?);
        }
        let value = last.unwrap_or(Value::Nil);
        if let Some(name) = &p.decl {
            self.vars.push((name.clone(), value.clone()));
        }
        Ok(value)
    }

    fn command(&mut self, cmd: &Command, piped: Option<Value>) -> Result<Value> {
        match cmd.args.first() {
            Some(Arg::Ident(name)) => {
                let mut args = Vec::with_capacity(cmd.args.len());
                for a in &cmd.args[1..] {
                    args.push(self.arg(a)?);
                }
                if let Some(v) = piped {
                    args.push(v);
                }
                functions::call(name, args, self.rng)
            }
            Some(first) => {
                if cmd.args.len() > 1 || piped.is_some() {
                    return Err(Test161Error::Expression(
                        "can't give arguments to a non-function".to_string(),
                    ));
                }
                self.arg(first)
            }
            None => Err(Test161Error::Expression("empty command".to_string())),
        }
    }

    fn arg(&mut self, a: &Arg) -> Result<Value> {
        match a {
            Arg::Int(i) => Ok(Value::Int(*i)),
            Arg::Str(s) => Ok(Value::Str(s.clone())),
            Arg::Field(name) => self.data.field(name),
            Arg::Dot => Ok(self.dot.last().cloned().unwrap_or(Value::Nil)),
            Arg::Var(name) => self
                .vars
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Test161Error::Expression(format!("undefined variable ${}", name))),
            Arg::Ident(name) => functions::call(name, Vec::new(), self.rng),
            Arg::Sub(p) => {
                let scope = self.vars.len();
                let v = self.pipeline(p);
                self.vars.truncate(scope);
                v
            }
        }
    }
}
