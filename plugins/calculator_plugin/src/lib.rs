//! Arithmetic plugin.
//!
//! Serves the `calculation` intent. A request is evaluated from, in order:
//!
//! * an `expression` parameter, e.g. `"2 + 3 * (4 - 1)"`;
//! * `numbers` plus `operators` parameters, folded left to right;
//!
//! ```jsonc
//! { "expression": "12 / 4" }
//! { "numbers": [20, 50], "operators": ["percentage"] }
//! ```

use assistant_core::{
    HandlerError, HandlerOutput, HandlerRequest, HandlerSpec, Plugin, PluginContext,
    PluginDescriptor,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const PLUGIN_NAME: &str = "calculator";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
    Percentage,
}

impl Op {
    fn parse(name: &str) -> Result<Self, HandlerError> {
        match name {
            "add" => Ok(Op::Add),
            "subtract" => Ok(Op::Subtract),
            "multiply" => Ok(Op::Multiply),
            "divide" => Ok(Op::Divide),
            "percentage" => Ok(Op::Percentage),
            other => Err(HandlerError::invalid_input(format!("unknown operator `{other}`"))),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Subtract => "-",
            Op::Multiply => "*",
            Op::Divide => "/",
            Op::Percentage => "% of",
        }
    }

    fn apply(self, lhs: f64, rhs: f64) -> Result<f64, HandlerError> {
        match self {
            Op::Add => Ok(lhs + rhs),
            Op::Subtract => Ok(lhs - rhs),
            Op::Multiply => Ok(lhs * rhs),
            Op::Divide if rhs == 0.0 => Err(HandlerError::invalid_input("division by zero")),
            Op::Divide => Ok(lhs / rhs),
            Op::Percentage => Ok(lhs / 100.0 * rhs),
        }
    }
}

/// Recursive-descent evaluator over `+ - * /`, parentheses and unary minus.
struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    depth: usize,
}

const MAX_NESTING: usize = 32;

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            depth: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.peek().copied()
    }

    fn expression(&mut self) -> Result<f64, HandlerError> {
        let mut value = self.term()?;
        while let Some(c @ ('+' | '-')) = self.peek() {
            self.chars.next();
            let rhs = self.term()?;
            value = if c == '+' { Op::Add } else { Op::Subtract }.apply(value, rhs)?;
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, HandlerError> {
        let mut value = self.factor()?;
        while let Some(c @ ('*' | '/')) = self.peek() {
            self.chars.next();
            let rhs = self.factor()?;
            value = if c == '*' { Op::Multiply } else { Op::Divide }.apply(value, rhs)?;
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, HandlerError> {
        match self.peek() {
            Some('-') => {
                self.chars.next();
                Ok(-self.factor()?)
            }
            Some('(') => {
                self.chars.next();
                self.depth += 1;
                if self.depth > MAX_NESTING {
                    return Err(HandlerError::invalid_input("expression nests too deeply"));
                }
                let value = self.expression()?;
                if self.peek() != Some(')') {
                    return Err(HandlerError::invalid_input("missing closing parenthesis"));
                }
                self.chars.next();
                self.depth -= 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) => Err(HandlerError::invalid_input(format!("unexpected `{c}` in expression"))),
            None => Err(HandlerError::invalid_input("expression ends unexpectedly")),
        }
    }

    fn number(&mut self) -> Result<f64, HandlerError> {
        let mut literal = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                literal.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        literal
            .parse()
            .map_err(|_| HandlerError::invalid_input(format!("bad number `{literal}`")))
    }
}

pub fn evaluate(expression: &str) -> Result<f64, HandlerError> {
    let mut parser = Parser::new(expression);
    let value = parser.expression()?;
    match parser.peek() {
        None => Ok(value),
        Some(c) => Err(HandlerError::invalid_input(format!("unexpected `{c}` in expression"))),
    }
}

fn fold(numbers: &[f64], operators: &[Op]) -> Result<(f64, String), HandlerError> {
    let (first, rest) = numbers
        .split_first()
        .ok_or_else(|| HandlerError::invalid_input("no numbers to calculate with"))?;
    if rest.is_empty() {
        return Err(HandlerError::invalid_input("need at least two numbers"));
    }
    if operators.is_empty() {
        return Err(HandlerError::invalid_input("no operation given"));
    }

    let mut value = *first;
    let mut shown = format_number(*first);
    for (i, rhs) in rest.iter().enumerate() {
        // a single operator applies to every number
        let op = operators.get(i).or(operators.last()).copied().unwrap_or(Op::Add);
        value = op.apply(value, *rhs)?;
        shown = format!("{shown} {} {}", op.symbol(), format_number(*rhs));
    }
    Ok((value, shown))
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let s = format!("{n:.6}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn numbers_param(request: &HandlerRequest) -> Result<Vec<f64>, HandlerError> {
    match request.param("numbers") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| HandlerError::invalid_input(format!("`{v}` is not a number")))
            })
            .collect(),
        Some(other) => Err(HandlerError::invalid_input(format!("numbers must be a list, got {other}"))),
        None => Ok(Vec::new()),
    }
}

fn operators_param(request: &HandlerRequest) -> Result<Vec<Op>, HandlerError> {
    match request.param("operators") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| Op::parse(v.as_str().unwrap_or_default()))
            .collect(),
        Some(Value::String(single)) => Ok(vec![Op::parse(single)?]),
        Some(other) => Err(HandlerError::invalid_input(format!("operators must be a list, got {other}"))),
        None => Ok(Vec::new()),
    }
}

async fn calculate(request: HandlerRequest, ctx: PluginContext) -> Result<HandlerOutput, HandlerError> {
    let (result, shown) = match request.param_str("expression") {
        Some(expression) => (evaluate(expression)?, expression.to_string()),
        None => fold(&numbers_param(&request)?, &operators_param(&request)?)?,
    };
    if !result.is_finite() {
        return Err(HandlerError::invalid_input("result is not a finite number"));
    }
    debug!("Calculated {} = {}", shown, result);

    ctx.storage().set("last_result", result, None)?;
    Ok(HandlerOutput::new(json!({ "result": result, "expression": shown }))
        .with_message(format!("{} = {}", shown, format_number(result))))
}

#[derive(Debug, Default)]
pub struct CalculatorPlugin;

impl CalculatorPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for CalculatorPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_NAME, env!("CARGO_PKG_VERSION"))
            .description(env!("CARGO_PKG_DESCRIPTION"))
            .author("assistant core")
            .handler(HandlerSpec::new("calculate", "calculation", calculate))
    }

    async fn initialize(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        info!("Calculator plugin initialized (namespace {})", ctx.storage().namespace());
        Ok(())
    }
}

/// Mandatory C-ABI entry-point so the platform can `dlopen` this plugin.
#[cfg_attr(feature = "dylib-export", no_mangle)]
#[allow(improper_ctypes_definitions)]
pub extern "C" fn create_plugin() -> *mut dyn Plugin {
    Box::into_raw(Box::new(CalculatorPlugin::new()))
}
