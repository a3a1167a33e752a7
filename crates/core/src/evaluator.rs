//! Equation correctness checks.
//!
//! [`EquationEvaluator`] is the contract the evaluation runner calls once per
//! example. [`PrefixEvaluator`] implements it for prefix-order equations over
//! an output symbol table, with `NUM_k` placeholders resolved through the
//! example's number list.

use mwp_common::{DatasetMeta, BRIDGE_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

/// Absolute tolerance when comparing equation values.
const VALUE_TOLERANCE: f64 = 1e-4;

// ── Verdict ─────────────────────────────────────────────────────────────────

/// Outcome of checking one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub value_correct: bool,
    pub equation_correct: bool,
    /// Values of the predicted equation(s); empty when not evaluable.
    pub predicted_values: Vec<f64>,
    pub predicted_equation: Vec<String>,
}

impl Verdict {
    /// An equation match always counts as a value match.
    pub fn new(
        value_correct: bool,
        equation_correct: bool,
        predicted_values: Vec<f64>,
        predicted_equation: Vec<String>,
    ) -> Self {
        Self {
            value_correct: value_correct || equation_correct,
            equation_correct,
            predicted_values,
            predicted_equation,
        }
    }
}

/// Per-example correctness check used by the evaluation runner.
pub trait EquationEvaluator {
    /// Single equation given as output-vocabulary indices.
    fn result(&self, prediction: &[u32], target: &[u32], num_list: &[String], num_stack: &[Vec<usize>]) -> Verdict;

    /// Several equations separated by `<BRG>`.
    fn result_multi(&self, prediction: &[u32], target: &[u32], num_list: &[String], num_stack: &[Vec<usize>]) -> Verdict;

    /// Infix equation text produced by a source-level model.
    fn eval_source(&self, prediction: &str, target: &str, num_list: &[String], num_stack: &[Vec<usize>]) -> Verdict;
}

// ── PrefixEvaluator ─────────────────────────────────────────────────────────

/// Evaluator for prefix-order output sequences.
#[derive(Debug, Clone)]
pub struct PrefixEvaluator {
    idx2symbol: Vec<String>,
}

impl PrefixEvaluator {
    pub fn new(meta: &DatasetMeta) -> Self {
        Self {
            idx2symbol: meta.out_idx2symbol.clone(),
        }
    }

    /// Indices → symbols, cut at `<EOS>`/`<PAD>`, with `<UNK>` replaced by the
    /// first candidate of the matching number-stack entry.
    fn symbols(&self, ids: &[u32], num_stack: &[Vec<usize>]) -> Vec<String> {
        let mut stack = num_stack.iter();
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let symbol = self
                .idx2symbol
                .get(id as usize)
                .map_or(UNK_TOKEN, String::as_str);
            if symbol == EOS_TOKEN || symbol == PAD_TOKEN {
                break;
            }
            if symbol == UNK_TOKEN {
                match stack.next().and_then(|candidates| candidates.first()) {
                    Some(pos) => out.push(format!("NUM_{pos}")),
                    None => out.push(UNK_TOKEN.to_string()),
                }
                continue;
            }
            out.push(symbol.to_string());
        }
        out
    }
}

impl EquationEvaluator for PrefixEvaluator {
    fn result(&self, prediction: &[u32], target: &[u32], num_list: &[String], num_stack: &[Vec<usize>]) -> Verdict {
        let pred = self.symbols(prediction, num_stack);
        let gold = self.symbols(target, num_stack);
        let pred_value = eval_prefix(&pred, num_list);
        let gold_value = eval_prefix(&gold, num_list);
        let value_correct = matches!((pred_value, gold_value), (Some(p), Some(g)) if close(p, g));
        Verdict::new(value_correct, !pred.is_empty() && pred == gold, pred_value.into_iter().collect(), pred)
    }

    fn result_multi(&self, prediction: &[u32], target: &[u32], num_list: &[String], num_stack: &[Vec<usize>]) -> Verdict {
        let pred = self.symbols(prediction, num_stack);
        let gold = self.symbols(target, num_stack);
        let pred_values = eval_segments(&pred, num_list);
        let gold_values = eval_segments(&gold, num_list);
        let value_correct = match (&pred_values, &gold_values) {
            (Some(p), Some(g)) => !p.is_empty() && same_values(p, g),
            _ => false,
        };
        Verdict::new(value_correct, !pred.is_empty() && pred == gold, pred_values.unwrap_or_default(), pred)
    }

    fn eval_source(&self, prediction: &str, target: &str, num_list: &[String], _num_stack: &[Vec<usize>]) -> Verdict {
        let pred = lex_infix(prediction);
        let gold = lex_infix(target);
        let pred_value = infix_to_prefix(&pred).and_then(|p| eval_prefix(&p, num_list));
        let gold_value = infix_to_prefix(&gold).and_then(|p| eval_prefix(&p, num_list));
        let value_correct = matches!((pred_value, gold_value), (Some(p), Some(g)) if close(p, g));
        Verdict::new(value_correct, !pred.is_empty() && pred == gold, pred_value.into_iter().collect(), pred)
    }
}

// ── Arithmetic ──────────────────────────────────────────────────────────────

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < VALUE_TOLERANCE
}

fn same_values(a: &[f64], b: &[f64]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    a.iter().zip(&b).all(|(x, y)| close(*x, *y))
}

fn is_operator(symbol: &str) -> bool {
    matches!(symbol, "+" | "-" | "*" | "/" | "^")
}

fn apply(op: &str, a: f64, b: f64) -> Option<f64> {
    let v = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" if b != 0.0 => a / b,
        "^" => a.powf(b),
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Numeric value of a leaf: `NUM_k`, a decimal, a percentage or a fraction.
fn leaf_value(symbol: &str, num_list: &[String]) -> Option<f64> {
    if let Some(k) = symbol.strip_prefix("NUM_") {
        let k: usize = k.parse().ok()?;
        return parse_number(num_list.get(k)?);
    }
    parse_number(symbol)
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some(pct) = text.strip_suffix('%') {
        return pct.parse::<f64>().ok().map(|v| v / 100.0);
    }
    if let Some((num, den)) = text.split_once('/') {
        let (n, d) = (num.parse::<f64>().ok()?, den.parse::<f64>().ok()?);
        return (d != 0.0).then(|| n / d);
    }
    text.parse().ok()
}

/// Evaluate a prefix expression; `None` when malformed or undefined.
fn eval_prefix(symbols: &[String], num_list: &[String]) -> Option<f64> {
    let mut stack: Vec<f64> = Vec::new();
    for symbol in symbols.iter().rev() {
        if is_operator(symbol) {
            let a = stack.pop()?;
            let b = stack.pop()?;
            stack.push(apply(symbol, a, b)?);
        } else {
            stack.push(leaf_value(symbol, num_list)?);
        }
    }
    match stack.as_slice() {
        [v] => Some(*v),
        _ => None,
    }
}

fn eval_segments(symbols: &[String], num_list: &[String]) -> Option<Vec<f64>> {
    symbols
        .split(|s| s == BRIDGE_TOKEN)
        .filter(|seg| !seg.is_empty())
        .map(|seg| eval_prefix(seg, num_list))
        .collect()
}

// ── Infix text ──────────────────────────────────────────────────────────────

fn lex_infix(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_whitespace() || is_operator(&c.to_string()) || c == '(' || c == ')' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if !c.is_whitespace() {
                tokens.push(c.to_string());
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn precedence(op: &str) -> u8 {
    match op {
        "+" | "-" => 1,
        "*" | "/" => 2,
        _ => 3,
    }
}

/// Shunting-yard to postfix, then reversed into prefix order.
fn infix_to_prefix(tokens: &[String]) -> Option<Vec<String>> {
    let mut output: Vec<Vec<String>> = Vec::new();
    let mut ops: Vec<String> = Vec::new();

    fn reduce(output: &mut Vec<Vec<String>>, op: String) -> Option<()> {
        let b = output.pop()?;
        let a = output.pop()?;
        let mut expr = vec![op];
        expr.extend(a);
        expr.extend(b);
        output.push(expr);
        Some(())
    }

    for token in tokens {
        match token.as_str() {
            "(" => ops.push(token.clone()),
            ")" => loop {
                let op = ops.pop()?;
                if op == "(" {
                    break;
                }
                reduce(&mut output, op)?;
            },
            t if is_operator(t) => {
                while let Some(top) = ops.last() {
                    let right_assoc = t == "^";
                    let pops = top != "(" && (precedence(top) > precedence(t) || (!right_assoc && precedence(top) == precedence(t)));
                    if !pops {
                        break;
                    }
                    let op = ops.pop()?;
                    reduce(&mut output, op)?;
                }
                ops.push(token.clone());
            }
            _ => output.push(vec![token.clone()]),
        }
    }
    while let Some(op) = ops.pop() {
        if op == "(" {
            return None;
        }
        reduce(&mut output, op)?;
    }
    match output.len() {
        1 => output.pop(),
        _ => None,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
