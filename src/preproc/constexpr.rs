use crate::diag::{Event, SharedSink};
use crate::preproc::macros::MacroTable;
use crate::token::Token;

/// Evaluates a controlling expression of `#if` or `#elif`.
///
/// The token sequence has already been macro-replaced except for the
/// operands of `defined`.  Any identifier left over evaluates to 0, as
/// 6.10.1p4 requires.
pub fn evaluate(toks: &[Token], table: &MacroTable, sink: &SharedSink) -> i64 {
    let mut parser = Parser {
        toks,
        idx: 0,
        table,
        sink,
    };
    parser.conditional()
}

struct Parser<'a> {
    toks: &'a [Token],
    idx: usize,
    table: &'a MacroTable,
    sink: &'a SharedSink,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.toks.get(self.idx)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let tok = self.toks.get(self.idx);
        if tok.is_some() {
            self.idx += 1;
        }
        tok
    }

    fn eat_value(&mut self, value: &str) -> bool {
        if self.peek().is_some_and(|t| t.value == value) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn conditional(&mut self) -> i64 {
        let cond = self.logical_or();
        if self.eat_value("?") {
            let then_val = self.conditional();
            self.eat_value(":");
            let else_val = self.conditional();
            return if cond != 0 { then_val } else { else_val };
        }
        cond
    }

    fn logical_or(&mut self) -> i64 {
        let mut lhs = self.logical_and();
        while self.eat_value("||") {
            let rhs = self.logical_and();
            lhs = i64::from(lhs != 0 || rhs != 0);
        }
        lhs
    }

    fn logical_and(&mut self) -> i64 {
        let mut lhs = self.inclusive_or();
        while self.eat_value("&&") {
            let rhs = self.inclusive_or();
            lhs = i64::from(lhs != 0 && rhs != 0);
        }
        lhs
    }

    fn inclusive_or(&mut self) -> i64 {
        let mut lhs = self.exclusive_or();
        while self.eat_value("|") {
            lhs |= self.exclusive_or();
        }
        lhs
    }

    fn exclusive_or(&mut self) -> i64 {
        let mut lhs = self.and();
        while self.eat_value("^") {
            lhs ^= self.and();
        }
        lhs
    }

    fn and(&mut self) -> i64 {
        let mut lhs = self.equality();
        while self.eat_value("&") {
            lhs &= self.equality();
        }
        lhs
    }

    fn equality(&mut self) -> i64 {
        let mut lhs = self.relational();
        loop {
            if self.eat_value("==") {
                lhs = i64::from(lhs == self.relational());
            } else if self.eat_value("!=") {
                lhs = i64::from(lhs != self.relational());
            } else {
                return lhs;
            }
        }
    }

    fn relational(&mut self) -> i64 {
        let mut lhs = self.shift();
        loop {
            if self.eat_value("<=") {
                lhs = i64::from(lhs <= self.shift());
            } else if self.eat_value(">=") {
                lhs = i64::from(lhs >= self.shift());
            } else if self.eat_value("<") {
                lhs = i64::from(lhs < self.shift());
            } else if self.eat_value(">") {
                lhs = i64::from(lhs > self.shift());
            } else {
                return lhs;
            }
        }
    }

    fn shift(&mut self) -> i64 {
        let mut lhs = self.additive();
        loop {
            if self.eat_value("<<") {
                lhs = lhs.wrapping_shl(self.additive() as u32);
            } else if self.eat_value(">>") {
                lhs = lhs.wrapping_shr(self.additive() as u32);
            } else {
                return lhs;
            }
        }
    }

    fn additive(&mut self) -> i64 {
        let mut lhs = self.multiplicative();
        loop {
            if self.eat_value("+") {
                lhs = lhs.wrapping_add(self.multiplicative());
            } else if self.eat_value("-") {
                lhs = lhs.wrapping_sub(self.multiplicative());
            } else {
                return lhs;
            }
        }
    }

    fn multiplicative(&mut self) -> i64 {
        let mut lhs = self.unary();
        loop {
            if self.eat_value("*") {
                lhs = lhs.wrapping_mul(self.unary());
            } else if self.eat_value("/") {
                let rhs = self.unary();
                lhs = self.checked_div(lhs, rhs, i64::wrapping_div);
            } else if self.eat_value("%") {
                let rhs = self.unary();
                lhs = self.checked_div(lhs, rhs, i64::wrapping_rem);
            } else {
                return lhs;
            }
        }
    }

    fn checked_div(&self, lhs: i64, rhs: i64, op: fn(i64, i64) -> i64) -> i64 {
        if rhs == 0 {
            if let Some(tok) = self.toks.first() {
                self.sink.notify(Event::DivisionByZeroInExpr {
                    loc: tok.location.clone(),
                });
            }
            0
        } else {
            op(lhs, rhs)
        }
    }

    fn unary(&mut self) -> i64 {
        if self.eat_value("+") {
            return self.unary();
        }
        if self.eat_value("-") {
            return self.unary().wrapping_neg();
        }
        if self.eat_value("!") {
            return i64::from(self.unary() == 0);
        }
        if self.eat_value("~") {
            return !self.unary();
        }
        if self.peek().is_some_and(|t| t.value == "defined") {
            self.idx += 1;
            return self.defined_operator();
        }
        self.primary()
    }

    fn defined_operator(&mut self) -> i64 {
        let parenthesized = self.eat_value("(");
        let id = match self.peek() {
            Some(tok) if starts_like_identifier(&tok.value) => {
                self.idx += 1;
                tok
            }
            other => {
                let loc = other
                    .or_else(|| self.toks.last())
                    .map(|t| t.location.clone());
                if let Some(loc) = loc {
                    self.sink.notify(Event::IllformedDefinedOp { loc });
                }
                return 0;
            }
        };
        if parenthesized && !self.eat_value(")") {
            self.sink.notify(Event::IllformedDefinedOp {
                loc: id.location.clone(),
            });
        }
        i64::from(self.table.lookup(&id.value).is_some())
    }

    fn primary(&mut self) -> i64 {
        if self.eat_value("(") {
            let value = self.conditional();
            self.eat_value(")");
            return value;
        }
        let Some(tok) = self.bump() else { return 0 };
        let value = &tok.value;
        if let Some(v) = parse_integer(value) {
            return v;
        }
        if let Some(v) = parse_char_constant(value) {
            return v;
        }
        if starts_like_identifier(value) {
            self.sink.notify(Event::UndefinedMacroInExpr {
                name: value.clone(),
                loc: tok.location.clone(),
            });
        }
        0
    }
}

fn starts_like_identifier(value: &str) -> bool {
    value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

fn parse_integer(value: &str) -> Option<i64> {
    let digits = value.trim_end_matches(['u', 'U', 'l', 'L']);
    if !digits.as_bytes().first().is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2)
    } else if digits.len() > 1 && digits.starts_with('0') && digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        u64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<u64>()
    };
    parsed.ok().map(|v| v as i64)
}

fn parse_char_constant(value: &str) -> Option<i64> {
    let body = value
        .strip_prefix('L')
        .or_else(|| value.strip_prefix('l'))
        .unwrap_or(value);
    let body = body.strip_prefix('\'')?.strip_suffix('\'')?;
    if let Some(esc) = body.strip_prefix('\\') {
        return Some(escape_value(esc));
    }
    body.chars().next().map(|c| c as i64)
}

/// Value of one escape sequence, without the leading backslash.
fn escape_value(esc: &str) -> i64 {
    match esc {
        "'" => '\'' as i64,
        "\"" => '"' as i64,
        "?" => '?' as i64,
        "\\" => '\\' as i64,
        "a" => 0x07,
        "b" => 0x08,
        "f" => 0x0c,
        "n" => '\n' as i64,
        "r" => '\r' as i64,
        "t" => '\t' as i64,
        "v" => 0x0b,
        _ => {
            if let Some(hex) = esc.strip_prefix('x').or_else(|| esc.strip_prefix('X')) {
                i64::from_str_radix(hex, 16).unwrap_or(0)
            } else if let Some(uni) = esc.strip_prefix('u').or_else(|| esc.strip_prefix('U')) {
                i64::from_str_radix(uni, 16).unwrap_or(0)
            } else if esc.bytes().all(|b| (b'0'..=b'7').contains(&b)) && !esc.is_empty() {
                i64::from_str_radix(esc, 8).unwrap_or(0)
            } else {
                0
            }
        }
    }
}
