//! `screen -c` script grammar.
//!
//! A script is a semicolon-separated list of statements:
//!
//! ```text
//! DECLARE x 10; ADD x x 5; PRINT("x is " + x); SLEEP 3;
//! WRITE 0x40 x; READ y 0x40
//! ```
//!
//! Addresses are hexadecimal with an optional `0x` prefix. PRINT takes a
//! parenthesized expression: a quoted literal, a bare variable, or
//! `"literal" + variable`. FOR is rejected here; loops only come from the
//! generator.

use std::sync::OnceLock;

use regex::Regex;

use crate::instruction::{Instruction, Operand};
use types::{SimError, SimResult};

/// `"message"`, `"message" + var`, or `var`, anchored.
fn print_regex() -> &'static Regex {
    static PRINT: OnceLock<Regex> = OnceLock::new();
    PRINT.get_or_init(|| {
        Regex::new(r#"^\s*(?:"(?P<msg>[^"]*)"(?:\s*\+\s*(?P<var>[A-Za-z_]\w*))?|(?P<only>[A-Za-z_]\w*))\s*$"#)
            .expect("print grammar regex")
    })
}

/// Parses the full script into instructions, rejecting the first bad
/// statement with a description the REPL can show verbatim.
pub fn parse_script(script: &str) -> SimResult<Vec<Instruction>> {
    let mut instructions = Vec::new();
    for statement in split_statements(script) {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        instructions.push(
            parse_statement(statement)
                .map_err(|e| match e {
                    SimError::InvalidScript(msg) => {
                        SimError::InvalidScript(format!("{statement:?}: {msg}"))
                    }
                    other => other,
                })?,
        );
    }
    Ok(instructions)
}

/// Splits on `;` outside of double quotes.
fn split_statements(script: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, ch) in script.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&script[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&script[start..]);
    parts
}

fn parse_statement(statement: &str) -> SimResult<Instruction> {
    let (command, rest) = split_command(statement);
    match command.to_ascii_uppercase().as_str() {
        "PRINT" => parse_print(rest),
        "DECLARE" => {
            let mut tokens = rest.split_whitespace();
            let var = required(tokens.next(), "variable name")?.to_string();
            let value = parse_u16(required(tokens.next(), "value")?)?;
            expect_exhausted(tokens)?;
            Ok(Instruction::Declare { var, value })
        }
        "SLEEP" => {
            let mut tokens = rest.split_whitespace();
            let ticks = required(tokens.next(), "duration")?
                .parse::<u8>()
                .map_err(|_| SimError::InvalidScript("SLEEP duration must be 0-255".into()))?;
            expect_exhausted(tokens)?;
            Ok(Instruction::Sleep { ticks })
        }
        op @ ("ADD" | "SUB") => {
            let mut tokens = rest.split_whitespace();
            let dest = required(tokens.next(), "destination")?.to_string();
            let lhs = Operand::from_token(required(tokens.next(), "lhs operand")?);
            let rhs = Operand::from_token(required(tokens.next(), "rhs operand")?);
            expect_exhausted(tokens)?;
            if op == "ADD" {
                Ok(Instruction::Add { dest, lhs, rhs })
            } else {
                Ok(Instruction::Sub { dest, lhs, rhs })
            }
        }
        "WRITE" => {
            let mut tokens = rest.split_whitespace();
            let addr = parse_hex_address(required(tokens.next(), "address")?)?;
            let value = Operand::from_token(required(tokens.next(), "value")?);
            expect_exhausted(tokens)?;
            Ok(Instruction::Write { addr, value })
        }
        "READ" => {
            let mut tokens = rest.split_whitespace();
            let var = required(tokens.next(), "variable name")?.to_string();
            let addr = parse_hex_address(required(tokens.next(), "address")?)?;
            expect_exhausted(tokens)?;
            Ok(Instruction::Read { var, addr })
        }
        "FOR" => Err(SimError::InvalidScript(
            "FOR loops are not supported in scripts".into(),
        )),
        other => Err(SimError::InvalidScript(format!("unknown instruction {other}"))),
    }
}

/// Splits the leading command word from the remainder. `PRINT("x")` has no
/// separating space, so this cannot simply split on whitespace.
fn split_command(statement: &str) -> (&str, &str) {
    let end = statement
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(statement.len());
    (&statement[..end], &statement[end..])
}

fn parse_print(rest: &str) -> SimResult<Instruction> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| {
            SimError::InvalidScript("PRINT must be of the form PRINT(\"text\" [+ var])".into())
        })?;

    let captures = print_regex()
        .captures(inner)
        .ok_or_else(|| SimError::InvalidScript("unrecognized PRINT expression".into()))?;

    if let Some(only) = captures.name("only") {
        return Ok(Instruction::Print {
            message: String::new(),
            var: Some(only.as_str().to_string()),
        });
    }
    Ok(Instruction::Print {
        message: captures["msg"].to_string(),
        var: captures.name("var").map(|m| m.as_str().to_string()),
    })
}

fn parse_hex_address(token: &str) -> SimResult<u32> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16)
        .map_err(|_| SimError::InvalidScript(format!("invalid hex address {token}")))
}

fn parse_u16(token: &str) -> SimResult<u16> {
    token
        .parse::<u16>()
        .map_err(|_| SimError::InvalidScript(format!("value {token} is not a 16-bit integer")))
}

fn required<'a>(token: Option<&'a str>, what: &str) -> SimResult<&'a str> {
    token.ok_or_else(|| SimError::InvalidScript(format!("missing {what}")))
}

fn expect_exhausted<'a>(mut tokens: impl Iterator<Item = &'a str>) -> SimResult<()> {
    match tokens.next() {
        None => Ok(()),
        Some(extra) => Err(SimError::InvalidScript(format!("unexpected token {extra}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_script() {
        let script = r#"DECLARE x 65530; ADD x x 10; PRINT("x=" + x)"#;
        let program = parse_script(script).unwrap();
        assert_eq!(program.len(), 3);
        assert_eq!(
            program[2],
            Instruction::Print { message: "x=".into(), var: Some("x".into()) }
        );
    }

    #[test]
    fn print_accepts_literal_variable_and_concatenation() {
        assert_eq!(
            parse_script(r#"PRINT("hello")"#).unwrap()[0],
            Instruction::Print { message: "hello".into(), var: None }
        );
        assert_eq!(
            parse_script("PRINT(x)").unwrap()[0],
            Instruction::Print { message: String::new(), var: Some("x".into()) }
        );
        assert_eq!(
            parse_script(r#"PRINT("v: " + var_1)"#).unwrap()[0],
            Instruction::Print { message: "v: ".into(), var: Some("var_1".into()) }
        );
    }

    #[test]
    fn semicolons_inside_print_messages_do_not_split() {
        let program = parse_script(r#"PRINT("a;b"); SLEEP 1"#).unwrap();
        assert_eq!(program.len(), 2);
        assert_eq!(
            program[0],
            Instruction::Print { message: "a;b".into(), var: None }
        );
    }

    #[test]
    fn addresses_are_hexadecimal() {
        assert_eq!(
            parse_script("WRITE 0x40 42").unwrap()[0],
            Instruction::Write { addr: 0x40, value: Operand::Literal(42) }
        );
        // No prefix still reads as hex, like the address grammar documents.
        assert_eq!(
            parse_script("READ y 100").unwrap()[0],
            Instruction::Read { var: "y".into(), addr: 0x100 }
        );
    }

    #[test]
    fn rejections_are_user_errors() {
        assert!(matches!(parse_script("FOR 3 x"), Err(SimError::InvalidScript(_))));
        assert!(matches!(parse_script("DECLARE x 99999"), Err(SimError::InvalidScript(_))));
        assert!(matches!(parse_script("PRINT 'x'"), Err(SimError::InvalidScript(_))));
        assert!(matches!(parse_script("NOP"), Err(SimError::InvalidScript(_))));
    }

    #[test]
    fn empty_statements_are_skipped() {
        let program = parse_script("SLEEP 1;;   ;SLEEP 2;").unwrap();
        assert_eq!(program.len(), 2);
    }
}
