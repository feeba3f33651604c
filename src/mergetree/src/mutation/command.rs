// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Declarative mutation commands and their stable text form.
//!
//! The text form is what gets persisted in mutation entry files, so parsing
//! must round-trip exactly what [std::fmt::Display] produces.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{BadArgumentsSnafu, Error, Result};

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn symbol(&self) -> &'static str {
        match self {
            Cmp::Eq => "=",
            Cmp::Ne => "!=",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        }
    }

    fn parse(symbol: &str) -> Option<Cmp> {
        match symbol {
            "=" => Some(Cmp::Eq),
            "!=" => Some(Cmp::Ne),
            "<" => Some(Cmp::Lt),
            "<=" => Some(Cmp::Le),
            ">" => Some(Cmp::Gt),
            ">=" => Some(Cmp::Ge),
            _ => None,
        }
    }
}

/// Row filter of a delete or update command.
///
/// `key` refers to the sort key, any other column name to a value column.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    All,
    Compare {
        column: String,
        op: Cmp,
        value: Value,
    },
}

impl Predicate {
    /// Evaluates the predicate against a scalar looked up by the caller.
    /// Absent columns never match.
    pub fn matches(&self, lookup: impl Fn(&str) -> Option<Value>) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Compare { column, op, value } => {
                let Some(actual) = lookup(column) else {
                    return false;
                };
                match op {
                    Cmp::Eq => actual == *value,
                    Cmp::Ne => actual != *value,
                    Cmp::Lt => compare(&actual, value).map(|o| o.is_lt()).unwrap_or(false),
                    Cmp::Le => compare(&actual, value).map(|o| o.is_le()).unwrap_or(false),
                    Cmp::Gt => compare(&actual, value).map(|o| o.is_gt()).unwrap_or(false),
                    Cmp::Ge => compare(&actual, value).map(|o| o.is_ge()).unwrap_or(false),
                }
            }
        }
    }

    fn size(&self) -> usize {
        match self {
            Predicate::All => 1,
            Predicate::Compare { .. } => 3,
        }
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => l.as_f64().partial_cmp(&r.as_f64()),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "TRUE"),
            Predicate::Compare { column, op, value } => {
                write!(f, "{} {} {}", column, op.symbol(), value)
            }
        }
    }
}

/// One declarative modification applied by a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationCommand {
    DeleteWhere {
        predicate: Predicate,
    },
    UpdateSet {
        column: String,
        value: Value,
        predicate: Predicate,
    },
    AddColumn {
        name: String,
        default: Value,
    },
    DropColumn {
        name: String,
    },
    RenameColumn {
        from: String,
        to: String,
    },
}

impl MutationCommand {
    /// Barrier commands change the column shape of the table and must be
    /// applied alone, never coalesced with neighbors.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            MutationCommand::AddColumn { .. }
                | MutationCommand::DropColumn { .. }
                | MutationCommand::RenameColumn { .. }
        )
    }

    /// Rough element count, budgeted against `max_expanded_ast_elements`.
    pub fn ast_size(&self) -> usize {
        match self {
            MutationCommand::DeleteWhere { predicate } => 2 + predicate.size(),
            MutationCommand::UpdateSet { predicate, .. } => 4 + predicate.size(),
            MutationCommand::AddColumn { .. } => 3,
            MutationCommand::DropColumn { .. } => 2,
            MutationCommand::RenameColumn { .. } => 3,
        }
    }

    /// Value columns the command writes.
    pub fn updated_columns(&self) -> Vec<String> {
        match self {
            MutationCommand::DeleteWhere { .. } => Vec::new(),
            MutationCommand::UpdateSet { column, .. } => vec![column.clone()],
            MutationCommand::AddColumn { name, .. } => vec![name.clone()],
            MutationCommand::DropColumn { name } => vec![name.clone()],
            MutationCommand::RenameColumn { from, to } => vec![from.clone(), to.clone()],
        }
    }
}

/// Whether any command in the sequence is a barrier.
pub fn contain_barrier_command(commands: &[MutationCommand]) -> bool {
    commands.iter().any(|c| c.is_barrier())
}

impl fmt::Display for MutationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationCommand::DeleteWhere { predicate } => {
                write!(f, "DELETE WHERE {}", predicate)
            }
            MutationCommand::UpdateSet {
                column,
                value,
                predicate,
            } => write!(f, "UPDATE {} = {} WHERE {}", column, value, predicate),
            MutationCommand::AddColumn { name, default } => {
                write!(f, "ADD COLUMN {} DEFAULT {}", name, default)
            }
            MutationCommand::DropColumn { name } => write!(f, "DROP COLUMN {}", name),
            MutationCommand::RenameColumn { from, to } => {
                write!(f, "RENAME COLUMN {} TO {}", from, to)
            }
        }
    }
}

impl FromStr for MutationCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<MutationCommand> {
        let bad = || BadArgumentsSnafu {
            reason: format!("cannot parse mutation command: {s}"),
        };

        if let Some(rest) = s.strip_prefix("DELETE WHERE ") {
            let predicate = parse_predicate(rest).ok_or_else(|| bad().build())?;
            return Ok(MutationCommand::DeleteWhere { predicate });
        }
        if let Some(rest) = s.strip_prefix("UPDATE ") {
            let (column, rest) = rest.split_once(" = ").ok_or_else(|| bad().build())?;
            validate_column(column)?;
            let (value, rest) = parse_json_prefix(rest).ok_or_else(|| bad().build())?;
            let rest = rest.strip_prefix(" WHERE ").ok_or_else(|| bad().build())?;
            let predicate = parse_predicate(rest).ok_or_else(|| bad().build())?;
            return Ok(MutationCommand::UpdateSet {
                column: column.to_string(),
                value,
                predicate,
            });
        }
        if let Some(rest) = s.strip_prefix("ADD COLUMN ") {
            let (name, rest) = rest.split_once(" DEFAULT ").ok_or_else(|| bad().build())?;
            validate_column(name)?;
            let (default, tail) = parse_json_prefix(rest).ok_or_else(|| bad().build())?;
            if !tail.is_empty() {
                return bad().fail();
            }
            return Ok(MutationCommand::AddColumn {
                name: name.to_string(),
                default,
            });
        }
        if let Some(name) = s.strip_prefix("DROP COLUMN ") {
            validate_column(name)?;
            return Ok(MutationCommand::DropColumn {
                name: name.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("RENAME COLUMN ") {
            let (from, to) = rest.split_once(" TO ").ok_or_else(|| bad().build())?;
            validate_column(from)?;
            validate_column(to)?;
            return Ok(MutationCommand::RenameColumn {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        bad().fail()
    }
}

fn parse_predicate(s: &str) -> Option<Predicate> {
    if s == "TRUE" {
        return Some(Predicate::All);
    }
    let (column, rest) = s.split_once(' ')?;
    validate_column(column).ok()?;
    let (symbol, rest) = rest.split_once(' ')?;
    let op = Cmp::parse(symbol)?;
    let (value, tail) = parse_json_prefix(rest)?;
    if !tail.is_empty() {
        return None;
    }
    Some(Predicate::Compare {
        column: column.to_string(),
        op,
        value,
    })
}

/// Parses one JSON value from the head of `s`, returning the remainder.
fn parse_json_prefix(s: &str) -> Option<(Value, &str)> {
    let mut stream = serde_json::Deserializer::from_str(s).into_iter::<Value>();
    let value = stream.next()?.ok()?;
    Some((value, &s[stream.byte_offset()..]))
}

fn validate_column(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace()) || name == "TRUE" {
        return BadArgumentsSnafu {
            reason: format!("invalid column name: {name:?}"),
        }
        .fail();
    }
    Ok(())
}
