use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// A decoded Prolog term.
///
/// Answers from the server arrive as JSON and are decoded into this shape;
/// [`Term`]'s `Display` implementation renders the canonical source form the
/// server-side parser accepts, so a decoded term can be embedded back into a
/// goal string.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    Atom(String),
    Integer(i64),
    Float(f64),
    /// A Prolog string (double-quoted). Never produced by the decoder, which
    /// cannot distinguish strings from atoms in the wire JSON; available for
    /// callers building goals.
    Str(String),
    /// A variable name, e.g. `A` or `_`. Decoded variables are renamed to the
    /// canonical sequence `A`, `B`, … except for the anonymous `_`.
    Variable(String),
    List(Vec<Term>),
    /// A functor with at least one argument; zero-arity compounds are atoms.
    Compound { functor: String, args: Vec<Term> },
}

/// Raised when a server payload does not decode into a [`Term`].
#[derive(Debug, Error)]
pub enum TermDecodeError {
    #[error("payload is not valid JSON: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("JSON value does not describe a term: {reason}")]
    Shape { reason: String },
}

impl Term {
    /// Convenience constructor for [`Term::Atom`].
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    /// Convenience constructor for [`Term::Compound`].
    pub fn compound(functor: impl Into<String>, args: Vec<Term>) -> Self {
        Term::Compound {
            functor: functor.into(),
            args,
        }
    }

    /// The principal name of the term: the functor of a compound, the text of
    /// an atom or variable, or the rendered form of anything else.
    pub fn name(&self) -> String {
        match self {
            Term::Atom(name) | Term::Variable(name) => name.clone(),
            Term::Compound { functor, .. } => functor.clone(),
            other => other.to_string(),
        }
    }

    /// Arguments of a compound term; empty for every other shape.
    pub fn args(&self) -> &[Term] {
        match self {
            Term::Compound { args, .. } => args,
            _ => &[],
        }
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, Term::Atom(_))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }

    /// Decodes one top-level JSON value into a term, canonicalizing variable
    /// names within it.
    pub fn from_json(value: &Value) -> Result<Term, TermDecodeError> {
        Self::from_json_with(value, &mut VariableNamer::default())
    }

    /// Decodes a JSON value using an existing variable namer so that several
    /// values (the terms of one answer) share one renaming scope.
    pub(crate) fn from_json_with(
        value: &Value,
        namer: &mut VariableNamer,
    ) -> Result<Term, TermDecodeError> {
        match value {
            Value::String(text) => {
                if text.starts_with('_') {
                    Ok(Term::Variable(namer.rename(text)))
                } else {
                    Ok(Term::Atom(text.clone()))
                }
            }
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Ok(Term::Integer(int))
                } else if let Some(float) = number.as_f64() {
                    Ok(Term::Float(float))
                } else {
                    Err(TermDecodeError::Shape {
                        reason: format!("number {number} fits neither i64 nor f64"),
                    })
                }
            }
            Value::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(Self::from_json_with(item, namer)?);
                }
                Ok(Term::List(elements))
            }
            Value::Object(map) => {
                let functor = map
                    .get("functor")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TermDecodeError::Shape {
                        reason: "object is missing a string \"functor\" key".into(),
                    })?;
                let args = map
                    .get("args")
                    .and_then(Value::as_array)
                    .ok_or_else(|| TermDecodeError::Shape {
                        reason: format!("compound {functor} is missing an \"args\" array"),
                    })?;
                if args.is_empty() {
                    return Ok(Term::Atom(functor.to_string()));
                }
                let mut decoded = Vec::with_capacity(args.len());
                for arg in args {
                    decoded.push(Self::from_json_with(arg, namer)?);
                }
                Ok(Term::Compound {
                    functor: functor.to_string(),
                    args: decoded,
                })
            }
            other => Err(TermDecodeError::Shape {
                reason: format!("unsupported JSON value: {other}"),
            }),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Atom(name) => write_atom(f, name),
            Term::Integer(value) => write!(f, "{value}"),
            Term::Float(value) => {
                // Keep a decimal point so the text re-reads as a float.
                if value.is_finite() && value.fract() == 0.0 {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            Term::Str(text) => {
                write!(f, "\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
            }
            Term::Variable(name) => write!(f, "{name}"),
            Term::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Term::Compound { functor, args } => {
                write_atom(f, functor)?;
                f.write_str("(")?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_atom(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if atom_needs_no_quotes(name) {
        f.write_str(name)
    } else {
        write!(f, "'{}'", name.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn atom_needs_no_quotes(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Assigns canonical names (`A`, `B`, …, `Z`, `AA`, …) to the variables of one
/// decoded value, left to right, first occurrence first. The anonymous `_` is
/// left untouched. One namer covers exactly one answer; nothing is shared
/// across messages.
#[derive(Debug, Default)]
pub(crate) struct VariableNamer {
    assigned: HashMap<String, String>,
    next: usize,
}

impl VariableNamer {
    pub(crate) fn rename(&mut self, raw: &str) -> String {
        if raw == "_" {
            return raw.to_string();
        }
        if let Some(existing) = self.assigned.get(raw) {
            return existing.clone();
        }
        let name = canonical_name(self.next);
        self.next += 1;
        self.assigned.insert(raw.to_string(), name.clone());
        name
    }
}

fn canonical_name(index: usize) -> String {
    let mut remaining = index;
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (remaining % 26) as u8);
        remaining /= 26;
        if remaining == 0 {
            break;
        }
        remaining -= 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}
