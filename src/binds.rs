//! Bind value sources
//!
//! A statement's bind names are resolved against exactly one source: the
//! caller's positional values, a key-value set, or a variable store. Empty
//! values bind as NULL.

use bytes::Bytes;
use indexmap::IndexMap;

use crate::constants::MAX_DYNAMIC_BUFFER;
use crate::error::{Error, Result};
use crate::statement::BindName;

/// Named variables read and written by PL/SQL calls, in insertion order
pub type Variables = IndexMap<String, String>;

#[derive(Debug, Clone, Default)]
enum Source {
    #[default]
    Empty,
    Positional(Vec<Bytes>),
    Set(IndexMap<String, Bytes>),
    Variables(Variables),
}

/// Values for a statement's bind variables.
///
/// ```rust
/// use ora_piecewise::Binds;
///
/// let binds = Binds::positional(["42", "smith"]);
/// let named = Binds::set([("id", "42"), ("name", "smith")]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Binds {
    source: Source,
}

impl Binds {
    /// No values; any bind reference is an error
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional values for `:1`, `:2`, ...
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        Self {
            source: Source::Positional(
                values
                    .into_iter()
                    .map(|v| Bytes::copy_from_slice(v.as_ref()))
                    .collect(),
            ),
        }
    }

    /// Values from a key-value set
    pub fn set<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        Self {
            source: Source::Set(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), Bytes::copy_from_slice(v.as_ref())))
                    .collect(),
            ),
        }
    }

    /// Values from a variable store; PL/SQL calls may write results back
    pub fn variables(vars: Variables) -> Self {
        Self {
            source: Source::Variables(vars),
        }
    }

    /// The variable store, if this source is one
    pub fn as_variables(&self) -> Option<&Variables> {
        match &self.source {
            Source::Variables(vars) => Some(vars),
            _ => None,
        }
    }

    /// Store a result into the variable store.
    ///
    /// Returns false when this source is not a variable store.
    pub fn set_variable(&mut self, name: &str, value: impl Into<String>) -> bool {
        match &mut self.source {
            Source::Variables(vars) => {
                vars.insert(name.to_string(), value.into());
                true
            }
            _ => false,
        }
    }

    /// Resolve one bind reference; empty values are NULL
    pub fn resolve(&self, name: &BindName) -> Result<Option<Bytes>> {
        let value = match (&self.source, name) {
            (Source::Positional(values), BindName::Positional(index)) => {
                positional(values, *index)?.clone()
            }
            (Source::Empty, BindName::Positional(index)) => {
                positional(&[], *index)?.clone()
            }
            (Source::Positional(_) | Source::Empty, BindName::Named(name)) => {
                return Err(Error::UndefinedVariable(name.clone()))
            }
            (Source::Set(set), name) => {
                let key = name.bind_text();
                set.get(&key)
                    .ok_or(Error::UndefinedSetElement(key))?
                    .clone()
            }
            (Source::Variables(vars), name) => {
                let key = name.bind_text();
                let value = vars.get(&key).ok_or(Error::UndefinedVariable(key))?;
                Bytes::copy_from_slice(value.as_bytes())
            }
        };
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Resolve every reference in order, enforcing the data-at-execute ceiling
    pub fn resolve_all(&self, names: &[BindName]) -> Result<Vec<Option<Bytes>>> {
        names
            .iter()
            .map(|name| {
                let value = self.resolve(name)?;
                check_size(name, value.as_ref())?;
                Ok(value)
            })
            .collect()
    }
}

fn positional(values: &[Bytes], index: usize) -> Result<&Bytes> {
    if index < 1 {
        return Err(Error::InvalidPositional(index));
    }
    values.get(index - 1).ok_or(Error::NotEnoughArguments(index))
}

/// Reject values too large to be supplied in a single piece
pub(crate) fn check_size(name: &BindName, value: Option<&Bytes>) -> Result<()> {
    match value {
        Some(value) if value.len() > MAX_DYNAMIC_BUFFER => Err(Error::ValueTooLarge {
            name: name.bind_text(),
            len: value.len(),
            max: MAX_DYNAMIC_BUFFER,
        }),
        _ => Ok(()),
    }
}
