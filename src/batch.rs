//! Array (bulk) DML support
//!
//! An array DML statement is prepared once and executed once per row. The
//! caller supplies one value list per bind position; every list must have
//! the same length, which becomes the number of rows executed.
//!
//! # Example
//!
//! ```rust,ignore
//! use ora_piecewise::ArrayBinds;
//!
//! let arrays = ArrayBinds::positional(vec![
//!     vec!["1", "2", "3"],
//!     vec!["alice", "bob", "carol"],
//! ]);
//! let rows = conn.array_dml("insert into users (id, name) values (:1, :2)", &arrays).await?;
//! assert_eq!(rows, 3);
//! ```

use bytes::Bytes;
use indexmap::IndexMap;

use crate::binds::check_size;
use crate::error::{Error, Result};
use crate::statement::BindName;

type ValueList = Vec<Option<Bytes>>;

fn to_list<L, V>(list: L) -> ValueList
where
    L: IntoIterator<Item = V>,
    V: AsRef<[u8]>,
{
    list.into_iter()
        .map(|v| {
            let v = v.as_ref();
            if v.is_empty() {
                None
            } else {
                Some(Bytes::copy_from_slice(v))
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Lists {
    Positional(Vec<ValueList>),
    Named(IndexMap<String, ValueList>),
}

/// Per-position value lists for array DML
#[derive(Debug, Clone)]
pub struct ArrayBinds {
    lists: Lists,
}

impl ArrayBinds {
    /// Lists for `:1`, `:2`, ... in order
    pub fn positional<I, L, V>(lists: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        Self {
            lists: Lists::Positional(lists.into_iter().map(to_list).collect()),
        }
    }

    /// Lists keyed by bind name
    pub fn named<I, K, L, V>(lists: I) -> Self
    where
        I: IntoIterator<Item = (K, L)>,
        K: Into<String>,
        L: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        Self {
            lists: Lists::Named(
                lists
                    .into_iter()
                    .map(|(k, list)| (k.into(), to_list(list)))
                    .collect(),
            ),
        }
    }

    fn list(&self, name: &BindName) -> Result<&ValueList> {
        match (&self.lists, name) {
            (Lists::Positional(lists), BindName::Positional(index)) => {
                if *index < 1 {
                    return Err(Error::InvalidPositional(*index));
                }
                lists
                    .get(index - 1)
                    .ok_or(Error::NotEnoughArguments(*index))
            }
            (Lists::Positional(_), BindName::Named(name)) => {
                Err(Error::UndefinedVariable(name.clone()))
            }
            (Lists::Named(lists), name) => {
                let key = name.bind_text();
                lists.get(&key).ok_or(Error::UndefinedSetElement(key))
            }
        }
    }

    /// Resolve every bind reference to its list and check row counts.
    ///
    /// Fails before anything is executed when any two lists differ in
    /// length.
    pub fn resolve(&self, names: &[BindName]) -> Result<ResolvedArrays> {
        let first = names.first().ok_or(Error::NoArrayBinds)?;
        let rows = self.list(first)?.len();

        let mut lists = Vec::with_capacity(names.len());
        for name in names {
            let list = self.list(name)?;
            if list.len() != rows {
                return Err(Error::ArrayRowMismatch {
                    name: name.bind_text(),
                    expected: rows,
                    actual: list.len(),
                });
            }
            for value in list {
                check_size(name, value.as_ref())?;
            }
            lists.push(list.clone());
        }

        Ok(ResolvedArrays { rows, lists })
    }
}

/// Lists matched to a statement's bind references
#[derive(Debug, Clone)]
pub struct ResolvedArrays {
    rows: usize,
    lists: Vec<ValueList>,
}

impl ResolvedArrays {
    /// Number of rows (iterations) to execute
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Longest value across a position's list, plus room for a terminator
    pub fn max_len(&self, position: usize) -> usize {
        self.lists
            .get(position)
            .map(|list| {
                list.iter()
                    .map(|v| v.as_ref().map_or(0, |v| v.len()))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1
    }

    /// Hand the lists over, one per bind reference
    pub fn into_lists(self) -> Vec<ValueList> {
        self.lists
    }
}
