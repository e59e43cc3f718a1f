//! Query results
//!
//! Every value comes back in its string form: numbers and dates as the
//! engine renders them, LOBs materialized as text, NULL as `None`.

use std::sync::Arc;

/// One fetched row.
///
/// # Example
///
/// ```rust
/// use ora_piecewise::Row;
///
/// let row = Row::with_names(
///     vec![Some("7".to_string()), None],
///     vec!["id".to_string(), "note".to_string()],
/// );
/// assert_eq!(row.get_str(0), Some("7"));
/// assert_eq!(row.get_by_name("NOTE"), None);
/// assert!(row.is_null(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Column values
    values: Vec<Option<String>>,
    /// Column names (shared across the rows of one result)
    column_names: Option<Arc<[String]>>,
}

impl Row {
    /// Create a new row with values
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self {
            values,
            column_names: None,
        }
    }

    /// Create a new row with values and column names
    pub fn with_names(values: Vec<Option<String>>, names: Vec<String>) -> Self {
        Self {
            values,
            column_names: Some(names.into()),
        }
    }

    fn with_shared_names(values: Vec<Option<String>>, names: Arc<[String]>) -> Self {
        Self {
            values,
            column_names: Some(names),
        }
    }

    /// Get the number of columns in this row
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index; `None` for NULL or out of range
    pub fn get(&self, index: usize) -> Option<&Option<String>> {
        self.values.get(index)
    }

    /// Get a non-NULL value by column index
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.values.get(index)?.as_deref()
    }

    /// Get a non-NULL value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        let names = self.column_names.as_ref()?;
        let index = names.iter().position(|n| n.eq_ignore_ascii_case(name))?;
        self.get_str(index)
    }

    /// Get all values as a slice
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Consume the row and return the values
    pub fn into_values(self) -> Vec<Option<String>> {
        self.values
    }

    /// Check if a column value is NULL (missing columns count as NULL)
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).map_or(true, Option::is_none)
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Option<String>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.values[index]
    }
}

/// Rows returned by a query, with lowercase column names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    columns: Arc<[String]>,
    rows: Vec<Row>,
}

impl ResultSet {
    /// Create an empty result with the given column names
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns: columns.into(),
            rows: Vec::new(),
        }
    }

    /// Append a row; it shares this result's column names
    pub fn push(&mut self, values: Vec<Option<String>>) {
        let row = Row::with_shared_names(values, Arc::clone(&self.columns));
        self.rows.push(row);
    }

    /// Column names in select-list order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get the number of columns
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Get column index by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as a slice
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Iterate over rows
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Get a single row (first row)
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Take the only row, if there is exactly one
    pub(crate) fn into_single(mut self) -> std::result::Result<Option<Row>, usize> {
        match self.rows.len() {
            0 => Ok(None),
            1 => Ok(self.rows.pop()),
            n => Err(n),
        }
    }
}

impl Default for ResultSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access() {
        let row = Row::new(vec![Some("a".into()), None]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_str(0), Some("a"));
        assert_eq!(row.get_str(1), None);
        assert!(row.is_null(1));
        assert!(row.is_null(5));
        assert_eq!(row[0].as_deref(), Some("a"));
        assert_eq!(row.get_by_name("a"), None);
    }

    #[test]
    fn test_result_set_shares_names() {
        let mut result = ResultSet::new(vec!["id".into(), "name".into()]);
        result.push(vec![Some("1".into()), Some("alice".into())]);
        result.push(vec![Some("2".into()), None]);

        assert_eq!(result.row_count(), 2);
        assert_eq!(result.column_index("NAME"), Some(1));
        assert_eq!(result.rows()[0].get_by_name("Name"), Some("alice"));
        assert_eq!(result.rows()[1].get_by_name("name"), None);

        let ids: Vec<_> = result.iter().map(|r| r.get_str(0).unwrap().to_string()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_into_single() {
        let mut result = ResultSet::new(vec!["x".into()]);
        assert_eq!(result.clone().into_single(), Ok(None));
        result.push(vec![Some("1".into())]);
        assert!(matches!(result.clone().into_single(), Ok(Some(_))));
        result.push(vec![Some("2".into())]);
        assert_eq!(result.into_single(), Err(2));
    }
}
