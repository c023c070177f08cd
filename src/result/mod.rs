use std::fmt;

use crate::core::{Instance, Result};

/// Forward-only sequence of instances returned by a query.
///
/// Instances are pulled from the provider as the iterator advances. The
/// sequence cannot be rewound; issue the query again to read it twice.
pub struct QueryResult {
    rows: Box<dyn Iterator<Item = Result<Instance>> + Send>,
}

impl QueryResult {
    pub fn new<I>(rows: I) -> Self
    where
        I: Iterator<Item = Result<Instance>> + Send + 'static,
    {
        Self {
            rows: Box::new(rows),
        }
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn from_instances(instances: Vec<Instance>) -> Self {
        Self::new(instances.into_iter().map(Ok))
    }

    /// Take the first instance and discard the rest.
    pub fn first(mut self) -> Result<Option<Instance>> {
        self.next().transpose()
    }
}

impl Iterator for QueryResult {
    type Item = Result<Instance>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult").finish_non_exhaustive()
    }
}
