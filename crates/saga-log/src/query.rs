/// Builder for filtered range scans over the saga log.
///
/// Results are always ordered newest first (`created_at` descending).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SagaLogQuery {
    /// Filter by status wire names (any of these).
    pub statuses: Option<Vec<String>>,

    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Maximum number of records to return.
    pub limit: Option<usize>,

    /// Number of records to skip.
    pub offset: Option<usize>,
}

impl SagaLogQuery {
    /// Creates a new empty query matching every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for records in any of the given statuses.
    pub fn for_statuses<I, T>(statuses: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            statuses: Some(statuses.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Filters by a single status.
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.statuses = Some(vec![status.into()]);
        self
    }

    /// Filters by saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Limits the number of records returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many records before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if a record with these columns passes the filters.
    pub fn matches(&self, saga_type: &str, status: &str) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.iter().any(|s| s == status)
        {
            return false;
        }
        if let Some(ref wanted) = self.saga_type
            && wanted != saga_type
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        let query = SagaLogQuery::new();
        assert!(query.matches("any", "RUNNING"));
    }

    #[test]
    fn query_builder_chain() {
        let query = SagaLogQuery::new()
            .status("FAILED")
            .saga_type("complete-affiliate-registration")
            .limit(10)
            .offset(20);

        assert_eq!(query.statuses, Some(vec!["FAILED".to_string()]));
        assert_eq!(
            query.saga_type.as_deref(),
            Some("complete-affiliate-registration")
        );
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(20));
    }

    #[test]
    fn status_and_type_filters_combine() {
        let query = SagaLogQuery::for_statuses(["PENDING", "RUNNING"]).saga_type("a");

        assert!(query.matches("a", "RUNNING"));
        assert!(query.matches("a", "PENDING"));
        assert!(!query.matches("a", "COMPLETED"));
        assert!(!query.matches("b", "RUNNING"));
    }
}
