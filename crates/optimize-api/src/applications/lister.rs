//! Batch iteration over applications

use super::{ApplicationApi, ApplicationItem, ApplicationListQuery, ApplicationName};
use optimize_core::{Relation, Result};
use std::future::Future;
use tracing::debug;

/// Visits applications one page at a time
pub struct ApplicationLister<A> {
    pub api: A,
    /// Page size hint, 0 for the server default
    pub batch_size: usize,
}

impl<A: ApplicationApi> ApplicationLister<A> {
    pub fn new(api: A) -> Self {
        Self { api, batch_size: 0 }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Visit every application, following `next` links until exhausted
    pub async fn for_each_application<F, Fut>(
        &self,
        query: &ApplicationListQuery,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(ApplicationItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut query = query.clone();
        if self.batch_size > 0 {
            query.limit = Some(self.batch_size);
        }

        loop {
            let list = self.api.list_applications(&query).await?;
            let next = list.metadata.link(Relation::Next).map(str::to_string);

            for item in list.items {
                visit(item).await?;
            }

            let Some(next) = next else {
                return Ok(());
            };
            if query.continuation.as_deref() == Some(next.as_str()) {
                return Ok(());
            }
            debug!("Following next page {}", next);
            query.continuation = Some(next);
        }
    }

    /// Visit each named application in the order given
    pub async fn for_each_named_application<S, F, Fut>(
        &self,
        names: &[S],
        ignore_not_found: bool,
        mut visit: F,
    ) -> Result<()>
    where
        S: AsRef<str>,
        F: FnMut(ApplicationItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for name in names {
            let name = ApplicationName::from(name.as_ref());
            let item = match self.api.get_application_by_name(&name).await {
                Ok(item) => item,
                Err(e) if ignore_not_found && e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            visit(item).await?;
        }
        Ok(())
    }
}
