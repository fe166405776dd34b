//! Batch iteration over experiments

use super::{ExperimentApi, ExperimentItem, ExperimentListQuery, ExperimentName};
use optimize_core::{Relation, Result};
use std::future::Future;
use tracing::debug;

/// Visits experiments one page at a time
pub struct ExperimentLister<A> {
    pub api: A,
    /// Page size hint, 0 for the server default
    pub batch_size: usize,
}

impl<A: ExperimentApi> ExperimentLister<A> {
    pub fn new(api: A) -> Self {
        Self { api, batch_size: 0 }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Visit every experiment matching `query`, in server order
    ///
    /// Iteration stops at the first error returned by `visit`.
    pub async fn for_each_experiment<F, Fut>(
        &self,
        query: &ExperimentListQuery,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(ExperimentItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut query = query.clone();
        if self.batch_size > 0 {
            query.limit = Some(self.batch_size);
        }

        loop {
            let list = self.api.list_experiments(&query).await?;
            let next = list.metadata.link(Relation::Next).map(str::to_string);

            for item in list.items {
                visit(item).await?;
            }

            match next {
                Some(next) if query.continuation.as_deref() != Some(next.as_str()) => {
                    debug!("Following next page {}", next);
                    query.continuation = Some(next);
                }
                _ => return Ok(()),
            }
        }
    }

    /// Visit each named experiment in the order given
    ///
    /// With `ignore_not_found`, names that do not resolve are skipped;
    /// otherwise the first failure ends the iteration.
    pub async fn for_each_named_experiment<S, F, Fut>(
        &self,
        names: &[S],
        ignore_not_found: bool,
        mut visit: F,
    ) -> Result<()>
    where
        S: AsRef<str>,
        F: FnMut(ExperimentItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for name in names {
            let name = ExperimentName::from(name.as_ref());
            match self.api.get_experiment_by_name(&name).await {
                Ok(item) => visit(item).await?,
                Err(e) if ignore_not_found && e.is_not_found() => {
                    debug!("Skipping missing experiment {}", name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
