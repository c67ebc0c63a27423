use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use caisson_domain::ResourceName;
use futures::future::{BoxFuture, FutureExt, Shared, try_join_all};

use crate::error::Unresolved;

type SharedValue<T> = Shared<BoxFuture<'static, Result<T, Unresolved>>>;

/// A value that becomes available once the resources it flows from are
/// realized.
///
/// The underlying future is evaluated at most once and only when some clone is
/// resolved. Reading always goes through [`Output::resolve`].
pub struct Output<T> {
    value: SharedValue<T>,
    resources: BTreeSet<ResourceName>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            resources: self.resources.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Output")
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl<T> Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn known(value: T) -> Self {
        Self::from_future(Vec::new(), async move { Ok(value) })
    }

    #[must_use]
    pub fn unresolved(error: Unresolved) -> Self {
        let origin = error.origin.clone();
        Self::from_future(vec![origin], async move { Err(error) })
    }

    pub fn from_future<R, F>(resources: R, future: F) -> Self
    where
        R: IntoIterator<Item = ResourceName>,
        F: Future<Output = Result<T, Unresolved>> + Send + 'static,
    {
        Self {
            value: future.boxed().shared(),
            resources: resources.into_iter().collect(),
        }
    }

    /// Resources this value flows from.
    #[must_use]
    pub const fn resources(&self) -> &BTreeSet<ResourceName> {
        &self.resources
    }

    /// Wait for the value.
    ///
    /// # Errors
    ///
    /// Returns the [`Unresolved`] error of the first upstream that failed.
    pub async fn resolve(&self) -> Result<T, Unresolved> {
        self.value.clone().await
    }

    #[must_use]
    pub fn map<U, F>(&self, transform: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let upstream = self.value.clone();
        Output::from_future(self.resources.clone(), async move {
            upstream.await.map(transform)
        })
    }

    #[must_use]
    pub fn then<U, F, Fut>(&self, next: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, Unresolved>> + Send + 'static,
    {
        let upstream = self.value.clone();
        Output::from_future(self.resources.clone(), async move {
            let value = upstream.await?;
            next(value).await
        })
    }

    /// Join several outputs; resolves to every value in input order, or to the
    /// first failure.
    #[must_use]
    pub fn all<I>(outputs: I) -> Output<Vec<T>>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut resources = BTreeSet::new();
        let mut values = Vec::new();
        for output in outputs {
            resources.extend(output.resources);
            values.push(output.value);
        }
        Output::from_future(resources, async move { try_join_all(values).await })
    }
}
