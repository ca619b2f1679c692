//! User creation with a post-insert callback.

use futures::future::BoxFuture;
use tracing::info;

use bank_core::{LedgerResult, User};

use crate::executor::Store;
use crate::queries::{CreateUserParams, Database, Queries};

/// Fields of the new user plus the callback run inside the same scope.
pub struct CreateUserTxParams<F> {
    pub params: CreateUserParams,
    /// Runs after the insert, before commit, on the same `Queries` as the
    /// insert. Anything it writes there (typically an `enqueue_task`)
    /// commits with the user; an error aborts the scope and the user is not
    /// persisted.
    pub after_create: F,
}

impl<F> CreateUserTxParams<F>
where
    F: for<'c> FnOnce(&'c mut dyn Queries, User) -> BoxFuture<'c, LedgerResult<()>> + Send + 'static,
{
    /// Builds the params; closures passed here get their scope-borrowing
    /// signature inferred.
    pub fn new(params: CreateUserParams, after_create: F) -> Self {
        Self {
            params,
            after_create,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserTxResult {
    pub user: User,
}

impl<D: Database> Store<D> {
    /// Insert a user and run `after_create` before committing.
    ///
    /// Single attempt: the callback may have side effects outside the scope
    /// and must not run twice for one committed user.
    pub async fn create_user_tx<F>(&self, arg: CreateUserTxParams<F>) -> LedgerResult<CreateUserTxResult>
    where
        F: for<'c> FnOnce(&'c mut dyn Queries, User) -> BoxFuture<'c, LedgerResult<()>> + Send + 'static,
    {
        let CreateUserTxParams {
            params,
            after_create,
        } = arg;

        let result = self
            .exec_tx(move |q| {
                Box::pin(async move {
                    let user = q.create_user(params).await?;
                    after_create(&mut *q, user.clone()).await?;
                    Ok(CreateUserTxResult { user })
                })
            })
            .await?;

        info!(username = %result.user.username, role = result.user.role.as_str(), "user created");
        Ok(result)
    }
}
