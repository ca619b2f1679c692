//! `task:send_verify_email`: issue a verification code for a new user and
//! mail them the link.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use bank_core::{LedgerError, LedgerResult, User, VerifyEmail};
use bank_store::{CreateVerifyEmailParams, Database, Queries, Store};

use super::distributor::{TaskDistributor, TaskError, enqueue_in};
use super::mail::{Email, EmailSender};
use super::processor::{ProcessError, TaskProcessor};
use super::store::TaskStore;
use super::types::{QUEUE_CRITICAL, Task, TaskInfo, TaskOptions};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

const SECRET_CODE_LEN: usize = 32;
const WELCOME_SUBJECT: &str = "Welcome! Please verify your email address";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Options used when a freshly created user schedules their verification
/// email: critical queue, 10 retries, first run after 10 seconds.
pub fn after_create_options() -> TaskOptions {
    TaskOptions::new()
        .with_queue(QUEUE_CRITICAL)
        .with_max_retry(10)
        .with_process_in(Duration::from_secs(10))
}

impl<S: TaskStore> TaskDistributor<S> {
    pub async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, TaskError> {
        self.enqueue(TASK_SEND_VERIFY_EMAIL, payload, opts).await
    }
}

/// Stage `task:send_verify_email` in the open ledger scope `q`.
pub async fn distribute_task_send_verify_email_in(
    q: &mut dyn Queries,
    payload: &PayloadSendVerifyEmail,
    opts: TaskOptions,
) -> Result<TaskInfo, TaskError> {
    enqueue_in(q, TASK_SEND_VERIFY_EMAIL, payload, opts).await
}

/// `after_create` callback for `Store::create_user_tx` that schedules the
/// verification email in the user's own scope: the task exists if and only
/// if the user commits.
pub fn enqueue_verify_email()
-> impl for<'c> FnOnce(&'c mut dyn Queries, User) -> BoxFuture<'c, LedgerResult<()>> + Send + 'static {
    |q: &mut dyn Queries, user: User| {
        async move {
            let payload = PayloadSendVerifyEmail {
                username: user.username,
            };
            distribute_task_send_verify_email_in(q, &payload, after_create_options()).await?;
            Ok::<(), LedgerError>(())
        }
        .boxed()
    }
}

/// Link embedded in the verification email.
pub fn verify_email_url(base: &str, verify_email: &VerifyEmail) -> String {
    format!(
        "{base}?email_id={}&secret_code={}",
        verify_email.id, verify_email.secret_code
    )
}

/// Handler for `task:send_verify_email`.
pub struct SendVerifyEmail<D, M> {
    store: Store<D>,
    mailer: M,
    verify_url: String,
}

impl<D, M> SendVerifyEmail<D, M>
where
    D: Database + 'static,
    M: EmailSender + 'static,
{
    pub fn new(store: Store<D>, mailer: M, verify_url: impl Into<String>) -> Self {
        Self {
            store,
            mailer,
            verify_url: verify_url.into(),
        }
    }

    /// Install this handler on `processor`.
    pub fn register<S: TaskStore>(self, processor: &mut TaskProcessor<S>) {
        let handler = Arc::new(self);
        processor.register_handler(TASK_SEND_VERIFY_EMAIL, move |task: Task| {
            let handler = handler.clone();
            async move { handler.handle(task).await }
        });
    }

    pub async fn handle(&self, task: Task) -> Result<(), ProcessError> {
        let payload: PayloadSendVerifyEmail = serde_json::from_value(task.payload.clone())
            .map_err(|e| ProcessError::skip_retry(anyhow::anyhow!("failed to unmarshal payload: {e}")))?;

        let user = match self.store.get_user(&payload.username).await {
            Ok(user) => user,
            Err(e) if e.is_not_found() => {
                return Err(ProcessError::skip_retry(anyhow::anyhow!(
                    "user {} does not exist",
                    payload.username
                )));
            }
            Err(e) => {
                return Err(ProcessError::retry(
                    anyhow::Error::new(e).context("failed to get user"),
                ));
            }
        };

        let verify_email = self
            .store
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_string(SECRET_CODE_LEN),
            })
            .await
            .map_err(|e| ProcessError::retry(anyhow::Error::new(e).context("failed to create verify email")))?;

        let url = verify_email_url(&self.verify_url, &verify_email);
        let email = Email {
            subject: WELCOME_SUBJECT.to_string(),
            content: format!(
                "Hello {},<br/>\
                 Thank you for registering with us!<br/>\
                 Please <a href=\"{url}\">click here</a> to verify your email address.<br/>",
                user.full_name
            ),
            to: vec![user.email.clone()],
            ..Default::default()
        };

        self.mailer
            .send_email(email)
            .await
            .map_err(|e| ProcessError::retry(e.context("failed to send verify email")))?;

        info!(
            task_type = %task.task_type,
            payload = %task.payload,
            email = %user.email,
            verify_email_id = %verify_email.id,
            "processed task"
        );
        Ok(())
    }
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}
