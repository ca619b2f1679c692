//! Email verification.

use tracing::info;

use bank_core::{LedgerError, LedgerResult, User, VerifyEmail, VerifyEmailId};

use crate::executor::Store;
use crate::queries::{Database, Queries, UpdateUserParams};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxParams {
    pub email_id: VerifyEmailId,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

impl<D: Database> Store<D> {
    /// Consume a verification code and mark the user's email verified.
    ///
    /// Both writes commit together. An unknown id is `NotFound`; a wrong,
    /// already used or expired code is `Mismatch`.
    pub async fn verify_email_tx(&self, arg: VerifyEmailTxParams) -> LedgerResult<VerifyEmailTxResult> {
        let VerifyEmailTxParams {
            email_id,
            secret_code,
        } = arg;

        let result = self
            .exec_tx_with_retry(move |q| Box::pin(verify_email(q, email_id, secret_code.clone())))
            .await?;

        info!(
            username = %result.user.username,
            email_id = %result.verify_email.id,
            "email verified"
        );
        Ok(result)
    }
}

async fn verify_email(
    q: &mut dyn Queries,
    email_id: VerifyEmailId,
    secret_code: String,
) -> LedgerResult<VerifyEmailTxResult> {
    q.get_verify_email(email_id).await?;

    let verify_email = q
        .update_verify_email(email_id, &secret_code)
        .await?
        .ok_or_else(|| {
            LedgerError::mismatch(format!(
                "verification code for {email_id} is invalid, used or expired"
            ))
        })?;

    let user = q
        .update_user(UpdateUserParams {
            is_email_verified: Some(true),
            ..UpdateUserParams::for_user(verify_email.username.clone())
        })
        .await?;

    Ok(VerifyEmailTxResult { user, verify_email })
}
