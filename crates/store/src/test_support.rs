use bank_core::{Account, Currency, Role, User};

use crate::executor::Store;
use crate::queries::{CreateAccountParams, CreateUserParams, Database};

pub(crate) fn user_params(username: &str) -> CreateUserParams {
    CreateUserParams {
        username: username.to_string(),
        hashed_password: "$2a$10$hashed".to_string(),
        full_name: format!("{username} Example"),
        email: format!("{username}@example.com"),
        role: Role::Depositor,
    }
}

pub(crate) async fn seed_user<D: Database>(store: &Store<D>, username: &str) -> User {
    let params = user_params(username);
    store
        .exec_tx(move |q| q.create_user(params))
        .await
        .unwrap()
}

pub(crate) async fn seed_account<D: Database>(
    store: &Store<D>,
    owner: &str,
    balance: i64,
    currency: Currency,
) -> Account {
    store
        .create_account(CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency,
        })
        .await
        .unwrap()
}
