//! Process wiring: pool, schema, ledger store, task processor.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use bank_store::{Database, PostgresDatabase, Store, StoreConfig, ensure_schema};
use bank_worker::{
    EmailSender, PostgresTaskStore, ProcessorConfig, SendVerifyEmail, TaskDistributor,
    TaskProcessor, TaskProcessorHandle, TaskStore, TracingEmailSender, ensure_task_schema,
};

use crate::config::Config;

/// Processor configuration derived from `config`.
pub fn processor_config(config: &Config) -> ProcessorConfig {
    ProcessorConfig::default()
        .with_name("bank-worker")
        .with_concurrency(config.worker_concurrency)
        .with_poll_interval(config.task_poll_interval)
        .with_lease(config.task_lease)
        .with_queues(config.task_queues.clone())
}

/// A processor with every task handler registered.
pub fn build_processor<D, S, M>(
    config: &Config,
    store: Store<D>,
    tasks: S,
    mailer: M,
) -> TaskProcessor<S>
where
    D: Database + 'static,
    S: TaskStore,
    M: EmailSender + 'static,
{
    let mut processor = TaskProcessor::new(tasks, processor_config(config));
    SendVerifyEmail::new(store, mailer, config.verify_email_url.clone()).register(&mut processor);
    processor
}

/// Running services.
pub struct App {
    pub store: Store<Arc<PostgresDatabase>>,
    pub distributor: TaskDistributor<Arc<PostgresTaskStore>>,
    processor: TaskProcessorHandle,
}

impl App {
    /// Connect to Postgres, bootstrap the schema and start the task processor.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await?;

        ensure_schema(&pool).await?;
        ensure_task_schema(&pool).await?;

        let store = Store::with_config(
            Arc::new(PostgresDatabase::new(pool.clone())),
            StoreConfig {
                max_tx_attempts: config.tx_max_attempts,
            },
        );
        let tasks = Arc::new(PostgresTaskStore::new(pool));
        let distributor = TaskDistributor::new(tasks.clone());

        let processor = build_processor(config, store.clone(), tasks, TracingEmailSender).start();
        info!(
            max_connections = config.db_max_connections,
            verify_email_url = %config.verify_email_url,
            "bank services started"
        );

        Ok(Self {
            store,
            distributor,
            processor,
        })
    }

    pub fn processor(&self) -> &TaskProcessorHandle {
        &self.processor
    }

    /// Stop the task processor, letting in-flight tasks finish.
    pub async fn shutdown(self) {
        let stats = self.processor.stats();
        self.processor.shutdown().await;
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            dead = stats.dead,
            "bank services stopped"
        );
    }
}
