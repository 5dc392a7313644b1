use crate::bot::inbound::{to_business_link, to_inbound_callback, to_inbound_message};
use crate::bot::TelegramPlatform;
use crate::config::BotSettings;
use anyhow::{anyhow, Context, Result};
use concierge_core::config::{get_storage_ready_timeout_secs, get_sweep_interval_secs};
use concierge_core::conversation::{ConversationService, Flow};
use concierge_core::llm::LlmClient;
use concierge_core::storage::{InMemoryStorage, R2Storage, StorageProvider};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{BusinessConnection, CallbackQuery};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run the Telegram transport runtime.
///
/// # Errors
///
/// Returns an error when storage cannot be initialized or is not reachable
/// within `STORAGE_READY_TIMEOUT_SECS`.
pub async fn run_bot(settings: Arc<BotSettings>) -> Result<()> {
    let storage = init_storage(&settings).await?;

    let llm_client = Arc::new(LlmClient::new(settings.core.as_ref()));
    info!("LLM Client initialized.");

    let bot = Bot::new(settings.telegram.telegram_token.clone());
    let platform = Arc::new(TelegramPlatform::new(bot.clone()));
    let service = Arc::new(ConversationService::new(
        storage,
        llm_client,
        platform,
        settings.core.clone(),
    ));

    if let Err(e) = service.publish_commands().await {
        warn!(error = %e, "Failed to publish command menu");
    }

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeps(service.clone(), shutdown.clone()));

    info!("Bot is running...");
    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![service])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!(error = %e, "Sweep task panicked");
    }
    info!("Bot stopped.");
    Ok(())
}

async fn init_storage(settings: &BotSettings) -> Result<Arc<dyn StorageProvider>> {
    let storage: Arc<dyn StorageProvider> = if settings.core.uses_memory_storage() {
        warn!("Using in-memory storage, data is lost on restart.");
        Arc::new(InMemoryStorage::new())
    } else {
        let r2 = R2Storage::new(settings.core.as_ref())
            .await
            .context("Failed to initialize R2 Storage")?;
        info!("R2 Storage initialized.");
        Arc::new(r2)
    };

    let timeout = Duration::from_secs(get_storage_ready_timeout_secs());
    match tokio::time::timeout(timeout, storage.check_connection()).await {
        Ok(Ok(())) => Ok(storage),
        Ok(Err(e)) => Err(anyhow!("Storage connection check failed: {e}")),
        Err(_) => Err(anyhow!(
            "Storage did not become ready within {}s",
            timeout.as_secs()
        )),
    }
}

/// Periodic reconciliation until `shutdown` fires
async fn run_sweeps(service: Arc<ConversationService>, shutdown: CancellationToken) {
    let period = Duration::from_secs(get_sweep_interval_secs());
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = period.as_secs(), "Sweep scheduler started");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match service.reconciler().process_all_unanswered_chats().await {
                    Ok(report) => debug!(?report, "Sweep report"),
                    Err(e) => error!(error = %e, "Sweep failed to scan the ledger"),
                }
            }
        }
    }
    info!("Sweep scheduler stopped");
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_business_connection().endpoint(handle_business_connection))
        .branch(Update::filter_business_message().endpoint(handle_message))
        .branch(Update::filter_edited_business_message().endpoint(handle_edited_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(Update::filter_message().endpoint(handle_message))
}

async fn handle_message(
    msg: Message,
    service: Arc<ConversationService>,
) -> Result<(), teloxide::RequestError> {
    let Some(inbound) = to_inbound_message(&msg) else {
        debug!(chat_id = msg.chat.id.0, "Ignoring message sent by the bot");
        return respond(());
    };
    if service.handle_message(inbound).await == Flow::Continue {
        debug!(chat_id = msg.chat.id.0, "Message left unhandled");
    }
    respond(())
}

async fn handle_edited_message(
    msg: Message,
    service: Arc<ConversationService>,
) -> Result<(), teloxide::RequestError> {
    if let Some(inbound) = to_inbound_message(&msg) {
        service.handle_edit(inbound).await;
    }
    respond(())
}

async fn handle_callback(
    q: CallbackQuery,
    service: Arc<ConversationService>,
) -> Result<(), teloxide::RequestError> {
    match to_inbound_callback(&q) {
        Some(callback) => service.handle_callback(callback).await,
        None => debug!(user_id = q.from.id.0, "Callback without payload ignored"),
    }
    respond(())
}

async fn handle_business_connection(
    connection: BusinessConnection,
    service: Arc<ConversationService>,
) -> Result<(), teloxide::RequestError> {
    service
        .handle_business_link(to_business_link(&connection))
        .await;
    respond(())
}
