use std::sync::Arc;

use log::{info, warn};

use crate::attachment_store::{BlobStore, FileStore};
use crate::dispatch::{DeadLetter, QueueId, QueueRegistry, StopFailures};
use crate::error::Result;
use crate::mail_codec::IncomingMessage;
use crate::mail_source::account::AccountDirectory;
use crate::mail_source::smtp::LettreConnector;
use crate::mail_source::{AttachmentData, MailSource, MessageSource, SendRequest};
use crate::settings::Config;

/// Entry point for callers: queue outbound mail, collect inbound mail.
pub struct Gateway {
    directory: Arc<AccountDirectory>,
    registry: QueueRegistry,
    store: Option<Arc<dyn BlobStore>>,
}

impl Gateway {
    pub fn new(config: &Config) -> Self {
        let directory = Arc::new(AccountDirectory::from_file(&config.accounts_file, config.account_lookup));
        let store: Option<Arc<dyn BlobStore>> = if config.store.enabled {
            info!("Attachments are kept in {}", config.store.path.display());
            Some(Arc::new(FileStore::new(&config.store.path)))
        } else {
            None
        };
        let source = Arc::new(MailSource::new(Arc::clone(&directory), Arc::new(LettreConnector), store.clone()));
        Gateway::with_source(config, directory, source, store)
    }

    pub fn with_source(
        config: &Config,
        directory: Arc<AccountDirectory>,
        source: Arc<dyn MessageSource>,
        store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Gateway { directory, registry: QueueRegistry::new(source, config.queue.clone()), store }
    }

    /// Starts polling the mailbox of every configured account.
    pub fn start(&self) {
        let keys = self.directory.keys();
        for key in &keys {
            self.registry.get_or_create(&QueueId::receiving(key.as_str()));
        }
        info!("Gateway started for {} account(s)", keys.len());
    }

    /// Queues a message and returns its id. The account has to exist now;
    /// delivery itself happens in the background.
    pub fn send(&self, mut request: SendRequest) -> Result<String> {
        let account = self.directory.resolve(&request.key)?;
        request.key = account.key.clone();

        if let Some(store) = &self.store {
            for attachment in &mut request.attachments {
                if let AttachmentData::Inline(data) = &attachment.data {
                    attachment.data = AttachmentData::Stored(store.put(data)?);
                }
            }
        }

        let id = request.id.clone();
        let queue = self.registry.get_or_create(&QueueId::sending(account.key));
        if !queue.enqueue_send(request) {
            warn!("Message {} was already queued", id);
        }
        Ok(id)
    }

    /// Everything received for the account since the last call.
    pub async fn receive(&self, key: &str) -> Result<Vec<IncomingMessage>> {
        let account = self.directory.resolve(key)?;
        let queue = self.registry.get_or_create(&QueueId::receiving(account.key));
        queue.receive_messages().await
    }

    pub fn dead_letters(&self, key: &str) -> Result<Vec<DeadLetter>> {
        let account = self.directory.resolve(key)?;
        Ok(self
            .registry
            .get(&QueueId::sending(account.key))
            .map(|queue| queue.dead_letters())
            .unwrap_or_default())
    }

    pub fn reload_accounts(&self) {
        self.directory.reload();
    }

    pub async fn stop(&self) -> std::result::Result<(), StopFailures> {
        info!("Stopping gateway");
        self.registry.stop().await
    }
}
