pub mod account;
pub mod pool;
pub mod smtp;

use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attachment_store::BlobStore;
use crate::error::{Error, Result};
use crate::mail_codec::{decode_message, Attachment, ContentPart, IncomingMessage, OutgoingMessage};
use crate::pop3::{Client, MailboxClient};
use tokio::io::{AsyncRead, AsyncWrite};

use account::{Account, AccountDirectory};
use pool::Pool;
use smtp::{Courier, SmtpConnector};

const IDLE_COURIERS: usize = 4;

/// A message waiting to be sent from one of the configured accounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRequest {
    pub id: String,
    pub key: String,
    /// Display name put in front of the account address.
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub contents: Vec<ContentPart>,
    pub attachments: Vec<QueuedAttachment>,
}

impl SendRequest {
    pub fn new(key: impl Into<String>) -> Self {
        SendRequest {
            id: Uuid::new_v4().to_string(),
            key: key.into(),
            sender: String::new(),
            recipients: Vec::new(),
            subject: String::new(),
            contents: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Recipient addresses; entries may themselves be comma separated lists.
    pub fn recipient_addresses(&self) -> Vec<&str> {
        self.recipients
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedAttachment {
    pub name: String,
    pub data: AttachmentData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AttachmentData {
    Inline(Vec<u8>),
    /// Key into the attachment store.
    Stored(String),
}

/// One message in a remote mailbox. `number` is only valid in the session
/// that listed it; `id` identifies the message across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxEntry {
    pub key: String,
    pub number: u32,
    pub id: String,
}

/// The protocol side of the gateway as seen by the dispatch queues.
pub trait MessageSource: Send + Sync {
    fn send<'a>(&'a self, request: &'a SendRequest) -> BoxFuture<'a, Result<()>>;

    fn stat<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<MailboxEntry>>>;

    fn read<'a>(&'a self, entry: &'a MailboxEntry) -> BoxFuture<'a, Result<IncomingMessage>>;

    /// Releases whatever a request that will never be sent still holds.
    fn discard(&self, _request: &SendRequest) {}
}

/// Sends over SMTP and reads over POP3 for the accounts in a directory.
pub struct MailSource {
    directory: Arc<AccountDirectory>,
    couriers: Arc<Pool<Courier>>,
    store: Option<Arc<dyn BlobStore>>,
}

impl MailSource {
    pub fn new(
        directory: Arc<AccountDirectory>,
        connector: Arc<dyn SmtpConnector>,
        store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        let courier_directory = Arc::clone(&directory);
        let couriers = Pool::new(IDLE_COURIERS, move || {
            Courier::new(Arc::clone(&courier_directory), Arc::clone(&connector))
        });
        MailSource { directory, couriers, store }
    }

    fn build_message(&self, request: &SendRequest, account: &Account) -> Result<OutgoingMessage> {
        let mut message = OutgoingMessage::new();
        message.set_sender(&request.sender, &account.email)?;
        for address in request.recipient_addresses() {
            message.add_recipient(address)?;
        }
        message.set_subject(&request.subject);
        for content in &request.contents {
            message.add_content(content.clone());
        }
        for attachment in &request.attachments {
            let data = match &attachment.data {
                AttachmentData::Inline(data) => data.clone(),
                AttachmentData::Stored(key) => self.stored()?.get(key)?,
            };
            message.attach(Attachment::new(attachment.name.clone(), data));
        }
        Ok(message)
    }

    fn stored(&self) -> Result<&Arc<dyn BlobStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Store("no attachment store configured".to_string()))
    }

    fn release_attachments(&self, request: &SendRequest) {
        for attachment in &request.attachments {
            if let AttachmentData::Stored(key) = &attachment.data {
                let removed = self.stored().and_then(|store| store.remove(key));
                if let Err(err) = removed {
                    warn!("Couldn't remove stored attachment {}: {}", key, err);
                }
            }
        }
    }

    async fn deliver(&self, request: &SendRequest) -> Result<()> {
        let account = self.directory.resolve(&request.key)?;
        let message = self.build_message(request, &account)?;
        let encoded = message.encode()?;

        let mut courier = self.couriers.acquire()?;
        courier.deliver(&account, message.recipients(), &encoded).await?;
        drop(courier);

        info!("Sent message {} from {} to {}", request.id, account.email, message.recipients().join(", "));
        self.release_attachments(request);
        Ok(())
    }

    async fn list_mailbox(&self, key: &str) -> Result<Vec<MailboxEntry>> {
        let account = self.directory.resolve(key)?;
        let mut client = open_mailbox(&account).await?;
        let entries = list_entries(&mut client, &account.key).await;
        close_mailbox(client).await;
        entries
    }

    async fn read_entry(&self, entry: &MailboxEntry) -> Result<IncomingMessage> {
        let account = self.directory.resolve(&entry.key)?;
        let mut client = open_mailbox(&account).await?;
        let message = fetch_from(&mut client, &account, entry).await;
        close_mailbox(client).await;
        message
    }
}

impl MessageSource for MailSource {
    fn send<'a>(&'a self, request: &'a SendRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.deliver(request).await.map_err(|err| {
                error!("Couldn't send message {} from {}: {}", request.id, request.key, err);
                err
            })
        })
    }

    fn stat<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<MailboxEntry>>> {
        Box::pin(self.list_mailbox(key))
    }

    fn read<'a>(&'a self, entry: &'a MailboxEntry) -> BoxFuture<'a, Result<IncomingMessage>> {
        Box::pin(self.read_entry(entry))
    }

    fn discard(&self, request: &SendRequest) {
        self.release_attachments(request);
    }
}

async fn open_mailbox(account: &Account) -> Result<MailboxClient> {
    let mut client = MailboxClient::connect(&account.pop3.address(), account.pop3.encryption).await?;
    if let Err(err) = client.authenticate(&account.username, &account.password).await {
        error!("Couldn't log in to mailbox {}: {}", account.key, err);
        close_mailbox(client).await;
        return Err(err);
    }
    Ok(client)
}

async fn close_mailbox(client: MailboxClient) {
    if let Err(err) = client.close().await {
        warn!("Mailbox session did not close cleanly: {}", err);
    }
}

// Prefers UIDL for identifiers that survive across sessions; servers
// without it fall back to LIST, whose second column is the size.
async fn list_entries<S>(client: &mut Client<S>, key: &str) -> Result<Vec<MailboxEntry>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let lines = match client.uidl().await {
        Ok(lines) => lines,
        Err(Error::Rejected(reason)) => {
            debug!("UIDL not available for {} ({}), using LIST", key, reason);
            client.list().await?
        }
        Err(err) => return Err(err),
    };
    Ok(parse_listing(key, &lines))
}

async fn fetch_from<S>(
    client: &mut Client<S>,
    account: &Account,
    entry: &MailboxEntry,
) -> Result<IncomingMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let current = list_entries(client, &account.key).await?;
    let number = current
        .iter()
        .find(|listed| listed.id == entry.id)
        .map(|listed| listed.number)
        .ok_or_else(|| Error::MessageGone(entry.id.clone()))?;

    let mut reader = client.retrieve(number).await?;
    let message = decode_message(&mut reader).await?;

    if account.delete_after_read {
        client.delete(number).await?;
        debug!("Marked message {} in {} for deletion", entry.id, account.key);
    }
    Ok(message)
}

fn parse_listing(key: &str, lines: &[String]) -> Vec<MailboxEntry> {
    lines
        .iter()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next().map(str::parse::<u32>), fields.next(), fields.next()) {
                (Some(Ok(number)), Some(id), None) => {
                    Some(MailboxEntry { key: key.to_string(), number, id: id.to_string() })
                }
                _ => {
                    warn!("Skipping malformed listing line {:?} for {}", line, key);
                    None
                }
            }
        })
        .collect()
}
