use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{debug, info};

use crate::error::{Error, Result};
use crate::mail_source::account::{Account, AccountDirectory};
use crate::mail_source::pool::Reusable;

/// Delivers an already encoded message.
pub trait SmtpSend: Send + Sync {
    fn send<'a>(&'a self, from: &'a str, to: &'a [String], message: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// Builds an authenticated SMTP client for an account.
pub trait SmtpConnector: Send + Sync {
    fn connect(&self, account: &Account) -> Result<Box<dyn SmtpSend>>;
}

pub struct LettreConnector;

impl SmtpConnector for LettreConnector {
    fn connect(&self, account: &Account) -> Result<Box<dyn SmtpSend>> {
        let server = &account.smtp;
        let builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&server.hostname).port(server.port);
        let builder = if server.encryption {
            let tls = TlsParameters::builder(server.hostname.clone()).build().map_err(smtp_error)?;
            builder.tls(Tls::Wrapper(tls))
        } else {
            builder
        };

        let transport = builder
            .credentials(Credentials::new(account.username.clone(), account.password.clone()))
            .authentication(vec![Mechanism::Login, Mechanism::Plain])
            .build();

        debug!("Prepared SMTP client for {} at {}", account.key, server.address());
        Ok(Box::new(LettreMailer { transport }))
    }
}

struct LettreMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSend for LettreMailer {
    fn send<'a>(&'a self, from: &'a str, to: &'a [String], message: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let envelope = envelope(from, to)?;
            self.transport.send_raw(&envelope, message).await.map_err(smtp_error)?;
            Ok(())
        })
    }
}

fn envelope(from: &str, to: &[String]) -> Result<Envelope> {
    let parse = |address: &str| {
        address.parse::<Address>().map_err(|_| Error::InvalidAddress(address.to_string()))
    };
    let recipients = to.iter().map(|address| parse(address)).collect::<Result<Vec<_>>>()?;
    Envelope::new(Some(parse(from)?), recipients).map_err(|err| Error::InvalidAddress(err.to_string()))
}

fn smtp_error(err: lettre::transport::smtp::Error) -> Error {
    Error::Smtp { message: err.to_string(), permanent: err.is_permanent() }
}

/// Per-account SMTP clients, handed out through a `Pool`. Clients are built
/// on first use and dropped when their account changes in the directory.
pub struct Courier {
    directory: Arc<AccountDirectory>,
    connector: Arc<dyn SmtpConnector>,
    accounts: Arc<Vec<Account>>,
    mailers: HashMap<String, (Account, Box<dyn SmtpSend>)>,
}

impl Courier {
    pub fn new(directory: Arc<AccountDirectory>, connector: Arc<dyn SmtpConnector>) -> Self {
        let accounts = directory.snapshot();
        Courier { directory, connector, accounts, mailers: HashMap::new() }
    }

    pub async fn deliver(&mut self, account: &Account, to: &[String], message: &[u8]) -> Result<()> {
        if !self.mailers.contains_key(&account.key) {
            let mailer = self.connector.connect(account)?;
            self.mailers.insert(account.key.clone(), (account.clone(), mailer));
        }
        let Some((_, mailer)) = self.mailers.get(&account.key) else {
            return Err(Error::AccountNotFound(account.key.clone()));
        };
        mailer.send(&account.email, to, message).await?;
        info!("Message from {} delivered to {} recipient(s)", account.key, to.len());
        Ok(())
    }
}

impl Reusable for Courier {
    fn reinitialize(&mut self) -> Result<()> {
        let current = self.directory.snapshot();
        if !Arc::ptr_eq(&current, &self.accounts) {
            self.mailers.retain(|_, (account, _)| current.iter().any(|known| known == account));
            self.accounts = current;
        }
        Ok(())
    }
}
