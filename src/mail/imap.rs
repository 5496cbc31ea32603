//! IMAP mailbox adapter: connect-per-cycle sessions over rustls.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::types::{FetchedMail, MailEndpoint, MailError};
use super::{Mailbox, MailboxConnector};

/// Byte stream an IMAP session runs over, TLS or plain.
trait ImapStream:
    futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + Sync + fmt::Debug
{
}

impl<T> ImapStream for T where
    T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + Sync + fmt::Debug
{
}

type ImapSession = async_imap::Session<Box<dyn ImapStream>>;

/// Opens [`ImapMailbox`]es. Holds the shared TLS configuration.
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
    timeout: Duration,
}

impl ImapConnector {
    pub fn new(timeout: Duration) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            timeout,
        }
    }
}

impl MailboxConnector for ImapConnector {
    fn mailbox(&self, endpoint: &MailEndpoint) -> Box<dyn Mailbox> {
        Box::new(ImapMailbox {
            session: None,
            selected: None,
            endpoint: endpoint.clone(),
            tls: self.tls.clone(),
            timeout: self.timeout,
        })
    }
}

/// One department's mailbox. Connects lazily and reconnects after a
/// transport failure, reselecting the last mailbox.
pub struct ImapMailbox {
    session: Option<ImapSession>,
    selected: Option<String>,
    endpoint: MailEndpoint,
    tls: TlsConnector,
    timeout: Duration,
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, MailError>
where
    F: Future<Output = Result<T, MailError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MailError::Timeout(limit))?
}

impl ImapMailbox {
    //
    // Connection Management
    //

    async fn open_session(&self) -> Result<ImapSession, MailError> {
        let addr = self.endpoint.address();

        let tcp = bounded(self.timeout, async {
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
                .await
                .map_err(|e| MailError::io(format!("Failed to connect to {}", addr), e))
        })
        .await?;

        let stream: Box<dyn ImapStream> = if self.endpoint.secure {
            let server_name = ServerName::try_from(self.endpoint.host.clone()).map_err(|e| {
                MailError::Config(format!("invalid server name '{}': {}", self.endpoint.host, e))
            })?;
            let tls_stream = bounded(self.timeout, async {
                self.tls
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| MailError::io("TLS handshake failed", e))
            })
            .await?;
            Box::new(tls_stream.compat())
        } else {
            tracing::warn!("IMAP connection to {} is not encrypted", addr);
            Box::new(tcp.compat())
        };

        let client = async_imap::Client::new(stream);

        let session = bounded(self.timeout, async move {
            client
                .login(&self.endpoint.user, &self.endpoint.password)
                .await
                .map_err(|(e, _)| match e {
                    async_imap::error::Error::Io(io) => MailError::io("IMAP login", io),
                    other => MailError::Auth(other.to_string()),
                })
        })
        .await?;

        tracing::info!("Connected to IMAP server {}", addr);
        Ok(session)
    }

    async fn ensure_connected(&mut self) -> Result<(), MailError> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = self.open_session().await?;
        self.session = Some(session);

        if let Some(folder) = self.selected.clone() {
            self.select_inner(&folder).await?;
        }
        Ok(())
    }

    fn session(&mut self) -> Result<&mut ImapSession, MailError> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// Drop the session after a transport failure so the next call reconnects.
    fn note_failure<T>(&mut self, result: Result<T, MailError>) -> Result<T, MailError> {
        if let Err(e) = &result
            && e.drops_connection()
        {
            tracing::debug!("Dropping IMAP session for {}: {}", self.endpoint.host, e);
            self.session = None;
        }
        result
    }

    async fn select_inner(&mut self, folder: &str) -> Result<u32, MailError> {
        let limit = self.timeout;
        let session = self.session()?;
        let mailbox = bounded(limit, async { Ok(session.select(folder).await?) }).await?;
        Ok(mailbox.exists)
    }

    //
    // Fetch Operations
    //

    async fn fetch_unseen_inner(&mut self) -> Result<Vec<FetchedMail>, MailError> {
        let limit = self.timeout;
        let session = self.session()?;

        let uids = bounded(limit, async { Ok(session.uid_search("UNSEEN").await?) }).await?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        // PEEK so the server leaves \Seen alone until the ticket exists
        let responses = bounded(limit, async {
            let stream = session.uid_fetch(&uid_set, "(UID BODY.PEEK[])").await?;
            Ok(stream.collect::<Vec<_>>().await)
        })
        .await?;

        let mut mails = Vec::with_capacity(responses.len());
        for response in responses {
            match response {
                Ok(fetch) => {
                    if let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) {
                        mails.push(FetchedMail {
                            uid,
                            raw: body.to_vec(),
                        });
                    }
                }
                Err(e) => tracing::warn!("Error in fetch response: {:?}", e),
            }
        }

        tracing::debug!(
            "Fetched {} unseen messages from {}",
            mails.len(),
            self.endpoint.host
        );
        Ok(mails)
    }

    //
    // Flag Operations
    //

    async fn mark_seen_inner(&mut self, uid: u32) -> Result<(), MailError> {
        let limit = self.timeout;
        let session = self.session()?;

        let responses = bounded(limit, async {
            let stream = session
                .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
                .await?;
            Ok(stream.collect::<Vec<_>>().await)
        })
        .await?;

        for response in responses {
            if let Err(e) = response {
                tracing::warn!("Error in mark_seen response: {:?}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn connect(&mut self) -> Result<(), MailError> {
        let result = self.ensure_connected().await;
        self.note_failure(result)
    }

    async fn select_mailbox(&mut self, name: &str) -> Result<u32, MailError> {
        self.selected = Some(name.to_string());
        let result = match self.ensure_connected().await {
            Ok(()) => self.select_inner(name).await,
            Err(e) => Err(e),
        };
        self.note_failure(result)
    }

    async fn fetch_unseen(&mut self) -> Result<Vec<FetchedMail>, MailError> {
        let result = match self.ensure_connected().await {
            Ok(()) => self.fetch_unseen_inner().await,
            Err(e) => Err(e),
        };
        self.note_failure(result)
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailError> {
        let result = match self.ensure_connected().await {
            Ok(()) => self.mark_seen_inner(uid).await,
            Err(e) => Err(e),
        };
        self.note_failure(result)
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
    }
}
