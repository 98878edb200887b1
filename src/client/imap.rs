//! [`MailClient`] backed by `async-imap`.

use super::{ClientError, LinkState, MailClient, MailConnector, WaitCanceller, WaitOutcome};
use crate::config::AccountConfig;
use crate::message::{Address, BodyPart, MailboxStatus, MessageRecord, Part, PartPath, Uid};
use async_imap::{
    extensions::idle::IdleResponse,
    types::{Capability, UnsolicitedResponse},
    Client, Session,
};
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::StreamExt;
use imap_proto::types::{
    BodyContentCommon, BodyContentSinglePart, BodyStructure, ContentEncoding, SectionPath,
};
use std::{
    collections::HashSet,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

/// RFC 2177 asks clients to re-issue IDLE at least every 29 minutes.
const IDLE_REFRESH: Duration = Duration::from_secs(29 * 60);

/// How long the server gets to confirm the end of an IDLE.
const DONE_TIMEOUT: Duration = Duration::from_secs(30);

/// Either a TLS or a plaintext connection.
#[derive(Debug)]
pub enum MailStream {
    Tls(TlsStream<TcpStream>),
    Plain(TcpStream),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            MailStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MailStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            MailStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            MailStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            MailStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImapConnector;

#[async_trait]
impl MailConnector for ImapConnector {
    type Client = ImapClient;

    async fn connect(&self, account: &AccountConfig) -> Result<ImapClient, ClientError> {
        let host = account.server.as_str();
        let tcp_stream = TcpStream::connect((host, account.port))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let stream = if account.secure {
            let tls = async_native_tls::TlsConnector::new()
                .danger_accept_invalid_certs(account.accept_invalid_certs);
            let tls_stream = tls
                .connect(host, tcp_stream)
                .await
                .map_err(|e| ClientError::Connect(e.to_string()))?;
            MailStream::Tls(tls_stream)
        } else {
            MailStream::Plain(tcp_stream)
        };
        tracing::debug!(host, port = account.port, secure = account.secure, "connected");
        Ok(ImapClient {
            conn: Conn::Connected(Client::new(stream)),
            link: LinkState::new(),
        })
    }
}

enum Conn {
    Connected(Client<MailStream>),
    Authenticated(Session<MailStream>),
    Closed,
}

pub struct ImapClient {
    conn: Conn,
    link: LinkState,
}

impl ImapClient {
    fn session(&mut self) -> Result<&mut Session<MailStream>, ClientError> {
        match &mut self.conn {
            Conn::Authenticated(session) => Ok(session),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    fn take_session(&mut self) -> Result<Session<MailStream>, ClientError> {
        match std::mem::replace(&mut self.conn, Conn::Closed) {
            Conn::Authenticated(session) => Ok(session),
            other => {
                self.conn = other;
                Err(ClientError::NotAuthenticated)
            }
        }
    }

    /// Converts a protocol error, remembering when it killed the connection.
    fn fail(&mut self, err: async_imap::error::Error) -> ClientError {
        let err = classify(err);
        if err.is_fatal() {
            self.link.mark_lost();
        }
        err
    }

    /// The session was consumed by a failed IDLE; nothing is left to reuse.
    fn lose(&mut self, err: async_imap::error::Error) -> ClientError {
        self.conn = Conn::Closed;
        self.link.mark_lost();
        match classify(err) {
            ClientError::Refused(msg) => ClientError::Protocol(msg),
            other => other,
        }
    }
}

#[async_trait]
impl MailClient for ImapClient {
    async fn login(&mut self, user: &str, password: &str) -> Result<(), ClientError> {
        let client = match std::mem::replace(&mut self.conn, Conn::Closed) {
            Conn::Connected(client) => client,
            other => {
                self.conn = other;
                return Err(ClientError::Protocol("already logged in".to_string()));
            }
        };
        match client.login(user, password).await {
            Ok(session) => {
                self.conn = Conn::Authenticated(session);
                Ok(())
            }
            Err((err, client)) => {
                self.conn = Conn::Connected(client);
                Err(ClientError::Login(err.to_string()))
            }
        }
    }

    async fn select(&mut self, mailbox: &str) -> Result<(), ClientError> {
        let result = self.session()?.select(mailbox).await;
        result.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn capabilities(&mut self) -> Result<HashSet<String>, ClientError> {
        let result = self.session()?.capabilities().await;
        let capabilities = result.map_err(|e| self.fail(e))?;
        Ok(capabilities
            .iter()
            .map(|capability| match capability {
                Capability::Imap4rev1 => "IMAP4rev1".to_string(),
                Capability::Auth(mechanism) => format!("AUTH={mechanism}"),
                Capability::Atom(atom) => atom.to_string(),
            })
            .collect())
    }

    async fn search(&mut self, criteria: &str) -> Result<Vec<Uid>, ClientError> {
        let result = self.session()?.uid_search(criteria).await;
        let mut uids: Vec<Uid> = result.map_err(|e| self.fail(e))?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uids: &[Uid]) -> Result<Vec<MessageRecord>, ClientError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uid_set(uids);
        let responses = {
            let session = self.session()?;
            match session.uid_fetch(&set, "(UID ENVELOPE BODYSTRUCTURE)").await {
                Ok(stream) => Ok(stream.collect::<Vec<_>>().await),
                Err(e) => Err(e),
            }
        };
        let responses = responses.map_err(|e| self.fail(e))?;

        let mut records = Vec::with_capacity(responses.len());
        for response in responses {
            let fetch = response.map_err(|e| self.fail(e))?;
            // Unsolicited FETCH responses (flag updates) carry no UID.
            let Some(uid) = fetch.uid else { continue };
            let (subject, from) = match fetch.envelope() {
                Some(envelope) => (
                    envelope.subject.as_ref().map(|s| s.to_vec()),
                    envelope
                        .from
                        .iter()
                        .flatten()
                        .map(|address| Address {
                            name: address.name.as_ref().map(|v| v.to_vec()),
                            mailbox: address.mailbox.as_ref().map(|v| v.to_vec()),
                            host: address.host.as_ref().map(|v| v.to_vec()),
                        })
                        .collect(),
                ),
                None => (None, Vec::new()),
            };
            records.push(MessageRecord {
                uid,
                subject,
                from,
                structure: fetch.bodystructure().map(convert_structure),
            });
        }
        Ok(records)
    }

    async fn fetch_part(&mut self, uid: Uid, path: &PartPath) -> Result<Vec<u8>, ClientError> {
        let query = format!("BODY.PEEK[{path}]");
        let responses = {
            let session = self.session()?;
            match session.uid_fetch(uid.to_string(), &query).await {
                Ok(stream) => Ok(stream.collect::<Vec<_>>().await),
                Err(e) => Err(e),
            }
        };
        let responses = responses.map_err(|e| self.fail(e))?;

        let section = SectionPath::Part(path.segments().to_vec(), None);
        let mut part = None;
        for response in responses {
            let fetch = response.map_err(|e| self.fail(e))?;
            if fetch.uid != Some(uid) {
                continue;
            }
            if let Some(bytes) = fetch.section(&section) {
                part = Some(bytes.to_vec());
            }
        }
        part.ok_or_else(|| ClientError::Missing(format!("BODY[{path}] of UID {uid}")))
    }

    async fn long_poll(&mut self, cancel: &WaitCanceller) -> Result<WaitOutcome, ClientError> {
        let session = self.take_session()?;
        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            return Err(self.lose(e));
        }

        let response = {
            let (wait, stop) = idle.wait_with_timeout(IDLE_REFRESH);
            tokio::pin!(wait);
            let mut stop = Some(stop);
            loop {
                tokio::select! {
                    response = &mut wait => break response,
                    // Dropping the stop source makes `wait` resolve with
                    // a manual interrupt.
                    () = cancel.cancelled(), if stop.is_some() => drop(stop.take()),
                }
            }
        };

        let outcome = match response {
            Ok(IdleResponse::NewData(data)) => {
                let raw = String::from_utf8_lossy(data.borrow_raw());
                tracing::debug!(data = %raw.trim_end(), "IDLE data");
                if announces_new_mail(&raw) {
                    WaitOutcome::NewMail
                } else {
                    WaitOutcome::Other
                }
            }
            Ok(IdleResponse::ManualInterrupt) => WaitOutcome::Cancelled,
            Ok(IdleResponse::Timeout) => WaitOutcome::Timeout,
            Err(e) => return Err(self.lose(e)),
        };

        tracing::debug!("sending DONE");
        match tokio::time::timeout(DONE_TIMEOUT, idle.done()).await {
            Ok(Ok(session)) => {
                self.conn = Conn::Authenticated(session);
                Ok(outcome)
            }
            Ok(Err(e)) => Err(self.lose(e)),
            Err(_) => {
                self.conn = Conn::Closed;
                self.link.mark_lost();
                Err(ClientError::Connection(format!(
                    "no answer to DONE within {DONE_TIMEOUT:?}"
                )))
            }
        }
    }

    async fn poll_now(&mut self) -> Result<MailboxStatus, ClientError> {
        let result = self.session()?.noop().await;
        result.map_err(|e| self.fail(e))?;

        // NOOP itself answers nothing; news arrives as untagged responses.
        let session = self.session()?;
        let mut status = MailboxStatus::default();
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(count) => status.exists = Some(count),
                UnsolicitedResponse::Expunge(_) => status.changed = true,
                _ => {}
            }
        }
        Ok(status)
    }

    fn link(&self) -> LinkState {
        self.link.clone()
    }

    async fn logout(&mut self) -> Result<(), ClientError> {
        let result = match std::mem::replace(&mut self.conn, Conn::Closed) {
            Conn::Authenticated(mut session) => session.logout().await.map_err(classify),
            _ => Ok(()),
        };
        self.link.mark_lost();
        result
    }
}

fn classify(err: async_imap::error::Error) -> ClientError {
    use async_imap::error::Error;
    match err {
        Error::No(msg) | Error::Bad(msg) => ClientError::Refused(msg),
        Error::Io(e) => ClientError::Connection(e.to_string()),
        Error::ConnectionLost => ClientError::Connection("server closed the connection".into()),
        other => ClientError::Protocol(other.to_string()),
    }
}

fn announces_new_mail(raw: &str) -> bool {
    raw.lines().any(|line| {
        let mut words = line.split_whitespace();
        matches!(
            (words.next(), words.next(), words.next()),
            (Some("*"), Some(_), Some(kind)) if kind.eq_ignore_ascii_case("EXISTS")
        )
    })
}

fn uid_set(uids: &[Uid]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn convert_structure(structure: &BodyStructure<'_>) -> BodyPart {
    match structure {
        BodyStructure::Multipart { bodies, .. } => {
            BodyPart::Multipart(bodies.iter().map(convert_structure).collect())
        }
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => {
            BodyPart::Leaf(convert_part(common, other))
        }
    }
}

fn convert_part(common: &BodyContentCommon<'_>, other: &BodyContentSinglePart<'_>) -> Part {
    let mut part = Part::new(&common.ty.ty, &common.ty.subtype);
    for (name, value) in common.ty.params.iter().flatten() {
        part = part.with_param(name, value);
    }
    let encoding = match &other.transfer_encoding {
        ContentEncoding::SevenBit => "7bit",
        ContentEncoding::EightBit => "8bit",
        ContentEncoding::Binary => "binary",
        ContentEncoding::Base64 => "base64",
        ContentEncoding::QuotedPrintable => "quoted-printable",
        ContentEncoding::Other(name) => name.as_ref(),
    };
    part.with_encoding(encoding)
}
