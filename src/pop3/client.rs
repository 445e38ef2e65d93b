use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};

use crate::error::{Error, Result};
use crate::pop3::response::{parse_response, Response};
use crate::pop3::stream::{self, MailStream};

pub type MailboxClient = Client<MailStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Greeted,
    Authenticating,
    Transaction,
    Closed,
    /// A transport or protocol failure left the stream in an unknown position.
    Broken,
}

/// One POP3 session. Commands are strictly sequential: each writes a line
/// and reads exactly one status line (plus a dot-terminated body for the
/// multi-line commands).
pub struct Client<S> {
    stream: BufStream<S>,
    state: SessionState,
}

impl Client<MailStream> {
    pub async fn connect(address: &str, encryption: bool) -> Result<Self> {
        let stream = stream::connect(address, encryption).await?;
        Client::new(stream).await
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream and waits for the server greeting.
    pub async fn new(stream: S) -> Result<Self> {
        let mut client = Client { stream: BufStream::new(stream), state: SessionState::Connecting };

        match client.read_response().await {
            Ok(Response::Ok(greeting)) => {
                debug!("S: +OK {}", greeting);
                client.state = SessionState::Greeted;
                Ok(client)
            }
            Ok(Response::Err(reason)) => {
                let _ = client.stream.shutdown().await;
                Err(Error::Protocol(format!("server refused connection: {}", reason)))
            }
            Err(err) => {
                let _ = client.stream.shutdown().await;
                Err(err)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// USER followed by PASS. A negative answer to either aborts with the
    /// server's reason.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        self.expect_state(SessionState::Greeted)?;
        self.state = SessionState::Authenticating;

        if let Response::Err(reason) = self.command(&format!("USER {}", username), None).await? {
            self.state = SessionState::Greeted;
            return Err(Error::Authentication(reason));
        }
        if let Response::Err(reason) = self.command(&format!("PASS {}", password), Some("PASS ****")).await? {
            self.state = SessionState::Greeted;
            return Err(Error::Authentication(reason));
        }

        self.state = SessionState::Transaction;
        Ok(())
    }

    /// Returns the message count and mailbox size in octets.
    pub async fn stat(&mut self) -> Result<(u32, u64)> {
        self.expect_state(SessionState::Transaction)?;
        let text = self.simple("STAT").await?;
        let mut fields = text.split_whitespace();
        match (
            fields.next().and_then(|count| count.parse().ok()),
            fields.next().and_then(|size| size.parse().ok()),
        ) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(Error::Protocol(format!("malformed STAT answer {:?}", text))),
        }
    }

    /// Scan listing lines (`"<number> <size>"`), terminator removed.
    pub async fn list(&mut self) -> Result<Vec<String>> {
        self.expect_state(SessionState::Transaction)?;
        self.simple("LIST").await?;
        self.read_dot_lines().await
    }

    /// Unique-id listing lines (`"<number> <uid>"`), terminator removed.
    pub async fn uidl(&mut self) -> Result<Vec<String>> {
        self.expect_state(SessionState::Transaction)?;
        self.simple("UIDL").await?;
        self.read_dot_lines().await
    }

    /// Starts retrieving a message and hands back a reader positioned at
    /// its body. The caller must read through the terminating `.` line
    /// before issuing another command.
    pub async fn retrieve(&mut self, number: u32) -> Result<Retrieval<'_, S>> {
        self.expect_state(SessionState::Transaction)?;
        self.simple(&format!("RETR {}", number)).await?;
        Ok(Retrieval { client: self })
    }

    /// Marks a message deleted. Takes effect when the session is closed
    /// with `close`.
    pub async fn delete(&mut self, number: u32) -> Result<()> {
        self.expect_state(SessionState::Transaction)?;
        self.simple(&format!("DELE {}", number)).await?;
        Ok(())
    }

    pub async fn noop(&mut self) -> Result<()> {
        self.expect_state(SessionState::Transaction)?;
        self.simple("NOOP").await?;
        Ok(())
    }

    /// Sends QUIT and closes the stream whatever the answer was.
    pub async fn close(mut self) -> Result<()> {
        let result = match self.state {
            SessionState::Broken | SessionState::Closed => Ok(()),
            _ => self.simple("QUIT").await.map(|_| ()),
        };
        self.state = SessionState::Closed;

        if let Err(err) = self.stream.shutdown().await {
            warn!("Error closing mailbox stream: {}", err);
        }
        result
    }

    async fn simple(&mut self, line: &str) -> Result<String> {
        match self.command(line, None).await? {
            Response::Ok(text) => Ok(text),
            Response::Err(reason) => Err(Error::Rejected(reason)),
        }
    }

    async fn command(&mut self, line: &str, shown: Option<&str>) -> Result<Response> {
        if matches!(self.state, SessionState::Broken | SessionState::Closed) {
            return Err(Error::Protocol(format!("session is {:?}", self.state)));
        }
        debug!("C: {}", shown.unwrap_or(line));

        let written = async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await
        }
        .await;
        if let Err(err) = written {
            self.state = SessionState::Broken;
            return Err(err.into());
        }

        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response> {
        let line = self.read_line().await?;
        debug!("S: {}", line);
        parse_response(&line).map_err(|err| {
            self.state = SessionState::Broken;
            err
        })
    }

    async fn read_dot_lines(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(lines);
            }
            let line = line.strip_prefix('.').unwrap_or(&line);
            lines.push(line.to_string());
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        match self.stream.read_line(&mut line).await {
            Ok(0) => {
                self.state = SessionState::Broken;
                Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "mailbox server closed the connection",
                )))
            }
            Ok(_) => Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
            Err(err) => {
                self.state = SessionState::Broken;
                Err(err.into())
            }
        }
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "command not allowed in state {:?}, expected {:?}",
                self.state, expected
            )))
        }
    }
}

/// Body of a message being retrieved. The stream ending or failing before
/// the terminating `.` line breaks the session.
pub struct Retrieval<'a, S> {
    client: &'a mut Client<S>,
}

impl<S> AsyncRead for Retrieval<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let client = &mut *self.get_mut().client;
        let before = buf.filled().len();
        let polled = Pin::new(&mut client.stream).poll_read(cx, buf);
        match &polled {
            Poll::Ready(Err(_)) => client.state = SessionState::Broken,
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                client.state = SessionState::Broken
            }
            _ => {}
        }
        polled
    }
}

impl<S> AsyncBufRead for Retrieval<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let client = &mut *self.get_mut().client;
        match Pin::new(&mut client.stream).poll_fill_buf(cx) {
            Poll::Ready(Ok(buf)) => {
                if buf.is_empty() {
                    client.state = SessionState::Broken;
                }
                Poll::Ready(Ok(buf))
            }
            Poll::Ready(Err(err)) => {
                client.state = SessionState::Broken;
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().client.stream).consume(amt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail_codec::decode_message;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    // A fake server that sends `greeting`, then for every step checks the
    // received command and writes the canned reply.
    fn scripted(greeting: &'static str, steps: Vec<(&'static str, &'static str)>) -> (DuplexStream, JoinHandle<()>) {
        let (client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut server = BufStream::new(server);
            server.write_all(greeting.as_bytes()).await.unwrap();
            server.flush().await.unwrap();
            for (expected, reply) in steps {
                let mut line = String::new();
                server.read_line(&mut line).await.unwrap();
                assert_eq!(line, format!("{}\r\n", expected));
                server.write_all(reply.as_bytes()).await.unwrap();
                server.flush().await.unwrap();
            }
        });
        (client, handle)
    }

    async fn logged_in(steps: Vec<(&'static str, &'static str)>) -> (Client<DuplexStream>, JoinHandle<()>) {
        let mut all = vec![("USER gopher", "+OK\r\n"), ("PASS secret", "+OK logged in\r\n")];
        all.extend(steps);
        let (stream, server) = scripted("+OK POP3 ready\r\n", all);
        let mut client = Client::new(stream).await.unwrap();
        client.authenticate("gopher", "secret").await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_negative_greeting_is_rejected() {
        let (stream, server) = scripted("-ERR go away\r\n", vec![]);
        assert!(matches!(Client::new(stream).await, Err(Error::Protocol(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (client, server) = logged_in(vec![]).await;
        assert_eq!(client.state(), SessionState::Transaction);
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let (stream, server) = scripted(
            "+OK ready\r\n",
            vec![("USER gopher", "+OK\r\n"), ("PASS nope", "-ERR invalid password\r\n")],
        );
        let mut client = Client::new(stream).await.unwrap();
        match client.authenticate("gopher", "nope").await {
            Err(Error::Authentication(reason)) => assert_eq!(reason, "invalid password"),
            other => panic!("unexpected {:?}", other.err()),
        }
        assert_eq!(client.state(), SessionState::Greeted);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_need_authentication() {
        let (stream, server) = scripted("+OK ready\r\n", vec![]);
        let mut client = Client::new(stream).await.unwrap();
        assert!(matches!(client.list().await, Err(Error::Protocol(_))));
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_consumes_terminator() {
        let (mut client, server) =
            logged_in(vec![("LIST", "+OK 2 messages\r\n1 100\r\n2 101\r\n.\r\n"), ("NOOP", "+OK\r\n")]).await;
        assert_eq!(client.list().await.unwrap(), vec!["1 100", "2 101"]);
        client.noop().await.unwrap();
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stat_and_uidl() {
        let (mut client, server) = logged_in(vec![
            ("STAT", "+OK 2 320\r\n"),
            ("UIDL", "+OK\r\n1 whqtswO00WBw418f9t5JxYwZ\r\n2 QhdPYR:00WBw1Ph7x7\r\n.\r\n"),
        ])
        .await;
        assert_eq!(client.stat().await.unwrap(), (2, 320));
        assert_eq!(
            client.uidl().await.unwrap(),
            vec!["1 whqtswO00WBw418f9t5JxYwZ", "2 QhdPYR:00WBw1Ph7x7"]
        );
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_retrieve_then_decode() {
        let (mut client, server) = logged_in(vec![
            ("RETR 1", "+OK 64 octets\r\nSubject: hello\r\nMessage-ID: <1@x>\r\n\r\n..hidden\r\n.\r\n"),
            ("DELE 1", "+OK deleted\r\n"),
            ("QUIT", "+OK bye\r\n"),
        ])
        .await;
        let mut reader = client.retrieve(1).await.unwrap();
        let message = decode_message(&mut reader).await.unwrap();
        assert_eq!(message.subject(), "hello");
        assert_eq!(message.message_id(), "1@x");
        client.delete(1).await.unwrap();
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let (mut client, server) =
            logged_in(vec![("RETR 9", "-ERR no such message\r\n"), ("QUIT", "-ERR cannot commit\r\n")]).await;
        match client.retrieve(9).await {
            Err(Error::Rejected(reason)) => assert_eq!(reason, "no such message"),
            other => panic!("unexpected {:?}", other.err()),
        }
        // the stream is closed even though QUIT failed
        assert!(matches!(client.close().await, Err(Error::Rejected(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_response_breaks_session() {
        let (mut client, server) = logged_in(vec![("NOOP", "* what\r\n")]).await;
        assert!(matches!(client.noop().await, Err(Error::Protocol(_))));
        assert_eq!(client.state(), SessionState::Broken);
        assert!(matches!(client.noop().await, Err(Error::Protocol(_))));
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_cut_off_retrieval_breaks_session() {
        let (mut client, server) = logged_in(vec![("RETR 1", "+OK\r\nSubject: cut\r\n\r\npartial")]).await;
        let mut reader = client.retrieve(1).await.unwrap();
        server.await.unwrap();
        assert!(matches!(decode_message(&mut reader).await, Err(Error::Transport(_))));
        assert_eq!(client.state(), SessionState::Broken);
        assert!(matches!(client.noop().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_dropped_connection_is_transport_error() {
        let (mut client, server) = logged_in(vec![]).await;
        server.await.unwrap();
        assert!(matches!(client.list().await, Err(Error::Transport(_))));
        assert_eq!(client.state(), SessionState::Broken);
    }
}
